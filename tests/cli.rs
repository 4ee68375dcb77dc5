//! End-to-end CLI tests driving the built `skonfig` binary, the way the
//! teacher exercises its own runner binary rather than only its library.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn check_accepts_a_minimal_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let conf_dir = dir.path().join("conf");
    std::fs::create_dir_all(&conf_dir).unwrap();
    let settings_path = dir.path().join("skonfig.toml");
    let mut settings = std::fs::File::create(&settings_path).unwrap();
    writeln!(
        settings,
        "conf_dirs = [{:?}]\nout_path = {:?}\ncache_path_root = {:?}\njobs = 2\n",
        conf_dir.to_string_lossy(),
        dir.path().join("out").to_string_lossy(),
        dir.path().join("cache").to_string_lossy(),
    )
    .unwrap();

    Command::cargo_bin("skonfig")
        .unwrap()
        .args(["config", "localhost", "--settings", settings_path.to_str().unwrap(), "--check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("settings OK"));
}

#[test]
fn check_rejects_a_missing_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist.toml");

    Command::cargo_bin("skonfig")
        .unwrap()
        .args(["config", "localhost", "--settings", missing.to_str().unwrap(), "--check"])
        .assert()
        .failure();
}
