//! Type discovery (spec §3 "Type", §4.2).
//!
//! Types live on disk as directories named `__<name>` under one or more
//! *conf dirs*. When more than one conf dir is configured they are overlaid:
//! later conf dirs win over earlier ones for a type with the same name, the
//! way a `PATH`-like search order would, but resolved once at registry-build
//! time rather than re-walked per lookup.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TypeError;

/// A parameter declared by a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub required: bool,
    pub multiple: bool,
    pub boolean: bool,
    pub default: Option<String>,
    pub deprecated_message: Option<String>,
}

/// A discovered type and its declared capabilities.
#[derive(Debug, Clone)]
pub struct Type {
    /// Name including the leading `__`.
    pub name: String,
    /// Root directory this type resolved from (after overlay).
    pub path: PathBuf,
    pub parameters: Vec<ParameterSpec>,
    pub explorers: Vec<String>,
    pub has_manifest: bool,
    pub has_gencode_local: bool,
    pub has_gencode_remote: bool,
    pub singleton: bool,
    pub install: bool,
    pub nonparallel: bool,
    pub deprecated: Option<String>,
}

impl Type {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join("manifest")
    }

    pub fn gencode_local_path(&self) -> PathBuf {
        self.path.join("gencode-local")
    }

    pub fn gencode_remote_path(&self) -> PathBuf {
        self.path.join("gencode-remote")
    }

    pub fn explorer_path(&self, name: &str) -> PathBuf {
        self.path.join("explorer").join(name)
    }

    pub fn files_path(&self) -> PathBuf {
        self.path.join("files")
    }
}

/// The overlaid set of types visible to a run.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Type>,
}

fn is_valid_type_name(name: &str) -> bool {
    name.starts_with("__")
        && name.len() > 2
        && name[2..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn read_lines(path: &Path) -> std::io::Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn read_default_dir(path: &Path) -> std::io::Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    let dir = match fs::read_dir(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };
    for entry in dir {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let value = fs::read_to_string(entry.path())?.trim_end().to_string();
        out.insert(name, value);
    }
    Ok(out)
}

fn load_type(name: &str, dir: &Path) -> Result<Type, TypeError> {
    let read = |sub: &str| -> Result<Vec<String>, TypeError> {
        read_lines(&dir.join(sub)).map_err(|source| TypeError::Read {
            path: dir.join(sub),
            source,
        })
    };

    let required: BTreeSet<_> = read("parameter/required")?.into_iter().collect();
    let required_multiple: BTreeSet<_> =
        read("parameter/required_multiple")?.into_iter().collect();
    let optional: BTreeSet<_> = read("parameter/optional")?.into_iter().collect();
    let optional_multiple: BTreeSet<_> =
        read("parameter/optional_multiple")?.into_iter().collect();
    let boolean: BTreeSet<_> = read("parameter/boolean")?.into_iter().collect();

    let defaults = read_default_dir(&dir.join("parameter/default"))
        .map_err(|source| TypeError::Read { path: dir.join("parameter/default"), source })?;
    let deprecated_params = read_default_dir(&dir.join("parameter/deprecated"))
        .map_err(|source| TypeError::Read { path: dir.join("parameter/deprecated"), source })?;

    let mut parameters = Vec::new();
    for name in required
        .iter()
        .chain(required_multiple.iter())
        .chain(optional.iter())
        .chain(optional_multiple.iter())
        .chain(boolean.iter())
    {
        if parameters.iter().any(|p: &ParameterSpec| &p.name == name) {
            continue;
        }
        parameters.push(ParameterSpec {
            name: name.clone(),
            required: required.contains(name) || required_multiple.contains(name),
            multiple: required_multiple.contains(name) || optional_multiple.contains(name),
            boolean: boolean.contains(name),
            default: defaults.get(name).cloned(),
            deprecated_message: deprecated_params.get(name).cloned(),
        });
    }

    let explorers = match fs::read_dir(dir.join("explorer")) {
        Ok(entries) => {
            let mut names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(source) => {
            return Err(TypeError::Read {
                path: dir.join("explorer"),
                source,
            });
        }
    };

    let deprecated = match fs::read_to_string(dir.join("deprecated")) {
        Ok(msg) if !msg.trim().is_empty() => Some(msg.trim().to_string()),
        Ok(_) => Some(String::new()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(_) => None,
    };

    Ok(Type {
        name: name.to_string(),
        path: dir.to_path_buf(),
        parameters,
        explorers,
        has_manifest: dir.join("manifest").is_file(),
        has_gencode_local: dir.join("gencode-local").exists(),
        has_gencode_remote: dir.join("gencode-remote").exists(),
        singleton: dir.join("singleton").exists(),
        install: dir.join("install").exists(),
        nonparallel: dir.join("nonparallel").exists(),
        deprecated,
    })
}

impl TypeRegistry {
    /// Build a registry by overlaying `conf_dirs` in order; later directories
    /// win over earlier ones for a type present in both (spec §4.2: "last
    /// conf-dir wins").
    pub fn discover(conf_dirs: &[PathBuf]) -> Result<Self, TypeError> {
        let mut types = HashMap::new();
        for conf_dir in conf_dirs {
            let type_root = conf_dir.join("type");
            let entries = match fs::read_dir(&type_root) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(TypeError::Read {
                        path: type_root,
                        source,
                    });
                }
            };
            for entry in entries {
                let entry = entry.map_err(|source| TypeError::Read {
                    path: type_root.clone(),
                    source,
                })?;
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if !is_valid_type_name(&name) {
                    return Err(TypeError::InvalidName(name));
                }
                let parsed = load_type(&name, &entry.path())?;
                types.insert(name, parsed);
            }
        }
        Ok(Self { types })
    }

    pub fn get(&self, name: &str) -> Result<&Type, TypeError> {
        self.types.get(name).ok_or_else(|| TypeError::Unknown(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Type> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn discovers_a_simple_type() {
        let conf = tempdir().unwrap();
        let t = conf.path().join("type/__planet");
        write(&t.join("parameter/required"), "name\n");
        write(&t.join("manifest"), "#!/bin/sh\n");

        let reg = TypeRegistry::discover(&[conf.path().to_path_buf()]).unwrap();
        let ty = reg.get("__planet").unwrap();
        assert!(ty.has_manifest);
        assert!(ty.parameter("name").unwrap().required);
    }

    #[test]
    fn rejects_invalid_type_name() {
        let conf = tempdir().unwrap();
        fs::create_dir_all(conf.path().join("type/not-a-type")).unwrap();
        let err = TypeRegistry::discover(&[conf.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, TypeError::InvalidName(_)));
    }

    #[test]
    fn overlay_last_conf_dir_wins() {
        let base = tempdir().unwrap();
        let over = tempdir().unwrap();
        write(&base.path().join("type/__moon/parameter/optional"), "phase\n");
        write(&over.path().join("type/__moon/parameter/required"), "phase\n");

        let reg = TypeRegistry::discover(&[
            base.path().to_path_buf(),
            over.path().to_path_buf(),
        ])
        .unwrap();
        let ty = reg.get("__moon").unwrap();
        assert!(ty.parameter("phase").unwrap().required);
    }

    #[test]
    fn singleton_install_nonparallel_flags() {
        let conf = tempdir().unwrap();
        let t = conf.path().join("type/__os");
        fs::create_dir_all(&t).unwrap();
        fs::write(t.join("singleton"), "").unwrap();
        fs::write(t.join("nonparallel"), "").unwrap();

        let reg = TypeRegistry::discover(&[conf.path().to_path_buf()]).unwrap();
        let ty = reg.get("__os").unwrap();
        assert!(ty.singleton);
        assert!(ty.nonparallel);
        assert!(!ty.install);
    }
}
