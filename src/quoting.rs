//! Shell quoting and splitting.
//!
//! Every argument vector that crosses a shell boundary — a local `run`, a
//! remote `exec /bin/sh -c '...'` wrapper, an exported environment variable —
//! goes through [`quote`]/[`join`] on the way out and [`split`] on the way
//! back. The round-trip property `split(join(argv)) == argv` is exercised in
//! the proptest at the bottom of this file.
//!
//! # Example
//!
//! ```
//! use skonfig::quoting::{join, split};
//!
//! let argv = vec!["echo".to_string(), "hello world".to_string(), "it's fine".to_string()];
//! let joined = join(&argv);
//! assert_eq!(split(&joined).unwrap(), argv);
//! ```

use std::borrow::Cow;

use once_cell_like::Lazy;
use regex::Regex;

/// Characters that are safe to emit unquoted in a POSIX shell command.
fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '@' | '%' | '+')
}

static UNSAFE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_\-./:=@%+]").unwrap());

/// Quote a single argument for safe inclusion in a POSIX shell command line.
///
/// Arguments containing only [`is_shell_safe`] characters are passed through
/// unquoted; everything else is wrapped in single quotes, with embedded
/// single quotes escaped via the usual `'\''` POSIX idiom. Empty strings are
/// quoted to `''` so they are not silently dropped by the shell.
pub fn quote(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && !UNSAFE_RE.is_match(arg) {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', "'\\''")))
    }
}

/// Join an argument vector into a single shell command line.
pub fn join(argv: &[String]) -> String {
    argv.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" ")
}

/// Split a shell command line back into an argument vector.
///
/// Delegates to [`shell_words::split`], which implements POSIX word
/// splitting including single/double quoting and backslash escapes — the
/// same quoting dialect [`quote`] produces.
pub fn split(line: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(line)
}

/// Export an environment variable assignment as a single shell-safe token,
/// e.g. `KEY='value with spaces'`, suitable for prefixing a remote command.
pub fn export(key: &str, value: &str) -> String {
    format!("{}={}", key, quote(value))
}

/// Wrap a host for use in a command line, bracketing IPv6 literals.
///
/// Per the transport spec, a host containing a `:` (and therefore an IPv6
/// address, since hostnames and IPv4 literals never contain one) must be
/// wrapped in `[...]` the way a URI authority component would be.
pub fn bracket_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Minimal lazy-once-cell, avoiding a new dependency for a single static.
mod once_cell_like {
    use std::sync::OnceLock;

    pub struct Lazy<T> {
        cell: OnceLock<T>,
        init: fn() -> T,
    }

    impl<T> Lazy<T> {
        pub const fn new(init: fn() -> T) -> Self {
            Self {
                cell: OnceLock::new(),
                init,
            }
        }
    }

    impl<T> std::ops::Deref for Lazy<T> {
        type Target = T;
        fn deref(&self) -> &T {
            self.cell.get_or_init(self.init)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_args_pass_through() {
        assert_eq!(quote("hello"), "hello");
        assert_eq!(quote("/usr/bin/env"), "/usr/bin/env");
    }

    #[test]
    fn unsafe_args_are_single_quoted() {
        assert_eq!(quote("hello world"), "'hello world'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn embedded_quote_is_escaped() {
        assert_eq!(quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn round_trip_simple() {
        let argv = vec!["a".to_string(), "b c".to_string(), "d'e".to_string()];
        assert_eq!(split(&join(&argv)).unwrap(), argv);
    }

    #[test]
    fn host_bracketing() {
        assert_eq!(bracket_host("example.com"), "example.com");
        assert_eq!(bracket_host("::1"), "[::1]");
        assert_eq!(bracket_host("[::1]"), "[::1]");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn round_trip_any_argv(argv in prop::collection::vec("[ -~]{0,24}", 0..8)) {
            let joined = join(&argv);
            prop_assert_eq!(split(&joined).unwrap(), argv);
        }
    }
}
