//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own `thiserror` enum; [`Error`] aggregates them
//! with `#[from]` so call sites can propagate with `?` while still letting
//! callers match on the originating subsystem when they need to.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Emulator(#[from] EmulatorError),

    #[error(transparent)]
    Configurator(#[from] ConfiguratorError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the local/remote transport peers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("command failed (exit {exit_code}): {argv}")]
    NonZeroExit { argv: String, exit_code: i32 },

    #[error("failed to spawn command `{argv}`: {source}")]
    Spawn {
        argv: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to transfer `{src}` -> `{dst}`: {reason}")]
    Transfer {
        src: String,
        dst: String,
        reason: String,
    },

    #[error("IPv6 host literal `{0}` must be bracketed")]
    UnbracketedIpv6(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while discovering or validating types.
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("unknown type `{0}`")]
    Unknown(String),

    #[error("type name `{0}` must start with `__` and contain only alphanumerics/underscore")]
    InvalidName(String),

    #[error("failed to read type directory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while creating or mutating objects.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("object id must be non-empty for non-singleton type `{0}`")]
    MissingId(String),

    #[error("singleton type `{0}` already has an object")]
    SingletonConflict(String),

    #[error("object id `{id}` contains the reserved object-marker substring `{marker}`")]
    IdContainsMarker { id: String, marker: String },

    #[error("missing required parameter `{parameter}` for object `{object}`")]
    MissingParameter { object: String, parameter: String },

    #[error(
        "object `{object}` redeclared with conflicting parameter `{parameter}` (old={old:?}, new={new:?}); set CDIST_OVERRIDE to allow"
    )]
    ParameterConflict {
        object: String,
        parameter: String,
        old: Vec<String>,
        new: Vec<String>,
    },

    #[error("object `{0}` does not exist")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while the emulator parses an invocation.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error("unknown parameter `--{0}`")]
    UnknownParameter(String),

    #[error("parameter `--{0}` requires a value")]
    MissingValue(String),

    #[error("argv[0] `{0}` does not name a known type")]
    UnresolvedArgv0(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the configurator's fixed-point loop.
#[derive(Debug, Error)]
pub enum ConfiguratorError {
    #[error("unresolvable requirements: cycle detected: {0}")]
    Cycle(String),

    #[error("unresolvable requirements: {count} object(s) never reached DONE: {names}")]
    StuckObjects { count: usize, names: String },

    #[error("run interrupted by signal")]
    Interrupted,

    #[error("entity `{object}` failed: {source}")]
    Entity {
        object: String,
        #[source]
        source: anyhow::Error,
        stdout_path: Option<PathBuf>,
        stderr_path: Option<PathBuf>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Emulator(#[from] EmulatorError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Errors raised while persisting the working tree into the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache destination `{0}` escapes the configured cache root")]
    PathEscape(PathBuf),

    #[error("failed to move `{from}` into cache at `{to}`: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
