//! The type/object data model (spec §3, §4.2).
//!
//! A [`TypeRegistry`] discovers types from an overlaid conf tree; an
//! [`ObjectStore`] creates and mutates [`Object`]s instantiated from those
//! types, backing every mutation with a file under the per-host working
//! directory the way the original engine does, so that an in-progress run
//! can be inspected (or resumed for debugging) from the filesystem alone.

pub mod object;
pub mod type_registry;

pub use object::{Object, ObjectId, ObjectState, ObjectStore, RequirementKind};
pub use type_registry::{Type, TypeRegistry};

/// Default name of the file that marks the boundary of an object directory.
///
/// Per spec §3 this is "configurable...per run"; the default below matches
/// the original's well-known marker and is randomised per run by
/// [`crate::config::Settings::object_marker`] when not pinned by tests.
pub const DEFAULT_OBJECT_MARKER: &str = ".cdist";
