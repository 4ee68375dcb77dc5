//! Nonparallel chunk partitioning (spec §4.7 Phase B, invariant 7).
//!
//! Partitions a set of `PREPARED` objects ready for code execution into
//! chunks such that no chunk contains two objects of the same *nonparallel*
//! type; objects of types that aren't nonparallel may share a chunk freely.
//! Chunks execute one after another; within a chunk, objects run
//! concurrently. Modeled as a greedy bin-pack keyed on type identity, the
//! same batching shape as this crate's round-robin/fixed-size schedulers
//! before it, just keyed on "type already placed" instead of a fixed count.

use std::collections::HashSet;

use crate::model::{Object, Type};

/// Partition `objects` into chunks honoring nonparallel exclusivity.
///
/// `is_nonparallel` looks up whether an object's type is marked
/// `nonparallel`; objects of non-nonparallel types never block chunk
/// membership against each other.
pub fn partition_nonparallel<'a>(
    objects: &[&'a Object],
    lookup_type: impl Fn(&str) -> Option<&'a Type>,
) -> Vec<Vec<&'a Object>> {
    let mut chunks: Vec<Vec<&Object>> = Vec::new();
    let mut chunk_types: Vec<HashSet<&str>> = Vec::new();

    'objects: for object in objects {
        let nonparallel = lookup_type(&object.type_name).map(|t| t.nonparallel).unwrap_or(false);

        if !nonparallel {
            if let Some(chunk) = chunks.first_mut() {
                chunk.push(object);
                continue;
            }
            chunks.push(vec![object]);
            chunk_types.push(HashSet::new());
            continue;
        }

        for (chunk, types) in chunks.iter_mut().zip(chunk_types.iter_mut()) {
            if !types.contains(object.type_name.as_str()) {
                chunk.push(object);
                types.insert(object.type_name.as_str());
                continue 'objects;
            }
        }

        let mut types = HashSet::new();
        types.insert(object.type_name.as_str());
        chunk_types.push(types);
        chunks.push(vec![object]);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::object::ObjectState;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn object(type_name: &str, id: &str) -> Object {
        Object {
            type_name: type_name.to_string(),
            id: id.to_string(),
            name: format!("{type_name}/{id}"),
            parameters: BTreeMap::new(),
            requires: Vec::new(),
            autorequire: Vec::new(),
            source: Vec::new(),
            state: ObjectState::Prepared,
            changed: false,
            stdin: None,
        }
    }

    fn ty(name: &str, nonparallel: bool) -> Type {
        Type {
            name: name.to_string(),
            path: PathBuf::from("/dev/null"),
            parameters: Vec::new(),
            explorers: Vec::new(),
            has_manifest: false,
            has_gencode_local: false,
            has_gencode_remote: false,
            singleton: false,
            install: false,
            nonparallel,
            deprecated: None,
        }
    }

    #[test]
    fn nonparallel_objects_of_same_type_never_share_a_chunk() {
        let a = object("__apt", "pkg1");
        let b = object("__apt", "pkg2");
        let apt = ty("__apt", true);
        let objs = vec![&a, &b];

        let chunks = partition_nonparallel(&objs, |_| Some(&apt));
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            assert_eq!(chunk.len(), 1);
        }
    }

    #[test]
    fn non_nonparallel_objects_share_one_chunk() {
        let a = object("__file", "a");
        let b = object("__file", "b");
        let file_ty = ty("__file", false);
        let objs = vec![&a, &b];

        let chunks = partition_nonparallel(&objs, |_| Some(&file_ty));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 2);
    }

    #[test]
    fn mixed_types_pack_together_when_possible() {
        let a = object("__apt", "pkg1");
        let b = object("__file", "x");
        let apt = ty("__apt", true);
        let file_ty = ty("__file", false);
        let objs = vec![&a, &b];

        let chunks = partition_nonparallel(&objs, |name| if name == "__apt" { Some(&apt) } else { Some(&file_ty) });
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 2);
    }
}
