//! Object creation and mutation (spec §3 "Object", invariants 1-4, §4.3
//! steps 6-9).
//!
//! An [`ObjectStore`] is the only writer of object state; the emulator and
//! configurator both go through it so invariants 1-4 (at most one object per
//! `(type, id)`, singleton exclusivity, required-parameter completeness,
//! override-gated parameter conflicts) are enforced in one place instead of
//! being re-checked by every caller.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ObjectError;
use crate::model::type_registry::Type;

/// `<type-name>/<id>`, e.g. `__planet/earth` or `__os` for a singleton.
pub type ObjectId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectState {
    Undef,
    Prepared,
    Done,
}

impl ObjectState {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectState::Undef => "",
            ObjectState::Prepared => "prepared",
            ObjectState::Done => "done",
        }
    }
}

/// The two disjoint requirement kinds from spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    /// Declared by the shell author via the `require` environment variable.
    Explicit,
    /// Auto-populated from objects created during this object's own
    /// manifest.
    Autorequire,
}

/// A single configuration object, instantiated from a [`Type`].
#[derive(Debug, Clone)]
pub struct Object {
    pub type_name: String,
    pub id: String,
    /// `<type_name>/<id>`, or bare `type_name` for a singleton.
    pub name: ObjectId,
    pub parameters: BTreeMap<String, Vec<String>>,
    pub requires: Vec<String>,
    pub autorequire: Vec<String>,
    pub source: Vec<String>,
    pub state: ObjectState,
    pub changed: bool,
    pub stdin: Option<Vec<u8>>,
}

impl Object {
    pub fn object_name(type_name: &str, id: &str) -> ObjectId {
        if id.is_empty() {
            type_name.to_string()
        } else {
            format!("{type_name}/{id}")
        }
    }

    /// A requirement set (explicit or autorequire) is *unfinished* if any
    /// referenced name does not resolve to a `DONE` object, per spec §3.
    /// Names may be glob patterns; any object matching a pattern must be
    /// `DONE` for that pattern to count as finished.
    pub fn requirement_set(&self, kind: RequirementKind) -> &[String] {
        match kind {
            RequirementKind::Explicit => &self.requires,
            RequirementKind::Autorequire => &self.autorequire,
        }
    }
}

/// Persists objects under `<work_dir>/object/<type>/<id>/<marker>/...`
/// following the on-disk contract in spec §6.
pub struct ObjectStore {
    work_dir: PathBuf,
    object_marker: String,
    objects: HashMap<ObjectId, Object>,
    singletons: HashMap<String, ()>,
}

impl ObjectStore {
    pub fn new(work_dir: PathBuf, object_marker: String) -> Self {
        Self {
            work_dir,
            object_marker,
            objects: HashMap::new(),
            singletons: HashMap::new(),
        }
    }

    fn validate_id(&self, id: &str) -> Result<(), ObjectError> {
        if id.contains(&self.object_marker) {
            return Err(ObjectError::IdContainsMarker {
                id: id.to_string(),
                marker: self.object_marker.clone(),
            });
        }
        Ok(())
    }

    fn object_dir(&self, type_name: &str, id: &str) -> PathBuf {
        self.work_dir
            .join("object")
            .join(type_name)
            .join(id)
            .join(&self.object_marker)
    }

    /// Create a new object, or reconcile with an existing declaration per
    /// spec §4.3 steps 6-9 and invariants 1, 4.
    ///
    /// `override_conflicts` mirrors `CDIST_OVERRIDE`; when set, a divergent
    /// re-declaration replaces parameters rather than failing. Requirement
    /// sets always merge as a union regardless of override, per the Open
    /// Question resolution in spec §9 ("union with warning on asymmetry").
    pub fn declare(
        &mut self,
        ty: &Type,
        id: &str,
        parameters: BTreeMap<String, Vec<String>>,
        requires: Vec<String>,
        source: String,
        override_conflicts: bool,
    ) -> Result<&Object, ObjectError> {
        if ty.singleton {
            if !id.is_empty() {
                return Err(ObjectError::MissingId(ty.name.clone()));
            }
        } else if id.is_empty() {
            return Err(ObjectError::MissingId(ty.name.clone()));
        }
        self.validate_id(id)?;

        for p in ty.parameters.iter().filter(|p| p.required) {
            if !parameters.contains_key(&p.name) {
                return Err(ObjectError::MissingParameter {
                    object: Object::object_name(&ty.name, id),
                    parameter: p.name.clone(),
                });
            }
        }

        let name = Object::object_name(&ty.name, id);

        if let Some(existing) = self.objects.get_mut(&name) {
            for (key, new_val) in &parameters {
                if let Some(old_val) = existing.parameters.get(key) {
                    if old_val != new_val && !override_conflicts {
                        return Err(ObjectError::ParameterConflict {
                            object: name,
                            parameter: key.clone(),
                            old: old_val.clone(),
                            new: new_val.clone(),
                        });
                    }
                }
            }
            if override_conflicts {
                for (key, new_val) in parameters {
                    existing.parameters.insert(key, new_val);
                }
            }
            // Union with warning on asymmetry (spec §9 Open Question).
            let before: std::collections::HashSet<_> = existing.requires.iter().cloned().collect();
            let after: std::collections::HashSet<_> = requires.iter().cloned().collect();
            if before != after {
                tracing::warn!(
                    object = %existing.name,
                    "requirement sets differ across declarations; merging as union"
                );
            }
            for r in requires {
                if !existing.requires.contains(&r) {
                    existing.requires.push(r);
                }
            }
            if !existing.source.contains(&source) {
                existing.source.push(source);
            }
            return Ok(self.objects.get(&name).unwrap());
        }

        if ty.singleton && self.singletons.contains_key(&ty.name) {
            return Err(ObjectError::SingletonConflict(ty.name.clone()));
        }

        let object = Object {
            type_name: ty.name.clone(),
            id: id.to_string(),
            name: name.clone(),
            parameters,
            requires,
            autorequire: Vec::new(),
            source: vec![source],
            state: ObjectState::Undef,
            changed: false,
            stdin: None,
        };
        self.persist(&object)?;
        if ty.singleton {
            self.singletons.insert(ty.name.clone(), ());
        }
        self.objects.insert(name.clone(), object);
        Ok(self.objects.get(&name).unwrap())
    }

    pub fn add_autorequire(&mut self, parent: &str, child: ObjectId) {
        if let Some(obj) = self.objects.get_mut(parent) {
            if !obj.autorequire.contains(&child) {
                obj.autorequire.push(child);
            }
        }
    }

    /// Append `child` to `parent`'s autorequire file directly on disk,
    /// without requiring `parent` to be loaded into this store. Used by the
    /// emulator subprocess (a different OS process from the configurator
    /// that holds `parent` in memory) to satisfy spec §3's autorequire rule
    /// when it runs inside `parent`'s own type manifest.
    pub fn append_autorequire_on_disk(&self, parent_name: &str, child: &str) -> Result<(), ObjectError> {
        let (type_name, id) = match parent_name.split_once('/') {
            Some((t, i)) => (t, i),
            None => (parent_name, ""),
        };
        let dir = self.object_dir(type_name, id);
        let path = dir.join("autorequire");
        let mut existing: Vec<String> = match fs::read_to_string(&path) {
            Ok(text) => text.lines().filter(|l| !l.is_empty()).map(str::to_string).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if !existing.contains(&child.to_string()) {
            existing.push(child.to_string());
            fs::write(&path, existing.join("\n"))?;
        }
        Ok(())
    }

    pub fn set_stdin(&mut self, name: &str, data: Vec<u8>) {
        if let Some(obj) = self.objects.get_mut(name) {
            obj.stdin = Some(data);
        }
    }

    pub fn set_state(&mut self, name: &str, state: ObjectState) {
        if let Some(obj) = self.objects.get_mut(name) {
            obj.state = state;
        }
    }

    pub fn set_changed(&mut self, name: &str, changed: bool) {
        if let Some(obj) = self.objects.get_mut(name) {
            obj.changed = changed;
        }
    }

    pub fn get(&self, name: &str) -> Result<&Object, ObjectError> {
        self.objects.get(name).ok_or_else(|| ObjectError::NotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    pub fn names(&self) -> Vec<ObjectId> {
        self.objects.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Resolve a requirement pattern (literal name or glob) against all
    /// currently known object names.
    pub fn resolve_pattern(&self, pattern: &str) -> Vec<ObjectId> {
        if !pattern.contains(['*', '?', '[']) {
            return if self.objects.contains_key(pattern) {
                vec![pattern.to_string()]
            } else {
                Vec::new()
            };
        }
        self.objects
            .keys()
            .filter(|name| glob_match(pattern, name))
            .cloned()
            .collect()
    }

    /// Is `requirement_set` for `object` unfinished, i.e. does any name or
    /// glob it contains resolve to at least one non-DONE object (or fail to
    /// resolve at all, which counts as unfinished since the referent may not
    /// have been created yet)?
    pub fn is_unfinished(&self, patterns: &[String]) -> bool {
        for pattern in patterns {
            let matches = self.resolve_pattern(pattern);
            if matches.is_empty() {
                return true;
            }
            for m in matches {
                if self.objects.get(&m).map(|o| o.state) != Some(ObjectState::Done) {
                    return true;
                }
            }
        }
        false
    }

    fn persist(&self, object: &Object) -> Result<(), ObjectError> {
        let dir = self.object_dir(&object.type_name, &object.id);
        fs::create_dir_all(dir.join("parameter"))?;
        fs::create_dir_all(dir.join("explorer"))?;
        fs::create_dir_all(dir.join("stdout"))?;
        fs::create_dir_all(dir.join("stderr"))?;
        for (key, values) in &object.parameters {
            fs::write(dir.join("parameter").join(key), values.join("\n"))?;
        }
        fs::write(dir.join("require"), object.requires.join("\n"))?;
        fs::write(dir.join("autorequire"), object.autorequire.join("\n"))?;
        fs::write(dir.join("source"), object.source.join("\n"))?;
        fs::write(dir.join("state"), object.state.as_str())?;
        Ok(())
    }

    pub fn sync_to_disk(&self, name: &str) -> Result<(), ObjectError> {
        let object = self.get(name)?;
        self.persist(object)?;
        let dir = self.object_dir(&object.type_name, &object.id);
        if object.changed {
            fs::write(dir.join("changed"), "")?;
        }
        if let Some(stdin) = &object.stdin {
            fs::write(dir.join("stdin"), stdin)?;
        }
        Ok(())
    }

    pub fn object_disk_path(&self, name: &str) -> Result<PathBuf, ObjectError> {
        let object = self.get(name)?;
        Ok(self.object_dir(&object.type_name, &object.id))
    }

    /// Open a store and hydrate it from whatever objects already exist on
    /// disk under `work_dir` (spec §5: "workers...communicating only
    /// through the filesystem"). The emulator runs as a separate process
    /// from the configurator for every invocation, so a freshly opened
    /// store in the same work dir is how it sees objects declared by
    /// earlier manifest/emulator invocations in this run.
    pub fn open(work_dir: PathBuf, object_marker: String) -> Result<Self, ObjectError> {
        let mut store = Self::new(work_dir, object_marker);
        store.load_existing()?;
        Ok(store)
    }

    fn load_existing(&mut self) -> Result<(), ObjectError> {
        let root = self.work_dir.join("object");
        if !root.is_dir() {
            return Ok(());
        }
        for type_entry in fs::read_dir(&root)? {
            let type_entry = type_entry?;
            if !type_entry.file_type()?.is_dir() {
                continue;
            }
            let type_name = type_entry.file_name().to_string_lossy().into_owned();
            let type_path = type_entry.path();

            if type_path.join(&self.object_marker).is_dir() {
                self.load_one(&type_name, "", &type_path.join(&self.object_marker))?;
                continue;
            }

            for id_entry in fs::read_dir(&type_path)? {
                let id_entry = id_entry?;
                if !id_entry.file_type()?.is_dir() {
                    continue;
                }
                let marker_dir = id_entry.path().join(&self.object_marker);
                if !marker_dir.is_dir() {
                    continue;
                }
                let id = id_entry.file_name().to_string_lossy().into_owned();
                self.load_one(&type_name, &id, &marker_dir)?;
            }
        }
        Ok(())
    }

    /// Merge in objects and autorequire edges written directly to disk by
    /// emulator subprocesses since this store was opened (spec §5). New
    /// object names are adopted wholesale; for names already known here,
    /// only the autorequire set is unioned in, since state/changed are only
    /// ever mutated by the configurator itself, never by the emulator.
    pub fn reload_from_disk(&mut self) -> Result<(), ObjectError> {
        let mut disk = ObjectStore::new(self.work_dir.clone(), self.object_marker.clone());
        disk.load_existing()?;
        for (name, disk_obj) in disk.objects {
            match self.objects.get_mut(&name) {
                Some(existing) => {
                    for r in disk_obj.autorequire {
                        if !existing.autorequire.contains(&r) {
                            existing.autorequire.push(r);
                        }
                    }
                }
                None => {
                    if disk_obj.id.is_empty() {
                        self.singletons.insert(disk_obj.type_name.clone(), ());
                    }
                    self.objects.insert(name, disk_obj);
                }
            }
        }
        Ok(())
    }

    fn load_one(&mut self, type_name: &str, id: &str, marker_dir: &Path) -> Result<(), ObjectError> {
        let mut parameters = BTreeMap::new();
        let param_dir = marker_dir.join("parameter");
        if param_dir.is_dir() {
            for entry in fs::read_dir(&param_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let key = entry.file_name().to_string_lossy().into_owned();
                let values = fs::read_to_string(entry.path())?
                    .lines()
                    .map(str::to_string)
                    .collect();
                parameters.insert(key, values);
            }
        }

        let read_list = |name: &str| -> Result<Vec<String>, ObjectError> {
            match fs::read_to_string(marker_dir.join(name)) {
                Ok(text) => Ok(text.lines().filter(|l| !l.is_empty()).map(str::to_string).collect()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(e.into()),
            }
        };

        let state = match fs::read_to_string(marker_dir.join("state")) {
            Ok(s) if s.trim() == "done" => ObjectState::Done,
            Ok(s) if s.trim() == "prepared" => ObjectState::Prepared,
            _ => ObjectState::Undef,
        };
        let stdin = fs::read(marker_dir.join("stdin")).ok();

        let name = Object::object_name(type_name, id);
        let object = Object {
            type_name: type_name.to_string(),
            id: id.to_string(),
            name: name.clone(),
            parameters,
            requires: read_list("require")?,
            autorequire: read_list("autorequire")?,
            source: read_list("source")?,
            state,
            changed: marker_dir.join("changed").exists(),
            stdin,
        };
        if id.is_empty() {
            self.singletons.insert(type_name.to_string(), ());
        }
        self.objects.insert(name, object);
        Ok(())
    }
}

/// Simple shell-style glob match (`*`, `?`, `[...]`) against a full name,
/// matching the original engine's use of `fnmatch` rather than a path-aware
/// glob crate (spec.md §3: "Requirement names may be glob patterns").
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some('*') => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            Some('?') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some('[') => {
                if let Some(close) = p.iter().position(|&c| c == ']') {
                    if t.is_empty() {
                        return false;
                    }
                    let class = &p[1..close];
                    if class.contains(&t[0]) {
                        inner(&p[close + 1..], &t[1..])
                    } else {
                        false
                    }
                } else {
                    !t.is_empty() && p[0] == t[0] && inner(&p[1..], &t[1..])
                }
            }
            Some(c) => !t.is_empty() && *c == t[0] && inner(&p[1..], &t[1..]),
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::type_registry::{ParameterSpec, Type};
    use tempfile::tempdir;

    fn simple_type(name: &str, singleton: bool) -> Type {
        Type {
            name: name.to_string(),
            path: PathBuf::from("/dev/null"),
            parameters: vec![ParameterSpec {
                name: "param1".into(),
                required: false,
                multiple: false,
                boolean: false,
                default: None,
                deprecated_message: None,
            }],
            explorers: Vec::new(),
            has_manifest: false,
            has_gencode_local: false,
            has_gencode_remote: false,
            singleton,
            install: false,
            nonparallel: false,
            deprecated: None,
        }
    }

    #[test]
    fn duplicate_identical_declaration_merges_requirements() {
        let dir = tempdir().unwrap();
        let mut store = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
        let ty = simple_type("__cdist_test_type", false);
        let mut params = BTreeMap::new();
        params.insert("param1".to_string(), vec!["foo".to_string()]);

        store
            .declare(&ty, "test", params.clone(), vec!["a".into()], "m1".into(), false)
            .unwrap();
        store
            .declare(&ty, "test", params, vec!["b".into()], "m2".into(), false)
            .unwrap();

        let obj = store.get("__cdist_test_type/test").unwrap();
        assert_eq!(obj.requires, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn conflicting_parameters_without_override_fail() {
        let dir = tempdir().unwrap();
        let mut store = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
        let ty = simple_type("__cdist_test_type", false);
        let mut p1 = BTreeMap::new();
        p1.insert("param1".to_string(), vec!["foo".to_string()]);
        let mut p2 = BTreeMap::new();
        p2.insert("param1".to_string(), vec!["bar".to_string()]);

        store.declare(&ty, "test", p1, vec![], "m1".into(), false).unwrap();
        let err = store.declare(&ty, "test", p2, vec![], "m2".into(), false).unwrap_err();
        assert!(matches!(err, ObjectError::ParameterConflict { .. }));
    }

    #[test]
    fn conflicting_parameters_with_override_succeed() {
        let dir = tempdir().unwrap();
        let mut store = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
        let ty = simple_type("__cdist_test_type", false);
        let mut p1 = BTreeMap::new();
        p1.insert("param1".to_string(), vec!["foo".to_string()]);
        let mut p2 = BTreeMap::new();
        p2.insert("param1".to_string(), vec!["bar".to_string()]);

        store.declare(&ty, "test", p1, vec![], "m1".into(), false).unwrap();
        store.declare(&ty, "test", p2, vec![], "m2".into(), true).unwrap();
        assert_eq!(
            store.get("__cdist_test_type/test").unwrap().parameters["param1"],
            vec!["bar".to_string()]
        );
    }

    #[test]
    fn singleton_type_rejects_second_object() {
        let dir = tempdir().unwrap();
        let mut store = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
        let ty = simple_type("__test_singleton", true);
        store.declare(&ty, "", BTreeMap::new(), vec![], "m1".into(), false).unwrap();
        // Re-declaring the same (empty id) object merges rather than conflicts.
        store.declare(&ty, "", BTreeMap::new(), vec![], "m2".into(), false).unwrap();
        assert_eq!(store.names().len(), 1);
    }

    #[test]
    fn id_containing_marker_is_rejected() {
        let dir = tempdir().unwrap();
        let mut store = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
        let ty = simple_type("__planet", false);
        let err = store
            .declare(&ty, "foo.marker.bar", BTreeMap::new(), vec![], "m1".into(), false)
            .unwrap_err();
        assert!(matches!(err, ObjectError::IdContainsMarker { .. }));
    }

    #[test]
    fn glob_requirement_matches_prefix() {
        assert!(glob_match("__planet/*", "__planet/earth"));
        assert!(!glob_match("__planet/*", "__moon/luna"));
        assert!(glob_match("__test_singleton", "__test_singleton"));
    }

    #[test]
    fn reopening_a_work_dir_hydrates_previously_declared_objects() {
        let dir = tempdir().unwrap();
        let ty = simple_type("__planet", false);
        {
            let mut store = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
            let mut params = BTreeMap::new();
            params.insert("param1".to_string(), vec!["foo".to_string()]);
            store.declare(&ty, "earth", params, vec!["__os".into()], "m1".into(), false).unwrap();
        }

        let reopened = ObjectStore::open(dir.path().to_path_buf(), ".marker".into()).unwrap();
        let obj = reopened.get("__planet/earth").unwrap();
        assert_eq!(obj.parameters["param1"], vec!["foo".to_string()]);
        assert_eq!(obj.requires, vec!["__os".to_string()]);
        assert_eq!(obj.state, ObjectState::Undef);
    }

    #[test]
    fn reload_from_disk_adopts_objects_written_by_another_process() {
        let dir = tempdir().unwrap();
        let ty = simple_type("__planet", false);

        let mut store = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
        store.declare(&ty, "earth", BTreeMap::new(), vec![], "m1".into(), false).unwrap();

        // Simulate a sibling emulator subprocess declaring a second object
        // and appending an autorequire edge directly on disk.
        {
            let mut other = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
            other.declare(&ty, "moon", BTreeMap::new(), vec![], "m1".into(), false).unwrap();
            other.append_autorequire_on_disk("__planet/earth", "__planet/moon").unwrap();
        }

        store.reload_from_disk().unwrap();
        assert!(store.exists("__planet/moon"));
        assert_eq!(store.get("__planet/earth").unwrap().autorequire, vec!["__planet/moon".to_string()]);
    }

    #[test]
    fn append_autorequire_on_disk_is_idempotent() {
        let dir = tempdir().unwrap();
        let ty = simple_type("__planet", false);
        let mut store = ObjectStore::new(dir.path().to_path_buf(), ".marker".into());
        store.declare(&ty, "earth", BTreeMap::new(), vec![], "m1".into(), false).unwrap();

        store.append_autorequire_on_disk("__planet/earth", "__moon/luna").unwrap();
        store.append_autorequire_on_disk("__planet/earth", "__moon/luna").unwrap();

        let reopened = ObjectStore::open(dir.path().to_path_buf(), ".marker".into()).unwrap();
        assert_eq!(reopened.get("__planet/earth").unwrap().autorequire, vec!["__moon/luna".to_string()]);
    }
}
