//! Emulator (spec §4.3).
//!
//! Invoked when the user's manifest calls `<type-name> <args…>`. The engine
//! has previously symlinked every discovered type's name into a `bin/`
//! directory on `PATH` (see [`crate::manifest::ManifestEnv::base_vars`]), so
//! the shell's own name lookup for the type reaches back into this binary
//! under a different `argv[0]`. [`EmulatorInvocation::parse`] implements the
//! nine-step algorithm from spec §4.3 verbatim; the caller (`main.rs`) is
//! responsible for actually dispatching to it when `argv[0]` starts with
//! `__`.

use std::collections::BTreeMap;
use std::io::IsTerminal;

use crate::error::EmulatorError;
use crate::model::type_registry::Type;

/// Environment variables the emulator consumes (spec §6).
pub struct EmulatorEnv {
    pub require: Option<String>,
    pub cdist_order_dependency: bool,
    pub cdist_override: bool,
    /// Path to the per-manifest "last object created" file (step 8), or
    /// `None` if order-dependency tracking isn't active.
    pub order_dep_file: Option<std::path::PathBuf>,
    /// Present and pointing at the parent object's name when this emulator
    /// call happens inside a type manifest (step 9).
    pub parent_object: Option<String>,
}

/// A fully parsed emulator invocation, ready to be applied to an
/// [`crate::model::object::ObjectStore`].
pub struct EmulatorInvocation {
    pub type_name: String,
    pub object_id: String,
    pub parameters: BTreeMap<String, Vec<String>>,
    pub requires: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub parent_object: Option<String>,
    pub order_dependency_predecessor: Option<String>,
}

impl EmulatorInvocation {
    /// Steps 1-5 of spec §4.3: resolve the type from `argv[0]`, parse
    /// `argv[1:]` into an id and parameters, validate the id, capture
    /// stdin, and parse `require`.
    pub fn parse(
        argv0: &str,
        argv_rest: &[String],
        ty: &Type,
        env: &EmulatorEnv,
        stdin_bytes: Option<Vec<u8>>,
        object_marker: &str,
    ) -> Result<Self, EmulatorError> {
        if !argv0.ends_with(&ty.name) {
            return Err(EmulatorError::UnresolvedArgv0(argv0.to_string()));
        }

        let mut positional = Vec::new();
        let mut parameters: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut i = 0;
        while i < argv_rest.len() {
            let arg = &argv_rest[i];
            if let Some(flag) = arg.strip_prefix("--") {
                let spec = ty
                    .parameter(flag)
                    .ok_or_else(|| EmulatorError::UnknownParameter(flag.to_string()))?;
                if spec.boolean {
                    parameters.entry(flag.to_string()).or_default();
                } else {
                    i += 1;
                    let value = argv_rest
                        .get(i)
                        .ok_or_else(|| EmulatorError::MissingValue(flag.to_string()))?;
                    parameters.entry(flag.to_string()).or_default().push(value.clone());
                }
            } else {
                positional.push(arg.clone());
            }
            i += 1;
        }

        // Apply declared defaults for parameters not supplied at all.
        for spec in &ty.parameters {
            if !parameters.contains_key(&spec.name) {
                if let Some(default) = &spec.default {
                    parameters.insert(spec.name.clone(), vec![default.clone()]);
                }
            }
        }

        let object_id = if ty.singleton {
            String::new()
        } else {
            positional
                .first()
                .cloned()
                .ok_or_else(|| EmulatorError::Object(crate::error::ObjectError::MissingId(ty.name.clone())))?
        };

        if !ty.singleton && object_id.is_empty() {
            return Err(EmulatorError::Object(crate::error::ObjectError::MissingId(ty.name.clone())));
        }
        if object_id.contains(object_marker) {
            return Err(EmulatorError::Object(crate::error::ObjectError::IdContainsMarker {
                id: object_id,
                marker: object_marker.to_string(),
            }));
        }

        let stdin = stdin_bytes.filter(|b| !b.is_empty());

        let mut requires: Vec<String> = env
            .require
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let order_dependency_predecessor = if env.cdist_order_dependency {
            env.order_dep_file
                .as_ref()
                .and_then(|p| std::fs::read_to_string(p).ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        } else {
            None
        };
        if let Some(pred) = &order_dependency_predecessor {
            if !requires.contains(pred) {
                requires.push(pred.clone());
            }
        }

        Ok(Self {
            type_name: ty.name.clone(),
            object_id,
            parameters,
            requires,
            stdin,
            parent_object: env.parent_object.clone(),
            order_dependency_predecessor,
        })
    }
}

/// Is stdin worth capturing, per step 4: "if stdin is not a terminal and
/// non-empty".
pub fn should_capture_stdin() -> bool {
    !std::io::stdin().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::type_registry::ParameterSpec;
    use std::path::PathBuf;

    fn planet_type() -> Type {
        Type {
            name: "__planet".into(),
            path: PathBuf::from("/dev/null"),
            parameters: vec![ParameterSpec {
                name: "moons".into(),
                required: false,
                multiple: true,
                boolean: false,
                default: None,
                deprecated_message: None,
            }],
            explorers: vec![],
            has_manifest: true,
            has_gencode_local: false,
            has_gencode_remote: false,
            singleton: false,
            install: false,
            nonparallel: false,
            deprecated: None,
        }
    }

    fn no_op_env() -> EmulatorEnv {
        EmulatorEnv {
            require: None,
            cdist_order_dependency: false,
            cdist_override: false,
            order_dep_file: None,
            parent_object: None,
        }
    }

    #[test]
    fn parses_object_id_and_multi_valued_param() {
        let ty = planet_type();
        let argv = vec!["earth".to_string(), "--moons".to_string(), "luna".to_string()];
        let inv = EmulatorInvocation::parse("__planet", &argv, &ty, &no_op_env(), None, ".marker").unwrap();
        assert_eq!(inv.object_id, "earth");
        assert_eq!(inv.parameters["moons"], vec!["luna".to_string()]);
    }

    #[test]
    fn rejects_unknown_parameter() {
        let ty = planet_type();
        let argv = vec!["earth".to_string(), "--bogus".to_string(), "x".to_string()];
        let err = EmulatorInvocation::parse("__planet", &argv, &ty, &no_op_env(), None, ".marker").unwrap_err();
        assert!(matches!(err, EmulatorError::UnknownParameter(_)));
    }

    #[test]
    fn missing_id_for_nonsingleton_fails() {
        let ty = planet_type();
        let err = EmulatorInvocation::parse("__planet", &[], &ty, &no_op_env(), None, ".marker").unwrap_err();
        assert!(matches!(err, EmulatorError::Object(_)));
    }

    #[test]
    fn require_env_var_is_split_on_whitespace() {
        let ty = planet_type();
        let argv = vec!["earth".to_string()];
        let mut env = no_op_env();
        env.require = Some("__moon/luna  __os".to_string());
        let inv = EmulatorInvocation::parse("__planet", &argv, &ty, &env, None, ".marker").unwrap();
        assert_eq!(inv.requires, vec!["__moon/luna".to_string(), "__os".to_string()]);
    }
}
