//! Import resolution.
//!
//! Turns the ordered list of component-level import declarations into
//! immutable [`Instance`]s plus one flat table mapping
//! (instance-name, function-name) to a function type. Everything downstream
//! (adapter generation, binding checks, the manifest) looks functions up
//! through that table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::types::{TypeDef, TypeId, TypeTable};

/// What a component-level instance exports under a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternDecl {
    /// A re-exported type.
    Type(TypeId),
    /// A callable function; the id must name a function type.
    Func(TypeId),
}

/// A declared component-level import: a named instance and its exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportDecl {
    pub name: String,
    pub exports: Vec<(String, ExternDecl)>,
}

/// A resolved import instance. Immutable once created.
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    exports: Vec<(String, ExternDecl)>,
}

impl Instance {
    pub fn export(&self, name: &str) -> Option<ExternDecl> {
        self.exports
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, decl)| *decl)
    }
}

/// One entry of the flat function table.
#[derive(Debug, Clone)]
pub struct ResolvedFunc {
    pub instance: String,
    pub name: String,
    pub ty: TypeId,
}

/// The resolver's output: instances plus the flat function table.
#[derive(Debug, Default)]
pub struct ResolvedImports {
    pub instances: Vec<Instance>,
    pub funcs: Vec<ResolvedFunc>,
    index: HashMap<(String, String), usize>,
}

impl ResolvedImports {
    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Look up a function, failing with the exact missing pair.
    pub fn func(&self, instance: &str, name: &str) -> Result<&ResolvedFunc, LinkError> {
        self.index
            .get(&(instance.to_string(), name.to_string()))
            .map(|&i| &self.funcs[i])
            .ok_or_else(|| LinkError::UnresolvedImport {
                instance: instance.to_string(),
                name: name.to_string(),
            })
    }

    /// Whether a type re-exported by an instance is structurally equal to
    /// `expected`. This is the equality used by `(eq)`-style export
    /// declarations: declaration site is irrelevant, only shape counts.
    pub fn type_alias_matches(
        &self,
        types: &TypeTable,
        instance: &str,
        name: &str,
        expected: TypeId,
    ) -> bool {
        match self.instance(instance).and_then(|i| i.export(name)) {
            Some(ExternDecl::Type(id)) => types.resolve_equals(id, expected),
            _ => false,
        }
    }
}

/// Resolve the ordered import declarations against the type table.
pub fn resolve(types: &TypeTable, decls: &[ImportDecl]) -> Result<ResolvedImports, LinkError> {
    let mut resolved = ResolvedImports::default();

    for decl in decls {
        if resolved.instance(&decl.name).is_some() {
            return Err(LinkError::Definition {
                message: format!("duplicate import instance '{}'", decl.name),
            });
        }

        let mut exports = Vec::with_capacity(decl.exports.len());
        for (export_name, extern_decl) in &decl.exports {
            if exports.iter().any(|(n, _): &(String, ExternDecl)| n == export_name) {
                return Err(LinkError::Definition {
                    message: format!(
                        "duplicate export '{}' in instance '{}'",
                        export_name, decl.name
                    ),
                });
            }
            check_decl(types, &decl.name, export_name, *extern_decl)?;
            exports.push((export_name.clone(), *extern_decl));

            if let ExternDecl::Func(ty) = extern_decl {
                let slot = resolved.funcs.len();
                resolved.funcs.push(ResolvedFunc {
                    instance: decl.name.clone(),
                    name: export_name.clone(),
                    ty: *ty,
                });
                resolved
                    .index
                    .insert((decl.name.clone(), export_name.clone()), slot);
            }
        }

        resolved.instances.push(Instance {
            name: decl.name.clone(),
            exports,
        });
    }

    Ok(resolved)
}

fn check_decl(
    types: &TypeTable,
    instance: &str,
    name: &str,
    decl: ExternDecl,
) -> Result<(), LinkError> {
    let id = match decl {
        ExternDecl::Type(id) | ExternDecl::Func(id) => id,
    };
    if id.0 as usize >= types.len() {
        return Err(LinkError::Definition {
            message: format!(
                "export '{name}' of instance '{instance}' references undeclared type {}",
                id.0
            ),
        });
    }
    if matches!(decl, ExternDecl::Func(_)) && !matches!(types.get(id), Some(TypeDef::Func(_))) {
        return Err(LinkError::Definition {
            message: format!(
                "export '{name}' of instance '{instance}' is declared as a function but \
                 references a non-function type"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Primitive;

    fn one_instance(types: &mut TypeTable) -> Vec<ImportDecl> {
        let s32 = types.primitive(Primitive::S32);
        let f = types.func([("a", s32)], Some(s32)).unwrap();
        vec![ImportDecl {
            name: "math".to_string(),
            exports: vec![
                ("int".to_string(), ExternDecl::Type(s32)),
                ("double".to_string(), ExternDecl::Func(f)),
            ],
        }]
    }

    #[test]
    fn resolves_flat_function_table() {
        let mut types = TypeTable::new();
        let decls = one_instance(&mut types);
        let resolved = resolve(&types, &decls).unwrap();

        assert_eq!(resolved.funcs.len(), 1);
        let f = resolved.func("math", "double").unwrap();
        assert_eq!(f.instance, "math");
        assert_eq!(f.name, "double");
    }

    #[test]
    fn missing_function_reports_exact_pair() {
        let mut types = TypeTable::new();
        let decls = one_instance(&mut types);
        let resolved = resolve(&types, &decls).unwrap();

        match resolved.func("math", "halve") {
            Err(LinkError::UnresolvedImport { instance, name }) => {
                assert_eq!(instance, "math");
                assert_eq!(name, "halve");
            }
            other => panic!("expected UnresolvedImport, got {other:?}"),
        }
    }

    #[test]
    fn type_alias_matches_structurally() {
        let mut types = TypeTable::new();
        let decls = one_instance(&mut types);
        let resolved = resolve(&types, &decls).unwrap();

        // An independently declared s32 is the same type structurally.
        let other_s32 = types.primitive(Primitive::S32);
        assert!(resolved.type_alias_matches(&types, "math", "int", other_s32));
    }

    #[test]
    fn func_decl_must_reference_function_type() {
        let mut types = TypeTable::new();
        let s32 = types.primitive(Primitive::S32);
        let decls = vec![ImportDecl {
            name: "bad".to_string(),
            exports: vec![("f".to_string(), ExternDecl::Func(s32))],
        }];
        assert!(matches!(
            resolve(&types, &decls),
            Err(LinkError::Definition { .. })
        ));
    }

    #[test]
    fn duplicate_names_are_definition_errors() {
        let mut types = TypeTable::new();
        let s32 = types.primitive(Primitive::S32);
        let decls = vec![ImportDecl {
            name: "dup".to_string(),
            exports: vec![
                ("t".to_string(), ExternDecl::Type(s32)),
                ("t".to_string(), ExternDecl::Type(s32)),
            ],
        }];
        assert!(matches!(
            resolve(&types, &decls),
            Err(LinkError::Definition { .. })
        ));
    }
}
