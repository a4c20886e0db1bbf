//! The linking front end.
//!
//! [`Linker`] is a builder: declare types, host import instances, input
//! modules, bindings, designations, and top-level exports, then call
//! [`Linker::link`] to run the pipeline end to end. The input graph is
//! static; every validation failure is fatal and deterministic.

use std::collections::HashMap;

use crate::adapter::{Adapter, AdapterGenerator, CanonicalOptions, ExportRef};
use crate::emit::{emit, Artifact, ExportDecl};
use crate::error::LinkError;
use crate::module::{ExportKind, ImportKind, LowLevelModule, ScalarKind, ScalarSig};
use crate::plan::{BindingTarget, Bindings, Planner};
use crate::resolve::{resolve, ExternDecl, ImportDecl};
use crate::synth::{exporting_module, synthesize};
use crate::trampoline::{deduplicate, DedupPolicy};
use crate::types::{TypeId, TypeTable};

/// One declared binding: the consumer's import
/// `("<instance>", "<func>")` is wired to the lowered host function.
#[derive(Debug, Clone)]
struct BindSpec {
    consumer: String,
    instance: String,
    func: String,
    options: CanonicalOptions,
}

/// Builder for a composed artifact.
#[derive(Debug, Default)]
pub struct Linker {
    types: TypeTable,
    imports: Vec<ImportDecl>,
    modules: Vec<LowLevelModule>,
    bindings: Vec<BindSpec>,
    exports: Vec<ExportDecl>,
    designated_memory: Option<ExportRef>,
    designated_realloc: Option<ExportRef>,
    policy: DedupPolicy,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The type table; declare component-level types through this.
    pub fn types_mut(&mut self) -> &mut TypeTable {
        &mut self.types
    }

    /// Declare a host import instance wholesale.
    pub fn import_instance(&mut self, decl: ImportDecl) -> &mut Self {
        self.imports.push(decl);
        self
    }

    /// Declare one host function, creating its instance on first use.
    pub fn import_func(&mut self, instance: &str, name: &str, ty: TypeId) -> &mut Self {
        let export = (name.to_string(), ExternDecl::Func(ty));
        match self.imports.iter_mut().find(|d| d.name == instance) {
            Some(decl) => decl.exports.push(export),
            None => self.imports.push(ImportDecl {
                name: instance.to_string(),
                exports: vec![export],
            }),
        }
        self
    }

    /// Add an input module. The binary is parsed now so malformed inputs
    /// fail at the call site, but its bytes are never modified.
    pub fn add_module(&mut self, name: &str, bytes: Vec<u8>) -> Result<&mut Self, LinkError> {
        let module = LowLevelModule::parse(name, bytes)?;
        self.modules.push(module);
        Ok(self)
    }

    /// Bind `consumer`'s import `("instance", "func")` to the host function
    /// of the same name, lowered with the given canonical options.
    pub fn bind(
        &mut self,
        consumer: &str,
        instance: &str,
        func: &str,
        options: CanonicalOptions,
    ) -> &mut Self {
        self.bindings.push(BindSpec {
            consumer: consumer.to_string(),
            instance: instance.to_string(),
            func: func.to_string(),
            options,
        });
        self
    }

    /// Designate the linear memory adapters marshal through.
    pub fn designate_memory(&mut self, module: &str, export: &str) -> &mut Self {
        self.designated_memory = Some(ExportRef {
            module: module.to_string(),
            export: export.to_string(),
        });
        self
    }

    /// Designate the allocation function adapters obtain scratch from.
    pub fn designate_realloc(&mut self, module: &str, export: &str) -> &mut Self {
        self.designated_realloc = Some(ExportRef {
            module: module.to_string(),
            export: export.to_string(),
        });
        self
    }

    pub fn dedup_policy(&mut self, policy: DedupPolicy) -> &mut Self {
        self.policy = policy;
        self
    }

    /// Expose `module`'s `export` as a top-level export named `name`.
    pub fn export(&mut self, name: &str, module: &str, export: &str) -> &mut Self {
        self.exports.push(ExportDecl {
            name: name.to_string(),
            module: module.to_string(),
            export: export.to_string(),
        });
        self
    }

    /// Run the pipeline: resolve, lower, deduplicate, synthesize, plan,
    /// emit.
    pub fn link(&self) -> Result<Artifact, LinkError> {
        self.check_names()?;
        let hosts = resolve(&self.types, &self.imports)?;

        // Designations are resolved before any adapter is generated.
        self.check_memory_designation()?;
        self.check_realloc_designation()?;

        let (adapters, adapter_of) = self.lower_bindings(&hosts)?;
        let dedup = deduplicate(&adapters, self.policy);
        let synth = synthesize(&adapters, &dedup);

        let glue: Vec<LowLevelModule> = synth
            .modules()
            .map(|m| LowLevelModule::parse(m.name, m.bytes.clone()))
            .collect::<Result<_, _>>()?;

        let mut bindings = Bindings::new();
        for spec in &self.bindings {
            let index = adapter_of[&(spec.instance.clone(), spec.func.clone())];
            bindings.insert(
                (
                    spec.consumer.clone(),
                    spec.instance.clone(),
                    spec.func.clone(),
                ),
                BindingTarget {
                    module: exporting_module(dedup.sites[index]).to_string(),
                    export: adapters[index].name.clone(),
                },
            );
        }

        let mut modules: Vec<&LowLevelModule> = self.modules.iter().collect();
        let glue_from = modules.len();
        modules.extend(glue.iter());

        let plan = Planner::new(&modules, glue_from, &hosts, &bindings).plan()?;
        emit(&modules, &plan, &self.exports, &dedup.tables)
    }

    /// Lower every binding; one adapter per bound (instance, func).
    fn lower_bindings(
        &self,
        hosts: &crate::resolve::ResolvedImports,
    ) -> Result<(Vec<Adapter>, HashMap<(String, String), usize>), LinkError> {
        let generator = AdapterGenerator::new(
            &self.types,
            self.designated_memory.clone(),
            self.designated_realloc.clone(),
        );

        let mut adapters: Vec<Adapter> = Vec::new();
        let mut adapter_of: HashMap<(String, String), usize> = HashMap::new();
        for spec in &self.bindings {
            let func = hosts.func(&spec.instance, &spec.func)?;
            let lowered = generator.lower(&spec.instance, &spec.func, func.ty, &spec.options)?;

            let key = (spec.instance.clone(), spec.func.clone());
            let index = match adapter_of.get(&key) {
                Some(&index) => {
                    // Two consumers may share an adapter only if they agree
                    // on the canonical options.
                    if adapters[index].options != lowered.options {
                        return Err(LinkError::Definition {
                            message: format!(
                                "conflicting canonical options for '{}'",
                                lowered.name
                            ),
                        });
                    }
                    index
                }
                None => {
                    adapters.push(lowered);
                    adapter_of.insert(key, adapters.len() - 1);
                    adapters.len() - 1
                }
            };

            self.check_consumer_import(spec, &adapters[index])?;
        }
        Ok((adapters, adapter_of))
    }

    /// The consumer's flat import must exist and match the adapter's
    /// lowered signature exactly.
    fn check_consumer_import(&self, spec: &BindSpec, adapter: &Adapter) -> Result<(), LinkError> {
        let consumer = self.module(&spec.consumer).ok_or_else(|| LinkError::Definition {
            message: format!("binding references unknown module '{}'", spec.consumer),
        })?;
        let import = consumer
            .imports
            .iter()
            .find(|i| i.module == spec.instance && i.field == spec.func)
            .ok_or_else(|| LinkError::Definition {
                message: format!(
                    "module '{}' has no import '{}'::'{}' to bind",
                    spec.consumer, spec.instance, spec.func
                ),
            })?;
        match &import.kind {
            ImportKind::Func(sig) if *sig == adapter.signature => Ok(()),
            ImportKind::Func(sig) => Err(LinkError::SignatureMismatch {
                name: adapter.name.clone(),
                expected: adapter.signature.to_string(),
                found: sig.to_string(),
            }),
            _ => Err(LinkError::SignatureMismatch {
                name: adapter.name.clone(),
                expected: adapter.signature.to_string(),
                found: "non-function import".to_string(),
            }),
        }
    }

    fn module(&self, name: &str) -> Option<&LowLevelModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    fn check_names(&self) -> Result<(), LinkError> {
        for (i, module) in self.modules.iter().enumerate() {
            if module.name.starts_with("weft:") {
                return Err(LinkError::Definition {
                    message: format!("module name '{}' uses the reserved prefix", module.name),
                });
            }
            if self.modules[..i].iter().any(|m| m.name == module.name) {
                return Err(LinkError::Definition {
                    message: format!("duplicate module name '{}'", module.name),
                });
            }
            if self.imports.iter().any(|d| d.name == module.name) {
                return Err(LinkError::Definition {
                    message: format!(
                        "module '{}' shadows a host import instance",
                        module.name
                    ),
                });
            }
        }
        Ok(())
    }

    fn check_memory_designation(&self) -> Result<(), LinkError> {
        let Some(memory) = &self.designated_memory else {
            return Ok(());
        };
        match self.designated_export(memory)? {
            ExportKind::Memory => Ok(()),
            _ => Err(LinkError::Definition {
                message: format!(
                    "designated memory '{}'::'{}' is not a memory export",
                    memory.module, memory.export
                ),
            }),
        }
    }

    fn check_realloc_designation(&self) -> Result<(), LinkError> {
        let Some(realloc) = &self.designated_realloc else {
            return Ok(());
        };
        let expected = ScalarSig {
            params: vec![ScalarKind::I32; 4],
            results: vec![ScalarKind::I32],
        };
        match self.designated_export(realloc)? {
            ExportKind::Func(sig) if *sig == expected => Ok(()),
            ExportKind::Func(sig) => Err(LinkError::SignatureMismatch {
                name: format!("{}::{}", realloc.module, realloc.export),
                expected: expected.to_string(),
                found: sig.to_string(),
            }),
            _ => Err(LinkError::Definition {
                message: format!(
                    "designated realloc '{}'::'{}' is not a function export",
                    realloc.module, realloc.export
                ),
            }),
        }
    }

    fn designated_export(&self, target: &ExportRef) -> Result<&ExportKind, LinkError> {
        let module = self.module(&target.module).ok_or_else(|| LinkError::Definition {
            message: format!("designation references unknown module '{}'", target.module),
        })?;
        let export = module
            .export(&target.export)
            .ok_or_else(|| LinkError::Definition {
                message: format!(
                    "designation references missing export '{}'::'{}'",
                    target.module, target.export
                ),
            })?;
        Ok(&export.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Primitive;

    fn wat_module(wat_src: &str) -> Vec<u8> {
        wat::parse_str(wat_src).unwrap()
    }

    #[test]
    fn reserved_module_names_are_rejected() {
        let mut linker = Linker::new();
        linker
            .add_module("weft:shim", wat_module("(module)"))
            .unwrap();
        let err = linker.link().unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));
    }

    #[test]
    fn module_shadowing_a_host_instance_is_rejected() {
        let mut linker = Linker::new();
        let s32 = linker.types_mut().primitive(Primitive::S32);
        let f = linker.types_mut().func([("a", s32)], None).unwrap();
        linker.import_func("env", "f", f);
        linker.add_module("env", wat_module("(module)")).unwrap();
        let err = linker.link().unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));
    }

    #[test]
    fn bad_realloc_designation_is_a_signature_mismatch() {
        let mut linker = Linker::new();
        linker
            .add_module(
                "core",
                wat_module(
                    r#"
                    (module
                        (memory (export "memory") 1)
                        (func (export "realloc") (param i32) (result i32)
                            local.get 0)
                    )
                    "#,
                ),
            )
            .unwrap();
        linker.designate_memory("core", "memory");
        linker.designate_realloc("core", "realloc");
        let err = linker.link().unwrap_err();
        assert!(matches!(err, LinkError::SignatureMismatch { .. }));
    }

    #[test]
    fn conflicting_options_for_one_target_are_rejected() {
        let mut linker = Linker::new();
        let string = linker.types_mut().string();
        let log = linker.types_mut().func([("s", string)], None).unwrap();
        linker.import_func("host", "log", log);
        let consumer = r#"
            (module
                (import "host" "log" (func (param i32 i32)))
                (memory (export "memory") 1)
                (func (export "realloc") (param i32 i32 i32 i32) (result i32)
                    i32.const 0)
            )
        "#;
        linker.add_module("a", wat_module(consumer)).unwrap();
        linker.add_module("b", wat_module(consumer)).unwrap();
        linker.designate_memory("a", "memory");
        linker.designate_realloc("a", "realloc");
        linker.bind("a", "host", "log", CanonicalOptions::default());
        linker.bind(
            "b",
            "host",
            "log",
            CanonicalOptions {
                string_encoding: crate::adapter::StringEncoding::Utf16,
                ..Default::default()
            },
        );
        let err = linker.link().unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));
    }

    #[test]
    fn binding_an_absent_import_is_rejected() {
        let mut linker = Linker::new();
        let s32 = linker.types_mut().primitive(Primitive::S32);
        let f = linker.types_mut().func([("a", s32)], Some(s32)).unwrap();
        linker.import_func("host", "f", f);
        linker.add_module("app", wat_module("(module)")).unwrap();
        linker.bind("app", "host", "f", CanonicalOptions::default());
        let err = linker.link().unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));
    }
}
