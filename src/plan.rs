//! Instantiation planning.
//!
//! Orders module instantiations so every import is satisfied by an already
//! live instance, and wires each import to its provider export by alias.
//! An alias names (instance, export); nothing is ever copied between
//! instances, re-export included.
//!
//! Host import instances are live before the first instantiation, so they
//! never constrain the order. Dependencies between modules must form a DAG;
//! a cycle is a fatal error naming the modules left unscheduled.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::module::{ExportKind, ImportKind, LowLevelModule};
use crate::resolve::ResolvedImports;

/// An alias into a live instance. `instance` is a plan-space index: host
/// instances first, then instantiations in plan order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRef {
    pub instance: usize,
    pub export: String,
}

/// One wired import of an instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportWire {
    pub namespace: String,
    pub field: String,
    pub target: AliasRef,
}

/// One step of the plan: instantiate `module` with the given wires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instantiation {
    /// Index into the planner's input module list.
    pub module: usize,
    pub name: String,
    pub args: Vec<ImportWire>,
}

/// The complete instantiation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancePlan {
    /// Host instance names, in declaration order. These occupy plan-space
    /// indices `0..hosts.len()`.
    pub hosts: Vec<String>,
    pub order: Vec<Instantiation>,
}

/// Where a binding points: an export of a named (synthesized) module.
#[derive(Debug, Clone)]
pub struct BindingTarget {
    pub module: String,
    pub export: String,
}

/// Key: (consumer module, import namespace, import field).
pub type Bindings = HashMap<(String, String, String), BindingTarget>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModuleState {
    Unscheduled,
    Ready,
    Instantiated,
}

#[derive(Debug, Clone)]
enum Provider {
    Host(usize),
    Module(usize),
}

/// A wire before instantiation order is known.
struct PendingWire {
    namespace: String,
    field: String,
    provider: Provider,
    export: String,
}

pub struct Planner<'a> {
    modules: &'a [&'a LowLevelModule],
    /// Modules at this index and beyond are synthesized glue; they may
    /// import host functions directly, source modules may not.
    glue_from: usize,
    hosts: &'a ResolvedImports,
    bindings: &'a Bindings,
}

impl<'a> Planner<'a> {
    pub fn new(
        modules: &'a [&'a LowLevelModule],
        glue_from: usize,
        hosts: &'a ResolvedImports,
        bindings: &'a Bindings,
    ) -> Self {
        Self {
            modules,
            glue_from,
            hosts,
            bindings,
        }
    }

    pub fn plan(&self) -> Result<InstancePlan, LinkError> {
        let n = self.modules.len();
        let mut wires: Vec<Vec<PendingWire>> = Vec::with_capacity(n);
        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(n);

        for (index, module) in self.modules.iter().enumerate() {
            let mut module_wires = Vec::with_capacity(module.imports.len());
            let mut module_deps = Vec::new();
            for import in &module.imports {
                let wire = self.resolve_import(index, module, import)?;
                if let Provider::Module(dep) = wire.provider {
                    if !module_deps.contains(&dep) {
                        module_deps.push(dep);
                    }
                }
                module_wires.push(wire);
            }
            wires.push(module_wires);
            deps.push(module_deps);
        }

        let order = self.schedule(&deps)?;

        // Plan-space indices: hosts first, then instantiation positions.
        let host_count = self.hosts.instances.len();
        let mut position = vec![0usize; n];
        for (pos, &module) in order.iter().enumerate() {
            position[module] = host_count + pos;
        }

        let plan_order = order
            .iter()
            .map(|&module| Instantiation {
                module,
                name: self.modules[module].name.clone(),
                args: wires[module]
                    .iter()
                    .map(|w| ImportWire {
                        namespace: w.namespace.clone(),
                        field: w.field.clone(),
                        target: AliasRef {
                            instance: match w.provider {
                                Provider::Host(h) => h,
                                Provider::Module(m) => position[m],
                            },
                            export: w.export.clone(),
                        },
                    })
                    .collect(),
            })
            .collect();

        Ok(InstancePlan {
            hosts: self.hosts.instances.iter().map(|i| i.name.clone()).collect(),
            order: plan_order,
        })
    }

    fn resolve_import(
        &self,
        index: usize,
        module: &LowLevelModule,
        import: &crate::module::ModuleImport,
    ) -> Result<PendingWire, LinkError> {
        let key = (
            module.name.clone(),
            import.module.clone(),
            import.field.clone(),
        );
        if index < self.glue_from {
            if let Some(target) = self.bindings.get(&key) {
                let provider = self.module_index(&target.module).ok_or_else(|| {
                    LinkError::UnresolvedImport {
                        instance: target.module.clone(),
                        name: target.export.clone(),
                    }
                })?;
                self.check_module_wire(import, provider, &target.export)?;
                return Ok(PendingWire {
                    namespace: import.module.clone(),
                    field: import.field.clone(),
                    provider: Provider::Module(provider),
                    export: target.export.clone(),
                });
            }
        }

        if let Some(provider) = self.module_index(&import.module) {
            self.check_module_wire(import, provider, &import.field)?;
            return Ok(PendingWire {
                namespace: import.module.clone(),
                field: import.field.clone(),
                provider: Provider::Module(provider),
                export: import.field.clone(),
            });
        }

        if let Some(host) = self
            .hosts
            .instances
            .iter()
            .position(|i| i.name == import.module)
        {
            // Only synthesized glue reaches host functions directly; a
            // source module's flat import cannot take a structured value.
            if index >= self.glue_from && matches!(import.kind, ImportKind::Func(_)) {
                self.hosts.func(&import.module, &import.field)?;
                return Ok(PendingWire {
                    namespace: import.module.clone(),
                    field: import.field.clone(),
                    provider: Provider::Host(host),
                    export: import.field.clone(),
                });
            }
        }

        Err(LinkError::UnresolvedImport {
            instance: import.module.clone(),
            name: import.field.clone(),
        })
    }

    fn module_index(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.name == name)
    }

    /// Kind and signature check for a module-provided wire.
    fn check_module_wire(
        &self,
        import: &crate::module::ModuleImport,
        provider: usize,
        export: &str,
    ) -> Result<(), LinkError> {
        let provider = self.modules[provider];
        let found = provider
            .export(export)
            .ok_or_else(|| LinkError::UnresolvedImport {
                instance: provider.name.clone(),
                name: export.to_string(),
            })?;
        let path = format!("{}::{}", import.module, import.field);
        match (&import.kind, &found.kind) {
            (ImportKind::Func(want), ExportKind::Func(have)) => {
                if want != have {
                    return Err(LinkError::SignatureMismatch {
                        name: path,
                        expected: want.to_string(),
                        found: have.to_string(),
                    });
                }
            }
            (ImportKind::Memory, ExportKind::Memory) => {}
            (ImportKind::Table, ExportKind::Table) => {}
            (want, have) => {
                return Err(LinkError::SignatureMismatch {
                    name: path,
                    expected: kind_name_import(want).to_string(),
                    found: kind_name_export(have).to_string(),
                });
            }
        }
        Ok(())
    }

    /// Deterministic batch topological ordering. Each round promotes every
    /// module whose dependencies are all live: glue modules first, then
    /// source modules, each in declaration order. A round that promotes
    /// nothing while modules remain is a cycle.
    ///
    /// Promoting glue ahead of source modules means a fixup that becomes
    /// Ready alongside its consumers fills the dispatch tables before any
    /// of those consumers is instantiated.
    fn schedule(&self, deps: &[Vec<usize>]) -> Result<Vec<usize>, LinkError> {
        let n = self.modules.len();
        let mut state = vec![ModuleState::Unscheduled; n];
        let mut order = Vec::with_capacity(n);

        while order.len() < n {
            for m in 0..n {
                if state[m] == ModuleState::Unscheduled
                    && deps[m].iter().all(|&d| state[d] == ModuleState::Instantiated)
                {
                    state[m] = ModuleState::Ready;
                }
            }
            let round_start = order.len();
            for m in (self.glue_from..n).chain(0..self.glue_from) {
                if state[m] == ModuleState::Ready {
                    state[m] = ModuleState::Instantiated;
                    order.push(m);
                }
            }
            if order.len() == round_start {
                let cycle = (0..n)
                    .filter(|&m| state[m] != ModuleState::Instantiated)
                    .map(|m| self.modules[m].name.clone())
                    .collect();
                return Err(LinkError::CyclicDependency { cycle });
            }
        }

        Ok(order)
    }
}

fn kind_name_import(kind: &ImportKind) -> &'static str {
    match kind {
        ImportKind::Func(_) => "function",
        ImportKind::Memory => "memory",
        ImportKind::Table => "table",
    }
}

fn kind_name_export(kind: &ExportKind) -> &'static str {
    match kind {
        ExportKind::Func(_) => "function",
        ExportKind::Memory => "memory",
        ExportKind::Table => "table",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{resolve, ExternDecl, ImportDecl};
    use crate::types::{Primitive, TypeTable};

    fn module(name: &str, wat_src: &str) -> LowLevelModule {
        LowLevelModule::parse(name, wat::parse_str(wat_src).unwrap()).unwrap()
    }

    fn no_hosts() -> ResolvedImports {
        resolve(&TypeTable::new(), &[]).unwrap()
    }

    #[test]
    fn providers_precede_consumers() {
        let provider = module(
            "core",
            r#"
            (module
                (memory (export "memory") 1)
                (func (export "f") (param i32) (result i32) local.get 0)
            )
            "#,
        );
        let consumer = module(
            "app",
            r#"
            (module
                (import "core" "f" (func (param i32) (result i32)))
                (import "core" "memory" (memory 1))
            )
            "#,
        );

        let hosts = no_hosts();
        let bindings = Bindings::new();
        // Consumer listed first; the planner must still schedule core first.
        let modules = [&consumer, &provider];
        let plan = Planner::new(&modules, 2, &hosts, &bindings).plan().unwrap();

        assert_eq!(plan.order.len(), 2);
        assert_eq!(plan.order[0].name, "core");
        assert_eq!(plan.order[1].name, "app");
        // Both wires alias plan instance 0 (no hosts, core first).
        for arg in &plan.order[1].args {
            assert_eq!(arg.target.instance, 0);
        }
    }

    #[test]
    fn cycle_is_fatal_and_names_the_modules() {
        let a = module(
            "a",
            r#"(module (import "b" "f" (func)) (func (export "g")))"#,
        );
        let b = module(
            "b",
            r#"(module (import "a" "g" (func)) (func (export "f")))"#,
        );

        let hosts = no_hosts();
        let bindings = Bindings::new();
        let modules = [&a, &b];
        let err = Planner::new(&modules, 2, &hosts, &bindings)
            .plan()
            .unwrap_err();
        match err {
            LinkError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn missing_export_names_the_exact_pair() {
        let provider = module("core", r#"(module (func (export "f")))"#);
        let consumer = module("app", r#"(module (import "core" "missing" (func)))"#);

        let hosts = no_hosts();
        let bindings = Bindings::new();
        let modules = [&provider, &consumer];
        let err = Planner::new(&modules, 2, &hosts, &bindings)
            .plan()
            .unwrap_err();
        match err {
            LinkError::UnresolvedImport { instance, name } => {
                assert_eq!(instance, "core");
                assert_eq!(name, "missing");
            }
            other => panic!("expected UnresolvedImport, got {other:?}"),
        }
    }

    #[test]
    fn signature_mismatch_is_rejected() {
        let provider = module(
            "core",
            r#"(module (func (export "f") (param i64) (result i64) local.get 0))"#,
        );
        let consumer = module(
            "app",
            r#"(module (import "core" "f" (func (param i32) (result i32))))"#,
        );

        let hosts = no_hosts();
        let bindings = Bindings::new();
        let modules = [&provider, &consumer];
        let err = Planner::new(&modules, 2, &hosts, &bindings)
            .plan()
            .unwrap_err();
        match err {
            LinkError::SignatureMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, "(i32) -> (i32)");
                assert_eq!(found, "(i64) -> (i64)");
            }
            other => panic!("expected SignatureMismatch, got {other:?}"),
        }
    }

    #[test]
    fn bindings_redirect_source_imports_to_glue() {
        let mut types = TypeTable::new();
        let s32 = types.primitive(Primitive::S32);
        let frob = types.func([("a", s32)], Some(s32)).unwrap();
        let hosts = resolve(
            &types,
            &[ImportDecl {
                name: "bar".to_string(),
                exports: vec![("frob".to_string(), ExternDecl::Func(frob))],
            }],
        )
        .unwrap();

        let app = module(
            "app",
            r#"(module (import "bar" "frob" (func (param i32) (result i32))))"#,
        );
        // Stands in for the synthesized adapter module.
        let glue = module(
            "weft:adapters",
            r#"
            (module
                (import "bar" "frob" (func $t (param i32) (result i32)))
                (func (export "bar#frob") (param i32) (result i32)
                    local.get 0
                    call $t)
            )
            "#,
        );

        let mut bindings = Bindings::new();
        bindings.insert(
            ("app".to_string(), "bar".to_string(), "frob".to_string()),
            BindingTarget {
                module: "weft:adapters".to_string(),
                export: "bar#frob".to_string(),
            },
        );

        let modules = [&app, &glue];
        let plan = Planner::new(&modules, 1, &hosts, &bindings).plan().unwrap();

        assert_eq!(plan.hosts, vec!["bar".to_string()]);
        assert_eq!(plan.order[0].name, "weft:adapters");
        // The glue's target import aliases host instance 0.
        assert_eq!(plan.order[0].args[0].target.instance, 0);
        assert_eq!(plan.order[0].args[0].target.export, "frob");
        // The app's import aliases the glue instance (plan index 1), under
        // the adapter's export name, not a copy.
        assert_eq!(plan.order[1].name, "app");
        assert_eq!(plan.order[1].args[0].target.instance, 1);
        assert_eq!(plan.order[1].args[0].target.export, "bar#frob");
    }

    #[test]
    fn source_module_cannot_take_a_host_function_raw() {
        let mut types = TypeTable::new();
        let s32 = types.primitive(Primitive::S32);
        let frob = types.func([("a", s32)], Some(s32)).unwrap();
        let hosts = resolve(
            &types,
            &[ImportDecl {
                name: "bar".to_string(),
                exports: vec![("frob".to_string(), ExternDecl::Func(frob))],
            }],
        )
        .unwrap();

        let app = module(
            "app",
            r#"(module (import "bar" "frob" (func (param i32) (result i32))))"#,
        );
        let bindings = Bindings::new();
        let modules = [&app];
        let err = Planner::new(&modules, 1, &hosts, &bindings)
            .plan()
            .unwrap_err();
        assert!(matches!(err, LinkError::UnresolvedImport { .. }));
    }
}
