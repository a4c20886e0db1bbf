//! The composed artifact.
//!
//! A WEFT container holds the module binaries in instantiation order,
//! byte-identical to their inputs, followed by a JSON manifest describing
//! the host instances, the per-instantiation wiring, the dispatch tables,
//! and the top-level exports. Exports are traced to the owning instance and
//! recorded as aliases; the artifact never duplicates a definition.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! magic "WEFT"  u32
//! version       u16
//! flags         u16 (zero)
//! module count  u32
//! per module:   name len u32, name bytes, blob len u32, blob bytes
//! manifest len  u32, manifest JSON
//! ```
//!
//! Encoding is deterministic: the same plan and inputs produce the same
//! bytes, so artifact digests are stable across runs.

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::module::{ExportKind, LowLevelModule};
use crate::plan::{ImportWire, InstancePlan};
use crate::trampoline::DispatchTable;

const MAGIC: u32 = u32::from_le_bytes(*b"WEFT");
const VERSION: u16 = 1;

/// A requested top-level export: expose `module`'s `export` as `name`.
#[derive(Debug, Clone)]
pub struct ExportDecl {
    pub name: String,
    pub module: String,
    pub export: String,
}

/// The artifact manifest. Every collection is an ordered `Vec`; nothing
/// here may iterate in hash order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Host instance names; plan-space indices `0..hosts.len()`.
    pub hosts: Vec<String>,
    /// One entry per module record, in instantiation order. Plan-space
    /// index of entry `k` is `hosts.len() + k`.
    pub instances: Vec<ManifestInstance>,
    pub exports: Vec<ManifestExport>,
    pub dispatch_tables: Vec<ManifestTable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestInstance {
    pub module: String,
    pub args: Vec<ImportWire>,
}

/// A top-level export, aliased to a live instance's export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestExport {
    pub name: String,
    pub instance: usize,
    pub export: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestTable {
    pub export: String,
    pub size: u32,
    pub signature: String,
}

/// An encoded artifact plus its manifest.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub manifest: Manifest,
}

/// An artifact read back from its byte encoding.
#[derive(Debug, Clone)]
pub struct DecodedArtifact {
    /// (name, binary) per module record, in instantiation order.
    pub modules: Vec<(String, Vec<u8>)>,
    pub manifest: Manifest,
}

/// Encode the composed artifact for a finished plan.
pub fn emit(
    modules: &[&LowLevelModule],
    plan: &InstancePlan,
    exports: &[ExportDecl],
    tables: &[DispatchTable],
) -> Result<Artifact, LinkError> {
    let manifest = Manifest {
        hosts: plan.hosts.clone(),
        instances: plan
            .order
            .iter()
            .map(|inst| ManifestInstance {
                module: inst.name.clone(),
                args: inst.args.clone(),
            })
            .collect(),
        exports: trace_exports(modules, plan, exports)?,
        dispatch_tables: tables
            .iter()
            .enumerate()
            .map(|(g, table)| ManifestTable {
                export: crate::synth::table_export_name(g),
                size: table.members.len() as u32,
                signature: table.signature.to_string(),
            })
            .collect(),
    };

    let manifest_json = serde_json::to_vec(&manifest).map_err(|e| LinkError::Artifact {
        message: format!("manifest serialization failed: {e}"),
    })?;

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&MAGIC.to_le_bytes());
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&(plan.order.len() as u32).to_le_bytes());
    for inst in &plan.order {
        let module = modules[inst.module];
        bytes.extend_from_slice(&(module.name.len() as u32).to_le_bytes());
        bytes.extend_from_slice(module.name.as_bytes());
        bytes.extend_from_slice(&(module.bytes().len() as u32).to_le_bytes());
        bytes.extend_from_slice(module.bytes());
    }
    bytes.extend_from_slice(&(manifest_json.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&manifest_json);

    Ok(Artifact { bytes, manifest })
}

/// Resolve every requested export to (instance, export, kind).
fn trace_exports(
    modules: &[&LowLevelModule],
    plan: &InstancePlan,
    exports: &[ExportDecl],
) -> Result<Vec<ManifestExport>, LinkError> {
    let mut traced: Vec<ManifestExport> = Vec::with_capacity(exports.len());
    for decl in exports {
        if traced.iter().any(|e| e.name == decl.name) {
            return Err(LinkError::Definition {
                message: format!("duplicate top-level export '{}'", decl.name),
            });
        }
        let position = plan
            .order
            .iter()
            .position(|inst| inst.name == decl.module)
            .ok_or_else(|| LinkError::UnresolvedExport {
                name: decl.name.clone(),
                message: format!("module '{}' is not part of the composition", decl.module),
            })?;
        let module = modules[plan.order[position].module];
        let export = module
            .export(&decl.export)
            .ok_or_else(|| LinkError::UnresolvedExport {
                name: decl.name.clone(),
                message: format!("module '{}' has no export '{}'", decl.module, decl.export),
            })?;
        let kind = match &export.kind {
            ExportKind::Func(_) => "func",
            ExportKind::Memory => "memory",
            ExportKind::Table => "table",
        };
        traced.push(ManifestExport {
            name: decl.name.clone(),
            instance: plan.hosts.len() + position,
            export: decl.export.clone(),
            kind: kind.to_string(),
        });
    }
    Ok(traced)
}

/// Decode an artifact produced by [`emit`].
pub fn decode(bytes: &[u8]) -> Result<DecodedArtifact, LinkError> {
    let mut cursor = Cursor::new(bytes);
    if cursor.read_u32()? != MAGIC {
        return Err(invalid("bad magic"));
    }
    if cursor.read_u16()? != VERSION {
        return Err(invalid("unsupported version"));
    }
    let _flags = cursor.read_u16()?;

    let count = cursor.read_u32()? as usize;
    let mut modules = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = cursor.read_u32()? as usize;
        let name = std::str::from_utf8(cursor.read_bytes(name_len)?)
            .map_err(|_| invalid("module name is not UTF-8"))?
            .to_string();
        let blob_len = cursor.read_u32()? as usize;
        let blob = cursor.read_bytes(blob_len)?.to_vec();
        modules.push((name, blob));
    }

    let manifest_len = cursor.read_u32()? as usize;
    let manifest: Manifest = serde_json::from_slice(cursor.read_bytes(manifest_len)?)
        .map_err(|e| invalid(&format!("malformed manifest: {e}")))?;
    if !cursor.is_eof() {
        return Err(invalid("trailing bytes"));
    }

    if manifest.instances.len() != modules.len() {
        return Err(invalid("manifest does not match module records"));
    }

    Ok(DecodedArtifact { modules, manifest })
}

fn invalid(message: &str) -> LinkError {
    LinkError::Artifact {
        message: message.to_string(),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], LinkError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| invalid("truncated artifact"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, LinkError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, LinkError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn is_eof(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Bindings, Planner};
    use crate::resolve::resolve;
    use crate::types::TypeTable;

    fn module(name: &str, wat_src: &str) -> LowLevelModule {
        LowLevelModule::parse(name, wat::parse_str(wat_src).unwrap()).unwrap()
    }

    fn two_modules() -> (LowLevelModule, LowLevelModule) {
        let core = module(
            "core",
            r#"
            (module
                (memory (export "memory") 1)
                (func (export "f") (param i32) (result i32) local.get 0)
            )
            "#,
        );
        let app = module(
            "app",
            r#"
            (module
                (import "core" "f" (func (param i32) (result i32)))
                (func (export "run") (param i32) (result i32)
                    local.get 0
                    call 0)
            )
            "#,
        );
        (core, app)
    }

    fn plan_and_emit(exports: &[ExportDecl]) -> Result<Artifact, LinkError> {
        let (core, app) = two_modules();
        let hosts = resolve(&TypeTable::new(), &[]).unwrap();
        let bindings = Bindings::new();
        let modules = [&app, &core];
        let plan = Planner::new(&modules, 2, &hosts, &bindings).plan().unwrap();
        emit(&modules, &plan, exports, &[])
    }

    fn run_export() -> ExportDecl {
        ExportDecl {
            name: "run".to_string(),
            module: "app".to_string(),
            export: "run".to_string(),
        }
    }

    #[test]
    fn records_follow_instantiation_order_byte_identically() {
        let (core, app) = two_modules();
        let artifact = plan_and_emit(&[run_export()]).unwrap();
        let decoded = decode(&artifact.bytes).unwrap();

        assert_eq!(decoded.modules.len(), 2);
        assert_eq!(decoded.modules[0].0, "core");
        assert_eq!(decoded.modules[0].1, core.bytes());
        assert_eq!(decoded.modules[1].0, "app");
        assert_eq!(decoded.modules[1].1, app.bytes());
        assert_eq!(decoded.manifest, artifact.manifest);
    }

    #[test]
    fn exports_alias_the_owning_instance() {
        let artifact = plan_and_emit(&[run_export()]).unwrap();
        let export = &artifact.manifest.exports[0];
        // No hosts, so app (second instantiation) is plan instance 1.
        assert_eq!(export.instance, 1);
        assert_eq!(export.export, "run");
        assert_eq!(export.kind, "func");
    }

    #[test]
    fn emitting_twice_is_byte_identical() {
        let a = plan_and_emit(&[run_export()]).unwrap();
        let b = plan_and_emit(&[run_export()]).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn untraceable_export_is_fatal() {
        let err = plan_and_emit(&[ExportDecl {
            name: "run".to_string(),
            module: "app".to_string(),
            export: "nope".to_string(),
        }])
        .unwrap_err();
        assert!(matches!(err, LinkError::UnresolvedExport { .. }));

        let err = plan_and_emit(&[ExportDecl {
            name: "run".to_string(),
            module: "ghost".to_string(),
            export: "run".to_string(),
        }])
        .unwrap_err();
        assert!(matches!(err, LinkError::UnresolvedExport { .. }));
    }

    #[test]
    fn duplicate_export_names_are_rejected() {
        let err = plan_and_emit(&[run_export(), run_export()]).unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));
    }

    #[test]
    fn corrupt_containers_are_rejected() {
        let artifact = plan_and_emit(&[run_export()]).unwrap();

        let mut bad_magic = artifact.bytes.clone();
        bad_magic[0] ^= 0xff;
        assert!(matches!(
            decode(&bad_magic),
            Err(LinkError::Artifact { .. })
        ));

        let truncated = &artifact.bytes[..artifact.bytes.len() - 3];
        assert!(matches!(decode(truncated), Err(LinkError::Artifact { .. })));
    }
}
