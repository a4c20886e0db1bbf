//! Low-level module surfaces.
//!
//! The linker holds input modules read-only: it never rewrites a module's
//! code, it only inspects the flat import/export surface and supplies
//! instantiation arguments. Parsing therefore extracts signatures and entity
//! kinds and keeps the original bytes for byte-identical embedding in the
//! composed artifact.

use std::fmt;

use serde::{Deserialize, Serialize};
use wasmparser::{
    ExportSectionReader, FunctionSectionReader, ImportSectionReader, MemorySectionReader, Parser,
    Payload, TableSectionReader, TypeSectionReader,
};

use crate::error::LinkError;

/// A core scalar value kind. The entire low-level ABI is restricted to
/// these four widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    I32,
    I64,
    F32,
    F64,
}

impl ScalarKind {
    pub fn to_val_type(self) -> wasm_encoder::ValType {
        match self {
            ScalarKind::I32 => wasm_encoder::ValType::I32,
            ScalarKind::I64 => wasm_encoder::ValType::I64,
            ScalarKind::F32 => wasm_encoder::ValType::F32,
            ScalarKind::F64 => wasm_encoder::ValType::F64,
        }
    }

    fn from_val_type(ty: wasmparser::ValType) -> Option<Self> {
        match ty {
            wasmparser::ValType::I32 => Some(ScalarKind::I32),
            wasmparser::ValType::I64 => Some(ScalarKind::I64),
            wasmparser::ValType::F32 => Some(ScalarKind::F32),
            wasmparser::ValType::F64 => Some(ScalarKind::F64),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalarKind::I32 => "i32",
            ScalarKind::I64 => "i64",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// A flat function signature: ordered scalar parameters and results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ScalarSig {
    pub params: Vec<ScalarKind>,
    pub results: Vec<ScalarKind>,
}

impl fmt::Display for ScalarSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ") -> (")?;
        for (i, r) in self.results.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, ")")
    }
}

/// The kind of entity a module imports.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportKind {
    Func(ScalarSig),
    Memory,
    Table,
}

/// A single import of a low-level module.
#[derive(Debug, Clone)]
pub struct ModuleImport {
    /// The import's module namespace, as written in the binary.
    pub module: String,
    /// The import's field name.
    pub field: String,
    pub kind: ImportKind,
}

/// The kind of entity a module exports.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportKind {
    Func(ScalarSig),
    Memory,
    Table,
}

/// A single export of a low-level module.
#[derive(Debug, Clone)]
pub struct ModuleExport {
    pub name: String,
    pub kind: ExportKind,
}

/// The read-only surface of one flat input module.
#[derive(Debug, Clone)]
pub struct LowLevelModule {
    pub name: String,
    bytes: Vec<u8>,
    pub imports: Vec<ModuleImport>,
    pub exports: Vec<ModuleExport>,
}

impl LowLevelModule {
    /// Parse a module's import/export surface from its binary encoding.
    ///
    /// Function signatures outside the scalar ABI (vector or reference
    /// types), and import kinds the linker cannot wire (globals, tags), are
    /// rejected: the inputs to this linker are scalar-only by contract.
    pub fn parse(name: &str, bytes: Vec<u8>) -> Result<Self, LinkError> {
        let mut surface = SurfaceParser::new(name);
        for payload in Parser::new(0).parse_all(&bytes) {
            let payload = payload.map_err(|e| parse_error(name, e))?;
            surface.process_payload(payload)?;
        }
        Ok(LowLevelModule {
            name: name.to_string(),
            bytes,
            imports: surface.imports,
            exports: surface.exports,
        })
    }

    /// The original, unmodified module bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn export(&self, name: &str) -> Option<&ModuleExport> {
        self.exports.iter().find(|e| e.name == name)
    }
}

/// Accumulates the surface while walking payloads.
struct SurfaceParser {
    name: String,
    types: Vec<ScalarSig>,
    func_types: Vec<u32>,
    num_imported_funcs: u32,
    imports: Vec<ModuleImport>,
    exports: Vec<ModuleExport>,
    defined_memories: u32,
    defined_tables: u32,
    imported_memories: u32,
    imported_tables: u32,
}

impl SurfaceParser {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            types: Vec::new(),
            func_types: Vec::new(),
            num_imported_funcs: 0,
            imports: Vec::new(),
            exports: Vec::new(),
            defined_memories: 0,
            defined_tables: 0,
            imported_memories: 0,
            imported_tables: 0,
        }
    }

    fn process_payload(&mut self, payload: Payload<'_>) -> Result<(), LinkError> {
        match payload {
            Payload::TypeSection(reader) => self.parse_types(reader)?,
            Payload::ImportSection(reader) => self.parse_imports(reader)?,
            Payload::FunctionSection(reader) => self.parse_functions(reader)?,
            Payload::TableSection(reader) => self.parse_tables(reader)?,
            Payload::MemorySection(reader) => self.parse_memories(reader)?,
            Payload::ExportSection(reader) => self.parse_exports(reader)?,
            _ => {} // Code, data, element and custom sections stay opaque.
        }
        Ok(())
    }

    fn parse_types(&mut self, reader: TypeSectionReader<'_>) -> Result<(), LinkError> {
        for rec_group in reader {
            let rec_group = rec_group.map_err(|e| parse_error(&self.name, e))?;
            for ty in rec_group.into_types() {
                if let wasmparser::CompositeInnerType::Func(func_type) = ty.composite_type.inner {
                    self.types.push(self.scalar_sig(&func_type)?);
                }
            }
        }
        Ok(())
    }

    fn scalar_sig(&self, ty: &wasmparser::FuncType) -> Result<ScalarSig, LinkError> {
        let convert = |vals: &[wasmparser::ValType]| -> Result<Vec<ScalarKind>, LinkError> {
            vals.iter()
                .map(|&v| {
                    ScalarKind::from_val_type(v).ok_or_else(|| LinkError::Module {
                        module: self.name.clone(),
                        message: format!("non-scalar value type {v:?} in function signature"),
                    })
                })
                .collect()
        };
        Ok(ScalarSig {
            params: convert(ty.params())?,
            results: convert(ty.results())?,
        })
    }

    fn parse_imports(&mut self, reader: ImportSectionReader<'_>) -> Result<(), LinkError> {
        for import in reader {
            let import = import.map_err(|e| parse_error(&self.name, e))?;
            let kind = match import.ty {
                wasmparser::TypeRef::Func(type_idx) => {
                    self.num_imported_funcs += 1;
                    let sig = self.types.get(type_idx as usize).cloned().ok_or_else(|| {
                        LinkError::Module {
                            module: self.name.clone(),
                            message: format!("import references unknown type index {type_idx}"),
                        }
                    })?;
                    ImportKind::Func(sig)
                }
                wasmparser::TypeRef::Memory(_) => {
                    self.imported_memories += 1;
                    ImportKind::Memory
                }
                wasmparser::TypeRef::Table(_) => {
                    self.imported_tables += 1;
                    ImportKind::Table
                }
                wasmparser::TypeRef::Global(_) | wasmparser::TypeRef::Tag(_) => {
                    return Err(LinkError::Module {
                        module: self.name.clone(),
                        message: format!(
                            "unsupported import kind for '{}'::'{}'",
                            import.module, import.name
                        ),
                    });
                }
            };
            self.imports.push(ModuleImport {
                module: import.module.to_string(),
                field: import.name.to_string(),
                kind,
            });
        }
        Ok(())
    }

    fn parse_functions(&mut self, reader: FunctionSectionReader<'_>) -> Result<(), LinkError> {
        for func in reader {
            let type_idx = func.map_err(|e| parse_error(&self.name, e))?;
            self.func_types.push(type_idx);
        }
        Ok(())
    }

    fn parse_tables(&mut self, reader: TableSectionReader<'_>) -> Result<(), LinkError> {
        for table in reader {
            table.map_err(|e| parse_error(&self.name, e))?;
            self.defined_tables += 1;
        }
        Ok(())
    }

    fn parse_memories(&mut self, reader: MemorySectionReader<'_>) -> Result<(), LinkError> {
        for memory in reader {
            memory.map_err(|e| parse_error(&self.name, e))?;
            self.defined_memories += 1;
        }
        Ok(())
    }

    fn parse_exports(&mut self, reader: ExportSectionReader<'_>) -> Result<(), LinkError> {
        for export in reader {
            let export = export.map_err(|e| parse_error(&self.name, e))?;
            let kind = match export.kind {
                wasmparser::ExternalKind::Func => {
                    let sig = self
                        .func_sig(export.index)
                        .ok_or_else(|| LinkError::Module {
                            module: self.name.clone(),
                            message: format!(
                                "export '{}' references unknown function index {}",
                                export.name, export.index
                            ),
                        })?;
                    ExportKind::Func(sig)
                }
                wasmparser::ExternalKind::Memory => ExportKind::Memory,
                wasmparser::ExternalKind::Table => ExportKind::Table,
                // Globals and tags are outside the flat surface this linker
                // wires; exporting them is harmless, so skip them.
                wasmparser::ExternalKind::Global | wasmparser::ExternalKind::Tag => continue,
            };
            self.exports.push(ModuleExport {
                name: export.name.to_string(),
                kind,
            });
        }
        Ok(())
    }

    /// Signature of a function by module-wide index (imports precede
    /// defined functions in the index space).
    fn func_sig(&self, index: u32) -> Option<ScalarSig> {
        if index < self.num_imported_funcs {
            let mut seen = 0;
            for import in &self.imports {
                if let ImportKind::Func(sig) = &import.kind {
                    if seen == index {
                        return Some(sig.clone());
                    }
                    seen += 1;
                }
            }
            None
        } else {
            let defined = (index - self.num_imported_funcs) as usize;
            let type_idx = *self.func_types.get(defined)? as usize;
            self.types.get(type_idx).cloned()
        }
    }
}

fn parse_error(module: &str, e: wasmparser::BinaryReaderError) -> LinkError {
    LinkError::Module {
        module: module.to_string(),
        message: e.to_string(),
    }
}
