//! Canonical lowering: adapters between structured component-level function
//! types and the flat scalar ABI.
//!
//! Flattening rules:
//! - numeric primitives become one scalar of matching width (8/16-bit values
//!   travel widened in an i32, 64-bit integers in an i64);
//! - `string` and `list<T>` become a (pointer, length) pair of i32s into the
//!   designated linear memory;
//! - records flatten field-by-field in declaration order, recursively.
//!
//! Results follow the same rules in the return direction, as core
//! multi-value results. A function whose signature flattens to nothing still
//! lowers to a valid zero-arity scalar call.
//!
//! Adapters whose configured string encoding is not the canonical UTF-8 must
//! re-encode through scratch space obtained from the designated realloc
//! export; generating such an adapter without a designated memory and
//! realloc is a fatal `AllocationUnavailable` error. Strings nested inside a
//! list element have no flattened slot to re-encode, so binding such a type
//! with a non-canonical encoding is rejected outright.

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::module::{ScalarKind, ScalarSig};
use crate::types::{Primitive, TypeDef, TypeId, TypeTable};

/// How strings are encoded on the module side of an adapter.
///
/// The canonical in-memory form at the component boundary is UTF-8; any
/// other module-side encoding forces the adapter to re-encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    #[default]
    Utf8,
    Utf16,
    Latin1,
}

impl StringEncoding {
    /// Size of one code unit in bytes.
    pub fn unit_size(self) -> u32 {
        match self {
            StringEncoding::Utf8 | StringEncoding::Latin1 => 1,
            StringEncoding::Utf16 => 2,
        }
    }
}

/// A reference to an export of a named module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportRef {
    pub module: String,
    pub export: String,
}

/// Per-binding canonical options as declared by the front end.
///
/// `memory`/`realloc` override the linker-wide designations; `None` means
/// use the designated defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalOptions {
    #[serde(default)]
    pub string_encoding: StringEncoding,
    #[serde(default)]
    pub memory: Option<ExportRef>,
    #[serde(default)]
    pub realloc: Option<ExportRef>,
}

/// Options after designation resolution. `memory`/`realloc` are present iff
/// the adapter actually marshals through memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedOptions {
    pub string_encoding: StringEncoding,
    pub memory: Option<ExportRef>,
    pub realloc: Option<ExportRef>,
}

/// One slot of a flattened signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatSlot {
    Scalar(ScalarKind),
    /// First half of a string's (pointer, length) pair.
    StringPtr,
    /// Second half of a string's (pointer, length) pair.
    StringLen,
    /// First half of a list's (pointer, length) pair.
    ListPtr,
    /// Second half of a list's (pointer, length) pair.
    ListLen,
}

impl FlatSlot {
    pub fn kind(self) -> ScalarKind {
        match self {
            FlatSlot::Scalar(kind) => kind,
            // Pointers and lengths are 32-bit.
            _ => ScalarKind::I32,
        }
    }
}

/// Flatten one value type into `out`.
pub fn flatten_type(
    types: &TypeTable,
    id: TypeId,
    out: &mut Vec<FlatSlot>,
) -> Result<(), LinkError> {
    let def = types.get(id).ok_or_else(|| LinkError::Definition {
        message: format!("flattening references undeclared type {}", id.0),
    })?;
    match def {
        TypeDef::Primitive(p) => out.push(FlatSlot::Scalar(primitive_kind(*p))),
        TypeDef::String => {
            out.push(FlatSlot::StringPtr);
            out.push(FlatSlot::StringLen);
        }
        TypeDef::List(_) => {
            out.push(FlatSlot::ListPtr);
            out.push(FlatSlot::ListLen);
        }
        TypeDef::Record(fields) => {
            for field in fields {
                flatten_type(types, field.ty, out)?;
            }
        }
        TypeDef::Func(_) => {
            return Err(LinkError::Definition {
                message: "function type in value position".to_string(),
            });
        }
    }
    Ok(())
}

/// Whether `id`'s tree holds a string behind a list boundary. Such strings
/// never flatten into slots of their own, so slot-level re-encoding cannot
/// reach them.
fn list_holds_string(types: &TypeTable, id: TypeId, inside_list: bool) -> bool {
    match types.get(id) {
        Some(TypeDef::String) => inside_list,
        Some(TypeDef::List(element)) => list_holds_string(types, *element, true),
        Some(TypeDef::Record(fields)) => fields
            .iter()
            .any(|f| list_holds_string(types, f.ty, inside_list)),
        _ => false,
    }
}

fn primitive_kind(p: Primitive) -> ScalarKind {
    match p {
        Primitive::Bool
        | Primitive::U8
        | Primitive::U16
        | Primitive::U32
        | Primitive::S8
        | Primitive::S16
        | Primitive::S32
        | Primitive::Char => ScalarKind::I32,
        Primitive::U64 | Primitive::S64 => ScalarKind::I64,
        Primitive::F32 => ScalarKind::F32,
        Primitive::F64 => ScalarKind::F64,
    }
}

/// A synthesized adapter for one bound import function.
#[derive(Debug, Clone)]
pub struct Adapter {
    /// Stable symbol for the adapter, `<instance>#<func>`. Also its export
    /// name in the synthesized module that carries it.
    pub name: String,
    pub instance: String,
    pub func: String,
    /// The component-level function type being lowered.
    pub ty: TypeId,
    /// The flat scalar signature shared by the module import and the
    /// lowered target call.
    pub signature: ScalarSig,
    pub param_slots: Vec<FlatSlot>,
    pub result_slots: Vec<FlatSlot>,
    pub options: ResolvedOptions,
}

impl Adapter {
    /// Whether this adapter re-encodes strings through scratch memory.
    pub fn transcodes(&self) -> bool {
        self.options.string_encoding != StringEncoding::Utf8 && self.has_string()
    }

    fn has_string(&self) -> bool {
        self.param_slots
            .iter()
            .chain(&self.result_slots)
            .any(|s| matches!(s, FlatSlot::StringPtr))
    }
}

/// Generates adapters. Designated memory and realloc must be resolved
/// before construction; the pipeline enforces that ordering.
pub struct AdapterGenerator<'a> {
    types: &'a TypeTable,
    designated_memory: Option<ExportRef>,
    designated_realloc: Option<ExportRef>,
}

impl<'a> AdapterGenerator<'a> {
    pub fn new(
        types: &'a TypeTable,
        designated_memory: Option<ExportRef>,
        designated_realloc: Option<ExportRef>,
    ) -> Self {
        Self {
            types,
            designated_memory,
            designated_realloc,
        }
    }

    /// Lower one bound import function into an adapter.
    pub fn lower(
        &self,
        instance: &str,
        func: &str,
        ty: TypeId,
        options: &CanonicalOptions,
    ) -> Result<Adapter, LinkError> {
        let func_ty = self.types.func_type(ty).ok_or_else(|| LinkError::Definition {
            message: format!("'{instance}'::'{func}' does not name a function type"),
        })?;

        // Non-canonical encodings re-encode string slots in place, but a
        // string inside a list has no slot to re-encode; rejecting the
        // binding beats handing module-encoded bytes to a UTF-8 callee.
        if options.string_encoding != StringEncoding::Utf8 {
            let nested = func_ty
                .params
                .iter()
                .map(|p| p.ty)
                .chain(func_ty.result)
                .any(|id| list_holds_string(self.types, id, false));
            if nested {
                return Err(LinkError::Definition {
                    message: format!(
                        "'{instance}'::'{func}' re-encodes strings inside a list, \
                         which marshaling does not support"
                    ),
                });
            }
        }

        let mut param_slots = Vec::new();
        for param in &func_ty.params {
            flatten_type(self.types, param.ty, &mut param_slots)?;
        }
        let mut result_slots = Vec::new();
        if let Some(result) = func_ty.result {
            flatten_type(self.types, result, &mut result_slots)?;
        }

        let signature = ScalarSig {
            params: param_slots.iter().map(|s| s.kind()).collect(),
            results: result_slots.iter().map(|s| s.kind()).collect(),
        };

        let name = format!("{instance}#{func}");
        let mut adapter = Adapter {
            name,
            instance: instance.to_string(),
            func: func.to_string(),
            ty,
            signature,
            param_slots,
            result_slots,
            options: ResolvedOptions {
                string_encoding: options.string_encoding,
                memory: None,
                realloc: None,
            },
        };

        if adapter.transcodes() {
            let memory = options
                .memory
                .clone()
                .or_else(|| self.designated_memory.clone());
            let realloc = options
                .realloc
                .clone()
                .or_else(|| self.designated_realloc.clone());
            match (memory, realloc) {
                (Some(memory), Some(realloc)) => {
                    adapter.options.memory = Some(memory);
                    adapter.options.realloc = Some(realloc);
                }
                _ => {
                    return Err(LinkError::AllocationUnavailable {
                        adapter: adapter.name,
                    });
                }
            }
        }

        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Primitive;

    fn table() -> TypeTable {
        TypeTable::new()
    }

    #[test]
    fn primitives_widen_to_native_words() {
        let mut types = table();
        let u8_ty = types.primitive(Primitive::U8);
        let s64 = types.primitive(Primitive::S64);
        let f32 = types.primitive(Primitive::F32);
        let f = types
            .func([("a", u8_ty), ("b", s64), ("c", f32)], Some(u8_ty))
            .unwrap();

        let generator = AdapterGenerator::new(&types, None, None);
        let adapter = generator
            .lower("env", "f", f, &CanonicalOptions::default())
            .unwrap();

        assert_eq!(
            adapter.signature.params,
            vec![ScalarKind::I32, ScalarKind::I64, ScalarKind::F32]
        );
        assert_eq!(adapter.signature.results, vec![ScalarKind::I32]);
    }

    #[test]
    fn string_flattens_to_ptr_len() {
        let mut types = table();
        let string = types.string();
        let f = types.func([("s", string)], None).unwrap();

        let generator = AdapterGenerator::new(&types, None, None);
        let adapter = generator
            .lower("env", "log", f, &CanonicalOptions::default())
            .unwrap();

        assert_eq!(
            adapter.signature.params,
            vec![ScalarKind::I32, ScalarKind::I32]
        );
        assert_eq!(
            adapter.param_slots,
            vec![FlatSlot::StringPtr, FlatSlot::StringLen]
        );
        assert!(!adapter.transcodes());
    }

    #[test]
    fn records_flatten_recursively_in_declaration_order() {
        let mut types = table();
        let s32 = types.primitive(Primitive::S32);
        let string = types.string();
        let inner = types.record([("tag", s32), ("label", string)]).unwrap();
        let outer = types.record([("head", inner), ("count", s32)]).unwrap();
        let f = types.func([("r", outer)], None).unwrap();

        let generator = AdapterGenerator::new(&types, None, None);
        let adapter = generator
            .lower("env", "take", f, &CanonicalOptions::default())
            .unwrap();

        assert_eq!(
            adapter.param_slots,
            vec![
                FlatSlot::Scalar(ScalarKind::I32),
                FlatSlot::StringPtr,
                FlatSlot::StringLen,
                FlatSlot::Scalar(ScalarKind::I32),
            ]
        );
    }

    #[test]
    fn zero_arity_signature_is_valid() {
        let mut types = table();
        let f = types.func(Vec::<(String, TypeId)>::new(), None).unwrap();

        let generator = AdapterGenerator::new(&types, None, None);
        let adapter = generator
            .lower("env", "tick", f, &CanonicalOptions::default())
            .unwrap();
        assert!(adapter.signature.params.is_empty());
        assert!(adapter.signature.results.is_empty());
    }

    #[test]
    fn reencoding_without_designation_fails() {
        let mut types = table();
        let string = types.string();
        let f = types.func([("s", string)], None).unwrap();

        let generator = AdapterGenerator::new(&types, None, None);
        let options = CanonicalOptions {
            string_encoding: StringEncoding::Utf16,
            ..Default::default()
        };
        let err = generator.lower("env", "log", f, &options).unwrap_err();
        assert!(matches!(err, LinkError::AllocationUnavailable { .. }));
    }

    #[test]
    fn strings_inside_lists_cannot_be_reencoded() {
        let mut types = table();
        let string = types.string();
        let names = types.list(string).unwrap();
        let f = types.func([("names", names)], None).unwrap();

        // Designations present: the rejection is about reachability of the
        // nested strings, not about allocation.
        let memory = ExportRef {
            module: "core".to_string(),
            export: "memory".to_string(),
        };
        let realloc = ExportRef {
            module: "core".to_string(),
            export: "realloc".to_string(),
        };
        let generator = AdapterGenerator::new(&types, Some(memory), Some(realloc));
        let options = CanonicalOptions {
            string_encoding: StringEncoding::Latin1,
            ..Default::default()
        };
        let err = generator.lower("env", "take", f, &options).unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));

        // The canonical encoding passes the (ptr, len) pair through.
        let adapter = generator
            .lower("env", "take", f, &CanonicalOptions::default())
            .unwrap();
        assert!(!adapter.transcodes());
    }

    #[test]
    fn record_wrapped_list_strings_are_also_rejected() {
        let mut types = table();
        let string = types.string();
        let names = types.list(string).unwrap();
        let batch = types.record([("names", names)]).unwrap();
        let f = types.func([("b", batch)], None).unwrap();

        let generator = AdapterGenerator::new(&types, None, None);
        let options = CanonicalOptions {
            string_encoding: StringEncoding::Utf16,
            ..Default::default()
        };
        let err = generator.lower("env", "take", f, &options).unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));
    }

    #[test]
    fn reencoding_picks_up_designations() {
        let mut types = table();
        let string = types.string();
        let f = types.func([("s", string)], None).unwrap();

        let memory = ExportRef {
            module: "core".to_string(),
            export: "memory".to_string(),
        };
        let realloc = ExportRef {
            module: "core".to_string(),
            export: "realloc".to_string(),
        };
        let generator = AdapterGenerator::new(&types, Some(memory.clone()), Some(realloc.clone()));
        let options = CanonicalOptions {
            string_encoding: StringEncoding::Utf16,
            ..Default::default()
        };
        let adapter = generator.lower("env", "log", f, &options).unwrap();
        assert!(adapter.transcodes());
        assert_eq!(adapter.options.memory, Some(memory));
        assert_eq!(adapter.options.realloc, Some(realloc));
    }
}
