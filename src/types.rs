//! The type table: declared component-level types and structural equality.
//!
//! Types are compared structurally, not nominally. Two records declared
//! independently with the same field names and field types are the same type
//! anywhere the linker requires type equality, including across instance
//! boundaries. Equality is implemented by interning: every declared shape is
//! hashed into a canonical SHA-256 digest over its variant tree (child types
//! contribute their own digests, so structurally equal trees collide by
//! construction), and `declare` returns the existing id for an
//! already-interned shape. After that, equality is a digest comparison.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LinkError;

/// Index of a declared type in a [`TypeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Fixed-width primitive value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    Bool,
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
    F64,
    Char,
}

/// A named field of a record, or a named function parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: TypeId,
}

/// A component-level function signature: ordered named parameters and an
/// optional result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncType {
    pub params: Vec<Field>,
    pub result: Option<TypeId>,
}

/// A declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeDef {
    Primitive(Primitive),
    String,
    Record(Vec<Field>),
    List(TypeId),
    Func(FuncType),
}

/// A 256-bit structural shape digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeHash([u8; 32]);

impl ShapeHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// Tag bytes distinguishing type constructors in the digest stream.
const TAG_PRIMITIVE: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_RECORD: u8 = 0x03;
const TAG_LIST: u8 = 0x04;
const TAG_FUNC: u8 = 0x05;

/// Incremental digest builder over a type shape.
///
/// Field and parameter names are part of the shape; declaration-site names
/// for the types themselves are not, so `point` and `vec2` with identical
/// fields produce identical digests.
struct ShapeHasher {
    hasher: Sha256,
}

impl ShapeHasher {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn tag(mut self, tag: u8) -> Self {
        self.hasher.update([tag]);
        self
    }

    fn string(mut self, s: &str) -> Self {
        self.hasher.update((s.len() as u32).to_le_bytes());
        self.hasher.update(s.as_bytes());
        self
    }

    fn child(mut self, hash: &ShapeHash) -> Self {
        self.hasher.update(hash.as_bytes());
        self
    }

    fn count(mut self, n: usize) -> Self {
        self.hasher.update((n as u32).to_le_bytes());
        self
    }

    fn finish(self) -> ShapeHash {
        let digest = self.hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        ShapeHash(bytes)
    }
}

/// All declared types, keyed by [`TypeId`], with structural interning.
#[derive(Debug, Default)]
pub struct TypeTable {
    defs: Vec<TypeDef>,
    hashes: Vec<ShapeHash>,
    interned: HashMap<ShapeHash, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a type, returning its id.
    ///
    /// Declaring a shape structurally equal to an already-declared one
    /// returns the existing id. Referencing an undeclared [`TypeId`], or
    /// placing a function type in value position (record field, list
    /// element, parameter, result), is a fatal definition error.
    pub fn declare(&mut self, def: TypeDef) -> Result<TypeId, LinkError> {
        self.validate(&def)?;
        let hash = self.hash_def(&def);
        if let Some(&id) = self.interned.get(&hash) {
            return Ok(id);
        }
        let id = TypeId(self.defs.len() as u32);
        self.defs.push(def);
        self.hashes.push(hash);
        self.interned.insert(hash, id);
        Ok(id)
    }

    /// Structural equality between two declared types.
    ///
    /// O(1): shapes were digested at declaration time. An undeclared id is
    /// equal to nothing, itself included.
    pub fn resolve_equals(&self, a: TypeId, b: TypeId) -> bool {
        match (self.hashes.get(a.0 as usize), self.hashes.get(b.0 as usize)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// The definition behind `id`. `TypeId` is public and deserializable,
    /// so a fabricated id yields `None` rather than a panic.
    pub fn get(&self, id: TypeId) -> Option<&TypeDef> {
        self.defs.get(id.0 as usize)
    }

    pub fn shape_hash(&self, id: TypeId) -> Option<ShapeHash> {
        self.hashes.get(id.0 as usize).copied()
    }

    /// The function signature behind `id`, if it names a function type.
    pub fn func_type(&self, id: TypeId) -> Option<&FuncType> {
        match self.get(id)? {
            TypeDef::Func(f) => Some(f),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    // Convenience constructors used by the front end and tests.

    pub fn primitive(&mut self, p: Primitive) -> TypeId {
        self.declare(TypeDef::Primitive(p)).expect("primitive declarations are always valid")
    }

    pub fn string(&mut self) -> TypeId {
        self.declare(TypeDef::String).expect("string declaration is always valid")
    }

    pub fn record(
        &mut self,
        fields: impl IntoIterator<Item = (impl Into<String>, TypeId)>,
    ) -> Result<TypeId, LinkError> {
        let fields = fields
            .into_iter()
            .map(|(name, ty)| Field {
                name: name.into(),
                ty,
            })
            .collect();
        self.declare(TypeDef::Record(fields))
    }

    pub fn list(&mut self, element: TypeId) -> Result<TypeId, LinkError> {
        self.declare(TypeDef::List(element))
    }

    pub fn func(
        &mut self,
        params: impl IntoIterator<Item = (impl Into<String>, TypeId)>,
        result: Option<TypeId>,
    ) -> Result<TypeId, LinkError> {
        let params = params
            .into_iter()
            .map(|(name, ty)| Field {
                name: name.into(),
                ty,
            })
            .collect();
        self.declare(TypeDef::Func(FuncType { params, result }))
    }

    fn validate(&self, def: &TypeDef) -> Result<(), LinkError> {
        match def {
            TypeDef::Primitive(_) | TypeDef::String => Ok(()),
            TypeDef::Record(fields) => {
                for (i, field) in fields.iter().enumerate() {
                    self.check_value_ref(field.ty, &field.name)?;
                    if fields[..i].iter().any(|f| f.name == field.name) {
                        return Err(LinkError::Definition {
                            message: format!("duplicate record field '{}'", field.name),
                        });
                    }
                }
                Ok(())
            }
            TypeDef::List(element) => self.check_value_ref(*element, "list element"),
            TypeDef::Func(func) => {
                for (i, param) in func.params.iter().enumerate() {
                    self.check_value_ref(param.ty, &param.name)?;
                    if func.params[..i].iter().any(|p| p.name == param.name) {
                        return Err(LinkError::Definition {
                            message: format!("duplicate parameter '{}'", param.name),
                        });
                    }
                }
                if let Some(result) = func.result {
                    self.check_value_ref(result, "result")?;
                }
                Ok(())
            }
        }
    }

    /// A value-position reference must name a declared, non-function type.
    fn check_value_ref(&self, id: TypeId, context: &str) -> Result<(), LinkError> {
        match self.defs.get(id.0 as usize) {
            None => Err(LinkError::Definition {
                message: format!("'{context}' references undeclared type {}", id.0),
            }),
            Some(TypeDef::Func(_)) => Err(LinkError::Definition {
                message: format!("'{context}' references a function type in value position"),
            }),
            Some(_) => Ok(()),
        }
    }

    fn hash_def(&self, def: &TypeDef) -> ShapeHash {
        match def {
            TypeDef::Primitive(p) => ShapeHasher::new().tag(TAG_PRIMITIVE).tag(*p as u8).finish(),
            TypeDef::String => ShapeHasher::new().tag(TAG_STRING).finish(),
            TypeDef::Record(fields) => {
                let mut hasher = ShapeHasher::new().tag(TAG_RECORD).count(fields.len());
                for field in fields {
                    hasher = hasher.string(&field.name).child(&self.hashes[field.ty.0 as usize]);
                }
                hasher.finish()
            }
            TypeDef::List(element) => ShapeHasher::new()
                .tag(TAG_LIST)
                .child(&self.hashes[element.0 as usize])
                .finish(),
            TypeDef::Func(func) => {
                let mut hasher = ShapeHasher::new().tag(TAG_FUNC).count(func.params.len());
                for param in &func.params {
                    hasher = hasher.string(&param.name).child(&self.hashes[param.ty.0 as usize]);
                }
                match func.result {
                    Some(result) => {
                        hasher = hasher.count(1).child(&self.hashes[result.0 as usize]);
                    }
                    None => hasher = hasher.count(0),
                }
                hasher.finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structurally_equal_records_intern_to_one_id() {
        let mut table = TypeTable::new();
        let s32 = table.primitive(Primitive::S32);
        let point = table.record([("x", s32), ("y", s32)]).unwrap();
        let vec2 = table.record([("x", s32), ("y", s32)]).unwrap();

        assert_eq!(point, vec2);
        assert!(table.resolve_equals(point, vec2));
    }

    #[test]
    fn equality_survives_declaration_order() {
        // Same shapes reached through different declaration orders.
        let mut a = TypeTable::new();
        let a_s32 = a.primitive(Primitive::S32);
        let a_str = a.string();
        let a_rec = a.record([("id", a_s32), ("name", a_str)]).unwrap();

        let mut b = TypeTable::new();
        let b_str = b.string();
        let b_u8 = b.primitive(Primitive::U8);
        let _ = b.list(b_u8).unwrap();
        let b_s32 = b.primitive(Primitive::S32);
        let b_rec = b.record([("id", b_s32), ("name", b_str)]).unwrap();

        assert_eq!(a.shape_hash(a_rec).unwrap(), b.shape_hash(b_rec).unwrap());
    }

    #[test]
    fn fabricated_ids_resolve_to_nothing() {
        let mut table = TypeTable::new();
        let s32 = table.primitive(Primitive::S32);

        assert!(table.get(TypeId(99)).is_none());
        assert!(table.shape_hash(TypeId(99)).is_none());
        assert!(!table.resolve_equals(TypeId(99), s32));
        assert!(!table.resolve_equals(TypeId(99), TypeId(99)));
    }

    #[test]
    fn field_names_are_part_of_the_shape() {
        let mut table = TypeTable::new();
        let s32 = table.primitive(Primitive::S32);
        let xy = table.record([("x", s32), ("y", s32)]).unwrap();
        let ab = table.record([("a", s32), ("b", s32)]).unwrap();

        assert_ne!(xy, ab);
        assert!(!table.resolve_equals(xy, ab));
    }

    #[test]
    fn func_signatures_compare_structurally() {
        let mut table = TypeTable::new();
        let s32 = table.primitive(Primitive::S32);
        let f = table.func([("a", s32)], Some(s32)).unwrap();
        let g = table.func([("a", s32)], Some(s32)).unwrap();
        let h = table.func([("a", s32)], None).unwrap();

        assert!(table.resolve_equals(f, g));
        assert!(!table.resolve_equals(f, h));
    }

    #[test]
    fn undeclared_reference_is_a_definition_error() {
        let mut table = TypeTable::new();
        let err = table.list(TypeId(42)).unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));
    }

    #[test]
    fn func_in_value_position_is_rejected() {
        let mut table = TypeTable::new();
        let s32 = table.primitive(Primitive::S32);
        let f = table.func([("a", s32)], None).unwrap();
        let err = table.list(f).unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));

        let err = table.func([("callback", f)], None).unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));
    }

    #[test]
    fn duplicate_field_names_are_rejected() {
        let mut table = TypeTable::new();
        let s32 = table.primitive(Primitive::S32);
        let err = table.record([("x", s32), ("x", s32)]).unwrap_err();
        assert!(matches!(err, LinkError::Definition { .. }));
    }
}
