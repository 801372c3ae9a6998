//! Type registry for Cot.
//!
//! A process-lifetime table of `TypeInfo` records addressed by a dense
//! 32-bit `TypeIndex`. Well-known types occupy stable low indices; user
//! types follow. Every compound constructor deduplicates by content, so
//! constructing pointer-to-T twice yields the same index.
//!
//! STRING is represented internally as slice<u8>: a (ptr, len) pair of
//! 16 bytes. The decomposition passes rely on this and accept either
//! `string_make` or `slice_make` at every extraction point.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dense index into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeIndex(pub u32);

impl TypeIndex {
    pub const BOOL: TypeIndex = TypeIndex(0);
    pub const I8: TypeIndex = TypeIndex(1);
    pub const I16: TypeIndex = TypeIndex(2);
    pub const I32: TypeIndex = TypeIndex(3);
    pub const I64: TypeIndex = TypeIndex(4);
    pub const U8: TypeIndex = TypeIndex(5);
    pub const U16: TypeIndex = TypeIndex(6);
    pub const U32: TypeIndex = TypeIndex(7);
    pub const U64: TypeIndex = TypeIndex(8);
    pub const F32: TypeIndex = TypeIndex(9);
    pub const F64: TypeIndex = TypeIndex(10);
    pub const VOID: TypeIndex = TypeIndex(11);
    pub const STRING: TypeIndex = TypeIndex(12);
    /// Pseudo-type for memory state in SSA.
    pub const SSA_MEM: TypeIndex = TypeIndex(13);
    /// Pseudo-type for condition flags (native path).
    pub const FLAGS: TypeIndex = TypeIndex(14);
    /// Pseudo-type for multi-result values.
    pub const TUPLE: TypeIndex = TypeIndex(15);
    /// Pseudo-type for call results pending selection.
    pub const RESULTS: TypeIndex = TypeIndex(16);
    /// First index available for user types.
    pub const FIRST_USER: u32 = 17;
}

/// A struct field: name, type, byte offset within the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: TypeIndex,
    pub offset: u32,
}

/// A union variant. `payload` is absent for tag-only variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub payload: Option<TypeIndex>,
}

/// The shape of a type. Content equality drives deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    Bool,
    Int { bits: u8, signed: bool },
    Float { bits: u8 },
    Void,
    String,
    Mem,
    Flags,
    Tuple,
    Results,
    Pointer { elem: TypeIndex },
    Optional { elem: TypeIndex },
    ErrorUnion { payload: TypeIndex },
    Slice { elem: TypeIndex },
    Array { elem: TypeIndex, len: u32 },
    List { elem: TypeIndex },
    Map { key: TypeIndex, value: TypeIndex },
    Func { params: Vec<TypeIndex>, ret: TypeIndex },
    Struct { name: String, fields: Vec<Field> },
    Enum { name: String, backing: TypeIndex },
    Union { name: String, tag: TypeIndex, variants: Vec<Variant> },
}

/// One registry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeInfo {
    pub kind: TypeKind,
    pub size: u32,
    pub align: u32,
}

/// The registry. Immutable once the check phase completes; the core only
/// reads it (and constructs derived types, which dedup to existing ones).
#[derive(Debug, Serialize, Deserialize)]
pub struct TypeRegistry {
    infos: Vec<TypeInfo>,
    #[serde(skip)]
    dedup: HashMap<TypeKind, TypeIndex>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create a registry seeded with the well-known types at their
    /// documented indices.
    pub fn new() -> TypeRegistry {
        let mut reg = TypeRegistry {
            infos: Vec::new(),
            dedup: HashMap::new(),
        };
        // Order must match the TypeIndex constants exactly.
        reg.push(TypeKind::Bool, 1, 1);
        reg.push(TypeKind::Int { bits: 8, signed: true }, 1, 1);
        reg.push(TypeKind::Int { bits: 16, signed: true }, 2, 2);
        reg.push(TypeKind::Int { bits: 32, signed: true }, 4, 4);
        reg.push(TypeKind::Int { bits: 64, signed: true }, 8, 8);
        reg.push(TypeKind::Int { bits: 8, signed: false }, 1, 1);
        reg.push(TypeKind::Int { bits: 16, signed: false }, 2, 2);
        reg.push(TypeKind::Int { bits: 32, signed: false }, 4, 4);
        reg.push(TypeKind::Int { bits: 64, signed: false }, 8, 8);
        reg.push(TypeKind::Float { bits: 32 }, 4, 4);
        reg.push(TypeKind::Float { bits: 64 }, 8, 8);
        reg.push(TypeKind::Void, 0, 1);
        reg.push(TypeKind::String, 16, 8);
        reg.push(TypeKind::Mem, 0, 1);
        reg.push(TypeKind::Flags, 0, 1);
        reg.push(TypeKind::Tuple, 0, 1);
        reg.push(TypeKind::Results, 0, 1);
        debug_assert_eq!(reg.infos.len() as u32, TypeIndex::FIRST_USER);
        reg
    }

    fn push(&mut self, kind: TypeKind, size: u32, align: u32) -> TypeIndex {
        let idx = TypeIndex(self.infos.len() as u32);
        self.dedup.insert(kind.clone(), idx);
        self.infos.push(TypeInfo { kind, size, align });
        idx
    }

    /// Rebuild the dedup map after deserialization (the map itself is not
    /// serialized).
    pub fn rehydrate(&mut self) {
        self.dedup.clear();
        for (i, info) in self.infos.iter().enumerate() {
            self.dedup.insert(info.kind.clone(), TypeIndex(i as u32));
        }
    }

    fn intern(&mut self, kind: TypeKind, size: u32, align: u32) -> TypeIndex {
        if let Some(&idx) = self.dedup.get(&kind) {
            return idx;
        }
        self.push(kind, size, align)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn info(&self, idx: TypeIndex) -> &TypeInfo {
        &self.infos[idx.0 as usize]
    }

    pub fn kind(&self, idx: TypeIndex) -> &TypeKind {
        &self.infos[idx.0 as usize].kind
    }

    pub fn size_of(&self, idx: TypeIndex) -> u32 {
        self.infos[idx.0 as usize].size
    }

    pub fn align_of(&self, idx: TypeIndex) -> u32 {
        self.infos[idx.0 as usize].align
    }

    // Compound constructors. All deduplicate by content.

    pub fn make_pointer(&mut self, elem: TypeIndex) -> TypeIndex {
        self.intern(TypeKind::Pointer { elem }, 8, 8)
    }

    /// Optionals of pointer type are nullable scalars; any other optional
    /// is a {tag, payload} pair.
    pub fn make_optional(&mut self, elem: TypeIndex) -> TypeIndex {
        let (size, align) = if matches!(self.kind(elem), TypeKind::Pointer { .. }) {
            (8, 8)
        } else {
            let payload = self.size_of(elem).max(1);
            (8 + align_up(payload, 8), 8)
        };
        self.intern(TypeKind::Optional { elem }, size, align)
    }

    /// Error unions are {tag i64, payload} pairs.
    pub fn make_error_union(&mut self, payload: TypeIndex) -> TypeIndex {
        let psize = align_up(self.size_of(payload).max(1), 8);
        self.intern(TypeKind::ErrorUnion { payload }, 8 + psize, 8)
    }

    pub fn make_slice(&mut self, elem: TypeIndex) -> TypeIndex {
        self.intern(TypeKind::Slice { elem }, 16, 8)
    }

    pub fn make_array(&mut self, elem: TypeIndex, len: u32) -> TypeIndex {
        let elem_size = self.size_of(elem);
        let align = self.align_of(elem);
        self.intern(TypeKind::Array { elem, len }, elem_size * len, align)
    }

    /// Lists are heap handles (a single pointer).
    pub fn make_list(&mut self, elem: TypeIndex) -> TypeIndex {
        self.intern(TypeKind::List { elem }, 8, 8)
    }

    /// Maps are heap handles (a single pointer).
    pub fn make_map(&mut self, key: TypeIndex, value: TypeIndex) -> TypeIndex {
        self.intern(TypeKind::Map { key, value }, 8, 8)
    }

    /// Function types are code indices (a single pointer-sized value).
    pub fn make_func(&mut self, params: Vec<TypeIndex>, ret: TypeIndex) -> TypeIndex {
        self.intern(TypeKind::Func { params, ret }, 8, 8)
    }

    /// Lay out a struct: assign field offsets by declaration order with
    /// natural alignment, and intern the result.
    pub fn make_struct(&mut self, name: &str, fields: Vec<(String, TypeIndex)>) -> TypeIndex {
        let mut laid = Vec::with_capacity(fields.len());
        let mut offset = 0u32;
        let mut align = 1u32;
        for (fname, fty) in fields {
            let fa = self.align_of(fty).max(1);
            let fs = self.size_of(fty);
            offset = align_up(offset, fa);
            laid.push(Field {
                name: fname,
                ty: fty,
                offset,
            });
            offset += fs;
            align = align.max(fa);
        }
        let size = align_up(offset, align);
        self.intern(
            TypeKind::Struct {
                name: name.to_string(),
                fields: laid,
            },
            size,
            align,
        )
    }

    pub fn make_enum(&mut self, name: &str, backing: TypeIndex) -> TypeIndex {
        let size = self.size_of(backing);
        let align = self.align_of(backing);
        self.intern(
            TypeKind::Enum {
                name: name.to_string(),
                backing,
            },
            size,
            align,
        )
    }

    /// Unions are {tag, max payload} with 8-byte alignment.
    pub fn make_union(&mut self, name: &str, tag: TypeIndex, variants: Vec<Variant>) -> TypeIndex {
        let mut payload_max = 0u32;
        for v in &variants {
            if let Some(p) = v.payload {
                payload_max = payload_max.max(self.size_of(p));
            }
        }
        let size = 8 + align_up(payload_max, 8);
        self.intern(
            TypeKind::Union {
                name: name.to_string(),
                tag,
                variants,
            },
            size,
            8,
        )
    }

    // Queries.

    pub fn is_signed(&self, idx: TypeIndex) -> bool {
        match self.kind(idx) {
            TypeKind::Int { signed, .. } => *signed,
            TypeKind::Enum { backing, .. } => self.is_signed(*backing),
            _ => true,
        }
    }

    pub fn is_float(&self, idx: TypeIndex) -> bool {
        matches!(self.kind(idx), TypeKind::Float { .. })
    }

    pub fn is_pointer(&self, idx: TypeIndex) -> bool {
        matches!(self.kind(idx), TypeKind::Pointer { .. })
    }

    /// True for STRING and any slice: a (ptr, len) pair.
    pub fn is_slice_like(&self, idx: TypeIndex) -> bool {
        matches!(self.kind(idx), TypeKind::String | TypeKind::Slice { .. })
    }

    /// True for every two-component 16-byte value: strings, slices, error
    /// unions, and wide optionals. These decompose into two 8-byte SSA
    /// values joined by a make op.
    pub fn is_pair(&self, idx: TypeIndex) -> bool {
        match self.kind(idx) {
            TypeKind::String | TypeKind::Slice { .. } => true,
            TypeKind::ErrorUnion { .. } | TypeKind::Optional { .. } => self.size_of(idx) == 16,
            _ => false,
        }
    }

    /// True if values of this type are heap objects subject to ARC.
    pub fn is_managed(&self, idx: TypeIndex) -> bool {
        match self.kind(idx) {
            TypeKind::Pointer { .. } | TypeKind::List { .. } | TypeKind::Map { .. } => true,
            TypeKind::Optional { elem } => self.is_managed(*elem),
            _ => false,
        }
    }

    /// True for types that fit a single SSA register (8 bytes or fewer).
    pub fn is_scalar(&self, idx: TypeIndex) -> bool {
        self.size_of(idx) <= 8 && !matches!(self.kind(idx), TypeKind::Void)
    }

    /// The display name of a nominal type, if it has one.
    pub fn name_of(&self, idx: TypeIndex) -> Option<&str> {
        match self.kind(idx) {
            TypeKind::Struct { name, .. }
            | TypeKind::Enum { name, .. }
            | TypeKind::Union { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Field lookup on a struct type.
    pub fn field<'a>(&'a self, idx: TypeIndex, name: &str) -> Option<&'a Field> {
        match self.kind(idx) {
            TypeKind::Struct { fields, .. } => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }

    /// Variant lookup on a union type, by unqualified name. Returns the
    /// tag value (declaration index) and payload type.
    pub fn union_variant(&self, idx: TypeIndex, name: &str) -> Option<(i64, Option<TypeIndex>)> {
        match self.kind(idx) {
            TypeKind::Union { variants, .. } => variants
                .iter()
                .position(|v| v.name == name)
                .map(|i| (i as i64, variants[i].payload)),
            _ => None,
        }
    }

    pub fn elem_of(&self, idx: TypeIndex) -> Option<TypeIndex> {
        match self.kind(idx) {
            TypeKind::Pointer { elem }
            | TypeKind::Optional { elem }
            | TypeKind::Slice { elem }
            | TypeKind::Array { elem, .. }
            | TypeKind::List { elem } => Some(*elem),
            TypeKind::String => Some(TypeIndex::U8),
            _ => None,
        }
    }
}

pub fn align_up(n: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_indices() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.size_of(TypeIndex::BOOL), 1);
        assert_eq!(reg.size_of(TypeIndex::I64), 8);
        assert_eq!(reg.size_of(TypeIndex::F32), 4);
        assert_eq!(reg.size_of(TypeIndex::F64), 8);
        assert_eq!(reg.size_of(TypeIndex::STRING), 16);
        assert_eq!(reg.size_of(TypeIndex::VOID), 0);
        assert!(matches!(
            reg.kind(TypeIndex::U8),
            TypeKind::Int { bits: 8, signed: false }
        ));
    }

    #[test]
    fn test_pointer_dedup() {
        let mut reg = TypeRegistry::new();
        let p1 = reg.make_pointer(TypeIndex::I64);
        let p2 = reg.make_pointer(TypeIndex::I64);
        assert_eq!(p1, p2);
        let p3 = reg.make_pointer(TypeIndex::I32);
        assert_ne!(p1, p3);
    }

    #[test]
    fn test_struct_layout() {
        let mut reg = TypeRegistry::new();
        let s = reg.make_struct(
            "Point",
            vec![
                ("x".to_string(), TypeIndex::I8),
                ("y".to_string(), TypeIndex::I64),
            ],
        );
        let f = reg.field(s, "y").unwrap();
        assert_eq!(f.offset, 8);
        assert_eq!(reg.size_of(s), 16);
        assert_eq!(reg.align_of(s), 8);
    }

    #[test]
    fn test_struct_dedup_by_content() {
        let mut reg = TypeRegistry::new();
        let a = reg.make_struct("Pair", vec![("a".to_string(), TypeIndex::I64)]);
        let b = reg.make_struct("Pair", vec![("a".to_string(), TypeIndex::I64)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_optional_of_pointer_is_scalar() {
        let mut reg = TypeRegistry::new();
        let p = reg.make_pointer(TypeIndex::I64);
        let opt = reg.make_optional(p);
        assert_eq!(reg.size_of(opt), 8);
        let opt_int = reg.make_optional(TypeIndex::I64);
        assert_eq!(reg.size_of(opt_int), 16);
    }

    #[test]
    fn test_union_layout() {
        let mut reg = TypeRegistry::new();
        let u = reg.make_union(
            "Shape",
            TypeIndex::I64,
            vec![
                Variant {
                    name: "Circle".to_string(),
                    payload: Some(TypeIndex::F64),
                },
                Variant {
                    name: "Empty".to_string(),
                    payload: None,
                },
            ],
        );
        assert_eq!(reg.size_of(u), 16);
        assert_eq!(reg.union_variant(u, "Empty"), Some((1, None)));
        assert_eq!(reg.union_variant(u, "Missing"), None);
    }

    #[test]
    fn test_string_is_slice_like() {
        let mut reg = TypeRegistry::new();
        assert!(reg.is_slice_like(TypeIndex::STRING));
        let s = reg.make_slice(TypeIndex::U8);
        assert!(reg.is_slice_like(s));
        assert_eq!(reg.size_of(s), 16);
    }

    #[test]
    fn test_rehydrate_preserves_dedup() {
        let mut reg = TypeRegistry::new();
        let p = reg.make_pointer(TypeIndex::I64);
        reg.rehydrate();
        let p2 = reg.make_pointer(TypeIndex::I64);
        assert_eq!(p, p2);
    }
}
