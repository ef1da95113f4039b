//! IR type table.
//!
//! Types are interned: asking for the same primitive, pointer, function
//! signature or struct layout twice yields the same [`TypeId`]. The table is
//! shared between the annotator's lowering of AST types and every IR pass.

use crate::types::{Type, TypeKind};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Primitive kind of an IR type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    I1,
    /// Byte; `ptr to i8` is the low-level string type.
    I8,
    I64,
    F64,
    Void,
    /// Placeholder produced while SSA phis have not yet settled on a type.
    Undef,
    Ptr,
    Func,
    Struct,
}

/// Index into the type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: Kind,
    /// Pointee for `Ptr`, signature index for `Func`, layout index for
    /// `Struct`.
    aux: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FnSig {
    params: Vec<TypeId>,
    ret: TypeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StructLayout {
    fields: Vec<TypeId>,
}

/// The interning table.
#[derive(Debug, Default)]
pub struct TypeTable {
    entries: Vec<Entry>,
    sigs: Vec<FnSig>,
    structs: Vec<StructLayout>,
    primitive_cache: HashMap<Kind, TypeId>,
    ptr_cache: HashMap<TypeId, TypeId>,
    func_cache: HashMap<FnSig, TypeId>,
    struct_cache: HashMap<StructLayout, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        TypeTable::default()
    }

    pub fn primitive(&mut self, kind: Kind) -> TypeId {
        if let Some(&id) = self.primitive_cache.get(&kind) {
            return id;
        }
        let id = TypeId(self.entries.len() as u32);
        self.entries.push(Entry { kind, aux: 0 });
        self.primitive_cache.insert(kind, id);
        id
    }

    pub fn ptr(&mut self, to: TypeId) -> TypeId {
        if let Some(&id) = self.ptr_cache.get(&to) {
            return id;
        }
        let id = TypeId(self.entries.len() as u32);
        self.entries.push(Entry {
            kind: Kind::Ptr,
            aux: to.0,
        });
        self.ptr_cache.insert(to, id);
        id
    }

    pub fn func(&mut self, params: Vec<TypeId>, ret: TypeId) -> TypeId {
        let sig = FnSig { params, ret };
        if let Some(&id) = self.func_cache.get(&sig) {
            return id;
        }
        let aux = self.sigs.len() as u32;
        self.sigs.push(sig.clone());
        let id = TypeId(self.entries.len() as u32);
        self.entries.push(Entry {
            kind: Kind::Func,
            aux,
        });
        self.func_cache.insert(sig, id);
        id
    }

    pub fn structure(&mut self, fields: Vec<TypeId>) -> TypeId {
        let layout = StructLayout { fields };
        if let Some(&id) = self.struct_cache.get(&layout) {
            return id;
        }
        let aux = self.structs.len() as u32;
        self.structs.push(layout.clone());
        let id = TypeId(self.entries.len() as u32);
        self.entries.push(Entry {
            kind: Kind::Struct,
            aux,
        });
        self.struct_cache.insert(layout, id);
        id
    }

    /// The low-level string type, `ptr to i8`.
    pub fn string(&mut self) -> TypeId {
        let i8 = self.primitive(Kind::I8);
        self.ptr(i8)
    }

    pub fn kind(&self, id: TypeId) -> Kind {
        self.entries[id.0 as usize].kind
    }

    pub fn is_integer(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Kind::I1 | Kind::I8 | Kind::I64)
    }

    pub fn is_float(&self, id: TypeId) -> bool {
        self.kind(id) == Kind::F64
    }

    pub fn is_void(&self, id: TypeId) -> bool {
        self.kind(id) == Kind::Void
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        self.kind(id) == Kind::Ptr
    }

    pub fn is_primitive(&self, id: TypeId) -> bool {
        !matches!(self.kind(id), Kind::Ptr | Kind::Func | Kind::Struct)
    }

    pub fn is_undef(&self, id: TypeId) -> bool {
        self.kind(id) == Kind::Undef
    }

    /// True for `ptr to i8`, the representation of strings.
    pub fn is_string(&self, id: TypeId) -> bool {
        match self.pointee(id) {
            Some(p) => self.kind(p) == Kind::I8,
            None => false,
        }
    }

    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        let e = self.entries[id.0 as usize];
        (e.kind == Kind::Ptr).then_some(TypeId(e.aux))
    }

    /// Unify two numeric types; Float dominates Int. `None` when the
    /// operands are not both numeric.
    pub fn unify(&self, left: TypeId, right: TypeId) -> Option<TypeId> {
        if left == right {
            return Some(left);
        }
        match (self.kind(left), self.kind(right)) {
            (Kind::I64, Kind::F64) => Some(right),
            (Kind::F64, Kind::I64) => Some(left),
            // A single integer and a single float width: same-kind pairs
            // are already equal by interning.
            _ => None,
        }
    }

    /// Lower a source-level type to its IR representation.
    pub fn lower(&mut self, ty: &Type) -> TypeId {
        match &ty.kind {
            TypeKind::Int => self.primitive(Kind::I64),
            TypeKind::Float => self.primitive(Kind::F64),
            TypeKind::Bool => self.primitive(Kind::I1),
            TypeKind::Void => self.primitive(Kind::Void),
            // A symbol is its code point.
            TypeKind::Symbol => self.primitive(Kind::I64),
            TypeKind::String => self.string(),
            TypeKind::Array { elem, .. } => {
                let e = self.lower(elem);
                self.ptr(e)
            }
            TypeKind::Pointer(p) => {
                let inner = self.lower(p);
                self.ptr(inner)
            }
            TypeKind::Reference(r) => {
                let inner = self.lower(r);
                self.ptr(inner)
            }
            TypeKind::Function { params, ret } => {
                let ps: Vec<TypeId> = params.iter().map(|p| self.lower(p)).collect();
                let r = self.lower(ret);
                self.func(ps, r)
            }
        }
    }

    /// Element type of an array/pointer representation.
    pub fn underlying(&self, id: TypeId) -> Option<TypeId> {
        self.pointee(id)
    }

    pub fn describe(&self, id: TypeId) -> String {
        let mut out = String::new();
        self.write_describe(&mut out, id);
        out
    }

    fn write_describe(&self, out: &mut String, id: TypeId) {
        let e = self.entries[id.0 as usize];
        match e.kind {
            Kind::I1 => out.push_str("i1"),
            Kind::I8 => out.push_str("i8"),
            Kind::I64 => out.push_str("i64"),
            Kind::F64 => out.push_str("f64"),
            Kind::Void => out.push_str("void"),
            Kind::Undef => out.push_str("undef"),
            Kind::Ptr => {
                out.push_str("ptr to ");
                self.write_describe(out, TypeId(e.aux));
            }
            Kind::Func => {
                let sig = &self.sigs[e.aux as usize];
                out.push_str("func(");
                for (i, p) in sig.params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_describe(out, *p);
                }
                out.push_str(") -> ");
                self.write_describe(out, sig.ret);
            }
            Kind::Struct => {
                let layout = &self.structs[e.aux as usize];
                out.push_str("struct { ");
                for (i, f) in layout.fields.iter().enumerate() {
                    if i > 0 {
                        out.push_str("; ");
                    }
                    self.write_describe(out, *f);
                }
                out.push_str(" }");
            }
        }
    }

    /// Format a raw 64-bit value according to its type, for IR dumps.
    pub fn format_value(&self, bits: u64, id: TypeId) -> String {
        let mut out = String::new();
        match self.kind(id) {
            Kind::I1 => out.push_str(if bits != 0 { "true" } else { "false" }),
            Kind::I8 | Kind::I64 => {
                let _ = write!(out, "{}", bits as i64);
            }
            Kind::F64 => {
                let _ = write!(out, "{:.15}", f64::from_bits(bits));
            }
            Kind::Void => out.push_str("<void>"),
            Kind::Undef => out.push_str("<undef>"),
            Kind::Ptr | Kind::Func | Kind::Struct => {
                if bits == 0 {
                    out.push_str("null");
                } else {
                    let _ = write!(out, "0x{:x}", bits);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_intern() {
        let mut tt = TypeTable::new();
        assert_eq!(tt.primitive(Kind::I64), tt.primitive(Kind::I64));
        assert_ne!(tt.primitive(Kind::I64), tt.primitive(Kind::F64));
    }

    #[test]
    fn pointers_intern_by_pointee() {
        let mut tt = TypeTable::new();
        let i64t = tt.primitive(Kind::I64);
        let f64t = tt.primitive(Kind::F64);
        assert_eq!(tt.ptr(i64t), tt.ptr(i64t));
        assert_ne!(tt.ptr(i64t), tt.ptr(f64t));
        let p = tt.ptr(i64t);
        assert_eq!(tt.pointee(p), Some(i64t));
    }

    #[test]
    fn functions_intern_by_signature() {
        let mut tt = TypeTable::new();
        let i = tt.primitive(Kind::I64);
        let f = tt.primitive(Kind::F64);
        let a = tt.func(vec![i, f], i);
        let b = tt.func(vec![i, f], i);
        let c = tt.func(vec![f, i], i);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn string_is_ptr_to_i8() {
        let mut tt = TypeTable::new();
        let s = tt.string();
        assert!(tt.is_string(s));
        assert!(tt.is_pointer(s));
        let i64t = tt.primitive(Kind::I64);
        let p = tt.ptr(i64t);
        assert!(!tt.is_string(p));
    }

    #[test]
    fn unify_promotes_to_float() {
        let mut tt = TypeTable::new();
        let i = tt.primitive(Kind::I64);
        let f = tt.primitive(Kind::F64);
        assert_eq!(tt.unify(i, f), Some(f));
        assert_eq!(tt.unify(f, i), Some(f));
        assert_eq!(tt.unify(i, i), Some(i));
        let s = tt.string();
        assert_eq!(tt.unify(i, s), None);
    }

    #[test]
    fn lowers_ast_types() {
        use crate::types::Type;
        let mut tt = TypeTable::new();
        assert_eq!(tt.lower(&Type::int()), tt.primitive(Kind::I64));
        assert_eq!(tt.lower(&Type::symbol()), tt.primitive(Kind::I64));
        assert_eq!(tt.lower(&Type::string()), tt.string());
        let arr = Type::array(Type::float(), 2);
        let f = tt.primitive(Kind::F64);
        assert_eq!(tt.lower(&arr), tt.ptr(f));
        let r = Type::reference(Type::int());
        let i = tt.primitive(Kind::I64);
        assert_eq!(tt.lower(&r), tt.ptr(i));
    }

    #[test]
    fn describe_renders_nested_types() {
        let mut tt = TypeTable::new();
        let s = tt.string();
        assert_eq!(tt.describe(s), "ptr to i8");
        let i = tt.primitive(Kind::I64);
        let sig = tt.func(vec![s], i);
        assert_eq!(tt.describe(sig), "func(ptr to i8) -> i64");
    }
}
