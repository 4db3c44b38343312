use std::fmt;
use std::rc::Rc;

use crate::path::Path;

/// A resolved type. Reference-counted so that the resolver's tables, the
/// analyzers, and Σ can share nodes freely; type terms are immutable once
/// built.
pub type Ty = Rc<TyKind>;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TyKind {
    Prim(PrimTy),
    /// Safe pointer; the state is part of the type (`&T`, `?&T`, expired).
    Ptr { elem: Ty, state: PtrState },
    RawPtr { qual: RawPtrQual, elem: Ty },
    Array { elem: Ty, len: u64 },
    Slice { elem: Ty },
    Tuple(Vec<Ty>),
    /// A named record/enum/modal/class type, unspecialized.
    Path(Path),
    /// A modal type narrowed to one state, `Type@State`.
    ModalState { path: Path, state: String },
    Union(Vec<Ty>),
    /// `dyn Class` — a fat object of some class.
    Dynamic { class_path: Path },
    /// Permission wrapper; stripped by type equivalence.
    Perm { base: Ty, perm: PermKind },
    /// Placeholder produced by upstream error recovery.
    Error,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PrimTy {
    Bool,
    Char,
    Unit,
    Int(IntTy),
    Uint(UintTy),
    Float(FloatTy),
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum IntTy {
    I8,
    I16,
    I32,
    I64,
    I128,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum UintTy {
    U8,
    U16,
    U32,
    U64,
    U128,
    Usize,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum FloatTy {
    F32,
    F64,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PtrState {
    Valid,
    Null,
    Expired,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RawPtrQual {
    Imm,
    Mut,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PermKind {
    Const,
    Mut,
}

impl IntTy {
    pub fn bit_width(self) -> u32 {
        match self {
            IntTy::I8 => 8,
            IntTy::I16 => 16,
            IntTy::I32 => 32,
            IntTy::I64 => 64,
            IntTy::I128 => 128,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IntTy::I8 => "i8",
            IntTy::I16 => "i16",
            IntTy::I32 => "i32",
            IntTy::I64 => "i64",
            IntTy::I128 => "i128",
        }
    }
}

impl UintTy {
    pub fn bit_width(self) -> u32 {
        match self {
            UintTy::U8 => 8,
            UintTy::U16 => 16,
            UintTy::U32 => 32,
            UintTy::U64 => 64,
            UintTy::U128 => 128,
            // The middle-end targets 64-bit pointers throughout.
            UintTy::Usize => 64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UintTy::U8 => "u8",
            UintTy::U16 => "u16",
            UintTy::U32 => "u32",
            UintTy::U64 => "u64",
            UintTy::U128 => "u128",
            UintTy::Usize => "usize",
        }
    }
}

pub fn mk_prim(prim: PrimTy) -> Ty {
    Rc::new(TyKind::Prim(prim))
}

pub fn mk_unit() -> Ty {
    mk_prim(PrimTy::Unit)
}

pub fn mk_path(path: Path) -> Ty {
    Rc::new(TyKind::Path(path))
}

/// Strips any number of `Perm` wrappers off the outermost type.
pub fn strip_perm(ty: &Ty) -> &Ty {
    let mut ty = ty;
    while let TyKind::Perm { base, .. } = &**ty {
        ty = base;
    }
    ty
}

/// Structural type equivalence modulo permissions.
pub fn type_equiv(lhs: &Ty, rhs: &Ty) -> bool {
    let lhs = strip_perm(lhs);
    let rhs = strip_perm(rhs);
    match (&**lhs, &**rhs) {
        (TyKind::Prim(a), TyKind::Prim(b)) => a == b,
        (
            TyKind::Ptr { elem: a, state: sa },
            TyKind::Ptr { elem: b, state: sb },
        ) => sa == sb && type_equiv(a, b),
        (
            TyKind::RawPtr { qual: qa, elem: a },
            TyKind::RawPtr { qual: qb, elem: b },
        ) => qa == qb && type_equiv(a, b),
        (
            TyKind::Array { elem: a, len: la },
            TyKind::Array { elem: b, len: lb },
        ) => la == lb && type_equiv(a, b),
        (TyKind::Slice { elem: a }, TyKind::Slice { elem: b }) => type_equiv(a, b),
        (TyKind::Tuple(a), TyKind::Tuple(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| type_equiv(x, y))
        }
        (TyKind::Path(a), TyKind::Path(b)) => a == b,
        (
            TyKind::ModalState { path: pa, state: sa },
            TyKind::ModalState { path: pb, state: sb },
        ) => pa == pb && crate::path::fold_ident(sa) == crate::path::fold_ident(sb),
        (TyKind::Union(a), TyKind::Union(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| type_equiv(x, y))
        }
        (TyKind::Dynamic { class_path: a }, TyKind::Dynamic { class_path: b }) => a == b,
        (TyKind::Error, TyKind::Error) => true,
        _ => false,
    }
}

pub fn is_unit_type(ty: &Ty) -> bool {
    matches!(&**strip_perm(ty), TyKind::Prim(PrimTy::Unit))
}

pub fn is_unsigned_prim(ty: &Ty) -> bool {
    matches!(&**strip_perm(ty), TyKind::Prim(PrimTy::Uint(_)))
}

/// The element type behind a safe or raw pointer, if `ty` is one.
pub fn ptr_element_type(ty: &Ty) -> Option<&Ty> {
    match &**strip_perm(ty) {
        TyKind::Ptr { elem, .. } | TyKind::RawPtr { elem, .. } => Some(elem),
        _ => None,
    }
}

impl fmt::Display for TyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TyKind::Prim(p) => match p {
                PrimTy::Bool => f.write_str("bool"),
                PrimTy::Char => f.write_str("char"),
                PrimTy::Unit => f.write_str("()"),
                PrimTy::Int(i) => f.write_str(i.name()),
                PrimTy::Uint(u) => f.write_str(u.name()),
                PrimTy::Float(FloatTy::F32) => f.write_str("f32"),
                PrimTy::Float(FloatTy::F64) => f.write_str("f64"),
            },
            TyKind::Ptr { elem, state } => match state {
                PtrState::Valid => write!(f, "&{}", elem),
                PtrState::Null => write!(f, "?&{}", elem),
                PtrState::Expired => write!(f, "&expired {}", elem),
            },
            TyKind::RawPtr { qual: RawPtrQual::Imm, elem } => write!(f, "*imm {}", elem),
            TyKind::RawPtr { qual: RawPtrQual::Mut, elem } => write!(f, "*mut {}", elem),
            TyKind::Array { elem, len } => write!(f, "[{}; {}]", elem, len),
            TyKind::Slice { elem } => write!(f, "[{}]", elem),
            TyKind::Tuple(elems) => {
                f.write_str("(")?;
                for (i, e) in elems.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str(")")
            }
            TyKind::Path(p) => write!(f, "{}", p),
            TyKind::ModalState { path, state } => write!(f, "{}@{}", path, state),
            TyKind::Union(members) => {
                for (i, m) in members.iter().enumerate() {
                    if i != 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{}", m)?;
                }
                Ok(())
            }
            TyKind::Dynamic { class_path } => write!(f, "${}", class_path),
            TyKind::Perm { base, perm } => match perm {
                PermKind::Const => write!(f, "const {}", base),
                PermKind::Mut => write!(f, "mut {}", base),
            },
            TyKind::Error => f.write_str("{type error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn i32_ty() -> Ty {
        mk_prim(PrimTy::Int(IntTy::I32))
    }

    #[test]
    fn equiv_strips_perm() {
        let plain = i32_ty();
        let wrapped = Rc::new(TyKind::Perm { base: i32_ty(), perm: PermKind::Mut });
        assert!(type_equiv(&plain, &wrapped));
        assert!(std::ptr::eq(strip_perm(&wrapped).as_ref(), {
            // strip_perm reaches the base term, not a copy
            match &*wrapped {
                TyKind::Perm { base, .. } => base.as_ref(),
                _ => unreachable!(),
            }
        }));
    }

    #[test]
    fn equiv_is_structural() {
        let a = Rc::new(TyKind::Tuple(vec![i32_ty(), mk_unit()]));
        let b = Rc::new(TyKind::Tuple(vec![i32_ty(), mk_unit()]));
        let c = Rc::new(TyKind::Tuple(vec![mk_unit(), i32_ty()]));
        assert!(type_equiv(&a, &b));
        assert!(!type_equiv(&a, &c));
    }

    #[test]
    fn unsigned_prim() {
        assert!(is_unsigned_prim(&mk_prim(PrimTy::Uint(UintTy::U8))));
        assert!(!is_unsigned_prim(&i32_ty()));
    }
}
