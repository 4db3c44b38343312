//! Type layout: sizes, alignments, field offsets, enum discriminants, and
//! the niche optimization for two-state modal/union shapes.
//!
//! Layouts are pure functions of declarations: computing the same
//! declaration twice yields identical results, which the IR contract and
//! the runtime ABI both rely on.

use rustc_hash::FxHashMap;
use tracing::trace;

use cursive_ast::ast::{EnumDecl, ModalDecl, VariantPayload};
use cursive_ast::env::{ScopeContext, TypeDecl};
use cursive_ast::path::PathKey;
use cursive_ast::types::{strip_perm, PrimTy, Ty, TyKind};

pub const POINTER_SIZE: u64 = 8;
pub const POINTER_ALIGN: u64 = 8;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Size {
    raw: u64,
}

impl Size {
    pub const ZERO: Size = Size { raw: 0 };

    pub fn from_bytes(bytes: u64) -> Size {
        Size { raw: bytes }
    }

    pub fn bytes(self) -> u64 {
        self.raw
    }

    pub fn align_to(self, align: Align) -> Size {
        let mask = align.bytes() - 1;
        Size { raw: (self.raw + mask) & !mask }
    }

    pub fn checked_add(self, other: Size) -> Option<Size> {
        self.raw.checked_add(other.raw).map(|raw| Size { raw })
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Align {
    pow2: u8,
}

impl Align {
    pub const ONE: Align = Align { pow2: 0 };

    /// `bytes` must be a power of two.
    pub fn from_bytes(bytes: u64) -> Align {
        debug_assert!(bytes.is_power_of_two());
        Align { pow2: bytes.trailing_zeros() as u8 }
    }

    pub fn bytes(self) -> u64 {
        1 << self.pow2
    }

    pub fn max(self, other: Align) -> Align {
        if self.pow2 >= other.pow2 {
            self
        } else {
            other
        }
    }
}

/// Width of an enum/union discriminant; always unsigned, always the
/// smallest that fits.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DiscWidth {
    U8,
    U16,
    U32,
    U64,
}

impl DiscWidth {
    pub fn for_count(count: usize) -> DiscWidth {
        if count <= u8::MAX as usize + 1 {
            DiscWidth::U8
        } else if count <= u16::MAX as usize + 1 {
            DiscWidth::U16
        } else if count <= u32::MAX as usize + 1 {
            DiscWidth::U32
        } else {
            DiscWidth::U64
        }
    }

    pub fn size(self) -> Size {
        Size::from_bytes(match self {
            DiscWidth::U8 => 1,
            DiscWidth::U16 => 2,
            DiscWidth::U32 => 4,
            DiscWidth::U64 => 8,
        })
    }

    pub fn align(self) -> Align {
        Align::from_bytes(self.size().bytes())
    }
}

#[derive(Clone, Debug)]
pub struct FieldSlot {
    pub name: String,
    pub offset: Size,
    pub ty: Ty,
}

#[derive(Clone, Debug)]
pub struct VariantLayout {
    pub name: String,
    pub discr: u64,
    /// Field offsets are relative to the payload start.
    pub fields: Vec<FieldSlot>,
}

#[derive(Clone, Debug)]
pub enum Shape {
    Primitive,
    /// Records and tuples: fields at their computed offsets.
    Aggregate { fields: Vec<FieldSlot> },
    Array { elem: Ty, stride: Size, len: u64 },
    /// Enums and multi-state modals with an explicit discriminant.
    Tagged { disc: DiscWidth, payload_offset: Size, variants: Vec<VariantLayout> },
    /// Two-state shape with the empty state encoded as a null first slot.
    Niche { payload_variant: usize, variants: Vec<VariantLayout> },
    /// Union members sharing the payload slot after the discriminant.
    UnionTagged { disc: DiscWidth, payload_offset: Size, members: Vec<Ty>, discrs: Vec<u64> },
    /// `{data, vtable}` fat object.
    DynObject,
    StrView,
    StrManaged,
    /// State-unknown string/bytes: `{disc: u8, payload: Managed}`.
    StrModal,
}

#[derive(Clone, Debug)]
pub struct Layout {
    pub size: Size,
    pub align: Align,
    pub shape: Shape,
}

impl Layout {
    fn primitive(size: u64, align: u64) -> Layout {
        Layout {
            size: Size::from_bytes(size),
            align: Align::from_bytes(align),
            shape: Shape::Primitive,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LayoutError {
    UnknownType(String),
    Unsized(String),
    Cyclic(PathKey),
}

/// Layout computation context; memoizes by path so recursive records
/// terminate (and cycles surface as errors instead of hanging).
pub struct LayoutCx<'a> {
    pub scx: &'a ScopeContext,
    cache: FxHashMap<PathKey, Layout>,
    in_flight: Vec<PathKey>,
}

impl<'a> LayoutCx<'a> {
    pub fn new(scx: &'a ScopeContext) -> LayoutCx<'a> {
        LayoutCx { scx, cache: FxHashMap::default(), in_flight: Vec::new() }
    }

    pub fn layout_of(&mut self, ty: &Ty) -> Result<Layout, LayoutError> {
        let ty = strip_perm(ty);
        match &**ty {
            TyKind::Prim(prim) => Ok(match prim {
                PrimTy::Bool => Layout::primitive(1, 1),
                PrimTy::Char => Layout::primitive(4, 4),
                PrimTy::Unit => Layout::primitive(0, 1),
                PrimTy::Int(t) => {
                    let b = (t.bit_width() / 8) as u64;
                    Layout::primitive(b, b)
                }
                PrimTy::Uint(t) => {
                    let b = (t.bit_width() / 8) as u64;
                    Layout::primitive(b, b)
                }
                PrimTy::Float(t) => {
                    let b = match t {
                        cursive_ast::types::FloatTy::F32 => 4,
                        cursive_ast::types::FloatTy::F64 => 8,
                    };
                    Layout::primitive(b, b)
                }
            }),
            TyKind::Ptr { .. } | TyKind::RawPtr { .. } => {
                Ok(Layout::primitive(POINTER_SIZE, POINTER_ALIGN))
            }
            TyKind::Array { elem, len } => {
                let elem_layout = self.layout_of(elem)?;
                let stride = elem_layout.size.align_to(elem_layout.align);
                Ok(Layout {
                    size: Size::from_bytes(stride.bytes() * len),
                    align: elem_layout.align,
                    shape: Shape::Array { elem: elem.clone(), stride, len: *len },
                })
            }
            TyKind::Slice { .. } => Ok(Layout {
                size: Size::from_bytes(2 * POINTER_SIZE),
                align: Align::from_bytes(POINTER_ALIGN),
                shape: Shape::StrView,
            }),
            TyKind::Tuple(elems) => {
                let named: Vec<(String, Ty)> = elems
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (i.to_string(), t.clone()))
                    .collect();
                self.aggregate_layout(&named)
            }
            TyKind::Path(path) => {
                if path == &cursive_ast::env::string_path()
                    || path == &cursive_ast::env::bytes_path()
                {
                    // State unknown at compile time: tagged Managed payload.
                    return Ok(Layout {
                        size: Size::from_bytes(8 + 3 * POINTER_SIZE),
                        align: Align::from_bytes(POINTER_ALIGN),
                        shape: Shape::StrModal,
                    });
                }
                let key = path.key();
                if let Some(cached) = self.cache.get(&key) {
                    return Ok(cached.clone());
                }
                if self.in_flight.contains(&key) {
                    return Err(LayoutError::Cyclic(key));
                }
                let decl = self
                    .scx
                    .type_decl(path)
                    .cloned()
                    .ok_or_else(|| LayoutError::UnknownType(path.to_string()))?;
                self.in_flight.push(key.clone());
                let result = match &decl {
                    TypeDecl::Record(r) => {
                        let named: Vec<(String, Ty)> =
                            r.fields.iter().map(|f| (f.name.clone(), f.ty.clone())).collect();
                        self.aggregate_layout(&named)
                    }
                    TypeDecl::Enum(e) => self.enum_layout(e),
                    TypeDecl::Modal(m) => self.modal_layout(m),
                };
                self.in_flight.pop();
                if let Ok(layout) = &result {
                    trace!("layout_of({}): size {} align {}", path, layout.size.bytes(), layout.align.bytes());
                    self.cache.insert(key, layout.clone());
                }
                result
            }
            TyKind::ModalState { path, state } => {
                // A state-specialized value lays out as that state's payload.
                let decl = self
                    .scx
                    .modal_decl(path)
                    .cloned()
                    .ok_or_else(|| LayoutError::UnknownType(path.to_string()))?;
                let folded = cursive_ast::path::fold_ident(state);
                let st = decl
                    .states
                    .iter()
                    .find(|s| cursive_ast::path::fold_ident(&s.name) == folded)
                    .ok_or_else(|| LayoutError::UnknownType(format!("{}@{}", path, state)))?;
                let named: Vec<(String, Ty)> =
                    st.fields.iter().map(|f| (f.name.clone(), f.ty.clone())).collect();
                self.aggregate_layout(&named)
            }
            TyKind::Union(members) => self.union_layout(members),
            TyKind::Dynamic { .. } => Ok(Layout {
                size: Size::from_bytes(2 * POINTER_SIZE),
                align: Align::from_bytes(POINTER_ALIGN),
                shape: Shape::DynObject,
            }),
            TyKind::Perm { .. } => unreachable!("perm stripped above"),
            TyKind::Error => Err(LayoutError::UnknownType("{type error}".to_string())),
        }
    }

    fn aggregate_layout(&mut self, fields: &[(String, Ty)]) -> Result<Layout, LayoutError> {
        let mut offset = Size::ZERO;
        let mut align = Align::ONE;
        let mut slots = Vec::with_capacity(fields.len());
        for (name, ty) in fields {
            let field = self.layout_of(ty)?;
            offset = offset.align_to(field.align);
            slots.push(FieldSlot { name: name.clone(), offset, ty: ty.clone() });
            offset = offset
                .checked_add(field.size)
                .ok_or_else(|| LayoutError::Unsized(name.clone()))?;
            align = align.max(field.align);
        }
        Ok(Layout { size: offset.align_to(align), align, shape: Shape::Aggregate { fields: slots } })
    }

    fn enum_layout(&mut self, decl: &EnumDecl) -> Result<Layout, LayoutError> {
        let disc = DiscWidth::for_count(decl.variants.len().max(1));
        let discrs = enum_discriminants(decl);
        let mut payload_align = Align::ONE;
        let mut payload_size = Size::ZERO;
        let mut variants = Vec::with_capacity(decl.variants.len());
        for (i, variant) in decl.variants.iter().enumerate() {
            let named: Vec<(String, Ty)> = match &variant.payload {
                None => Vec::new(),
                Some(VariantPayload::Tuple(tys)) => {
                    tys.iter().enumerate().map(|(i, t)| (i.to_string(), t.clone())).collect()
                }
                Some(VariantPayload::Record(fields)) => {
                    fields.iter().map(|f| (f.name.clone(), f.ty.clone())).collect()
                }
            };
            let inner = self.aggregate_layout(&named)?;
            payload_align = payload_align.max(inner.align);
            payload_size = payload_size.max(inner.size);
            let fields = match inner.shape {
                Shape::Aggregate { fields } => fields,
                _ => Vec::new(),
            };
            variants.push(VariantLayout { name: variant.name.clone(), discr: discrs[i], fields });
        }
        // Empty-payload variants are just the discriminant.
        if payload_size == Size::ZERO {
            return Ok(Layout {
                size: disc.size(),
                align: disc.align(),
                shape: Shape::Tagged { disc, payload_offset: disc.size(), variants },
            });
        }
        let payload_offset = disc.size().align_to(payload_align);
        let align = disc.align().max(payload_align);
        let size = payload_offset
            .checked_add(payload_size)
            .ok_or_else(|| LayoutError::Unsized(decl.path.to_string()))?
            .align_to(align);
        Ok(Layout { size, align, shape: Shape::Tagged { disc, payload_offset, variants } })
    }

    fn modal_layout(&mut self, decl: &ModalDecl) -> Result<Layout, LayoutError> {
        let mut variants = Vec::with_capacity(decl.states.len());
        let mut payload_align = Align::ONE;
        let mut payload_size = Size::ZERO;
        for (i, state) in decl.states.iter().enumerate() {
            let named: Vec<(String, Ty)> =
                state.fields.iter().map(|f| (f.name.clone(), f.ty.clone())).collect();
            let inner = self.aggregate_layout(&named)?;
            payload_align = payload_align.max(inner.align);
            payload_size = payload_size.max(inner.size);
            let fields = match inner.shape {
                Shape::Aggregate { fields } => fields,
                _ => Vec::new(),
            };
            variants.push(VariantLayout { name: state.name.clone(), discr: i as u64, fields });
        }
        // Two states, exactly one carrying a payload whose first slot is a
        // pointer: the null pointer encodes the empty state.
        if decl.states.len() == 2 {
            let with_payload: Vec<usize> = decl
                .states
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.fields.is_empty())
                .map(|(i, _)| i)
                .collect();
            if let [only] = with_payload[..] {
                let first = &decl.states[only].fields[0];
                if is_pointer_ty(&first.ty) {
                    let payload = self.aggregate_layout(
                        &decl.states[only]
                            .fields
                            .iter()
                            .map(|f| (f.name.clone(), f.ty.clone()))
                            .collect::<Vec<_>>(),
                    )?;
                    return Ok(Layout {
                        size: payload.size,
                        align: payload.align,
                        shape: Shape::Niche { payload_variant: only, variants },
                    });
                }
            }
        }
        let disc = DiscWidth::for_count(decl.states.len().max(1));
        if payload_size == Size::ZERO {
            return Ok(Layout {
                size: disc.size(),
                align: disc.align(),
                shape: Shape::Tagged { disc, payload_offset: disc.size(), variants },
            });
        }
        let payload_offset = disc.size().align_to(payload_align);
        let align = disc.align().max(payload_align);
        let size = payload_offset
            .checked_add(payload_size)
            .ok_or_else(|| LayoutError::Unsized(decl.path.to_string()))?
            .align_to(align);
        Ok(Layout { size, align, shape: Shape::Tagged { disc, payload_offset, variants } })
    }

    fn union_layout(&mut self, members: &[Ty]) -> Result<Layout, LayoutError> {
        let discrs = union_discriminants(members.len());
        let mut payload_align = Align::ONE;
        let mut payload_size = Size::ZERO;
        let mut layouts = Vec::with_capacity(members.len());
        for member in members {
            let l = self.layout_of(member)?;
            payload_align = payload_align.max(l.align);
            payload_size = payload_size.max(l.size);
            layouts.push(l);
        }
        // Two members, one empty, the other pointer-first: niche.
        if let [a, b] = &layouts[..] {
            let empty = if a.size == Size::ZERO {
                Some(0)
            } else if b.size == Size::ZERO {
                Some(1)
            } else {
                None
            };
            if let Some(empty) = empty {
                let payload_idx = 1 - empty;
                if is_pointer_ty(&members[payload_idx]) {
                    let payload = &layouts[payload_idx];
                    return Ok(Layout {
                        size: payload.size,
                        align: payload.align,
                        shape: Shape::Niche {
                            payload_variant: payload_idx,
                            variants: members
                                .iter()
                                .enumerate()
                                .map(|(i, m)| VariantLayout {
                                    name: m.to_string(),
                                    discr: discrs[i],
                                    fields: Vec::new(),
                                })
                                .collect(),
                        },
                    });
                }
            }
        }
        let disc = DiscWidth::for_count(members.len().max(1));
        let payload_offset = disc.size().align_to(payload_align);
        let align = disc.align().max(payload_align);
        let size = payload_offset
            .checked_add(payload_size)
            .ok_or_else(|| LayoutError::Unsized("union".to_string()))?
            .align_to(align);
        Ok(Layout {
            size,
            align,
            shape: Shape::UnionTagged {
                disc,
                payload_offset,
                members: members.to_vec(),
                discrs,
            },
        })
    }
}

/// Discriminant of variant `i` is `i` unless the declaration says otherwise;
/// an explicit value restarts the sequence from there.
pub fn enum_discriminants(decl: &EnumDecl) -> Vec<u64> {
    let mut next = 0u64;
    let mut out = Vec::with_capacity(decl.variants.len());
    for variant in &decl.variants {
        let discr = variant.discr.unwrap_or(next);
        out.push(discr);
        next = discr.wrapping_add(1);
    }
    out
}

/// Union member discriminants. Two-member unions follow the result-union
/// ABI: the second (error) member is 0, the first (ok) member is 1.
pub fn union_discriminants(count: usize) -> Vec<u64> {
    if count == 2 {
        vec![1, 0]
    } else {
        (0..count as u64).collect()
    }
}

pub fn is_pointer_ty(ty: &Ty) -> bool {
    matches!(
        &**strip_perm(ty),
        TyKind::Ptr { .. } | TyKind::RawPtr { .. } | TyKind::Dynamic { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::ast::{FieldDecl, ModalDecl, StateDecl, VariantDecl};
    use cursive_ast::path::Path;
    use cursive_ast::types::{mk_prim, IntTy, PtrState, UintTy};
    use std::rc::Rc;

    fn i32_ty() -> Ty {
        mk_prim(PrimTy::Int(IntTy::I32))
    }

    fn u8_ty() -> Ty {
        mk_prim(PrimTy::Uint(UintTy::U8))
    }

    #[test]
    fn record_fields_are_aligned_in_order() {
        let mut scx = ScopeContext::new();
        scx.register_type(TypeDecl::Record(cursive_ast::ast::RecordDecl {
            path: Path::single("R"),
            fields: vec![
                FieldDecl { name: "a".into(), ty: u8_ty() },
                FieldDecl { name: "b".into(), ty: i32_ty() },
                FieldDecl { name: "c".into(), ty: u8_ty() },
            ],
            methods: vec![],
        }));
        let mut cx = LayoutCx::new(&scx);
        let layout = cx.layout_of(&cursive_ast::types::mk_path(Path::single("R"))).unwrap();
        assert_eq!(layout.size.bytes(), 12);
        assert_eq!(layout.align.bytes(), 4);
        match layout.shape {
            Shape::Aggregate { fields } => {
                assert_eq!(fields[0].offset.bytes(), 0);
                assert_eq!(fields[1].offset.bytes(), 4);
                assert_eq!(fields[2].offset.bytes(), 8);
            }
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn enum_layout_is_deterministic() {
        let decl = EnumDecl {
            path: Path::single("E"),
            variants: vec![
                VariantDecl { name: "A".into(), payload: None, discr: None },
                VariantDecl { name: "B".into(), payload: Some(VariantPayload::Tuple(vec![i32_ty()])), discr: None },
            ],
        };
        let mut scx = ScopeContext::new();
        scx.register_type(TypeDecl::Enum(decl.clone()));
        let compute = || {
            let mut cx = LayoutCx::new(&scx);
            cx.layout_of(&cursive_ast::types::mk_path(Path::single("E"))).unwrap()
        };
        let a = compute();
        let b = compute();
        assert_eq!(a.size, b.size);
        assert_eq!(a.align, b.align);
        assert_eq!(enum_discriminants(&decl), vec![0, 1]);
    }

    #[test]
    fn explicit_discriminants_restart_sequence() {
        let decl = EnumDecl {
            path: Path::single("E"),
            variants: vec![
                VariantDecl { name: "A".into(), payload: None, discr: None },
                VariantDecl { name: "B".into(), payload: None, discr: Some(10) },
                VariantDecl { name: "C".into(), payload: None, discr: None },
            ],
        };
        assert_eq!(enum_discriminants(&decl), vec![0, 10, 11]);
    }

    #[test]
    fn empty_payload_enum_is_disc_only() {
        let mut scx = ScopeContext::new();
        scx.register_type(TypeDecl::Enum(EnumDecl {
            path: Path::single("E"),
            variants: (0..3)
                .map(|i| VariantDecl { name: format!("V{}", i), payload: None, discr: None })
                .collect(),
        }));
        let mut cx = LayoutCx::new(&scx);
        let layout = cx.layout_of(&cursive_ast::types::mk_path(Path::single("E"))).unwrap();
        assert_eq!(layout.size.bytes(), 1);
    }

    #[test]
    fn modal_with_pointer_payload_gets_niche() {
        let ptr_ty: Ty =
            Rc::new(TyKind::Ptr { elem: i32_ty(), state: PtrState::Valid });
        let decl = ModalDecl {
            path: Path::single("M"),
            states: vec![
                StateDecl { name: "Empty".into(), fields: vec![], methods: vec![] },
                StateDecl {
                    name: "Full".into(),
                    fields: vec![FieldDecl { name: "p".into(), ty: ptr_ty }],
                    methods: vec![],
                },
            ],
        };
        let mut scx = ScopeContext::new();
        scx.register_type(TypeDecl::Modal(decl));
        let mut cx = LayoutCx::new(&scx);
        let layout = cx.layout_of(&cursive_ast::types::mk_path(Path::single("M"))).unwrap();
        assert_eq!(layout.size.bytes(), 8, "no separate discriminant");
        assert!(matches!(layout.shape, Shape::Niche { payload_variant: 1, .. }));
    }

    #[test]
    fn two_member_union_uses_result_discs() {
        assert_eq!(union_discriminants(2), vec![1, 0]);
        assert_eq!(union_discriminants(3), vec![0, 1, 2]);
    }

    #[test]
    fn cyclic_record_is_an_error() {
        let mut scx = ScopeContext::new();
        scx.register_type(TypeDecl::Record(cursive_ast::ast::RecordDecl {
            path: Path::single("C"),
            fields: vec![FieldDecl {
                name: "next".into(),
                ty: cursive_ast::types::mk_path(Path::single("C")),
            }],
            methods: vec![],
        }));
        let mut cx = LayoutCx::new(&scx);
        assert!(matches!(
            cx.layout_of(&cursive_ast::types::mk_path(Path::single("C"))),
            Err(LayoutError::Cyclic(_))
        ));
    }
}
