//! Place lowering: reads, address-of, writes, and moves.
//!
//! A place is something with an address — a variable, a projection chain
//! off one, or a pointer dereference. Reads produce a value operand; writes
//! pick between the dropping and non-dropping store forms based on what the
//! ownership analysis recorded for the assignment.

use either::Either;

use cursive_ast::ast::{Expr, ExprKind};
use cursive_ast::types::{strip_perm, RawPtrQual, TyKind};

use crate::ir::{DerivedValue, Ir, IrValue};
use crate::lower::expr::lower_expr;
use crate::lower::{LowerCtx, LowerErrorKind, LowerResult};

/// Produces a readable value for a place expression.
pub fn lower_read_place(cx: &mut LowerCtx<'_>, place: &Expr) -> LowerResult {
    match &place.kind {
        ExprKind::Path(path) if path.segments.len() == 1 => {
            let dest = cx.fresh_local();
            LowerResult {
                setup: vec![Ir::ReadVar { name: path.segments[0].clone(), dest }],
                value: IrValue::Local(dest),
            }
        }
        ExprKind::Field { base, name } => {
            let base_r = lower_read_place(cx, base);
            let value =
                cx.opaque(DerivedValue::Field { base: base_r.value, name: name.clone() });
            LowerResult { setup: base_r.setup, value }
        }
        ExprKind::TupleField { base, index } => {
            let base_r = lower_read_place(cx, base);
            let value =
                cx.opaque(DerivedValue::TupleElem { base: base_r.value, index: *index });
            LowerResult { setup: base_r.setup, value }
        }
        ExprKind::Index { base, index } => {
            let base_r = lower_read_place(cx, base);
            let mut setup = base_r.setup;
            // Slicing and indexing share the node; a range operand slices.
            if let ExprKind::Range { kind, lo, hi } = &index.kind {
                let lo_val = lo.as_ref().map(|e| {
                    let r = lower_expr(cx, e);
                    setup.extend(r.setup);
                    r.value
                });
                let hi_val = hi.as_ref().map(|e| {
                    let r = lower_expr(cx, e);
                    setup.extend(r.setup);
                    r.value
                });
                let len = cx.opaque(DerivedValue::Len { base: base_r.value.clone() });
                setup.push(Ir::CheckRange {
                    len,
                    lo: lo_val.clone(),
                    hi: hi_val.clone(),
                    kind: *kind,
                });
                let value = cx.opaque(DerivedValue::Slice {
                    base: base_r.value,
                    kind: *kind,
                    lo: lo_val,
                    hi: hi_val,
                });
                return LowerResult { setup, value };
            }
            let index_r = lower_expr(cx, index);
            setup.extend(index_r.setup);
            let len = cx.opaque(DerivedValue::Len { base: base_r.value.clone() });
            setup.push(Ir::CheckIndex { len, index: index_r.value.clone() });
            let value =
                cx.opaque(DerivedValue::Index { base: base_r.value, index: index_r.value });
            LowerResult { setup, value }
        }
        ExprKind::Deref { expr: inner } => {
            let inner_r = lower_expr(cx, inner);
            let mut setup = inner_r.setup;
            let dest = cx.fresh_local();
            setup.push(Ir::ReadPtr { ptr: inner_r.value, dest });
            LowerResult { setup, value: IrValue::Local(dest) }
        }
        // Not a place: evaluate as an expression.
        _ => lower_expr(cx, place),
    }
}

/// Produces a safe-pointer value for a place.
pub fn lower_addr_of(cx: &mut LowerCtx<'_>, place: &Expr) -> LowerResult {
    match &place.kind {
        ExprKind::Path(path) if path.segments.len() == 1 => {
            let value = cx.opaque(DerivedValue::AddrOfVar { name: path.segments[0].clone() });
            LowerResult::pure(value)
        }
        ExprKind::Field { base, name } => {
            let base_r = lower_addr_of(cx, base);
            let value =
                cx.opaque(DerivedValue::AddrOfField { base: base_r.value, name: name.clone() });
            LowerResult { setup: base_r.setup, value }
        }
        ExprKind::Index { base, index } => {
            let base_r = lower_addr_of(cx, base);
            let index_r = lower_expr(cx, index);
            let mut setup = base_r.setup;
            setup.extend(index_r.setup);
            let value = cx.opaque(DerivedValue::AddrOfIndex {
                base: base_r.value,
                index: index_r.value,
            });
            LowerResult { setup, value }
        }
        // `&*p` and `&<temporary>`: the operand itself is the address or
        // the value to pin.
        ExprKind::Deref { expr: inner } => lower_expr(cx, inner),
        _ => {
            let r = lower_expr(cx, place);
            let mut setup = r.setup;
            let dest = cx.fresh_local();
            // Pin the temporary into a local so its address is stable.
            setup.push(Ir::BindVar {
                name: format!("$pin{}", dest.0),
                value: r.value,
            });
            let value = cx.opaque(DerivedValue::AddrOfVar { name: format!("$pin{}", dest.0) });
            LowerResult { setup, value }
        }
    }
}

/// The store instruction for an assignment; the ownership pass already
/// decided whether the old value must be dropped first.
pub fn lower_write_place(cx: &mut LowerCtx<'_>, place: &Expr, value: IrValue) -> Vec<Ir> {
    match classify_store(cx, place) {
        Either::Left(setup) => setup,
        Either::Right((mut setup, store)) => {
            setup.push(match store {
                Store::Var { name, no_drop: false } => Ir::StoreVar { name, value },
                Store::Var { name, no_drop: true } => Ir::StoreVarNoDrop { name, value },
                Store::Ptr { ptr } => Ir::WritePtr { ptr, value },
            });
            setup
        }
    }
}

enum Store {
    Var { name: String, no_drop: bool },
    Ptr { ptr: IrValue },
}

fn classify_store(
    cx: &mut LowerCtx<'_>,
    place: &Expr,
) -> Either<Vec<Ir>, (Vec<Ir>, Store)> {
    match &place.kind {
        ExprKind::Path(path) if path.segments.len() == 1 => {
            // Reassignment of a moved root restores it without a drop.
            let no_drop = !cx.own.drop_on_assign.contains(&place.id);
            Either::Right((
                Vec::new(),
                Store::Var { name: path.segments[0].clone(), no_drop },
            ))
        }
        ExprKind::Field { .. } | ExprKind::Index { .. } | ExprKind::TupleField { .. } => {
            let addr = lower_addr_of(cx, place);
            Either::Right((addr.setup, Store::Ptr { ptr: addr.value }))
        }
        ExprKind::Deref { expr: inner } => {
            // Writes through `*imm` raw pointers are rejected here.
            if let Some(ty) = cx.scx.expr_ty(inner.id) {
                if let TyKind::RawPtr { qual: RawPtrQual::Imm, .. } = &**strip_perm(ty) {
                    cx.error(place.span, LowerErrorKind::WriteThroughImmRaw);
                    return Either::Left(Vec::new());
                }
            }
            let inner_r = lower_expr(cx, inner);
            Either::Right((inner_r.setup, Store::Ptr { ptr: inner_r.value }))
        }
        _ => {
            let r = lower_expr(cx, place);
            Either::Left(r.setup)
        }
    }
}

/// Move out of a place: the analyzer already flipped the bind state; the
/// lowering is a plain read of the place.
pub fn lower_move_place(cx: &mut LowerCtx<'_>, place: &Expr) -> LowerResult {
    match &place.kind {
        ExprKind::Move { place: inner } => lower_move_place(cx, inner),
        _ => lower_read_place(cx, place),
    }
}

pub fn lower_move_var(cx: &mut LowerCtx<'_>, name: &str) -> LowerResult {
    let dest = cx.fresh_local();
    LowerResult {
        setup: vec![Ir::ReadVar { name: name.to_string(), dest }],
        value: IrValue::Local(dest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_analysis::ownership::OwnershipResults;
    use cursive_ast::ast::NodeId;
    use cursive_ast::env::ScopeContext;
    use cursive_ast::path::Path;

    fn path_expr(id: u32, name: &str) -> Expr {
        Expr::new(NodeId(id), ExprKind::Path(Path::single(name)))
    }

    #[test]
    fn index_read_inserts_bounds_check() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let mut cx = LowerCtx::new(&scx, &own, Path::single("m"));
        let place = Expr::new(
            NodeId(1),
            ExprKind::Index {
                base: Box::new(path_expr(2, "a")),
                index: Box::new(path_expr(3, "i")),
            },
        );
        let r = lower_read_place(&mut cx, &place);
        assert!(r.setup.iter().any(|ir| matches!(ir, Ir::CheckIndex { .. })));
    }

    #[test]
    fn slice_read_inserts_range_check() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let mut cx = LowerCtx::new(&scx, &own, Path::single("m"));
        let place = Expr::new(
            NodeId(1),
            ExprKind::Index {
                base: Box::new(path_expr(2, "a")),
                index: Box::new(Expr::new(
                    NodeId(3),
                    ExprKind::Range {
                        kind: cursive_ast::ast::RangeKind::Exclusive,
                        lo: Some(Box::new(path_expr(4, "lo"))),
                        hi: Some(Box::new(path_expr(5, "hi"))),
                    },
                )),
            },
        );
        let r = lower_read_place(&mut cx, &place);
        assert!(r.setup.iter().any(|ir| matches!(ir, Ir::CheckRange { .. })));
    }

    #[test]
    fn store_form_follows_ownership_verdict() {
        let scx = ScopeContext::new();
        let mut own = OwnershipResults::default();
        own.drop_on_assign.insert(NodeId(1));
        let mut cx = LowerCtx::new(&scx, &own, Path::single("m"));
        let dropping = lower_write_place(&mut cx, &path_expr(1, "x"), IrValue::unit());
        assert!(dropping.iter().any(|ir| matches!(ir, Ir::StoreVar { .. })));
        // A reassignment over a moved binding must not drop.
        let restoring = lower_write_place(&mut cx, &path_expr(2, "x"), IrValue::unit());
        assert!(restoring.iter().any(|ir| matches!(ir, Ir::StoreVarNoDrop { .. })));
    }

    #[test]
    fn write_through_imm_raw_is_rejected() {
        let mut scx = ScopeContext::new();
        let inner = path_expr(2, "p");
        scx.expr_tys.insert(
            inner.id,
            std::rc::Rc::new(TyKind::RawPtr {
                qual: RawPtrQual::Imm,
                elem: cursive_ast::types::mk_unit(),
            }),
        );
        let own = OwnershipResults::default();
        let mut cx = LowerCtx::new(&scx, &own, Path::single("m"));
        let place = Expr::new(NodeId(1), ExprKind::Deref { expr: Box::new(inner) });
        lower_write_place(&mut cx, &place, IrValue::unit());
        assert!(matches!(
            cx.errors.first().map(|e| &e.kind),
            Some(LowerErrorKind::WriteThroughImmRaw)
        ));
    }
}
