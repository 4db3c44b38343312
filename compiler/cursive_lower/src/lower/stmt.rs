//! Statement lowering.

use cursive_ast::ast::{LoopKind, Stmt, StmtKind};
use cursive_middle::panic::PanicReason;

use crate::ir::{Ir, IrValue, LoopShape};
use crate::lower::expr::{builtin_sym, lower_expr};
use crate::lower::{lower_block_scoped, pat, place, LowerCtx};

pub fn lower_stmt(cx: &mut LowerCtx<'_>, stmt: &Stmt) -> Ir {
    match &stmt.kind {
        StmtKind::Let { pattern, ty, init, .. } => {
            let init_r = lower_expr(cx, init);
            let mut seq = init_r.setup;
            let ty = ty.clone().or_else(|| cx.scx.expr_ty(init.id).cloned());
            let names = pat::lower_bind_pattern(cx, pattern, init_r.value, &mut seq);
            if let Some(ty) = ty {
                if cx.ty_needs_drop(&ty) {
                    for name in &names {
                        cx.schedule_cleanup(Ir::DropVar { name: name.clone() });
                    }
                }
            }
            Ir::seq(seq)
        }
        StmtKind::Assign { place: target, value } => {
            let value_r = lower_expr(cx, value);
            let mut seq = value_r.setup;
            seq.extend(place::lower_write_place(cx, target, value_r.value));
            Ir::seq(seq)
        }
        StmtKind::Expr(expr) => {
            let r = lower_expr(cx, expr);
            Ir::seq(r.setup)
        }
        StmtKind::Return(expr) => {
            let mut seq = Vec::new();
            let value = match expr {
                Some(expr) => {
                    let r = lower_expr(cx, expr);
                    seq.extend(r.setup);
                    Some(r.value)
                }
                None => None,
            };
            // Every open scope unwinds on the way out.
            seq.extend(cx.cleanup_on_panic());
            seq.push(Ir::Return { value });
            Ir::seq(seq)
        }
        StmtKind::Break(expr) => {
            let mut seq = Vec::new();
            if let Some(expr) = expr {
                let r = lower_expr(cx, expr);
                seq.extend(r.setup);
            }
            seq.push(Ir::Break);
            Ir::seq(seq)
        }
        StmtKind::Continue => Ir::Continue,
        StmtKind::Defer(block) => {
            // Deferred bodies join the cleanup schedule; they run at scope
            // exit in reverse insertion order.
            let lowered = lower_block_scoped(cx, block);
            cx.schedule_cleanup(lowered);
            Ir::Nop
        }
        StmtKind::Region { alias, body } => {
            let inner = lower_block_scoped(cx, body);
            Ir::Region { alias: alias.clone(), body: Box::new(inner) }
        }
        StmtKind::Frame { region, body } => {
            let mut seq = Vec::new();
            let region_val = region.as_ref().map(|name| {
                let r = place::lower_move_var(cx, name);
                seq.extend(r.setup);
                r.value
            });
            let inner = lower_block_scoped(cx, body);
            seq.push(Ir::Frame { region: region_val, body: Box::new(inner) });
            Ir::seq(seq)
        }
        StmtKind::KeyBlock { body, .. } => {
            // Keys are compile-time artifacts; the block itself is all that
            // survives lowering.
            lower_block_scoped(cx, body)
        }
        StmtKind::Parallel { domain, body } => {
            let domain_r = lower_expr(cx, domain);
            let mut seq = domain_r.setup;
            let ctx_local = cx.fresh_local();
            seq.push(Ir::Call {
                sym: builtin_sym("parallel_begin"),
                args: vec![domain_r.value],
                dest: Some(ctx_local),
            });
            seq.push(lower_block_scoped(cx, body));
            seq.push(Ir::Call {
                sym: builtin_sym("parallel_join"),
                args: vec![IrValue::Local(ctx_local)],
                dest: None,
            });
            // The join re-raises the first panic from the context.
            seq.push(Ir::PanicCheck { cleanup: cx.cleanup_on_panic() });
            Ir::seq(seq)
        }
        StmtKind::Loop { kind, body } => match kind {
            LoopKind::Loop => {
                let inner = lower_block_scoped(cx, body);
                Ir::Loop { shape: LoopShape::Forever, cond: None, body: Box::new(inner) }
            }
            LoopKind::While(cond) => {
                let cond_r = lower_expr(cx, cond);
                let inner = lower_block_scoped(cx, body);
                let mut full = cond_r.setup;
                full.push(inner);
                Ir::Loop {
                    shape: LoopShape::While,
                    cond: Some(cond_r.value),
                    body: Box::new(Ir::seq(full)),
                }
            }
            LoopKind::For { binder, iter } => {
                let iter_r = lower_expr(cx, iter);
                let mut seq = iter_r.setup;
                let inner = lower_block_scoped(cx, body);
                seq.push(Ir::Loop {
                    shape: LoopShape::Range { binder: binder.clone() },
                    cond: Some(iter_r.value),
                    body: Box::new(inner),
                });
                Ir::seq(seq)
            }
        },
        StmtKind::Error => {
            Ir::LowerPanic { reason: PanicReason::ErrorStmt, cleanup: cx.cleanup_on_panic() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_analysis::ownership::OwnershipResults;
    use cursive_ast::ast::{Block, Expr, ExprKind, Lit, NodeId, Pattern, PatternKind};
    use cursive_ast::env::ScopeContext;
    use cursive_ast::path::Path;

    fn let_stmt(name: &str, ty: Option<cursive_ast::types::Ty>, init: Expr) -> Stmt {
        Stmt::new(StmtKind::Let {
            pattern: Pattern::new(PatternKind::Ident { name: name.into(), by_move: false }),
            ty,
            init,
            mutable: false,
        })
    }

    #[test]
    fn managed_string_binding_schedules_drop() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let mut cx = LowerCtx::new(&scx, &own, Path::single("m"));
        cx.push_scope();
        let stmt = let_stmt(
            "s",
            Some(cursive_ast::types::mk_path(cursive_ast::env::string_path())),
            Expr::new(NodeId(1), ExprKind::Lit(Lit::Str(b"ab".to_vec()))),
        );
        lower_stmt(&mut cx, &stmt);
        let cleanup = cx.pop_scope();
        assert!(cleanup.iter().any(|ir| matches!(ir, Ir::DropVar { name } if name == "s")));
    }

    #[test]
    fn return_runs_scope_cleanup_first() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let mut cx = LowerCtx::new(&scx, &own, Path::single("m"));
        cx.push_scope();
        cx.schedule_cleanup(Ir::DropVar { name: "s".into() });
        let stmt = Stmt::new(StmtKind::Return(Some(Expr::new(
            NodeId(1),
            ExprKind::Lit(Lit::Unit),
        ))));
        let ir = lower_stmt(&mut cx, &stmt);
        match ir {
            Ir::Seq(items) => {
                let drop_pos =
                    items.iter().position(|i| matches!(i, Ir::DropVar { .. })).unwrap();
                let ret_pos = items.iter().position(|i| matches!(i, Ir::Return { .. })).unwrap();
                assert!(drop_pos < ret_pos);
            }
            other => panic!("expected sequence, got {:?}", other),
        }
    }

    #[test]
    fn defer_joins_cleanup_schedule() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let mut cx = LowerCtx::new(&scx, &own, Path::single("m"));
        cx.push_scope();
        let stmt = Stmt::new(StmtKind::Defer(Block::new(vec![], None)));
        lower_stmt(&mut cx, &stmt);
        assert_eq!(cx.pop_scope().len(), 1);
    }
}
