//! The interpreter as the lowering pass's constant evaluator: statics whose
//! initializers fold at compile time become constant globals; the rest
//! become zero-initialized globals with init-time stores.

use cursive_analysis::ownership::OwnershipResults;
use cursive_ast::ast::{BinOp, Expr, ExprKind, Lit, ModuleDecl, NodeId, StaticDecl};
use cursive_ast::env::ScopeContext;
use cursive_ast::path::Path;
use cursive_ast::types::{mk_prim, IntTy, PrimTy};
use cursive_interpret::const_eval::const_eval_expr;
use cursive_lower::globals::lower_module;
use cursive_lower::{GlobalInit, Ir};

fn int(id: u32, v: u128) -> Expr {
    Expr::new(
        NodeId(id),
        ExprKind::Lit(Lit::Int {
            negative: false,
            magnitude: v,
            ty: Some(mk_prim(PrimTy::Int(IntTy::I32))),
        }),
    )
}

fn static_decl(name: &str, init: Expr) -> StaticDecl {
    StaticDecl { name: name.into(), ty: mk_prim(PrimTy::Int(IntTy::I32)), init, is_move: false }
}

fn flat(ir: &Ir) -> Vec<&Ir> {
    match ir {
        Ir::Seq(items) => items.iter().flat_map(flat).collect(),
        other => vec![other],
    }
}

#[test]
fn foldable_static_becomes_const_global() {
    let scx = ScopeContext::new();
    let own = OwnershipResults::default();
    let sum = Expr::new(
        NodeId(10),
        ExprKind::Binary {
            op: BinOp::Add,
            lhs: Box::new(int(1, 1)),
            rhs: Box::new(int(2, 2)),
        },
    );
    let module = ModuleDecl {
        path: Path::single("m"),
        eager_deps: vec![],
        statics: vec![static_decl("x", sum)],
        procs: vec![],
    };
    let lowered = lower_module(&scx, &own, &module, &|e| const_eval_expr(&scx, e));
    assert_eq!(lowered.globals.len(), 1);
    assert!(
        matches!(&lowered.globals[0].init, GlobalInit::Const { bytes } if bytes == &[3, 0, 0, 0])
    );
    assert!(!flat(&lowered.init.body).iter().any(|ir| matches!(ir, Ir::StoreGlobal { .. })));
}

#[test]
fn panicking_static_falls_back_to_runtime_init() {
    let scx = ScopeContext::new();
    let own = OwnershipResults::default();
    let div = Expr::new(
        NodeId(10),
        ExprKind::Binary {
            op: BinOp::Div,
            lhs: Box::new(int(1, 1)),
            rhs: Box::new(int(2, 0)),
        },
    );
    let module = ModuleDecl {
        path: Path::single("m"),
        eager_deps: vec![],
        statics: vec![static_decl("x", div)],
        procs: vec![],
    };
    let lowered = lower_module(&scx, &own, &module, &|e| const_eval_expr(&scx, e));
    assert!(matches!(&lowered.globals[0].init, GlobalInit::Zero { size: 4 }));
    let body = flat(&lowered.init.body);
    assert!(body.iter().any(|ir| matches!(ir, Ir::StoreGlobal { .. })));
    // The runtime path carries the arithmetic guards the fold would have hit.
    assert!(body.iter().any(|ir| matches!(ir, Ir::CheckOp { .. })));
    assert!(body.iter().any(|ir| matches!(ir, Ir::InitPanicHandle { .. })));
}
