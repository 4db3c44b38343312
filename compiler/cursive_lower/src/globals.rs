//! Module statics: init/deinit synthesis and poison wiring.
//!
//! Every module yields an `init_M` and `deinit_M` procedure. Constant
//! initializers that evaluate statically become `GlobalConst` images;
//! everything else becomes `GlobalZero` plus an init-time store. Init
//! procedures check predecessor poison flags on entry and arm the panic
//! handler that poisons this module and its eager successors.

use rustc_hash::FxHashSet;
use tracing::debug;

use cursive_analysis::ownership::OwnershipResults;
use cursive_ast::ast::{Expr, ModuleDecl};
use cursive_ast::env::ScopeContext;
use cursive_ast::path::{Path, PathKey};

use crate::ir::{GlobalInit, Ir, IrGlobal, IrProc, IrValue};
use crate::lower::expr::{builtin_sym, lower_expr};
use crate::lower::LowerCtx;
use crate::symbols;

pub struct LoweredModule {
    pub globals: Vec<IrGlobal>,
    pub init: IrProc,
    pub deinit: IrProc,
}

/// Modules whose init eagerly requires `module`, transitively; a panic in
/// `module`'s init poisons all of them.
pub fn eager_successors(scx: &ScopeContext, module: &Path) -> Vec<PathKey> {
    let target = module.key();
    let mut out: Vec<PathKey> = Vec::new();
    let mut seen: FxHashSet<PathKey> = FxHashSet::default();
    seen.insert(target.clone());
    // Propagate over the dependency edges until nothing new poisons.
    let mut changed = true;
    while changed {
        changed = false;
        for decl in scx.modules.values() {
            let key = decl.path.key();
            if seen.contains(&key) {
                continue;
            }
            if decl.eager_deps.iter().any(|dep| seen.contains(&dep.key())) {
                seen.insert(key.clone());
                out.push(key);
                changed = true;
            }
        }
    }
    out.sort();
    out
}

/// Lowers a module's statics. `const_eval` is the compile-time evaluator
/// (the interpreter run over an empty Σ); `None` means the initializer
/// needs runtime evaluation.
pub fn lower_module(
    scx: &ScopeContext,
    own: &OwnershipResults,
    module: &ModuleDecl,
    const_eval: &dyn Fn(&Expr) -> Option<Vec<u8>>,
) -> LoweredModule {
    debug!("lower_module: {}", module.path);
    let module_key = module.path.key();
    let mut cx = LowerCtx::new(scx, own, module.path.clone());
    let mut globals = Vec::new();
    let mut init_body = vec![
        Ir::InitPanicHandle {
            module: module_key.clone(),
            poison_modules: eager_successors(scx, &module.path),
        },
        Ir::ClearPanic,
    ];
    for dep in &module.eager_deps {
        init_body.push(Ir::CheckPoison { module: dep.key() });
    }

    for static_decl in &module.statics {
        match const_eval(&static_decl.init) {
            Some(bytes) => {
                globals.push(IrGlobal {
                    module: module_key.clone(),
                    name: static_decl.name.clone(),
                    init: GlobalInit::Const { bytes },
                });
            }
            None => {
                let size = cx
                    .layouts
                    .layout_of(&static_decl.ty)
                    .map(|l| l.size.bytes())
                    .unwrap_or(0);
                globals.push(IrGlobal {
                    module: module_key.clone(),
                    name: static_decl.name.clone(),
                    init: GlobalInit::Zero { size },
                });
                let r = lower_expr(&mut cx, &static_decl.init);
                init_body.extend(r.setup);
                init_body.push(Ir::StoreGlobal {
                    module: module_key.clone(),
                    name: static_decl.name.clone(),
                    value: r.value,
                });
            }
        }
    }
    init_body.push(Ir::Return { value: None });

    // Deinit drops in reverse declaration order.
    let mut deinit_body = Vec::new();
    for static_decl in module.statics.iter().rev() {
        if cx.ty_needs_drop(&static_decl.ty) {
            deinit_body.push(Ir::DropGlobal {
                module: module_key.clone(),
                name: static_decl.name.clone(),
            });
        }
    }
    deinit_body.push(Ir::Return { value: None });

    let local_count = cx.local_count();
    let init = IrProc {
        sym: symbols::init_sym(&module.path),
        params: Vec::new(),
        body: Ir::seq(init_body),
        derived: cx.derived,
        local_count,
    };
    let deinit = IrProc {
        sym: symbols::deinit_sym(&module.path),
        params: Vec::new(),
        body: Ir::seq(deinit_body),
        derived: cursive_middle::index::IndexVec::new(),
        local_count: 0,
    };
    LoweredModule { globals, init, deinit }
}

/// Wraps `main`: run every module init in dependency order, abort on any
/// poison before the user body runs, then call user `main` with the
/// freshly-initialized context, and deinit in reverse order on the way out.
pub fn lower_entry(scx: &ScopeContext, main_module: &Path) -> IrProc {
    let mut body = Vec::new();
    for module in &scx.module_order {
        body.push(Ir::Call { sym: symbols::init_sym(module), args: Vec::new(), dest: None });
    }
    for module in &scx.module_order {
        body.push(Ir::CheckPoison { module: module.key() });
    }
    let ctx_local = crate::ir::LocalId(0);
    let exit_local = crate::ir::LocalId(1);
    body.push(Ir::Call {
        sym: builtin_sym("context_init"),
        args: Vec::new(),
        dest: Some(ctx_local),
    });
    body.push(Ir::Call {
        sym: symbols::proc_sym(main_module, "main"),
        args: vec![IrValue::Local(ctx_local)],
        dest: Some(exit_local),
    });
    for module in scx.module_order.iter().rev() {
        body.push(Ir::Call { sym: symbols::deinit_sym(module), args: Vec::new(), dest: None });
    }
    body.push(Ir::Return { value: Some(IrValue::Local(exit_local)) });
    IrProc {
        sym: "main".to_string(),
        params: Vec::new(),
        body: Ir::seq(body),
        derived: cursive_middle::index::IndexVec::new(),
        local_count: 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::ast::{ExprKind, Lit, NodeId, StaticDecl};
    use cursive_ast::types::{mk_prim, IntTy, PrimTy};

    fn int_lit(id: u32, v: u128) -> Expr {
        Expr::new(
            NodeId(id),
            ExprKind::Lit(Lit::Int {
                negative: false,
                magnitude: v,
                ty: Some(mk_prim(PrimTy::Int(IntTy::I32))),
            }),
        )
    }

    fn module(path: Path, statics: Vec<StaticDecl>, eager_deps: Vec<Path>) -> ModuleDecl {
        ModuleDecl { path, eager_deps, statics, procs: vec![] }
    }

    #[test]
    fn const_initializer_becomes_const_global() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let m = module(
            Path::single("a"),
            vec![StaticDecl {
                name: "x".into(),
                ty: mk_prim(PrimTy::Int(IntTy::I32)),
                init: int_lit(1, 1),
                is_move: false,
            }],
            vec![],
        );
        let lowered = lower_module(&scx, &own, &m, &|_| Some(vec![1, 0, 0, 0]));
        assert!(matches!(&lowered.globals[0].init, GlobalInit::Const { bytes } if bytes == &[1, 0, 0, 0]));
        // No runtime store needed.
        let has_store = flat(&lowered.init.body)
            .iter()
            .any(|ir| matches!(ir, Ir::StoreGlobal { .. }));
        assert!(!has_store);
    }

    #[test]
    fn runtime_initializer_zeroes_then_stores() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let m = module(
            Path::single("a"),
            vec![StaticDecl {
                name: "x".into(),
                ty: mk_prim(PrimTy::Int(IntTy::I32)),
                init: int_lit(1, 1),
                is_move: false,
            }],
            vec![],
        );
        let lowered = lower_module(&scx, &own, &m, &|_| None);
        assert!(matches!(&lowered.globals[0].init, GlobalInit::Zero { size: 4 }));
        let has_store = flat(&lowered.init.body)
            .iter()
            .any(|ir| matches!(ir, Ir::StoreGlobal { .. }));
        assert!(has_store);
    }

    #[test]
    fn init_checks_predecessor_poison() {
        let mut scx = ScopeContext::new();
        scx.register_module(module(Path::single("a"), vec![], vec![]));
        scx.register_module(module(Path::single("b"), vec![], vec![Path::single("a")]));
        let own = OwnershipResults::default();
        let b = scx.module(&Path::single("b")).unwrap().clone();
        let lowered = lower_module(&scx, &own, &b, &|_| None);
        assert!(flat(&lowered.init.body)
            .iter()
            .any(|ir| matches!(ir, Ir::CheckPoison { module } if module.as_str() == "a")));
    }

    #[test]
    fn successors_propagate_transitively() {
        let mut scx = ScopeContext::new();
        scx.register_module(module(Path::single("a"), vec![], vec![]));
        scx.register_module(module(Path::single("b"), vec![], vec![Path::single("a")]));
        scx.register_module(module(Path::single("c"), vec![], vec![Path::single("b")]));
        let succ = eager_successors(&scx, &Path::single("a"));
        assert_eq!(succ.len(), 2);
    }

    fn flat(ir: &Ir) -> Vec<&Ir> {
        match ir {
            Ir::Seq(items) => items.iter().flat_map(flat).collect(),
            other => vec![other],
        }
    }
}
