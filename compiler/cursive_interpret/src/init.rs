//! Whole-program execution: module initialization in dependency order with
//! poisoning, `main` invocation with the context record, and deinit in
//! reverse order.

use tracing::debug;

use cursive_ast::env::ScopeContext;
use cursive_ast::path::{fold_ident, Path};
use cursive_middle::panic::PanicReason;
use cursive_middle::store::CleanupItem;

use crate::builtins;
use crate::control::{ControlKind, Outcome};
use crate::machine::{ice, EvalContext, EvalResult, MachineOptions};

/// Exit code of an `Abort` (double panic during teardown).
pub const ABORT_EXIT_CODE: i32 = 134;

impl<'a> EvalContext<'a> {
    /// Runs every module's initializer in declaration order. A panicking
    /// initializer poisons its module and every eager successor; execution
    /// continues with the next module.
    pub fn init_modules(&mut self) -> EvalResult<Option<i32>> {
        let order = self.scx.module_order.clone();
        for module_path in &order {
            let module_key = module_path.key();
            let Some(module) = self.scx.module(module_path).cloned() else {
                return Err(ice(format!("module `{}` missing", module_path)));
            };
            // A poisoned eager predecessor poisons this module before any
            // of its statics run.
            if module.eager_deps.iter().any(|dep| self.sigma.poisoned_module(&dep.key())) {
                debug!("init {}: poisoned via eager dep", module_path);
                self.sigma.set_poisoned(&module_key);
                continue;
            }
            let saved = self.current_module.replace(module_path.clone());
            for static_decl in &module.statics {
                match self.eval_expr(&static_decl.init)? {
                    Outcome::Val(value) => {
                        self.sigma.alloc_static(module_key.clone(), &static_decl.name, value);
                    }
                    Outcome::Ctrl(ctrl) if ctrl.kind == ControlKind::Abort => {
                        return Ok(Some(ABORT_EXIT_CODE));
                    }
                    Outcome::Ctrl(_) => {
                        debug!("init {}: panicked on `{}`", module_path, static_decl.name);
                        self.sigma.set_poisoned(&module_key);
                        for successor in eager_successors(self.scx, module_path) {
                            self.sigma.set_poisoned(&successor);
                        }
                        break;
                    }
                }
            }
            self.current_module = saved;
        }
        Ok(None)
    }

    /// Schedules static drops so the scope cleanup (which runs in reverse
    /// insertion order) frees them in reverse dependency order.
    pub fn deinit_modules(&mut self) -> EvalResult<()> {
        let order = self.scx.module_order.clone();
        for module_path in &order {
            let module_key = module_path.key();
            if self.sigma.poisoned_module(&module_key) {
                continue;
            }
            let Some(module) = self.scx.module(module_path).cloned() else { continue };
            for static_decl in &module.statics {
                let item = CleanupItem::DropStatic {
                    module: module_key.clone(),
                    name: static_decl.name.clone(),
                };
                self.sigma.append_cleanup(item);
            }
        }
        Ok(())
    }
}

fn eager_successors(scx: &ScopeContext, module: &Path) -> Vec<cursive_ast::path::PathKey> {
    let mut seen = vec![module.key()];
    let mut out = Vec::new();
    let mut changed = true;
    while changed {
        changed = false;
        for decl in scx.modules.values() {
            let key = decl.path.key();
            if seen.contains(&key) {
                continue;
            }
            if decl.eager_deps.iter().any(|dep| seen.contains(&dep.key())) {
                seen.push(key.clone());
                out.push(key);
                changed = true;
            }
        }
    }
    out
}

fn find_main(scx: &ScopeContext) -> Option<Path> {
    scx.modules.values().find_map(|m| {
        m.procs
            .iter()
            .any(|p| fold_ident(&p.name) == "main")
            .then(|| m.path.child("main"))
    })
}

/// Initializes the world, runs `main`, and reports the process exit code.
pub fn run_program(scx: &ScopeContext, opts: MachineOptions) -> EvalResult<i32> {
    let mut ecx = EvalContext::new(scx, opts);
    run_program_in(&mut ecx)
}

/// Like [`run_program`], on a caller-provided context so tests can inspect
/// Σ, the heap model, and the fs state afterwards.
pub fn run_program_in(ecx: &mut EvalContext<'_>) -> EvalResult<i32> {
    ecx.sigma.push_scope();
    if let Some(code) = ecx.init_modules()? {
        return Ok(code);
    }
    let Some(main_path) = find_main(ecx.scx) else {
        return Err(ice("no `main` procedure"));
    };
    // Poison in main's own module aborts before the body runs.
    if ecx.sigma.poisoned_module(&main_path.parent().key()) {
        return Ok(PanicReason::InitPanic.code() as i32);
    }
    let context = builtins::make_context(ecx);
    let outcome = ecx.apply_named_proc(&main_path, vec![context])?;
    let code = match outcome {
        Outcome::Val(value) => match value.as_int().and_then(|i| i.to_i128()) {
            Some(code) => code as i32,
            None => 0,
        },
        Outcome::Ctrl(ctrl) => match ctrl.kind {
            ControlKind::Abort => return Ok(ABORT_EXIT_CODE),
            _ => ctrl.code as i32,
        },
    };
    ecx.deinit_modules()?;
    let status = ecx.cleanup_current_scope();
    ecx.sigma.pop_scope();
    match status {
        crate::cleanup::CleanupStatus::Ok => Ok(code),
        crate::cleanup::CleanupStatus::Panic(panic_code) => {
            if code == 0 {
                Ok(panic_code as i32)
            } else {
                Ok(code)
            }
        }
        crate::cleanup::CleanupStatus::Abort => Ok(ABORT_EXIT_CODE),
    }
}
