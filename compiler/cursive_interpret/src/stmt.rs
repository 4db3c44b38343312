//! Statement execution and block evaluation.

use std::rc::Rc;

use tracing::trace;

use cursive_ast::ast::{Block, Expr, LoopKind, Stmt, StmtKind};
use cursive_ast::path::fold_ident;
use cursive_middle::panic::PanicReason;
use cursive_middle::store::{
    BindInfo, BindState, BindingValue, CleanupItem, Movability, Responsibility,
};
use cursive_middle::value::{ModalVal, Value};

use crate::control::{Control, ControlKind, Outcome, StmtOut};
use crate::expr::{int_of, region_target_of, PlaceOut};
use crate::machine::{ice, EvalContext, EvalResult};
use crate::pattern;
use crate::rt::par::ParallelCtx;

impl<'a> EvalContext<'a> {
    /// Evaluates a block in its own scope; the scope's cleanup list runs on
    /// every exit path, and its status folds into the outcome.
    pub fn eval_block(&mut self, block: &Block) -> EvalResult<Outcome> {
        self.sigma.push_scope();
        for stmt in &block.stmts {
            match self.exec_stmt(stmt)? {
                StmtOut::Ok => {}
                StmtOut::Ctrl(ctrl) => {
                    return Ok(self.merge_scope_exit(Outcome::Ctrl(ctrl)));
                }
            }
        }
        let outcome = match &block.expr {
            Some(expr) => self.eval_expr(expr)?,
            None => Outcome::unit(),
        };
        Ok(self.merge_scope_exit(outcome))
    }

    pub fn exec_stmt(&mut self, stmt: &Stmt) -> EvalResult<StmtOut> {
        match &stmt.kind {
            StmtKind::Let { pattern, init, .. } => {
                let value = match self.eval_expr(init)? {
                    Outcome::Val(v) => v,
                    Outcome::Ctrl(ctrl) => return Ok(StmtOut::Ctrl(ctrl)),
                };
                let bindings = pattern::bind_irrefutable(pattern, &value)?;
                for (name, v) in bindings {
                    let info = BindInfo {
                        movability: Movability::Mov,
                        responsibility: Responsibility::Resp,
                    };
                    let binding = self
                        .sigma
                        .bind_val(&name, BindingValue::Val(v), info)
                        .ok_or_else(|| ice("no scope for let"))?;
                    self.sigma.append_cleanup(CleanupItem::DropBinding(binding));
                }
                Ok(StmtOut::Ok)
            }
            StmtKind::Assign { place, value } => self.exec_assign(place, value),
            StmtKind::Expr(expr) => match self.eval_expr(expr)? {
                Outcome::Val(_) => Ok(StmtOut::Ok),
                Outcome::Ctrl(ctrl) => Ok(StmtOut::Ctrl(ctrl)),
            },
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => match self.eval_expr(expr)? {
                        Outcome::Val(v) => Some(v),
                        Outcome::Ctrl(ctrl) => return Ok(StmtOut::Ctrl(ctrl)),
                    },
                    None => None,
                };
                Ok(StmtOut::Ctrl(Control::ret(value)))
            }
            StmtKind::Break(expr) => {
                let value = match expr {
                    Some(expr) => match self.eval_expr(expr)? {
                        Outcome::Val(v) => Some(v),
                        Outcome::Ctrl(ctrl) => return Ok(StmtOut::Ctrl(ctrl)),
                    },
                    None => None,
                };
                Ok(StmtOut::Ctrl(Control::brk(value)))
            }
            StmtKind::Continue => Ok(StmtOut::Ctrl(Control::cont())),
            StmtKind::Defer(block) => {
                self.sigma.append_cleanup(CleanupItem::DeferBlock(Rc::new(block.clone())));
                Ok(StmtOut::Ok)
            }
            StmtKind::Region { alias, body } => self.exec_region(alias, body),
            StmtKind::Frame { region, body } => self.exec_frame(region, body),
            StmtKind::KeyBlock { body, .. } => {
                // Keys were discharged statically; only the block remains.
                match self.eval_block(body)? {
                    Outcome::Val(_) => Ok(StmtOut::Ok),
                    Outcome::Ctrl(ctrl) => Ok(StmtOut::Ctrl(ctrl)),
                }
            }
            StmtKind::Parallel { domain, body } => self.exec_parallel(domain, body),
            StmtKind::Loop { kind, body } => self.exec_loop(kind, body),
            StmtKind::Error => Ok(StmtOut::Ctrl(Control::panic(PanicReason::ErrorStmt))),
        }
    }

    fn exec_assign(&mut self, place: &Expr, value: &Expr) -> EvalResult<StmtOut> {
        let new_value = match self.eval_expr(value)? {
            Outcome::Val(v) => v,
            Outcome::Ctrl(ctrl) => return Ok(StmtOut::Ctrl(ctrl)),
        };
        // Whole-binding assignment: drop the old value when this binding is
        // responsible for it, then restore validity.
        if let cursive_ast::ast::ExprKind::Path(path) = &place.kind {
            if path.segments.len() == 1 {
                let Some(binding) = self.sigma.lookup_bind(&path.segments[0]) else {
                    return Err(ice(format!("assign to unbound `{}`", path)));
                };
                let info = self.sigma.bind_info_of(&binding);
                let state = self.sigma.bind_state_of(&binding).cloned();
                let mut status = crate::cleanup::DropStatus::Ok;
                if let (Some(info), Some(state)) = (info, state) {
                    let readable = !matches!(state, BindState::Moved);
                    if readable && info.responsibility == Responsibility::Resp {
                        if let Some(old) = self.sigma.value_of_binding(&binding).cloned() {
                            let skip = match &state {
                                BindState::PartiallyMoved { fields } => fields.clone(),
                                _ => Default::default(),
                            };
                            status = self.drop_value(old, &skip)?;
                        }
                    }
                }
                self.sigma.update_val(&binding, new_value);
                self.sigma.set_state(&binding, BindState::Valid);
                return Ok(match status {
                    crate::cleanup::DropStatus::Ok => StmtOut::Ok,
                    crate::cleanup::DropStatus::Panic(code) => StmtOut::Ctrl(Control {
                        kind: ControlKind::Panic,
                        value: None,
                        code,
                    }),
                });
            }
        }
        // Field assignment into a partially-moved root heals that field.
        if let cursive_ast::ast::ExprKind::Field { base, name } = &place.kind {
            if let cursive_ast::ast::ExprKind::Path(path) = &base.kind {
                if path.segments.len() == 1 {
                    if let Some(binding) = self.sigma.lookup_bind(&path.segments[0]) {
                        if let Some(BindState::PartiallyMoved { fields }) =
                            self.sigma.bind_state_of(&binding).cloned()
                        {
                            let mut fields = fields;
                            fields.remove(&fold_ident(name));
                            let state = if fields.is_empty() {
                                BindState::Valid
                            } else {
                                BindState::PartiallyMoved { fields }
                            };
                            self.sigma.set_state(&binding, state);
                        }
                    }
                }
            }
        }
        match self.eval_place(place)? {
            PlaceOut::Place(addr) => match self.sigma.write_location(addr, new_value) {
                Ok(()) => Ok(StmtOut::Ok),
                Err(_) => {
                    Ok(StmtOut::Ctrl(Control::panic(PanicReason::ExpiredDeref)))
                }
            },
            PlaceOut::Ctrl(ctrl) => Ok(StmtOut::Ctrl(ctrl)),
        }
    }

    fn exec_region(&mut self, alias: &Option<String>, body: &Block) -> EvalResult<StmtOut> {
        let (tag, target) = self.sigma.push_region();
        self.trace.record("region", "enter", &format!("tag {} target {}", tag, target));
        self.sigma.push_scope();
        if let Some(alias) = alias {
            let handle = Value::Modal(ModalVal {
                state: "Active".to_string(),
                payload: Box::new(Value::Tuple(vec![
                    Value::usize(tag),
                    Value::usize(target),
                ])),
            });
            self.sigma.bind_val(
                alias,
                BindingValue::Val(handle),
                BindInfo {
                    movability: Movability::Immov,
                    responsibility: Responsibility::Alias,
                },
            );
        }
        let outcome = self.eval_block(body)?;
        let outcome = self.merge_scope_exit(outcome);
        // Explicit free inside the body already tore the region down.
        if self.sigma.region_by_target(target).is_some() {
            self.sigma.free_region(target);
        }
        self.trace.record("region", "exit", &format!("target {}", target));
        match outcome {
            Outcome::Val(_) => Ok(StmtOut::Ok),
            Outcome::Ctrl(ctrl) => Ok(StmtOut::Ctrl(ctrl)),
        }
    }

    fn exec_frame(&mut self, region: &Option<String>, body: &Block) -> EvalResult<StmtOut> {
        let target = match region {
            Some(name) => {
                let handle = match self.read_binding(name)? {
                    Outcome::Val(v) => v,
                    Outcome::Ctrl(ctrl) => return Ok(StmtOut::Ctrl(ctrl)),
                };
                match region_target_of(&handle) {
                    Some(target) => target,
                    None => return Err(ice(format!("`{}` is not a region", name))),
                }
            }
            None => match self.sigma.innermost_region() {
                Some(region) => region.target,
                None => return Err(ice("frame outside any region")),
            },
        };
        let mark = self
            .sigma
            .region_mark(target)
            .ok_or_else(|| ice("frame over dead region"))?;
        self.trace.record("region", "frame", &format!("target {} mark {}", target, mark));
        let outcome = self.eval_block(body)?;
        self.sigma.region_reset_to_mark(target, mark);
        match outcome {
            Outcome::Val(_) => Ok(StmtOut::Ok),
            Outcome::Ctrl(ctrl) => Ok(StmtOut::Ctrl(ctrl)),
        }
    }

    fn exec_parallel(&mut self, domain: &Expr, body: &Block) -> EvalResult<StmtOut> {
        let domain_v = match self.eval_expr(domain)? {
            Outcome::Val(v) => v,
            Outcome::Ctrl(ctrl) => return Ok(StmtOut::Ctrl(ctrl)),
        };
        let domain_name = match &domain_v {
            Value::Str(s) => String::from_utf8_lossy(&s.bytes).to_string(),
            other => other.to_string(),
        };
        let parent = self.current_token();
        let token = self.tokens.new_token(parent);
        self.par_stack.push(ParallelCtx { domain: domain_name.clone(), token, first_panic: None });
        self.trace.record("parallel", "begin", &domain_name);
        let outcome = self.eval_block(body)?;
        let ctx = self.par_stack.pop().ok_or_else(|| ice("parallel stack underflow"))?;
        self.trace.record("parallel", "join", &domain_name);
        match outcome {
            Outcome::Ctrl(ctrl) => Ok(StmtOut::Ctrl(ctrl)),
            Outcome::Val(_) => match ctx.first_panic {
                // The join re-raises the first panic of the context.
                Some(code) => Ok(StmtOut::Ctrl(Control {
                    kind: ControlKind::Panic,
                    value: None,
                    code,
                })),
                None => Ok(StmtOut::Ok),
            },
        }
    }

    fn exec_loop(&mut self, kind: &LoopKind, body: &Block) -> EvalResult<StmtOut> {
        let mut iterations: u64 = 0;
        loop {
            iterations += 1;
            if iterations > 10_000_000 {
                return Err(ice("interpreter loop bound exceeded"));
            }
            match kind {
                LoopKind::While(cond) => {
                    let c = match self.eval_expr(cond)? {
                        Outcome::Val(v) => v,
                        Outcome::Ctrl(ctrl) => return Ok(StmtOut::Ctrl(ctrl)),
                    };
                    if c.as_bool() != Some(true) {
                        return Ok(StmtOut::Ok);
                    }
                }
                LoopKind::Loop => {}
                LoopKind::For { .. } => break,
            }
            match self.eval_block(body)? {
                Outcome::Val(_) => {}
                Outcome::Ctrl(ctrl) => match ctrl.kind {
                    ControlKind::Break => return Ok(StmtOut::Ok),
                    ControlKind::Continue => {}
                    _ => return Ok(StmtOut::Ctrl(ctrl)),
                },
            }
        }
        // Counted iteration over a range or array.
        let LoopKind::For { binder, iter } = kind else {
            return Err(ice("loop shape"));
        };
        let iter_v = match self.eval_expr(iter)? {
            Outcome::Val(v) => v,
            Outcome::Ctrl(ctrl) => return Ok(StmtOut::Ctrl(ctrl)),
        };
        let items: Vec<Value> = match &iter_v {
            Value::Range(range) => {
                let lo = range.lo.as_deref().and_then(int_of).unwrap_or(0);
                let hi = match range.hi.as_deref().and_then(int_of) {
                    Some(hi) => hi,
                    None => return Err(ice("for over unbounded range")),
                };
                let hi = match range.kind {
                    cursive_ast::ast::RangeKind::Inclusive
                    | cursive_ast::ast::RangeKind::ToInclusive => hi + 1,
                    _ => hi,
                };
                (lo..hi).map(|i| Value::i32(i as i32)).collect()
            }
            Value::Array(elems) => elems.clone(),
            Value::Slice(slice) => slice.base.clone(),
            other => return Err(ice(format!("for over {}", other))),
        };
        for item in items {
            self.sigma.push_scope();
            self.sigma.bind_val(binder, BindingValue::Val(item), BindInfo::owned());
            let outcome = self.eval_block(body)?;
            let outcome = self.merge_scope_exit(outcome);
            match outcome {
                Outcome::Val(_) => {}
                Outcome::Ctrl(ctrl) => match ctrl.kind {
                    ControlKind::Break => return Ok(StmtOut::Ok),
                    ControlKind::Continue => {}
                    _ => return Ok(StmtOut::Ctrl(ctrl)),
                },
            }
        }
        trace!("for loop done");
        Ok(StmtOut::Ok)
    }
}
