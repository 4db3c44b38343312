//! Procedure and method application.
//!
//! Method resolution mirrors the static dispatch rules: inherent record
//! methods first, then class impls (with default bodies for omitted
//! overrides), then modal state methods selected by the receiver's current
//! state. Builtin receivers (strings, bytes, regions, the context
//! capabilities) short-circuit into the runtime model.

use tracing::trace;

use cursive_ast::ast::{Arg, ClassMethodDecl, Expr, ExprKind, ProcDecl};
use cursive_ast::path::{fold_ident, Path};
use cursive_ast::types::{strip_perm, Ty, TyKind};
use cursive_middle::panic::PanicReason;
use cursive_middle::store::{BindInfo, BindingValue, CleanupItem, MemError};
use cursive_middle::value::Value;

use crate::builtins;
use crate::cleanup::DropStatus;
use crate::control::{Control, ControlKind, Outcome};
use crate::expr::PlaceOut;
use crate::machine::{ice, EvalContext, EvalResult, MAX_CALL_DEPTH};

/// How a method call resolves.
enum MethodTarget {
    Record(ProcDecl),
    Class { method: ClassMethodDecl, override_body: Option<ProcDecl> },
    State { proc: ProcDecl, transitions_to: Option<String> },
}

impl<'a> EvalContext<'a> {
    fn eval_args(&mut self, args: &[Arg]) -> EvalResult<Result<Vec<Value>, Control>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let outcome = if arg.by_move {
                self.eval_expr(&Expr {
                    id: arg.expr.id,
                    span: arg.expr.span,
                    kind: ExprKind::Move { place: Box::new(arg.expr.clone()) },
                })?
            } else {
                self.eval_expr(&arg.expr)?
            };
            match outcome {
                Outcome::Val(v) => values.push(v),
                Outcome::Ctrl(ctrl) => return Ok(Err(ctrl)),
            }
        }
        Ok(Ok(values))
    }

    /// Applies a user procedure: fresh scope, parameters bound by value,
    /// body run under the callee's cleanup discipline.
    pub fn apply_proc(
        &mut self,
        module: &Path,
        proc: &ProcDecl,
        self_value: Option<Value>,
        args: Vec<Value>,
    ) -> EvalResult<Outcome> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Ok(Outcome::Ctrl(Control::panic(PanicReason::Other)));
        }
        trace!("apply_proc: {}.{} ({} args)", module, proc.name, args.len());
        let Some(body) = &proc.body else {
            return Err(ice(format!("extern `{}` has no body to interpret", proc.name)));
        };
        self.call_depth += 1;
        let saved_module = self.current_module.replace(module.clone());
        self.sigma.push_scope();
        if let Some(self_value) = self_value {
            self.sigma.bind_val("self", BindingValue::Val(self_value), BindInfo::alias());
        }
        for (param, value) in proc.params.iter().zip(args) {
            let binding = self
                .sigma
                .bind_val(&param.name, BindingValue::Val(value), BindInfo::owned())
                .ok_or_else(|| ice("no scope for params"))?;
            if param.by_move {
                // Moved-in parameters are the callee's to drop.
                self.sigma.append_cleanup(CleanupItem::DropBinding(binding));
            }
        }
        let outcome = self.eval_block(body)?;
        let outcome = self.merge_scope_exit(outcome);
        self.current_module = saved_module;
        self.call_depth -= 1;
        Ok(match outcome {
            Outcome::Val(v) => Outcome::Val(v),
            Outcome::Ctrl(ctrl) => match ctrl.kind {
                ControlKind::Return => Outcome::Val(ctrl.value.unwrap_or(Value::Unit)),
                ControlKind::Panic | ControlKind::Abort => Outcome::Ctrl(ctrl),
                ControlKind::Break | ControlKind::Continue => {
                    return Err(ice("loop control escaped a procedure"));
                }
            },
        })
    }

    pub fn apply_named_proc(&mut self, path: &Path, args: Vec<Value>) -> EvalResult<Outcome> {
        let Some(proc) = self.scx.proc(path).cloned() else {
            return Err(ice(format!("unknown procedure `{}`", path)));
        };
        self.apply_proc(&path.parent(), &proc, None, args)
    }

    /// Resolves a call head: builtin procs, user procs (current-module
    /// relative for bare names), and first-class proc/ctor values.
    pub fn eval_call(&mut self, callee: &Expr, args: &[Arg]) -> EvalResult<Outcome> {
        if let ExprKind::Path(path) = &callee.kind {
            if builtins::is_builtin_proc(path) {
                let args = match self.eval_args(args)? {
                    Ok(args) => args,
                    Err(ctrl) => return Ok(Outcome::Ctrl(ctrl)),
                };
                return builtins::call_builtin_proc(self, path, args);
            }
            if let Some(full) = self.resolve_proc_path(path) {
                let args = match self.eval_args(args)? {
                    Ok(args) => args,
                    Err(ctrl) => return Ok(Outcome::Ctrl(ctrl)),
                };
                return self.apply_named_proc(&full, args);
            }
        }
        // First-class callee.
        let callee_v = val_or_prop!(self.eval_expr(callee)?);
        let args = match self.eval_args(args)? {
            Ok(args) => args,
            Err(ctrl) => return Ok(Outcome::Ctrl(ctrl)),
        };
        match callee_v {
            Value::ProcRef { module_path, name } => {
                self.apply_named_proc(&module_path.child(name), args)
            }
            Value::RecordCtor { path } => self.construct_record(&path, args),
            other => Err(ice(format!("call of {}", other))),
        }
    }

    fn resolve_proc_path(&self, path: &Path) -> Option<Path> {
        if path.segments.len() > 1 {
            if self.scx.proc(path).is_some() {
                return Some(path.clone());
            }
            return None;
        }
        let name = &path.segments[0];
        if let Some(module) = &self.current_module {
            let candidate = module.child(name.clone());
            if self.scx.proc(&candidate).is_some() {
                return Some(candidate);
            }
        }
        let folded = fold_ident(name);
        self.scx.modules.values().find_map(|m| {
            m.procs
                .iter()
                .any(|p| fold_ident(&p.name) == folded)
                .then(|| m.path.child(name.clone()))
        })
    }

    fn construct_record(&mut self, path: &Path, args: Vec<Value>) -> EvalResult<Outcome> {
        let Some(decl) = self.scx.record_decl(path) else {
            return Err(ice(format!("unknown record `{}`", path)));
        };
        if decl.fields.len() != args.len() {
            return Err(ice(format!("record ctor arity for `{}`", path)));
        }
        let fields = decl
            .fields
            .iter()
            .zip(args)
            .map(|(f, v)| (f.name.clone(), v))
            .collect();
        Ok(Outcome::Val(Value::Record(cursive_middle::value::RecordVal {
            ty: cursive_ast::types::mk_path(path.clone()),
            fields,
        })))
    }

    // Methods.

    pub fn eval_method_call(
        &mut self,
        recv: &Expr,
        name: &str,
        args: &[Arg],
    ) -> EvalResult<Outcome> {
        let recv_value = val_or_prop!(self.eval_expr(recv)?);
        // Builtin receivers first.
        match &recv_value {
            Value::Str(_) | Value::Bytes(_) => {
                let args = match self.eval_args(args)? {
                    Ok(args) => args,
                    Err(ctrl) => return Ok(Outcome::Ctrl(ctrl)),
                };
                return self.apply_buffer_method(recv, recv_value, name, args);
            }
            Value::Modal(modal) if crate::expr::region_target_of(&recv_value).is_some() => {
                let state = modal.state.clone();
                let args = match self.eval_args(args)? {
                    Ok(args) => args,
                    Err(ctrl) => return Ok(Outcome::Ctrl(ctrl)),
                };
                return builtins::region_method(self, recv, recv_value, &state, name, args);
            }
            Value::Dynamic(dyn_val) => {
                if builtins::is_capability_class(&dyn_val.class_path) {
                    let args = match self.eval_args(args)? {
                        Ok(args) => args,
                        Err(ctrl) => return Ok(Outcome::Ctrl(ctrl)),
                    };
                    return builtins::capability_method(self, recv_value, name, args);
                }
            }
            Value::Record(record) if builtins::is_context_record(&record.ty) => {
                let args = match self.eval_args(args)? {
                    Ok(args) => args,
                    Err(ctrl) => return Ok(Outcome::Ctrl(ctrl)),
                };
                return builtins::context_method(self, name, args);
            }
            _ => {}
        }

        let recv_ty = self.recv_static_ty(recv, &recv_value);
        let Some(target) = self.resolve_method(&recv_ty, &recv_value, name) else {
            return Err(ice(format!("no method `{}` on {}", name, recv_value)));
        };
        let args = match self.eval_args(args)? {
            Ok(args) => args,
            Err(ctrl) => return Ok(Outcome::Ctrl(ctrl)),
        };
        match target {
            MethodTarget::Record(proc) => {
                let module = owner_path_of(&recv_ty).unwrap_or_else(|| Path::single("_"));
                self.apply_proc(&module, &proc, Some(recv_value), args)
            }
            MethodTarget::Class { method, override_body } => {
                let proc = match override_body {
                    Some(proc) => proc,
                    None => ProcDecl {
                        name: method.name.clone(),
                        params: method.params.clone(),
                        ret: method.ret.clone(),
                        body: method.default_body.clone(),
                        is_extern: false,
                    },
                };
                let module = owner_path_of(&recv_ty).unwrap_or_else(|| Path::single("_"));
                self.apply_proc(&module, &proc, Some(recv_value), args)
            }
            MethodTarget::State { proc, transitions_to } => {
                let module = owner_path_of(&recv_ty).unwrap_or_else(|| Path::single("_"));
                let outcome = self.apply_proc(&module, &proc, Some(recv_value), args)?;
                // A declared transition retargets the receiver's state.
                if let (Outcome::Val(_), Some(next)) = (&outcome, transitions_to) {
                    self.transition_receiver(recv, &next)?;
                }
                Ok(outcome)
            }
        }
    }

    fn recv_static_ty(&self, recv: &Expr, recv_value: &Value) -> Ty {
        if let Some(ty) = self.scx.expr_ty(recv.id) {
            return ty.clone();
        }
        match recv_value {
            Value::Record(record) => record.ty.clone(),
            Value::Dynamic(dyn_val) => std::rc::Rc::new(TyKind::Dynamic {
                class_path: dyn_val.class_path.clone(),
            }),
            _ => cursive_ast::types::mk_unit(),
        }
    }

    fn resolve_method(&self, recv_ty: &Ty, recv_value: &Value, name: &str) -> Option<MethodTarget> {
        let folded = fold_ident(name);
        match &**strip_perm(recv_ty) {
            TyKind::Path(path) | TyKind::ModalState { path, .. } => {
                if let Some(record) = self.scx.record_decl(path) {
                    if let Some(proc) =
                        record.methods.iter().find(|m| fold_ident(&m.name) == folded)
                    {
                        return Some(MethodTarget::Record(proc.clone()));
                    }
                    return self.resolve_class_method(recv_ty, &folded);
                }
                if let Some(modal) = self.scx.modal_decl(path) {
                    // State methods are selected by the value's state.
                    let current = match recv_value {
                        Value::Modal(m) => fold_ident(&m.state),
                        _ => match &**strip_perm(recv_ty) {
                            TyKind::ModalState { state, .. } => fold_ident(state),
                            _ => return None,
                        },
                    };
                    for state in &modal.states {
                        if fold_ident(&state.name) != current {
                            continue;
                        }
                        if let Some(method) = state
                            .methods
                            .iter()
                            .find(|m| fold_ident(&m.proc.name) == folded)
                        {
                            return Some(MethodTarget::State {
                                proc: method.proc.clone(),
                                transitions_to: method.transitions_to.clone(),
                            });
                        }
                    }
                }
                None
            }
            TyKind::Dynamic { class_path } => {
                let class = self.scx.class_decl(class_path)?;
                let method =
                    class.methods.iter().find(|m| fold_ident(&m.name) == folded)?.clone();
                let concrete = match recv_value {
                    Value::Dynamic(d) => d.concrete.clone(),
                    _ => return None,
                };
                let override_body = self
                    .scx
                    .impl_for(class_path, &concrete)
                    .and_then(|imp| {
                        imp.methods.iter().find(|m| fold_ident(&m.name) == folded)
                    })
                    .cloned();
                Some(MethodTarget::Class { method, override_body })
            }
            _ => None,
        }
    }

    fn resolve_class_method(&self, recv_ty: &Ty, folded: &str) -> Option<MethodTarget> {
        for imp in &self.scx.impls {
            if !cursive_ast::types::type_equiv(&imp.self_ty, recv_ty) {
                continue;
            }
            let class = self.scx.class_decl(&imp.class_path)?;
            let Some(method) = class.methods.iter().find(|m| fold_ident(&m.name) == folded)
            else {
                continue;
            };
            let override_body =
                imp.methods.iter().find(|m| fold_ident(&m.name) == folded).cloned();
            return Some(MethodTarget::Class { method: method.clone(), override_body });
        }
        None
    }

    fn transition_receiver(&mut self, recv: &Expr, next_state: &str) -> EvalResult<()> {
        if !recv.is_place() {
            return Ok(());
        }
        let addr = match self.eval_place(recv)? {
            PlaceOut::Place(addr) => addr,
            PlaceOut::Ctrl(_) => return Ok(()),
        };
        match self.sigma.read_location(addr) {
            Ok(Value::Modal(mut modal)) => {
                modal.state = next_state.to_string();
                let _ = self.sigma.write_location(addr, Value::Modal(modal));
                Ok(())
            }
            Ok(_) | Err(MemError::Expired) | Err(MemError::Unmapped) => Ok(()),
        }
    }

    /// String/Bytes methods mutate the receiver in place when it is a
    /// place expression; the updated buffer writes back through it.
    fn apply_buffer_method(
        &mut self,
        recv: &Expr,
        recv_value: Value,
        name: &str,
        args: Vec<Value>,
    ) -> EvalResult<Outcome> {
        let (updated, outcome) = builtins::buffer_method(self, recv_value, name, args)?;
        if let (Some(updated), true) = (updated, recv.is_place()) {
            if let PlaceOut::Place(addr) = self.eval_place(recv)? {
                let _ = self.sigma.write_location(addr, updated);
            }
        }
        Ok(outcome)
    }

    /// Invokes a type's `Drop` impl method on `value`.
    pub(crate) fn call_drop_method(
        &mut self,
        ty: &Ty,
        value: &Value,
    ) -> EvalResult<DropStatus> {
        let drop_class = cursive_ast::env::drop_class_path();
        let Some(imp) = self.scx.impl_for(&drop_class, ty) else {
            return Ok(DropStatus::Ok);
        };
        let Some(proc) = imp
            .methods
            .iter()
            .find(|m| fold_ident(&m.name) == "drop")
            .cloned()
        else {
            return Ok(DropStatus::Ok);
        };
        let module = owner_path_of(ty).unwrap_or_else(|| Path::single("_"));
        match self.apply_proc(&module, &proc, Some(value.clone()), Vec::new())? {
            Outcome::Val(_) => Ok(DropStatus::Ok),
            Outcome::Ctrl(ctrl) => Ok(DropStatus::Panic(ctrl.code)),
        }
    }
}

fn owner_path_of(ty: &Ty) -> Option<Path> {
    match &**strip_perm(ty) {
        TyKind::Path(path) | TyKind::ModalState { path, .. } => Some(path.clone()),
        TyKind::Dynamic { class_path } => Some(class_path.clone()),
        _ => None,
    }
}
