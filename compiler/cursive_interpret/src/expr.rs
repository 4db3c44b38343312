//! Expression evaluation.

use tracing::trace;

use cursive_ast::ast::{Expr, ExprKind, Lit, RangeKind, Reducer};
use cursive_ast::path::{fold_ident, Path};
use cursive_ast::types::{IntTy, PrimTy, PtrState, TyKind};
use cursive_middle::panic::PanicReason;
use cursive_middle::store::{Addr, AddrProj, BindState, MemError};
use cursive_middle::value::{
    BytesVal, EnumPayload, EnumVal, RangeVal, RecordVal, SliceVal, StrState, StrVal, Value,
};

use crate::control::{Control, Outcome};
use crate::machine::{ice, EvalContext, EvalResult};
use crate::{ops, pattern};

/// A resolved place: an address Σ can read and write through.
pub enum PlaceOut {
    Place(Addr),
    Ctrl(Control),
}

impl<'a> EvalContext<'a> {
    pub fn eval_expr(&mut self, expr: &Expr) -> EvalResult<Outcome> {
        match &expr.kind {
            ExprKind::Lit(lit) => Ok(Outcome::Val(self.eval_lit(expr, lit))),
            ExprKind::Path(path) => self.eval_path(path),
            ExprKind::Unary { op, expr: operand } => {
                let v = val_or_prop!(self.eval_expr(operand)?);
                ops::eval_unary(*op, v)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                // Short-circuit before touching the right operand.
                if matches!(op, cursive_ast::ast::BinOp::And | cursive_ast::ast::BinOp::Or) {
                    let l = val_or_prop!(self.eval_expr(lhs)?);
                    let l = l.as_bool().ok_or_else(|| ice("non-bool short-circuit lhs"))?;
                    let is_and = matches!(op, cursive_ast::ast::BinOp::And);
                    if l != is_and {
                        return Ok(Outcome::Val(Value::Bool(l)));
                    }
                    return self.eval_expr(rhs);
                }
                let l = val_or_prop!(self.eval_expr(lhs)?);
                let r = val_or_prop!(self.eval_expr(rhs)?);
                ops::eval_binary(*op, l, r)
            }
            ExprKind::Call { callee, args } => self.eval_call(callee, args),
            ExprKind::MethodCall { recv, name, args } => self.eval_method_call(recv, name, args),
            ExprKind::Field { base, name } => {
                let v = val_or_prop!(self.eval_expr(base)?);
                self.project_field(&v, name)
            }
            ExprKind::TupleField { base, index } => {
                let v = val_or_prop!(self.eval_expr(base)?);
                match &v {
                    Value::Tuple(elems) => match elems.get(*index) {
                        Some(e) => Ok(Outcome::Val(e.clone())),
                        None => Err(ice(format!("tuple index {} of {}", index, v))),
                    },
                    _ => Err(ice(format!("tuple access on {}", v))),
                }
            }
            ExprKind::Index { base, index } => self.eval_index(base, index),
            ExprKind::Range { kind, lo, hi } => {
                let lo = match lo {
                    Some(lo) => Some(Box::new(val_or_prop!(self.eval_expr(lo)?))),
                    None => None,
                };
                let hi = match hi {
                    Some(hi) => Some(Box::new(val_or_prop!(self.eval_expr(hi)?))),
                    None => None,
                };
                Ok(Outcome::Val(Value::Range(RangeVal { kind: *kind, lo, hi })))
            }
            ExprKind::Tuple(elems) => {
                let mut values = Vec::with_capacity(elems.len());
                for e in elems {
                    values.push(val_or_prop!(self.eval_expr(e)?));
                }
                Ok(Outcome::Val(Value::Tuple(values)))
            }
            ExprKind::Array(elems) => {
                let mut values = Vec::with_capacity(elems.len());
                for e in elems {
                    values.push(val_or_prop!(self.eval_expr(e)?));
                }
                Ok(Outcome::Val(Value::Array(values)))
            }
            ExprKind::RecordLit { path, fields } => self.eval_record_lit(path, fields),
            ExprKind::EnumLit { path, payload } => self.eval_enum_lit(path, payload),
            ExprKind::Cast { expr: inner, ty } => {
                let v = val_or_prop!(self.eval_expr(inner)?);
                crate::cast::eval_cast(v, ty)
            }
            ExprKind::Transmute { expr: inner, ty } => {
                let v = val_or_prop!(self.eval_expr(inner)?);
                crate::cast::eval_transmute(v, ty)
            }
            ExprKind::AddrOf { place } => match self.eval_place(place)? {
                PlaceOut::Place(addr) => {
                    Ok(Outcome::Val(Value::Ptr(cursive_middle::value::PtrVal {
                        state: PtrState::Valid,
                        addr,
                    })))
                }
                PlaceOut::Ctrl(ctrl) => Ok(Outcome::Ctrl(ctrl)),
            },
            ExprKind::Deref { expr: inner } => {
                let v = val_or_prop!(self.eval_expr(inner)?);
                self.deref_value(&v)
            }
            ExprKind::Move { place } => self.eval_move(place),
            ExprKind::Alloc { value, region } => self.eval_alloc(value, region),
            ExprKind::If { cond, then_blk, else_expr } => {
                let c = val_or_prop!(self.eval_expr(cond)?);
                match c.as_bool() {
                    Some(true) => self.eval_block(then_blk),
                    Some(false) => match else_expr {
                        Some(else_expr) => self.eval_expr(else_expr),
                        None => Ok(Outcome::unit()),
                    },
                    None => Err(ice(format!("non-bool condition {}", c))),
                }
            }
            ExprKind::Match { scrutinee, arms } => self.eval_match(scrutinee, arms),
            ExprKind::Block(block) => self.eval_block(block),
            ExprKind::Spawn { moves, body } => self.eval_spawn(moves, body),
            ExprKind::Wait { handle } => self.eval_wait(handle),
            ExprKind::Dispatch { range, binder, chunk, reduce, ordered, body } => {
                self.eval_dispatch(range, binder, chunk, reduce, *ordered, body)
            }
            ExprKind::Propagate { expr: inner } => self.eval_propagate(inner),
            ExprKind::Error => Ok(Outcome::Ctrl(Control::panic(PanicReason::ErrorExpr))),
        }
    }

    fn eval_lit(&mut self, expr: &Expr, lit: &Lit) -> Value {
        match lit {
            Lit::Bool(b) => Value::Bool(*b),
            Lit::Char(c) => Value::Char(*c),
            Lit::Unit => Value::Unit,
            Lit::Int { negative, magnitude, ty } => {
                let prim = ty
                    .as_ref()
                    .or_else(|| self.scx.expr_ty(expr.id))
                    .and_then(|t| match &**cursive_ast::types::strip_perm(t) {
                        TyKind::Prim(p @ PrimTy::Int(_)) | TyKind::Prim(p @ PrimTy::Uint(_)) => {
                            Some(*p)
                        }
                        _ => None,
                    })
                    .unwrap_or(PrimTy::Int(IntTy::I32));
                Value::int(prim, *negative, *magnitude)
            }
            Lit::Float { value, ty } => {
                let fty = ty
                    .as_ref()
                    .and_then(|t| match &**cursive_ast::types::strip_perm(t) {
                        TyKind::Prim(PrimTy::Float(f)) => Some(*f),
                        _ => None,
                    })
                    .unwrap_or(cursive_ast::types::FloatTy::F64);
                Value::Float(cursive_middle::value::FloatVal { ty: fty, value: *value })
            }
            Lit::Str(bytes) => {
                Value::Str(StrVal { state: StrState::View, bytes: bytes.clone(), cap: 0 })
            }
            Lit::Bytes(bytes) => {
                Value::Bytes(BytesVal { state: StrState::View, bytes: bytes.clone(), cap: 0 })
            }
        }
    }

    fn eval_path(&mut self, path: &Path) -> EvalResult<Outcome> {
        if path.segments.len() == 1 {
            return self.read_binding(&path.segments[0]);
        }
        // Enum variant without payload.
        if let Some((_, _, variant)) = self.scx.enum_variant(path) {
            if variant.payload.is_none() {
                return Ok(Outcome::Val(Value::Enum(EnumVal {
                    path: path.clone(),
                    payload: None,
                })));
            }
        }
        if self.scx.proc(path).is_some() {
            return Ok(Outcome::Val(Value::ProcRef {
                module_path: path.parent(),
                name: path.last().unwrap_or_default().to_string(),
            }));
        }
        if self.scx.record_decl(path).is_some() {
            return Ok(Outcome::Val(Value::RecordCtor { path: path.clone() }));
        }
        self.read_static(path)
    }

    pub(crate) fn read_binding(&mut self, name: &str) -> EvalResult<Outcome> {
        let Some(binding) = self.sigma.lookup_bind(name) else {
            return Err(ice(format!("unbound name `{}`", name)));
        };
        match self.sigma.bind_state_of(&binding) {
            Some(BindState::Valid) => {}
            Some(BindState::PartiallyMoved { fields }) if fields.is_empty() => {}
            // A moved read slipping past the analyzer is still a hole the
            // world must not expose.
            _ => return Ok(Outcome::Ctrl(Control::panic(PanicReason::Other))),
        }
        match self.sigma.value_of_binding(&binding) {
            Some(v) => Ok(Outcome::Val(v.clone())),
            None => Ok(Outcome::Ctrl(Control::panic(PanicReason::ExpiredDeref))),
        }
    }

    /// Static access panics `InitPanic` once the owning module is poisoned.
    pub(crate) fn read_static(&mut self, path: &Path) -> EvalResult<Outcome> {
        let module = path.parent();
        let name = path.last().unwrap_or_default();
        let module_key = module.key();
        if self.sigma.poisoned_module(&module_key) {
            return Ok(Outcome::Ctrl(Control::panic(PanicReason::InitPanic)));
        }
        match self.sigma.static_addr(&module_key, name) {
            Some(addr) => match self.sigma.read_location(addr) {
                Ok(v) => Ok(Outcome::Val(v)),
                Err(_) => Ok(Outcome::Ctrl(Control::panic(PanicReason::ExpiredDeref))),
            },
            None => Err(ice(format!("unknown static `{}`", path))),
        }
    }

    fn project_field(&mut self, value: &Value, name: &str) -> EvalResult<Outcome> {
        let folded = fold_ident(name);
        match value {
            Value::Record(record) => {
                match record.fields.iter().find(|(n, _)| fold_ident(n) == folded) {
                    Some((_, v)) => Ok(Outcome::Val(v.clone())),
                    None => Err(ice(format!("no field `{}` on {}", name, value))),
                }
            }
            Value::Modal(modal) => self.project_field(&modal.payload, name),
            _ => Err(ice(format!("field access `{}` on {}", name, value))),
        }
    }

    fn eval_index(&mut self, base: &Expr, index: &Expr) -> EvalResult<Outcome> {
        let base_v = val_or_prop!(self.eval_expr(base)?);
        let elems: &[Value] = match &base_v {
            Value::Array(elems) | Value::Tuple(elems) => elems,
            Value::Slice(slice) => &slice.base,
            _ => return Err(ice(format!("indexing {}", base_v))),
        };
        // Range operand: slice with bounds check.
        if let ExprKind::Range { .. } = &index.kind {
            let range_v = val_or_prop!(self.eval_expr(index)?);
            let Value::Range(range) = range_v else {
                return Err(ice("slice index must be a range"));
            };
            let len = elems.len() as u64;
            let lo = range.lo.as_deref().and_then(int_of);
            let hi = range.hi.as_deref().and_then(int_of);
            match cursive_lower::checks::slice_bounds(range.kind, lo, hi, len) {
                Some((start, end)) => {
                    let base = elems[start as usize..end as usize].to_vec();
                    return Ok(Outcome::Val(Value::Slice(SliceVal {
                        base,
                        range: RangeVal { kind: RangeKind::Full, lo: None, hi: None },
                    })));
                }
                None => return Ok(Outcome::Ctrl(Control::panic(PanicReason::Bounds))),
            }
        }
        let index_v = val_or_prop!(self.eval_expr(index)?);
        let idx = match int_of(&index_v) {
            Some(i) => i,
            None => return Ok(Outcome::Ctrl(Control::panic(PanicReason::Bounds))),
        };
        if !cursive_lower::checks::check_index(elems.len() as u64, idx) {
            return Ok(Outcome::Ctrl(Control::panic(PanicReason::Bounds)));
        }
        Ok(Outcome::Val(elems[idx as usize].clone()))
    }

    fn eval_record_lit(
        &mut self,
        path: &Path,
        fields: &[(String, Expr)],
    ) -> EvalResult<Outcome> {
        let mut values = Vec::with_capacity(fields.len());
        for (name, field) in fields {
            values.push((name.clone(), val_or_prop!(self.eval_expr(field)?)));
        }
        // Normalize to declaration order; equality is positional.
        if let Some(decl) = self.scx.record_decl(path) {
            let mut ordered = Vec::with_capacity(decl.fields.len());
            for field in &decl.fields {
                let folded = fold_ident(&field.name);
                match values.iter().find(|(n, _)| fold_ident(n) == folded) {
                    Some((_, v)) => ordered.push((field.name.clone(), v.clone())),
                    None => return Err(ice(format!("missing field `{}`", field.name))),
                }
            }
            values = ordered;
        }
        Ok(Outcome::Val(Value::Record(RecordVal {
            ty: cursive_ast::types::mk_path(path.clone()),
            fields: values,
        })))
    }

    fn eval_enum_lit(
        &mut self,
        path: &Path,
        payload: &Option<cursive_ast::ast::EnumPayloadExpr>,
    ) -> EvalResult<Outcome> {
        let payload = match payload {
            None => None,
            Some(cursive_ast::ast::EnumPayloadExpr::Tuple(elems)) => {
                let mut values = Vec::with_capacity(elems.len());
                for e in elems {
                    values.push(val_or_prop!(self.eval_expr(e)?));
                }
                Some(EnumPayload::Tuple(values))
            }
            Some(cursive_ast::ast::EnumPayloadExpr::Record(fields)) => {
                let mut values = Vec::with_capacity(fields.len());
                for (name, e) in fields {
                    values.push((name.clone(), val_or_prop!(self.eval_expr(e)?)));
                }
                Some(EnumPayload::Record(values))
            }
        };
        Ok(Outcome::Val(Value::Enum(EnumVal { path: path.clone(), payload })))
    }

    pub(crate) fn deref_value(&mut self, v: &Value) -> EvalResult<Outcome> {
        let addr = match v {
            Value::Ptr(p) => match p.state {
                PtrState::Null => {
                    return Ok(Outcome::Ctrl(Control::panic(PanicReason::NullDeref)));
                }
                PtrState::Expired => {
                    return Ok(Outcome::Ctrl(Control::panic(PanicReason::ExpiredDeref)));
                }
                PtrState::Valid => p.addr,
            },
            Value::RawPtr(p) => {
                if p.addr == 0 {
                    return Ok(Outcome::Ctrl(Control::panic(PanicReason::NullDeref)));
                }
                p.addr
            }
            _ => return Err(ice(format!("deref of {}", v))),
        };
        match self.sigma.read_location(addr) {
            Ok(value) => Ok(Outcome::Val(value)),
            Err(MemError::Expired) | Err(MemError::Unmapped) => {
                Ok(Outcome::Ctrl(Control::panic(PanicReason::ExpiredDeref)))
            }
        }
    }

    // Places.

    pub fn eval_place(&mut self, place: &Expr) -> EvalResult<PlaceOut> {
        match &place.kind {
            ExprKind::Path(path) if path.segments.len() == 1 => {
                match self.sigma.lookup_bind(&path.segments[0]) {
                    Some(binding) => Ok(PlaceOut::Place(binding.addr)),
                    None => Err(ice(format!("unbound place `{}`", path))),
                }
            }
            ExprKind::Path(path) => {
                let module = path.parent().key();
                if self.sigma.poisoned_module(&module) {
                    return Ok(PlaceOut::Ctrl(Control::panic(PanicReason::InitPanic)));
                }
                match self.sigma.static_addr(&module, path.last().unwrap_or_default()) {
                    Some(addr) => Ok(PlaceOut::Place(addr)),
                    None => Err(ice(format!("unknown static place `{}`", path))),
                }
            }
            ExprKind::Field { base, name } => match self.eval_place(base)? {
                PlaceOut::Place(addr) => {
                    Ok(PlaceOut::Place(self.sigma.view_addr(addr, AddrProj::Field(name.clone()))))
                }
                ctrl => Ok(ctrl),
            },
            ExprKind::TupleField { base, index } => match self.eval_place(base)? {
                PlaceOut::Place(addr) => {
                    Ok(PlaceOut::Place(self.sigma.view_addr(addr, AddrProj::Tuple(*index))))
                }
                ctrl => Ok(ctrl),
            },
            ExprKind::Index { base, index } => {
                let idx = match self.eval_expr(index)? {
                    Outcome::Val(v) => match int_of(&v) {
                        Some(i) => i as usize,
                        None => return Ok(PlaceOut::Ctrl(Control::panic(PanicReason::Bounds))),
                    },
                    Outcome::Ctrl(ctrl) => return Ok(PlaceOut::Ctrl(ctrl)),
                };
                match self.eval_place(base)? {
                    PlaceOut::Place(addr) => {
                        // Bounds are checked against the current value.
                        match self.sigma.read_location(addr) {
                            Ok(Value::Array(elems)) | Ok(Value::Tuple(elems))
                                if idx < elems.len() => {}
                            Ok(_) => {
                                return Ok(PlaceOut::Ctrl(Control::panic(PanicReason::Bounds)));
                            }
                            Err(_) => {
                                return Ok(PlaceOut::Ctrl(Control::panic(
                                    PanicReason::ExpiredDeref,
                                )));
                            }
                        }
                        Ok(PlaceOut::Place(self.sigma.view_addr(addr, AddrProj::Index(idx))))
                    }
                    ctrl => Ok(ctrl),
                }
            }
            // `alloc v` is a place: its address is the allocated slot.
            ExprKind::Alloc { value, region } => match self.eval_alloc(value, region)? {
                Outcome::Val(Value::Ptr(p)) => Ok(PlaceOut::Place(p.addr)),
                Outcome::Val(v) => Err(ice(format!("alloc produced {}", v))),
                Outcome::Ctrl(ctrl) => Ok(PlaceOut::Ctrl(ctrl)),
            },
            ExprKind::Deref { expr: inner } => {
                let v = match self.eval_expr(inner)? {
                    Outcome::Val(v) => v,
                    Outcome::Ctrl(ctrl) => return Ok(PlaceOut::Ctrl(ctrl)),
                };
                match v {
                    Value::Ptr(p) => match p.state {
                        PtrState::Null => {
                            Ok(PlaceOut::Ctrl(Control::panic(PanicReason::NullDeref)))
                        }
                        PtrState::Expired => {
                            Ok(PlaceOut::Ctrl(Control::panic(PanicReason::ExpiredDeref)))
                        }
                        PtrState::Valid => Ok(PlaceOut::Place(p.addr)),
                    },
                    Value::RawPtr(p) => Ok(PlaceOut::Place(p.addr)),
                    v => Err(ice(format!("deref place of {}", v))),
                }
            }
            // Evaluate-and-pin: a temporary gets a fresh scope-tagged slot.
            _ => {
                let v = match self.eval_expr(place)? {
                    Outcome::Val(v) => v,
                    Outcome::Ctrl(ctrl) => return Ok(PlaceOut::Ctrl(ctrl)),
                };
                let binding = self
                    .sigma
                    .bind_val(
                        "$tmp",
                        cursive_middle::store::BindingValue::Val(v),
                        cursive_middle::store::BindInfo::owned(),
                    )
                    .ok_or_else(|| ice("no scope for temporary"))?;
                Ok(PlaceOut::Place(binding.addr))
            }
        }
    }

    fn eval_move(&mut self, place: &Expr) -> EvalResult<Outcome> {
        match &place.kind {
            ExprKind::Path(path) if path.segments.len() == 1 => {
                let outcome = self.read_binding(&path.segments[0])?;
                if let Outcome::Val(_) = &outcome {
                    if let Some(binding) = self.sigma.lookup_bind(&path.segments[0]) {
                        self.sigma.set_state(&binding, BindState::Moved);
                    }
                }
                Ok(outcome)
            }
            ExprKind::Field { base, name } => {
                if let ExprKind::Path(path) = &base.kind {
                    if path.segments.len() == 1 {
                        let root = val_or_prop!(self.read_binding(&path.segments[0])?);
                        let field_val = val_or_prop!(self.project_field(&root, name)?);
                        if let Some(binding) = self.sigma.lookup_bind(&path.segments[0]) {
                            let folded = fold_ident(name);
                            let state = match self.sigma.bind_state_of(&binding) {
                                Some(BindState::PartiallyMoved { fields }) => {
                                    let mut fields = fields.clone();
                                    fields.insert(folded);
                                    BindState::PartiallyMoved { fields }
                                }
                                _ => {
                                    let mut fields = std::collections::BTreeSet::new();
                                    fields.insert(folded);
                                    BindState::PartiallyMoved { fields }
                                }
                            };
                            self.sigma.set_state(&binding, state);
                        }
                        return Ok(Outcome::Val(field_val));
                    }
                }
                self.eval_expr(place)
            }
            _ => self.eval_expr(place),
        }
    }

    fn eval_alloc(
        &mut self,
        value: &Expr,
        region: &Option<Box<Expr>>,
    ) -> EvalResult<Outcome> {
        let v = val_or_prop!(self.eval_expr(value)?);
        let target = match region {
            Some(region_expr) => {
                let handle = val_or_prop!(self.eval_expr(region_expr)?);
                match region_target_of(&handle) {
                    Some(target) => target,
                    None => return Err(ice(format!("not a region handle: {}", handle))),
                }
            }
            None => match self.sigma.innermost_region() {
                Some(region) => region.target,
                None => return Err(ice("alloc outside any region")),
            },
        };
        if self.sigma.region_by_target(target).map_or(true, |r| r.frozen) {
            return Ok(Outcome::Ctrl(Control::panic(PanicReason::Other)));
        }
        match self.sigma.alloc_in_region(target, v) {
            Some(addr) => {
                self.trace.record("region", "alloc", &format!("target {}", target));
                Ok(Outcome::Val(Value::Ptr(cursive_middle::value::PtrVal {
                    state: PtrState::Valid,
                    addr,
                })))
            }
            None => Ok(Outcome::Ctrl(Control::panic(PanicReason::ExpiredDeref))),
        }
    }

    fn eval_match(
        &mut self,
        scrutinee: &Expr,
        arms: &[cursive_ast::ast::Arm],
    ) -> EvalResult<Outcome> {
        let v = val_or_prop!(self.eval_expr(scrutinee)?);
        for arm in arms {
            let Some(bindings) = pattern::match_pattern(&arm.pattern, &v)? else {
                continue;
            };
            self.sigma.push_scope();
            for (name, value) in bindings {
                self.sigma.bind_val(
                    &name,
                    cursive_middle::store::BindingValue::Val(value),
                    cursive_middle::store::BindInfo::alias(),
                );
            }
            if let Some(guard) = &arm.guard {
                let g = match self.eval_expr(guard)? {
                    Outcome::Val(g) => g,
                    Outcome::Ctrl(ctrl) => {
                        self.finish_scope();
                        return Ok(Outcome::Ctrl(ctrl));
                    }
                };
                if g.as_bool() != Some(true) {
                    self.finish_scope();
                    continue;
                }
            }
            let outcome = self.eval_expr(&arm.body)?;
            let outcome = self.merge_scope_exit(outcome);
            return Ok(outcome);
        }
        trace!("match fell through on {}", v);
        Ok(Outcome::Ctrl(Control::panic(PanicReason::Other)))
    }

    // Structured parallelism.

    fn eval_spawn(&mut self, moves: &[String], body: &cursive_ast::ast::Block) -> EvalResult<Outcome> {
        // Cooperative model: the task runs at its submission point.
        for name in moves {
            if let Some(binding) = self.sigma.lookup_bind(name) {
                self.sigma.set_state(&binding, BindState::Moved);
            }
        }
        let cancelled = self
            .current_token()
            .map_or(false, |token| self.tokens.is_cancelled(token));
        let outcome = if cancelled {
            // Cancelled before entry: the body never runs.
            Outcome::unit()
        } else {
            self.eval_block(body)?
        };
        if let Outcome::Ctrl(ctrl) = &outcome {
            if ctrl.is_panic() {
                if let Some(par) = self.par_stack.last_mut() {
                    par.observe_panic(ctrl.code);
                }
                if let Some(token) = self.current_token() {
                    self.tokens.cancel(token);
                }
            }
        }
        let handle = self.tasks.insert(outcome);
        self.trace.record("parallel", "spawn", &format!("handle {}", handle));
        Ok(Outcome::Val(Value::usize(handle)))
    }

    fn eval_wait(&mut self, handle: &Expr) -> EvalResult<Outcome> {
        let h = val_or_prop!(self.eval_expr(handle)?);
        let Some(id) = int_of(&h) else {
            return Err(ice(format!("wait on {}", h)));
        };
        match self.tasks.take(id) {
            // The task's panic propagates at the wait point.
            Some(outcome) => Ok(outcome),
            None => Err(ice(format!("wait on unknown handle {}", id))),
        }
    }

    fn eval_dispatch(
        &mut self,
        range: &Expr,
        binder: &str,
        chunk: &Option<Box<Expr>>,
        reduce: &Option<Reducer>,
        _ordered: bool,
        body: &cursive_ast::ast::Block,
    ) -> EvalResult<Outcome> {
        let range_v = val_or_prop!(self.eval_expr(range)?);
        let Value::Range(range_val) = &range_v else {
            return Err(ice(format!("dispatch over {}", range_v)));
        };
        let lo = range_val.lo.as_deref().and_then(int_of).unwrap_or(0);
        let hi = match range_val.hi.as_deref().and_then(int_of) {
            Some(hi) => hi,
            None => return Err(ice("dispatch over unbounded range")),
        };
        let hi = match range_val.kind {
            RangeKind::Inclusive | RangeKind::ToInclusive => hi + 1,
            _ => hi,
        };
        if let Some(chunk) = chunk {
            // Chunk size shapes scheduling only; results are identical. The
            // sequential emulator is trivially ordered.
            let _ = val_or_prop!(self.eval_expr(chunk)?);
        }
        let mut acc: Option<Value> = None;
        for i in lo..hi {
            self.sigma.push_scope();
            self.sigma.bind_val(
                binder,
                cursive_middle::store::BindingValue::Val(Value::i32(i as i32)),
                cursive_middle::store::BindInfo::owned(),
            );
            let outcome = self.eval_block(body)?;
            let outcome = self.merge_scope_exit(outcome);
            let value = match outcome {
                Outcome::Val(v) => v,
                // First panic wins; the remaining iterations are cancelled.
                Outcome::Ctrl(ctrl) => return Ok(Outcome::Ctrl(ctrl)),
            };
            acc = Some(match acc {
                None => value,
                Some(prev) => {
                    let reduced = match reduce {
                        Some(Reducer::Proc(path)) => {
                            self.apply_named_proc(path, vec![prev, value])?
                        }
                        _ => apply_reducer(reduce, prev, value)?,
                    };
                    match reduced {
                        Outcome::Val(v) => v,
                        ctrl => return Ok(ctrl),
                    }
                }
            });
        }
        let result = match acc {
            Some(v) => v,
            None => reducer_identity(reduce),
        };
        self.trace.record("parallel", "dispatch", &format!("{}..{}", lo, hi));
        Ok(Outcome::Val(result))
    }

    fn eval_propagate(&mut self, inner: &Expr) -> EvalResult<Outcome> {
        let v = val_or_prop!(self.eval_expr(inner)?);
        let Value::Union(union) = &v else {
            // Not a union: nothing to forward.
            return Ok(Outcome::Val(v));
        };
        let ok_member = self
            .scx
            .expr_ty(inner.id)
            .and_then(|t| match &**cursive_ast::types::strip_perm(t) {
                TyKind::Union(members) => members.first().cloned(),
                _ => None,
            });
        let is_ok = match ok_member {
            Some(ok) => cursive_ast::types::type_equiv(&union.member, &ok),
            // Without type info, treat the payload as the success member.
            None => true,
        };
        if is_ok {
            Ok(Outcome::Val((*union.value).clone()))
        } else {
            Ok(Outcome::Ctrl(Control::ret(Some(v))))
        }
    }

    /// Runs the current scope's cleanup and folds its status into an
    /// in-flight outcome, then pops the scope.
    pub(crate) fn merge_scope_exit(&mut self, outcome: Outcome) -> Outcome {
        let status = self.cleanup_current_scope();
        self.sigma.pop_scope();
        crate::cleanup::merge_outcome(outcome, status)
    }

    pub(crate) fn finish_scope(&mut self) {
        let _ = self.cleanup_current_scope();
        self.sigma.pop_scope();
    }
}

pub(crate) fn int_of(v: &Value) -> Option<u64> {
    v.as_int().and_then(|i| i.to_u64())
}

/// Extracts the `target` a region handle value designates.
pub(crate) fn region_target_of(v: &Value) -> Option<u64> {
    match v {
        Value::Modal(modal) => match &*modal.payload {
            Value::Tuple(elems) => elems.get(1).and_then(int_of),
            _ => None,
        },
        _ => None,
    }
}

fn apply_reducer(reduce: &Option<Reducer>, acc: Value, next: Value) -> EvalResult<Outcome> {
    use cursive_ast::ast::BinOp;
    match reduce {
        None => Ok(Outcome::Val(next)),
        Some(Reducer::Add) => ops::eval_binary(BinOp::Add, acc, next),
        Some(Reducer::Mul) => ops::eval_binary(BinOp::Mul, acc, next),
        Some(Reducer::And) => ops::eval_binary(BinOp::BitAnd, acc, next),
        Some(Reducer::Or) => ops::eval_binary(BinOp::BitOr, acc, next),
        Some(Reducer::Min) | Some(Reducer::Max) => {
            let take_next = match ops::eval_binary(
                if matches!(reduce, Some(Reducer::Min)) { BinOp::Lt } else { BinOp::Gt },
                next.clone(),
                acc.clone(),
            )? {
                Outcome::Val(Value::Bool(b)) => b,
                other => return Ok(other),
            };
            Ok(Outcome::Val(if take_next { next } else { acc }))
        }
        // User reducers are applied pairwise by the dispatch loop itself.
        Some(Reducer::Proc(_)) => Ok(Outcome::Val(next)),
    }
}

fn reducer_identity(reduce: &Option<Reducer>) -> Value {
    match reduce {
        Some(Reducer::Add) => Value::i32(0),
        Some(Reducer::Mul) => Value::i32(1),
        Some(Reducer::And) => Value::Bool(true),
        Some(Reducer::Or) => Value::Bool(false),
        _ => Value::Unit,
    }
}
