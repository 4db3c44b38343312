//! Expression lowering.

use tracing::trace;

use cursive_ast::ast::{
    Arg, BinOp, Expr, ExprKind, Lit, Reducer, UnOp,
};
use cursive_ast::env::{bytes_path, string_path};
use cursive_ast::path::{fold_ident, Path};
use cursive_ast::types::{strip_perm, FloatTy, PrimTy, Ty, TyKind};
use cursive_middle::layout::enum_discriminants;
use cursive_middle::panic::PanicReason;
use cursive_middle::vtable::{self, VTABLE_HEADER_SLOTS};

use crate::ir::{DerivedValue, Ir, IrValue};
use crate::lower::{
    lower_block_valued, place, LowerCtx, LowerErrorKind, LowerResult,
};
use crate::symbols::{self, BuiltinSyms};

pub fn lower_expr(cx: &mut LowerCtx<'_>, expr: &Expr) -> LowerResult {
    match &expr.kind {
        ExprKind::Lit(lit) => lower_lit(cx, expr, lit),
        ExprKind::Path(path) => lower_path(cx, expr, path),
        ExprKind::Unary { op, expr: operand } => lower_unary(cx, *op, operand),
        ExprKind::Binary { op, lhs, rhs } => lower_binary(cx, *op, lhs, rhs),
        ExprKind::Call { callee, args } => lower_call(cx, expr, callee, args),
        ExprKind::MethodCall { recv, name, args } => {
            lower_method_call(cx, expr, recv, name, args)
        }
        ExprKind::Field { .. }
        | ExprKind::TupleField { .. }
        | ExprKind::Index { .. }
        | ExprKind::Deref { .. } => place::lower_read_place(cx, expr),
        ExprKind::Range { kind, lo, hi } => {
            let mut setup = Vec::new();
            let lo = lo.as_ref().map(|e| {
                let r = lower_expr(cx, e);
                setup.extend(r.setup);
                r.value
            });
            let hi = hi.as_ref().map(|e| {
                let r = lower_expr(cx, e);
                setup.extend(r.setup);
                r.value
            });
            let value = cx.opaque(DerivedValue::Range { kind: *kind, lo, hi });
            LowerResult { setup, value }
        }
        ExprKind::Tuple(elems) => {
            let (setup, values) = lower_all(cx, elems);
            let value = cx.opaque(DerivedValue::TupleLit(values));
            LowerResult { setup, value }
        }
        ExprKind::Array(elems) => {
            let (setup, values) = lower_all(cx, elems);
            let value = cx.opaque(DerivedValue::ArrayLit(values));
            LowerResult { setup, value }
        }
        ExprKind::RecordLit { path, fields } => {
            let mut setup = Vec::new();
            let mut lowered = Vec::with_capacity(fields.len());
            for (name, field) in fields {
                let r = lower_expr(cx, field);
                setup.extend(r.setup);
                lowered.push((name.clone(), r.value));
            }
            let ty = cursive_ast::types::mk_path(path.clone());
            let value = cx.opaque(DerivedValue::RecordLit { ty, fields: lowered });
            LowerResult { setup, value }
        }
        ExprKind::EnumLit { path, payload } => lower_enum_lit(cx, expr, path, payload),
        ExprKind::Cast { expr: inner, ty } => lower_cast(cx, expr, inner, ty),
        ExprKind::Transmute { expr: inner, ty } => lower_transmute(cx, expr, inner, ty),
        ExprKind::AddrOf { place: inner } => place::lower_addr_of(cx, inner),
        ExprKind::Move { place: inner } => place::lower_move_place(cx, inner),
        ExprKind::Alloc { value, region } => {
            let mut setup = Vec::new();
            let lowered = lower_expr(cx, value);
            setup.extend(lowered.setup);
            let region = region.as_ref().map(|r| {
                let lowered = lower_expr(cx, r);
                setup.extend(lowered.setup);
                lowered.value
            });
            let dest = cx.fresh_local();
            setup.push(Ir::Alloc { region, value: lowered.value, dest });
            LowerResult { setup, value: IrValue::Local(dest) }
        }
        ExprKind::If { cond, then_blk, else_expr } => {
            let cond_r = lower_expr(cx, cond);
            let mut setup = cond_r.setup;
            let dest = cx.fresh_local();
            let (then_ir, then_val) = lower_block_valued(cx, then_blk);
            let then_ir = Ir::seq(vec![then_ir, Ir::Phi { dest, sources: vec![then_val] }]);
            let else_ir = match else_expr {
                Some(else_expr) => {
                    let r = lower_expr(cx, else_expr);
                    let mut seq = r.setup;
                    seq.push(Ir::Phi { dest, sources: vec![r.value] });
                    Some(Box::new(Ir::seq(seq)))
                }
                None => Some(Box::new(Ir::Phi { dest, sources: vec![IrValue::unit()] })),
            };
            setup.push(Ir::If { cond: cond_r.value, then_ir: Box::new(then_ir), else_ir });
            LowerResult { setup, value: IrValue::Local(dest) }
        }
        ExprKind::Match { scrutinee, arms } => {
            super::pat::lower_match(cx, scrutinee, arms)
        }
        ExprKind::Block(block) => {
            let (ir, value) = lower_block_valued(cx, block);
            LowerResult { setup: vec![ir], value }
        }
        ExprKind::Spawn { moves, body } => lower_spawn(cx, moves, body),
        ExprKind::Wait { handle } => {
            let r = lower_expr(cx, handle);
            let mut setup = r.setup;
            let dest = cx.fresh_local();
            setup.push(Ir::Call {
                sym: builtin_sym("spawn_wait"),
                args: vec![r.value],
                dest: Some(dest),
            });
            // A panic inside the task surfaces at the wait point.
            setup.push(Ir::PanicCheck { cleanup: cx.cleanup_on_panic() });
            LowerResult { setup, value: IrValue::Local(dest) }
        }
        ExprKind::Dispatch { range, binder, chunk, reduce, ordered, body } => {
            lower_dispatch(cx, range, binder, chunk, reduce, *ordered, body)
        }
        ExprKind::Propagate { expr: inner } => lower_propagate(cx, inner),
        ExprKind::Error => {
            let setup =
                vec![Ir::LowerPanic { reason: PanicReason::ErrorExpr, cleanup: cx.cleanup_on_panic() }];
            LowerResult { setup, value: IrValue::unit() }
        }
    }
}

fn lower_all(cx: &mut LowerCtx<'_>, exprs: &[Expr]) -> (Vec<Ir>, Vec<IrValue>) {
    let mut setup = Vec::new();
    let mut values = Vec::with_capacity(exprs.len());
    for e in exprs {
        let r = lower_expr(cx, e);
        setup.extend(r.setup);
        values.push(r.value);
    }
    (setup, values)
}

pub fn builtin_sym(name: &str) -> String {
    BuiltinSyms::new()
        .resolve(name)
        .unwrap_or("cursive_rt_unknown")
        .to_string()
}

// Immediates.

fn encode_le(bits: u128, width_bytes: usize) -> Vec<u8> {
    bits.to_le_bytes()[..width_bytes].to_vec()
}

fn int_width_bytes(ty: &Ty) -> usize {
    match &**strip_perm(ty) {
        TyKind::Prim(PrimTy::Int(t)) => (t.bit_width() / 8) as usize,
        TyKind::Prim(PrimTy::Uint(t)) => (t.bit_width() / 8) as usize,
        _ => 4,
    }
}

fn lower_lit(cx: &mut LowerCtx<'_>, expr: &Expr, lit: &Lit) -> LowerResult {
    let value = match lit {
        Lit::Bool(b) => IrValue::Immediate(vec![*b as u8]),
        Lit::Char(c) => IrValue::Immediate(encode_le(*c as u128, 4)),
        Lit::Unit => IrValue::unit(),
        Lit::Int { negative, magnitude, ty } => {
            let ty = ty
                .clone()
                .or_else(|| cx.scx.expr_ty(expr.id).cloned())
                .unwrap_or_else(|| {
                    cursive_ast::types::mk_prim(PrimTy::Int(cursive_ast::types::IntTy::I32))
                });
            let bits = if *negative { magnitude.wrapping_neg() } else { *magnitude };
            IrValue::Immediate(encode_le(bits, int_width_bytes(&ty)))
        }
        Lit::Float { value, ty } => match ty.as_ref().map(|t| &**strip_perm(t)) {
            Some(TyKind::Prim(PrimTy::Float(FloatTy::F32))) => {
                IrValue::Immediate((*value as f32).to_le_bytes().to_vec())
            }
            _ => IrValue::Immediate(value.to_le_bytes().to_vec()),
        },
        Lit::Str(bytes) | Lit::Bytes(bytes) => cx.intern_bytes(bytes),
    };
    LowerResult::pure(value)
}

// Names.

fn lower_path(cx: &mut LowerCtx<'_>, expr: &Expr, path: &Path) -> LowerResult {
    if path.segments.len() == 1 {
        let dest = cx.fresh_local();
        let setup = vec![Ir::ReadVar { name: path.segments[0].clone(), dest }];
        return LowerResult { setup, value: IrValue::Local(dest) };
    }
    // Payloadless enum variant.
    if let Some((decl, idx, variant)) = cx.scx.enum_variant(path) {
        if variant.payload.is_none() {
            let discr = enum_discriminants(decl)[idx];
            let value = cx.opaque(DerivedValue::EnumLit {
                path: path.clone(),
                discr,
                payload: Vec::new(),
            });
            return LowerResult::pure(value);
        }
    }
    // Procedure reference.
    if cx.scx.proc(path).is_some() {
        let sym = symbols::proc_sym(&path.parent(), path.last().unwrap_or_default());
        return LowerResult::pure(IrValue::Symbol(sym));
    }
    // Static read: gate on the owning module's poison flag.
    let module = path.parent();
    let name = path.last().unwrap_or_default().to_string();
    let dest = cx.fresh_local();
    let setup = vec![
        Ir::CheckPoison { module: module.key() },
        Ir::ReadPath { module: module.key(), name, dest },
    ];
    trace!("lower_path: static read {} at {:?}", path, expr.span);
    LowerResult { setup, value: IrValue::Local(dest) }
}

// Operators.

fn expr_is_signed_int(cx: &LowerCtx<'_>, expr: &Expr) -> bool {
    match cx.scx.expr_ty(expr.id).map(|t| &**strip_perm(t)) {
        Some(TyKind::Prim(PrimTy::Int(_))) => true,
        Some(_) => false,
        // Unannotated integer literals default to signed.
        None => true,
    }
}

fn lower_unary(cx: &mut LowerCtx<'_>, op: UnOp, operand: &Expr) -> LowerResult {
    let r = lower_expr(cx, operand);
    let mut setup = r.setup;
    if op == UnOp::Neg && expr_is_signed_int(cx, operand) {
        // Negating MIN overflows; guard as `0 - x`.
        setup.push(Ir::CheckOp {
            op: BinOp::Sub,
            reason: PanicReason::Overflow,
            lhs: IrValue::Immediate(encode_le(0, 4)),
            rhs: r.value.clone(),
        });
    }
    let dest = cx.fresh_local();
    setup.push(Ir::UnaryOp { op, operand: r.value, dest });
    LowerResult { setup, value: IrValue::Local(dest) }
}

fn lower_binary(cx: &mut LowerCtx<'_>, op: BinOp, lhs: &Expr, rhs: &Expr) -> LowerResult {
    // Short-circuit forms become control flow.
    if let BinOp::And | BinOp::Or = op {
        let lhs_r = lower_expr(cx, lhs);
        let mut setup = lhs_r.setup;
        let dest = cx.fresh_local();
        let rhs_r = lower_expr(cx, rhs);
        let mut rhs_seq = rhs_r.setup;
        rhs_seq.push(Ir::Phi { dest, sources: vec![rhs_r.value] });
        let short = Ir::Phi {
            dest,
            sources: vec![IrValue::Immediate(vec![(op == BinOp::Or) as u8])],
        };
        let (then_ir, else_ir) = if op == BinOp::And {
            (Ir::seq(rhs_seq), short)
        } else {
            (short, Ir::seq(rhs_seq))
        };
        setup.push(Ir::If {
            cond: lhs_r.value,
            then_ir: Box::new(then_ir),
            else_ir: Some(Box::new(else_ir)),
        });
        return LowerResult { setup, value: IrValue::Local(dest) };
    }

    let lhs_r = lower_expr(cx, lhs);
    let rhs_r = lower_expr(cx, rhs);
    let mut setup = lhs_r.setup;
    setup.extend(rhs_r.setup);

    let signed = expr_is_signed_int(cx, lhs);
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul if signed => {
            setup.push(Ir::CheckOp {
                op,
                reason: PanicReason::Overflow,
                lhs: lhs_r.value.clone(),
                rhs: rhs_r.value.clone(),
            });
        }
        BinOp::Div | BinOp::Rem => {
            setup.push(Ir::CheckOp {
                op,
                reason: PanicReason::DivZero,
                lhs: lhs_r.value.clone(),
                rhs: rhs_r.value.clone(),
            });
            if signed {
                // MIN / -1 overflows even with a nonzero divisor.
                setup.push(Ir::CheckOp {
                    op,
                    reason: PanicReason::Overflow,
                    lhs: lhs_r.value.clone(),
                    rhs: rhs_r.value.clone(),
                });
            }
        }
        BinOp::Shl | BinOp::Shr => {
            setup.push(Ir::CheckOp {
                op,
                reason: PanicReason::Shift,
                lhs: lhs_r.value.clone(),
                rhs: rhs_r.value.clone(),
            });
        }
        _ => {}
    }
    let dest = cx.fresh_local();
    setup.push(Ir::BinaryOp { op, lhs: lhs_r.value, rhs: rhs_r.value, dest });
    LowerResult { setup, value: IrValue::Local(dest) }
}

fn lower_enum_lit(
    cx: &mut LowerCtx<'_>,
    expr: &Expr,
    path: &Path,
    payload: &Option<cursive_ast::ast::EnumPayloadExpr>,
) -> LowerResult {
    let discr = match cx.scx.enum_variant(path) {
        Some((decl, idx, _)) => enum_discriminants(decl)[idx],
        None => {
            cx.error(expr.span, LowerErrorKind::UnknownProc { path: path.to_string() });
            0
        }
    };
    let mut setup = Vec::new();
    let payload_vals = match payload {
        None => Vec::new(),
        Some(cursive_ast::ast::EnumPayloadExpr::Tuple(elems)) => {
            let (s, v) = lower_all(cx, elems);
            setup.extend(s);
            v
        }
        Some(cursive_ast::ast::EnumPayloadExpr::Record(fields)) => {
            let mut values = Vec::with_capacity(fields.len());
            for (_, e) in fields {
                let r = lower_expr(cx, e);
                setup.extend(r.setup);
                values.push(r.value);
            }
            values
        }
    };
    let value = cx.opaque(DerivedValue::EnumLit {
        path: path.clone(),
        discr,
        payload: payload_vals,
    });
    LowerResult { setup, value }
}

// Casts.

fn lower_cast(cx: &mut LowerCtx<'_>, _expr: &Expr, inner: &Expr, to: &Ty) -> LowerResult {
    let from = cx
        .scx
        .expr_ty(inner.id)
        .cloned()
        .unwrap_or_else(|| cursive_ast::types::mk_prim(PrimTy::Int(cursive_ast::types::IntTy::I32)));
    let r = lower_expr(cx, inner);
    let mut setup = r.setup;
    let needs_check = matches!(
        (&**strip_perm(&from), &**strip_perm(to)),
        (TyKind::Prim(PrimTy::Float(_)), TyKind::Prim(PrimTy::Int(_)))
            | (TyKind::Prim(PrimTy::Float(_)), TyKind::Prim(PrimTy::Uint(_)))
            | (TyKind::Prim(PrimTy::Int(_)), TyKind::Prim(PrimTy::Char))
            | (TyKind::Prim(PrimTy::Uint(_)), TyKind::Prim(PrimTy::Char))
    );
    if needs_check {
        setup.push(Ir::CheckCast { value: r.value.clone(), from: from.clone(), to: to.clone() });
    }
    let dest = cx.fresh_local();
    setup.push(Ir::Cast { value: r.value, from, to: to.clone(), dest });
    LowerResult { setup, value: IrValue::Local(dest) }
}

fn lower_transmute(cx: &mut LowerCtx<'_>, expr: &Expr, inner: &Expr, to: &Ty) -> LowerResult {
    let from = cx.scx.expr_ty(inner.id).cloned().unwrap_or_else(|| to.clone());
    let from_size = cx.layouts.layout_of(&from).map(|l| l.size.bytes());
    let to_size = cx.layouts.layout_of(to).map(|l| l.size.bytes());
    match (from_size, to_size) {
        (Ok(a), Ok(b)) if a != b => {
            cx.error(expr.span, LowerErrorKind::TransmuteSizeMismatch { from: a, to: b });
        }
        (Err(e), _) | (_, Err(e)) => {
            cx.error(expr.span, LowerErrorKind::Layout(e));
        }
        _ => {}
    }
    let r = lower_expr(cx, inner);
    let mut setup = r.setup;
    let dest = cx.fresh_local();
    setup.push(Ir::Transmute { value: r.value, from, to: to.clone(), dest });
    LowerResult { setup, value: IrValue::Local(dest) }
}

// Calls.

fn lower_args(cx: &mut LowerCtx<'_>, args: &[Arg]) -> (Vec<Ir>, Vec<IrValue>) {
    let mut setup = Vec::new();
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        let r = if arg.by_move {
            place::lower_move_place(cx, &arg.expr)
        } else {
            lower_expr(cx, &arg.expr)
        };
        setup.extend(r.setup);
        values.push(r.value);
    }
    (setup, values)
}

/// Builtin module procs (`Region.free_unchecked`, `String.from`, …) that
/// lower straight to runtime calls.
fn builtin_proc_sym(path: &Path) -> Option<String> {
    if path.segments.len() != 2 {
        if path.segments.len() == 1 && fold_ident(&path.segments[0]) == "free_unchecked" {
            return Some(builtin_sym("region_free_unchecked"));
        }
        return None;
    }
    let owner = fold_ident(&path.segments[0]);
    let name = fold_ident(&path.segments[1]);
    let key = match (owner.as_str(), name.as_str()) {
        ("string", "from") => "string_from",
        ("bytes", "from") => "string_from",
        ("region", "new_scoped") => "region_new_scoped",
        ("region", "alloc") => "region_alloc",
        ("region", "reset_unchecked") => "region_reset_unchecked",
        ("region", "freeze") => "region_freeze",
        ("region", "thaw") => "region_thaw",
        ("region", "free_unchecked") => "region_free_unchecked",
        ("heap", "with_quota") => "heap_with_quota",
        _ => return None,
    };
    Some(builtin_sym(key))
}

fn lower_call(cx: &mut LowerCtx<'_>, expr: &Expr, callee: &Expr, args: &[Arg]) -> LowerResult {
    let (mut setup, arg_vals) = lower_args(cx, args);
    let dest = cx.fresh_local();
    match &callee.kind {
        ExprKind::Path(path) => {
            if let Some(sym) = builtin_proc_sym(path) {
                setup.push(Ir::Call { sym, args: arg_vals, dest: Some(dest) });
                return LowerResult { setup, value: IrValue::Local(dest) };
            }
            let full = if path.segments.len() == 1 {
                cx.module().child(path.segments[0].clone())
            } else {
                path.clone()
            };
            if cx.scx.proc(&full).is_some() {
                let module = full.parent();
                setup.push(Ir::CheckPoison { module: module.key() });
                setup.push(Ir::Call {
                    sym: symbols::proc_sym(&module, full.last().unwrap_or_default()),
                    args: arg_vals,
                    dest: Some(dest),
                });
                setup.push(Ir::PanicCheck { cleanup: cx.cleanup_on_panic() });
                return LowerResult { setup, value: IrValue::Local(dest) };
            }
            cx.error(expr.span, LowerErrorKind::UnknownProc { path: path.to_string() });
            LowerResult { setup, value: IrValue::unit() }
        }
        _ => {
            // Indirect call through a proc reference value.
            let callee_r = lower_expr(cx, callee);
            setup.extend(callee_r.setup);
            setup.push(Ir::Call {
                sym: "cursive$indirect".to_string(),
                args: std::iter::once(callee_r.value).chain(arg_vals).collect(),
                dest: Some(dest),
            });
            setup.push(Ir::PanicCheck { cleanup: cx.cleanup_on_panic() });
            LowerResult { setup, value: IrValue::Local(dest) }
        }
    }
}

fn lower_method_call(
    cx: &mut LowerCtx<'_>,
    expr: &Expr,
    recv: &Expr,
    name: &str,
    args: &[Arg],
) -> LowerResult {
    let recv_r = lower_expr(cx, recv);
    let (args_setup, mut arg_vals) = lower_args(cx, args);
    let mut setup = recv_r.setup;
    setup.extend(args_setup);

    let recv_ty = cx.scx.expr_ty(recv.id).cloned();
    let dest = cx.fresh_local();
    let folded = fold_ident(name);

    if let Some(ty) = &recv_ty {
        match &**strip_perm(ty) {
            TyKind::Dynamic { class_path } => {
                let slot = cx
                    .scx
                    .class_decl(class_path)
                    .and_then(|c| vtable::vslot(c, name));
                match slot {
                    Some(slot) => {
                        setup.push(Ir::CallVTable {
                            object: recv_r.value,
                            slot: slot + VTABLE_HEADER_SLOTS,
                            args: arg_vals,
                            dest: Some(dest),
                        });
                        setup.push(Ir::PanicCheck { cleanup: cx.cleanup_on_panic() });
                        return LowerResult { setup, value: IrValue::Local(dest) };
                    }
                    None => {
                        cx.error(
                            expr.span,
                            LowerErrorKind::UnknownMethod {
                                ty: ty.to_string(),
                                name: name.to_string(),
                            },
                        );
                        return LowerResult { setup, value: IrValue::unit() };
                    }
                }
            }
            TyKind::Path(path) | TyKind::ModalState { path, .. } => {
                if *path == string_path() || *path == bytes_path() {
                    return lower_str_method(cx, setup, recv_r.value, &folded, arg_vals, dest);
                }
                if *path == cursive_ast::env::region_modal_path() {
                    let key = format!("region_{}", folded);
                    let mut call_args = vec![recv_r.value];
                    call_args.append(&mut arg_vals);
                    setup.push(Ir::Call {
                        sym: builtin_sym(&key),
                        args: call_args,
                        dest: Some(dest),
                    });
                    return LowerResult { setup, value: IrValue::Local(dest) };
                }
                let sym = match &**strip_perm(ty) {
                    TyKind::ModalState { path, state } => {
                        symbols::proc_sym(&path.child(state.clone()), name)
                    }
                    _ => symbols::proc_sym(path, name),
                };
                let mut call_args = vec![recv_r.value];
                call_args.append(&mut arg_vals);
                setup.push(Ir::Call { sym, args: call_args, dest: Some(dest) });
                setup.push(Ir::PanicCheck { cleanup: cx.cleanup_on_panic() });
                return LowerResult { setup, value: IrValue::Local(dest) };
            }
            _ => {}
        }
    }

    // Untyped receiver (tests, synthetic input): assume an inherent method
    // in the current module's namespace.
    let mut call_args = vec![recv_r.value];
    call_args.append(&mut arg_vals);
    let sym = symbols::proc_sym(cx.module(), name);
    setup.push(Ir::Call { sym, args: call_args, dest: Some(dest) });
    setup.push(Ir::PanicCheck { cleanup: cx.cleanup_on_panic() });
    LowerResult { setup, value: IrValue::Local(dest) }
}

fn lower_str_method(
    cx: &mut LowerCtx<'_>,
    mut setup: Vec<Ir>,
    recv: IrValue,
    folded_name: &str,
    mut args: Vec<IrValue>,
    dest: crate::ir::LocalId,
) -> LowerResult {
    match folded_name {
        "length" => {
            let value = cx.opaque(DerivedValue::Len { base: recv });
            LowerResult { setup, value }
        }
        "append" => {
            let mut call_args = vec![recv];
            call_args.append(&mut args);
            setup.push(Ir::Call {
                sym: builtin_sym("string_append"),
                args: call_args,
                dest: Some(dest),
            });
            LowerResult { setup, value: IrValue::Local(dest) }
        }
        "as_view" => {
            let mut call_args = vec![recv];
            call_args.append(&mut args);
            setup.push(Ir::Call {
                sym: builtin_sym("string_from"),
                args: call_args,
                dest: Some(dest),
            });
            LowerResult { setup, value: IrValue::Local(dest) }
        }
        other => {
            // Unknown buffer method: the sentinel symbol keeps the IR well
            // formed and the backend reports the unresolved call.
            let mut call_args = vec![recv];
            call_args.append(&mut args);
            setup.push(Ir::Call {
                sym: builtin_sym(other),
                args: call_args,
                dest: Some(dest),
            });
            LowerResult { setup, value: IrValue::Local(dest) }
        }
    }
}

// Structured parallelism.

fn lower_spawn(
    cx: &mut LowerCtx<'_>,
    moves: &[String],
    body: &cursive_ast::ast::Block,
) -> LowerResult {
    let task_sym = cx.lower_task_proc("task", body, moves.to_vec());
    let mut setup = Vec::new();
    // Captures listed as `move` travel by value; the rest by reference.
    let mut args = vec![IrValue::Symbol(task_sym)];
    for name in moves {
        let r = place::lower_move_var(cx, name);
        setup.extend(r.setup);
        args.push(r.value);
    }
    let dest = cx.fresh_local();
    setup.push(Ir::Call { sym: builtin_sym("spawn_task"), args, dest: Some(dest) });
    LowerResult { setup, value: IrValue::Local(dest) }
}

fn reducer_code(reduce: &Option<Reducer>) -> (u64, Option<String>) {
    match reduce {
        None => (0, None),
        Some(Reducer::Add) => (1, None),
        Some(Reducer::Mul) => (2, None),
        Some(Reducer::Min) => (3, None),
        Some(Reducer::Max) => (4, None),
        Some(Reducer::And) => (5, None),
        Some(Reducer::Or) => (6, None),
        Some(Reducer::Proc(path)) => (
            7,
            Some(symbols::proc_sym(&path.parent(), path.last().unwrap_or_default())),
        ),
    }
}

fn lower_dispatch(
    cx: &mut LowerCtx<'_>,
    range: &Expr,
    binder: &str,
    chunk: &Option<Box<Expr>>,
    reduce: &Option<Reducer>,
    ordered: bool,
    body: &cursive_ast::ast::Block,
) -> LowerResult {
    let range_r = lower_expr(cx, range);
    let mut setup = range_r.setup;
    let chunk_val = match chunk {
        Some(chunk) => {
            let r = lower_expr(cx, chunk);
            setup.extend(r.setup);
            r.value
        }
        None => IrValue::Immediate(encode_le(0, 8)),
    };
    let body_sym = cx.lower_task_proc("dispatch", body, vec![binder.to_string()]);
    let (code, user_sym) = reducer_code(reduce);
    let mut args = vec![
        IrValue::Symbol(body_sym),
        range_r.value,
        chunk_val,
        IrValue::Immediate(encode_le(code as u128, 1)),
        IrValue::Immediate(vec![ordered as u8]),
    ];
    if let Some(user_sym) = user_sym {
        args.push(IrValue::Symbol(user_sym));
    }
    let dest = cx.fresh_local();
    setup.push(Ir::Call { sym: builtin_sym("dispatch_run"), args, dest: Some(dest) });
    setup.push(Ir::PanicCheck { cleanup: cx.cleanup_on_panic() });
    LowerResult { setup, value: IrValue::Local(dest) }
}

// Result-union propagation.

fn lower_propagate(cx: &mut LowerCtx<'_>, inner: &Expr) -> LowerResult {
    let r = lower_expr(cx, inner);
    let mut setup = r.setup;
    let dest = cx.fresh_local();
    let member_ty = cx
        .scx
        .expr_ty(inner.id)
        .cloned()
        .unwrap_or_else(cursive_ast::types::mk_unit);
    let payload =
        cx.opaque(DerivedValue::UnionPayload { member: member_ty, value: r.value.clone() });
    let mut error_path = cx.cleanup_on_panic();
    // Forward the error member to the enclosing return type unchanged.
    error_path.push(Ir::Return { value: Some(r.value.clone()) });
    setup.push(Ir::Match {
        scrutinee: r.value,
        arms: vec![
            crate::ir::MatchArm { discrs: vec![0], binds: Vec::new(), body: Ir::seq(error_path) },
            crate::ir::MatchArm {
                discrs: Vec::new(),
                binds: Vec::new(),
                body: Ir::Phi { dest, sources: vec![payload] },
            },
        ],
        result: Some(dest),
    });
    LowerResult { setup, value: IrValue::Local(dest) }
}

impl<'a> LowerCtx<'a> {
    /// Lowers a spawned/dispatched body into its own nested procedure and
    /// returns the synthesized symbol.
    fn lower_task_proc(
        &mut self,
        hint: &str,
        body: &cursive_ast::ast::Block,
        params: Vec<String>,
    ) -> String {
        let sym = format!("cursive$par${}${}", hint, self.nested.len());
        let mut nested_cx = LowerCtx::new(self.scx, self.own, self.module.clone());
        let ir = super::lower_block_scoped(&mut nested_cx, body);
        self.errors.append(&mut nested_cx.errors);
        for (data_sym, data) in nested_cx.str_data {
            if !self.str_data.iter().any(|(s, _)| *s == data_sym) {
                self.str_data.push((data_sym, data));
            }
        }
        self.nested.push(crate::ir::IrProc {
            sym: sym.clone(),
            params,
            body: ir,
            derived: nested_cx.derived,
            local_count: nested_cx.next_local,
        });
        sym
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_analysis::ownership::OwnershipResults;
    use cursive_ast::ast::NodeId;
    use cursive_ast::env::ScopeContext;

    fn cx<'a>(
        scx: &'a ScopeContext,
        own: &'a OwnershipResults,
    ) -> LowerCtx<'a> {
        LowerCtx::new(scx, own, Path::single("m"))
    }

    fn int(id: u32, v: i64) -> Expr {
        Expr::new(
            NodeId(id),
            ExprKind::Lit(Lit::Int {
                negative: v < 0,
                magnitude: v.unsigned_abs() as u128,
                ty: Some(cursive_ast::types::mk_prim(PrimTy::Int(
                    cursive_ast::types::IntTy::I32,
                ))),
            }),
        )
    }

    #[test]
    fn literal_is_a_pure_immediate() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let mut cx = cx(&scx, &own);
        let r = lower_expr(&mut cx, &int(1, 3));
        assert!(r.setup.is_empty());
        assert_eq!(r.value, IrValue::Immediate(vec![3, 0, 0, 0]));
    }

    #[test]
    fn signed_add_gets_overflow_check() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let mut cx = cx(&scx, &own);
        let e = Expr::new(
            NodeId(10),
            ExprKind::Binary {
                op: BinOp::Add,
                lhs: Box::new(int(1, 1)),
                rhs: Box::new(int(2, 2)),
            },
        );
        let r = lower_expr(&mut cx, &e);
        assert!(r.setup.iter().any(|ir| matches!(
            ir,
            Ir::CheckOp { reason: PanicReason::Overflow, .. }
        )));
        assert!(r.setup.iter().any(|ir| matches!(ir, Ir::BinaryOp { op: BinOp::Add, .. })));
    }

    #[test]
    fn division_checks_zero_then_overflow() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let mut cx = cx(&scx, &own);
        let e = Expr::new(
            NodeId(10),
            ExprKind::Binary {
                op: BinOp::Div,
                lhs: Box::new(int(1, 1)),
                rhs: Box::new(int(2, 2)),
            },
        );
        let r = lower_expr(&mut cx, &e);
        let reasons: Vec<PanicReason> = r
            .setup
            .iter()
            .filter_map(|ir| match ir {
                Ir::CheckOp { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec![PanicReason::DivZero, PanicReason::Overflow]);
    }

    #[test]
    fn negative_literal_encodes_twos_complement() {
        let scx = ScopeContext::new();
        let own = OwnershipResults::default();
        let mut cx = cx(&scx, &own);
        let r = lower_expr(&mut cx, &int(1, -1));
        assert_eq!(r.value, IrValue::Immediate(vec![0xFF, 0xFF, 0xFF, 0xFF]));
    }
}
