//! Round-trip and idempotence laws of the builtin surface.

use cursive_ast::ast::{Expr, ExprKind, Lit, NodeId};
use cursive_ast::env::ScopeContext;
use cursive_ast::path::Path;
use cursive_interpret::builtins::{buffer_method, call_builtin_proc, region_method};
use cursive_interpret::control::Outcome;
use cursive_interpret::{EvalContext, MachineOptions};
use cursive_middle::store::MemError;
use cursive_middle::value::{value_equal, StrState, Value};

fn ecx(scx: &ScopeContext) -> EvalContext<'_> {
    let mut ecx = EvalContext::new(scx, MachineOptions::default());
    ecx.sigma.push_scope();
    ecx
}

fn value_of(outcome: Outcome) -> Value {
    match outcome {
        Outcome::Val(v) => v,
        Outcome::Ctrl(ctrl) => panic!("unexpected control {:?}", ctrl),
    }
}

fn non_place_expr() -> Expr {
    Expr::new(NodeId(0), ExprKind::Lit(Lit::Unit))
}

#[test]
fn as_view_of_from_preserves_bytes() {
    let scx = ScopeContext::new();
    let mut ecx = ecx(&scx);
    let source = Value::str_view("caf\u{e9}".as_bytes().to_vec());
    let managed = value_of(
        call_builtin_proc(
            &mut ecx,
            &Path::from_segments(vec!["String", "from"]),
            vec![source.clone()],
        )
        .unwrap(),
    );
    match &managed {
        Value::Str(s) => assert_eq!(s.state, StrState::Managed),
        other => panic!("unexpected {}", other),
    }
    let (_, view) = buffer_method(&mut ecx, managed, "as_view", vec![]).unwrap();
    let view = value_of(view);
    assert!(value_equal(&view, &source));
}

#[test]
fn append_length_is_monotone() {
    let scx = ScopeContext::new();
    let mut ecx = ecx(&scx);
    let managed = value_of(
        call_builtin_proc(
            &mut ecx,
            &Path::from_segments(vec!["Bytes", "from"]),
            vec![Value::Bytes(cursive_middle::value::BytesVal {
                state: StrState::View,
                bytes: b"ab".to_vec(),
                cap: 0,
            })],
        )
        .unwrap(),
    );
    // Appending the empty buffer changes nothing.
    let (updated, _) = buffer_method(
        &mut ecx,
        managed.clone(),
        "append",
        vec![Value::Bytes(cursive_middle::value::BytesVal {
            state: StrState::View,
            bytes: Vec::new(),
            cap: 0,
        })],
    )
    .unwrap();
    let updated = updated.expect("append yields an updated receiver");
    match (&managed, &updated) {
        (Value::Bytes(a), Value::Bytes(b)) => assert_eq!(a.bytes, b.bytes),
        _ => panic!("expected bytes"),
    }
}

#[test]
fn freeze_thaw_round_trips() {
    let scx = ScopeContext::new();
    let mut ecx = ecx(&scx);
    let handle = value_of(
        call_builtin_proc(&mut ecx, &Path::from_segments(vec!["Region", "new_scoped"]), vec![])
            .unwrap(),
    );
    let recv = non_place_expr();
    let frozen = value_of(
        region_method(&mut ecx, &recv, handle.clone(), "Active", "freeze", vec![]).unwrap(),
    );
    assert!(!value_equal(&frozen, &handle));
    let thawed = value_of(
        region_method(&mut ecx, &recv, frozen, "Frozen", "thaw", vec![]).unwrap(),
    );
    assert!(value_equal(&thawed, &handle));
}

#[test]
fn region_alloc_read_free_expires() {
    let scx = ScopeContext::new();
    let mut ecx = ecx(&scx);
    let handle = value_of(
        call_builtin_proc(&mut ecx, &Path::from_segments(vec!["Region", "new_scoped"]), vec![])
            .unwrap(),
    );
    let recv = non_place_expr();
    let ptr = value_of(
        region_method(&mut ecx, &recv, handle.clone(), "Active", "alloc", vec![Value::i32(7)])
            .unwrap(),
    );
    let addr = match &ptr {
        Value::Ptr(p) => p.addr,
        other => panic!("unexpected {}", other),
    };
    assert_eq!(ecx.sigma.read_location(addr), Ok(Value::i32(7)));
    call_builtin_proc(&mut ecx, &Path::single("free_unchecked"), vec![handle]).unwrap();
    assert_eq!(ecx.sigma.read_location(addr), Err(MemError::Expired));
}

#[test]
fn frozen_region_rejects_alloc() {
    let scx = ScopeContext::new();
    let mut ecx = ecx(&scx);
    let handle = value_of(
        call_builtin_proc(&mut ecx, &Path::from_segments(vec!["Region", "new_scoped"]), vec![])
            .unwrap(),
    );
    let recv = non_place_expr();
    let frozen = value_of(
        region_method(&mut ecx, &recv, handle, "Active", "freeze", vec![]).unwrap(),
    );
    let outcome =
        region_method(&mut ecx, &recv, frozen, "Frozen", "alloc", vec![Value::i32(1)]).unwrap();
    assert!(outcome.is_ctrl());
}
