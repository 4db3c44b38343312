//! Pattern lowering: `let` destructuring and `match` arm compilation.
//!
//! Match compilation is discriminant-directed: enum, modal, and literal
//! patterns contribute discriminant tests; identifier and wildcard patterns
//! become the default arm. Payload bindings are extracted through derived
//! projections on the scrutinee, so nothing is materialized until a body
//! actually reads it.

use cursive_ast::ast::{
    Arm, EnumPayloadPat, Expr, FieldPat, Lit, Pattern, PatternKind,
};
use cursive_ast::path::fold_ident;
use cursive_middle::layout::enum_discriminants;

use crate::ir::{DerivedValue, Ir, IrValue, MatchArm};
use crate::lower::expr::lower_expr;
use crate::lower::{LowerCtx, LowerResult};

/// Binds every name in `pattern` against `value`; pushes the binding
/// instructions into `seq` and returns the bound names in source order.
pub fn lower_bind_pattern(
    cx: &mut LowerCtx<'_>,
    pattern: &Pattern,
    value: IrValue,
    seq: &mut Vec<Ir>,
) -> Vec<String> {
    let mut names = Vec::new();
    bind_into(cx, pattern, value, seq, &mut names);
    names
}

fn bind_into(
    cx: &mut LowerCtx<'_>,
    pattern: &Pattern,
    value: IrValue,
    seq: &mut Vec<Ir>,
    names: &mut Vec<String>,
) {
    match &pattern.kind {
        PatternKind::Wildcard | PatternKind::Lit(_) => {}
        PatternKind::Ident { name, .. } => {
            seq.push(Ir::BindVar { name: name.clone(), value });
            names.push(name.clone());
        }
        PatternKind::Tuple(elems) => {
            for (i, sub) in elems.iter().enumerate() {
                let elem = cx.opaque(DerivedValue::TupleElem { base: value.clone(), index: i });
                bind_into(cx, sub, elem, seq, names);
            }
        }
        PatternKind::Record { fields, .. } => {
            bind_fields(cx, fields, &value, seq, names);
        }
        PatternKind::Enum { payload, .. } => match payload {
            None => {}
            Some(EnumPayloadPat::Tuple(elems)) => {
                for (i, sub) in elems.iter().enumerate() {
                    let elem =
                        cx.opaque(DerivedValue::TupleElem { base: value.clone(), index: i });
                    bind_into(cx, sub, elem, seq, names);
                }
            }
            Some(EnumPayloadPat::Record(fields)) => {
                bind_fields(cx, fields, &value, seq, names);
            }
        },
        PatternKind::Modal { fields, .. } => {
            if let Some(fields) = fields {
                bind_fields(cx, fields, &value, seq, names);
            }
        }
    }
}

fn bind_fields(
    cx: &mut LowerCtx<'_>,
    fields: &[FieldPat],
    value: &IrValue,
    seq: &mut Vec<Ir>,
    names: &mut Vec<String>,
) {
    for field in fields {
        let projected =
            cx.opaque(DerivedValue::Field { base: value.clone(), name: field.name.clone() });
        match &field.pattern {
            Some(sub) => bind_into(cx, sub, projected, seq, names),
            None => {
                seq.push(Ir::BindVar { name: field.name.clone(), value: projected });
                names.push(field.name.clone());
            }
        }
    }
}

/// The discriminant(s) a pattern selects, or `None` for a default arm.
fn pattern_discrs(cx: &LowerCtx<'_>, pattern: &Pattern) -> Option<Vec<u64>> {
    match &pattern.kind {
        PatternKind::Enum { path, .. } => {
            let (decl, idx, _) = cx.scx.enum_variant(path)?;
            Some(vec![enum_discriminants(decl)[idx]])
        }
        PatternKind::Modal { path, state, .. } => {
            let decl = cx.scx.modal_decl(path)?;
            let folded = fold_ident(state);
            let idx =
                decl.states.iter().position(|s| fold_ident(&s.name) == folded)?;
            Some(vec![idx as u64])
        }
        PatternKind::Lit(Lit::Bool(b)) => Some(vec![*b as u64]),
        PatternKind::Lit(Lit::Char(c)) => Some(vec![*c as u64]),
        PatternKind::Lit(Lit::Int { negative, magnitude, .. }) => {
            let bits =
                if *negative { magnitude.wrapping_neg() } else { *magnitude };
            Some(vec![bits as u64])
        }
        _ => None,
    }
}

pub fn lower_match(cx: &mut LowerCtx<'_>, scrutinee: &Expr, arms: &[Arm]) -> LowerResult {
    let scrut_r = lower_expr(cx, scrutinee);
    let mut setup = scrut_r.setup;
    let result = cx.fresh_local();

    let mut lowered_arms = Vec::with_capacity(arms.len());
    for arm in arms {
        let discrs = pattern_discrs(cx, &arm.pattern).unwrap_or_default();
        let mut binds = Vec::new();
        lower_bind_pattern(cx, &arm.pattern, scrut_r.value.clone(), &mut binds);
        let body_r = lower_expr(cx, &arm.body);
        let mut body = body_r.setup;
        body.push(Ir::Phi { dest: result, sources: vec![body_r.value] });
        let body = match &arm.guard {
            Some(guard) => {
                let guard_r = lower_expr(cx, guard);
                let mut seq = guard_r.setup;
                seq.push(Ir::If {
                    cond: guard_r.value,
                    then_ir: Box::new(Ir::seq(body)),
                    else_ir: None,
                });
                Ir::seq(seq)
            }
            None => Ir::seq(body),
        };
        lowered_arms.push(MatchArm { discrs, binds, body });
    }
    setup.push(Ir::Match {
        scrutinee: scrut_r.value,
        arms: lowered_arms,
        result: Some(result),
    });
    LowerResult { setup, value: IrValue::Local(result) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_analysis::ownership::OwnershipResults;
    use cursive_ast::ast::{EnumDecl, ExprKind, NodeId, VariantDecl, VariantPayload};
    use cursive_ast::env::{ScopeContext, TypeDecl};
    use cursive_ast::path::Path;
    use cursive_ast::types::{mk_prim, IntTy, PrimTy};

    fn option_scx() -> ScopeContext {
        let mut scx = ScopeContext::new();
        scx.register_type(TypeDecl::Enum(EnumDecl {
            path: Path::single("Option"),
            variants: vec![
                VariantDecl { name: "None".into(), payload: None, discr: None },
                VariantDecl {
                    name: "Some".into(),
                    payload: Some(VariantPayload::Tuple(vec![mk_prim(PrimTy::Int(
                        IntTy::I32,
                    ))])),
                    discr: None,
                },
            ],
        }));
        scx
    }

    #[test]
    fn enum_arms_get_their_discriminants() {
        let scx = option_scx();
        let own = OwnershipResults::default();
        let mut cx = LowerCtx::new(&scx, &own, Path::single("m"));
        let scrutinee = Expr::new(NodeId(1), ExprKind::Path(Path::single("v")));
        let arms = vec![
            Arm {
                pattern: Pattern::new(PatternKind::Enum {
                    path: Path::from_segments(vec!["Option", "Some"]),
                    payload: Some(EnumPayloadPat::Tuple(vec![Pattern::new(
                        PatternKind::Ident { name: "x".into(), by_move: false },
                    )])),
                }),
                guard: None,
                body: Expr::new(NodeId(2), ExprKind::Path(Path::single("x"))),
            },
            Arm {
                pattern: Pattern::new(PatternKind::Enum {
                    path: Path::from_segments(vec!["Option", "None"]),
                    payload: None,
                }),
                guard: None,
                body: Expr::new(NodeId(3), ExprKind::Lit(Lit::Unit)),
            },
        ];
        let r = lower_match(&mut cx, &scrutinee, &arms);
        let m = r
            .setup
            .iter()
            .find_map(|ir| match ir {
                Ir::Match { arms, .. } => Some(arms),
                _ => None,
            })
            .expect("match node");
        assert_eq!(m[0].discrs, vec![1]);
        assert_eq!(m[1].discrs, vec![0]);
        assert!(m[0].binds.iter().any(|ir| matches!(ir, Ir::BindVar { name, .. } if name == "x")));
    }

    #[test]
    fn wildcard_is_the_default_arm() {
        let scx = option_scx();
        let own = OwnershipResults::default();
        let mut cx = LowerCtx::new(&scx, &own, Path::single("m"));
        let scrutinee = Expr::new(NodeId(1), ExprKind::Path(Path::single("v")));
        let arms = vec![Arm {
            pattern: Pattern::new(PatternKind::Wildcard),
            guard: None,
            body: Expr::new(NodeId(2), ExprKind::Lit(Lit::Unit)),
        }];
        let r = lower_match(&mut cx, &scrutinee, &arms);
        let m = r
            .setup
            .iter()
            .find_map(|ir| match ir {
                Ir::Match { arms, .. } => Some(arms),
                _ => None,
            })
            .expect("match node");
        assert!(m[0].discrs.is_empty());
    }
}
