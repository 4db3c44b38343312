//! Compile-time constant evaluation for the lowering pass.
//!
//! "Run the interpreter on this expression with an empty Σ and fail unless
//! the result is a pure immediate."

use cursive_ast::ast::Expr;
use cursive_ast::env::ScopeContext;
use cursive_ast::types::FloatTy;
use cursive_middle::value::Value;

use crate::control::Outcome;
use crate::machine::{EvalContext, MachineOptions};

/// Encodes a value as little-endian constant bytes, when it is immediate.
pub fn encode_immediate(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Unit => Some(Vec::new()),
        Value::Bool(b) => Some(vec![*b as u8]),
        Value::Char(c) => Some(c.to_le_bytes().to_vec()),
        Value::Int(i) => {
            let width = (i.bit_width() / 8) as usize;
            if width == 0 {
                return None;
            }
            Some(i.to_bits().to_le_bytes()[..width].to_vec())
        }
        Value::Float(f) => Some(match f.ty {
            FloatTy::F32 => (f.value as f32).to_le_bytes().to_vec(),
            FloatTy::F64 => f.value.to_le_bytes().to_vec(),
        }),
        _ => None,
    }
}

/// Evaluates `expr` against an empty world. Anything that panics, reads
/// state, or produces a non-immediate value is not a compile-time constant.
pub fn const_eval_expr(scx: &ScopeContext, expr: &Expr) -> Option<Vec<u8>> {
    let mut ecx = EvalContext::new(scx, MachineOptions::default());
    ecx.sigma.push_scope();
    match ecx.eval_expr(expr) {
        Ok(Outcome::Val(value)) => encode_immediate(&value),
        Ok(Outcome::Ctrl(_)) | Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::ast::{BinOp, ExprKind, Lit, NodeId};
    use cursive_ast::types::{mk_prim, IntTy, PrimTy};

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

    #[test]
    fn arithmetic_folds() {
        let scx = ScopeContext::new();
        let e = Expr::new(
            NodeId(10),
            ExprKind::Binary {
                op: BinOp::Add,
                lhs: Box::new(int(1, 1)),
                rhs: Box::new(int(2, 2)),
            },
        );
        assert_eq!(const_eval_expr(&scx, &e), Some(vec![3, 0, 0, 0]));
    }

    #[test]
    fn division_by_zero_is_not_constant() {
        let scx = ScopeContext::new();
        let e = Expr::new(
            NodeId(10),
            ExprKind::Binary {
                op: BinOp::Div,
                lhs: Box::new(int(1, 1)),
                rhs: Box::new(int(2, 0)),
            },
        );
        assert_eq!(const_eval_expr(&scx, &e), None);
    }

    #[test]
    fn aggregate_is_not_an_immediate() {
        let scx = ScopeContext::new();
        let e = Expr::new(NodeId(1), ExprKind::Tuple(vec![int(2, 1), int(3, 2)]));
        assert_eq!(const_eval_expr(&scx, &e), None);
    }
}
