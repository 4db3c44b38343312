//! Operator evaluation, mirroring the lowered `CheckOp` semantics: the same
//! inputs that make lowering insert a failing check make these return the
//! matching panic.

use cursive_ast::ast::{BinOp, UnOp};
use cursive_middle::panic::PanicReason;
use cursive_middle::value::{
    self, int_cmp, value_equal, FloatVal, IntVal, Value,
};

use crate::control::{Control, Outcome};
use crate::machine::{ice, EvalResult};

pub fn eval_unary(op: UnOp, operand: Value) -> EvalResult<Outcome> {
    match (op, operand) {
        (UnOp::Not, Value::Bool(b)) => Ok(Outcome::Val(Value::Bool(!b))),
        (UnOp::Not, Value::Int(i)) => {
            let bits = !i.to_bits();
            Ok(Outcome::Val(Value::Int(IntVal::from_bits(i.ty, bits))))
        }
        (UnOp::Neg, Value::Int(i)) => {
            let (result, overflow) = value::checked_neg(&i);
            if overflow {
                return Ok(Outcome::Ctrl(Control::panic(PanicReason::Overflow)));
            }
            Ok(Outcome::Val(Value::Int(result)))
        }
        (UnOp::Neg, Value::Float(f)) => {
            Ok(Outcome::Val(Value::Float(FloatVal { ty: f.ty, value: -f.value })))
        }
        (op, operand) => Err(ice(format!("unary {:?} on {}", op, operand))),
    }
}

pub fn eval_binary(op: BinOp, lhs: Value, rhs: Value) -> EvalResult<Outcome> {
    // Equality and ordering work structurally / numerically across kinds.
    if op.is_comparison() {
        return eval_comparison(op, lhs, rhs);
    }
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => eval_int_op(op, a, b),
        (Value::Float(a), Value::Float(b)) => eval_float_op(op, a, b),
        (Value::Bool(a), Value::Bool(b)) => match op {
            BinOp::And | BinOp::BitAnd => Ok(Outcome::Val(Value::Bool(a && b))),
            BinOp::Or | BinOp::BitOr => Ok(Outcome::Val(Value::Bool(a || b))),
            BinOp::BitXor => Ok(Outcome::Val(Value::Bool(a != b))),
            op => Err(ice(format!("bool op {:?}", op))),
        },
        (lhs, rhs) => Err(ice(format!("binary {:?} on {} and {}", op, lhs, rhs))),
    }
}

fn eval_int_op(op: BinOp, a: IntVal, b: IntVal) -> EvalResult<Outcome> {
    let panic = |reason| Ok(Outcome::Ctrl(Control::panic(reason)));
    let checked = match op {
        BinOp::Add => value::checked_add(&a, &b),
        BinOp::Sub => value::checked_sub(&a, &b),
        BinOp::Mul => value::checked_mul(&a, &b),
        BinOp::Div => {
            if b.is_zero() {
                return panic(PanicReason::DivZero);
            }
            value::checked_div(&a, &b)
        }
        BinOp::Rem => {
            if b.is_zero() {
                return panic(PanicReason::DivZero);
            }
            value::checked_rem(&a, &b)
        }
        BinOp::Shl | BinOp::Shr => {
            let count = match b.to_u64() {
                Some(c) if c < a.bit_width() as u64 => c as u32,
                _ => return panic(PanicReason::Shift),
            };
            let result = if op == BinOp::Shl { value::shl(&a, count) } else { value::shr(&a, count) };
            return Ok(Outcome::Val(Value::Int(result)));
        }
        BinOp::BitAnd => return Ok(Outcome::Val(Value::Int(value::bitop(|x, y| x & y, &a, &b)))),
        BinOp::BitOr => return Ok(Outcome::Val(Value::Int(value::bitop(|x, y| x | y, &a, &b)))),
        BinOp::BitXor => return Ok(Outcome::Val(Value::Int(value::bitop(|x, y| x ^ y, &a, &b)))),
        op => return Err(ice(format!("int op {:?}", op))),
    };
    let (result, overflow) = checked;
    if overflow {
        return panic(PanicReason::Overflow);
    }
    Ok(Outcome::Val(Value::Int(result)))
}

fn eval_float_op(op: BinOp, a: FloatVal, b: FloatVal) -> EvalResult<Outcome> {
    let value = match op {
        BinOp::Add => a.value + b.value,
        BinOp::Sub => a.value - b.value,
        BinOp::Mul => a.value * b.value,
        BinOp::Div => a.value / b.value,
        BinOp::Rem => a.value % b.value,
        op => return Err(ice(format!("float op {:?}", op))),
    };
    Ok(Outcome::Val(Value::Float(FloatVal { ty: a.ty, value })))
}

fn eval_comparison(op: BinOp, lhs: Value, rhs: Value) -> EvalResult<Outcome> {
    use std::cmp::Ordering;
    let result = match (op, &lhs, &rhs) {
        (BinOp::Eq, _, _) => value_equal(&lhs, &rhs),
        (BinOp::Ne, _, _) => !value_equal(&lhs, &rhs),
        (_, Value::Int(a), Value::Int(b)) => {
            let ord = int_cmp(a, b);
            match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                BinOp::Ge => ord != Ordering::Less,
                _ => unreachable!(),
            }
        }
        (_, Value::Float(a), Value::Float(b)) => match op {
            BinOp::Lt => a.value < b.value,
            BinOp::Le => a.value <= b.value,
            BinOp::Gt => a.value > b.value,
            BinOp::Ge => a.value >= b.value,
            _ => unreachable!(),
        },
        (_, Value::Char(a), Value::Char(b)) => match op {
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Gt => a > b,
            BinOp::Ge => a >= b,
            _ => unreachable!(),
        },
        (op, lhs, rhs) => {
            return Err(ice(format!("comparison {:?} on {} and {}", op, lhs, rhs)));
        }
    };
    Ok(Outcome::Val(Value::Bool(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_middle::panic::PanicReason;

    fn int(v: i64) -> Value {
        Value::i32(v as i32)
    }

    fn expect_panic(outcome: Outcome, reason: PanicReason) {
        match outcome {
            Outcome::Ctrl(ctrl) => assert_eq!(ctrl.code, reason.code()),
            Outcome::Val(v) => panic!("expected panic, got {}", v),
        }
    }

    #[test]
    fn div_zero_panics() {
        expect_panic(eval_binary(BinOp::Div, int(1), int(0)).unwrap(), PanicReason::DivZero);
    }

    #[test]
    fn min_div_minus_one_panics_overflow() {
        expect_panic(
            eval_binary(BinOp::Div, Value::i32(i32::MIN), int(-1)).unwrap(),
            PanicReason::Overflow,
        );
    }

    #[test]
    fn wide_shift_panics() {
        expect_panic(eval_binary(BinOp::Shl, int(1), int(32)).unwrap(), PanicReason::Shift);
        match eval_binary(BinOp::Shl, int(1), int(31)).unwrap() {
            Outcome::Val(Value::Int(i)) => assert_eq!(i.to_i128(), Some(i32::MIN as i128)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn comparisons_are_signed() {
        match eval_binary(BinOp::Lt, int(-2), int(1)).unwrap() {
            Outcome::Val(Value::Bool(b)) => assert!(b),
            other => panic!("unexpected {:?}", other),
        }
    }
}
