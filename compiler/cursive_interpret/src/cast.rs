//! Cast and transmute evaluation, with the `Cast` panic on the conversions
//! lowering guards with `CheckCast`.

use cursive_ast::types::{strip_perm, FloatTy, PrimTy, Ty, TyKind};
use cursive_middle::panic::PanicReason;
use cursive_middle::value::{FloatVal, IntVal, Value};

use crate::control::{Control, Outcome};
use crate::machine::{ice, EvalResult};

fn int_bounds(prim: PrimTy) -> Option<(i128, u128)> {
    match prim {
        PrimTy::Int(t) => {
            let w = t.bit_width();
            if w == 128 {
                Some((i128::MIN, i128::MAX as u128))
            } else {
                Some((-(1i128 << (w - 1)), (1u128 << (w - 1)) - 1))
            }
        }
        PrimTy::Uint(t) => {
            let w = t.bit_width();
            let max = if w == 128 { u128::MAX } else { (1u128 << w) - 1 };
            Some((0, max))
        }
        _ => None,
    }
}

fn is_surrogate(cp: u128) -> bool {
    (0xD800..=0xDFFF).contains(&cp)
}

pub fn eval_cast(value: Value, to: &Ty) -> EvalResult<Outcome> {
    let target = match &**strip_perm(to) {
        TyKind::Prim(prim) => *prim,
        // Non-primitive casts (union widening, pointer reinterpretation)
        // keep the value; layout differences are the backend's concern.
        _ => return Ok(Outcome::Val(value)),
    };
    let panic = || Ok(Outcome::Ctrl(Control::panic(PanicReason::Cast)));
    match (value, target) {
        (Value::Int(i), PrimTy::Int(_)) | (Value::Int(i), PrimTy::Uint(_)) => {
            // Integer-to-integer casts truncate through the bit pattern.
            let wide = if i.is_signed() {
                match i.to_i128() {
                    Some(v) => v as u128,
                    None => i.to_bits(),
                }
            } else {
                i.magnitude
            };
            Ok(Outcome::Val(Value::Int(IntVal::from_bits(target, wide))))
        }
        (Value::Int(i), PrimTy::Char) => {
            // u32→char: reject beyond the scalar-value range and surrogates.
            if i.negative || i.magnitude > 0x10FFFF || is_surrogate(i.magnitude) {
                return panic();
            }
            Ok(Outcome::Val(Value::Char(i.magnitude as u32)))
        }
        (Value::Int(i), PrimTy::Float(fty)) => {
            let v = match i.to_i128() {
                Some(v) => v as f64,
                None => i.magnitude as f64,
            };
            Ok(Outcome::Val(Value::Float(FloatVal { ty: fty, value: v })))
        }
        (Value::Float(f), PrimTy::Int(_)) | (Value::Float(f), PrimTy::Uint(_)) => {
            let truncated = f.value.trunc();
            if truncated.is_nan() || truncated.is_infinite() {
                return panic();
            }
            let Some((min, max)) = int_bounds(target) else {
                return Err(ice("integer bounds"));
            };
            if truncated < min as f64 || truncated > max as f64 {
                return panic();
            }
            let negative = truncated < 0.0;
            let magnitude = truncated.abs() as u128;
            Ok(Outcome::Val(Value::int(target, negative, magnitude)))
        }
        (Value::Float(f), PrimTy::Float(fty)) => {
            let value = match fty {
                FloatTy::F32 => f.value as f32 as f64,
                FloatTy::F64 => f.value,
            };
            Ok(Outcome::Val(Value::Float(FloatVal { ty: fty, value })))
        }
        (Value::Char(c), PrimTy::Int(_)) | (Value::Char(c), PrimTy::Uint(_)) => {
            Ok(Outcome::Val(Value::int(target, false, c as u128)))
        }
        (Value::Bool(b), PrimTy::Int(_)) | (Value::Bool(b), PrimTy::Uint(_)) => {
            Ok(Outcome::Val(Value::int(target, false, b as u128)))
        }
        (value, target) => Err(ice(format!("cast {} to {:?}", value, target))),
    }
}

/// Transmute reinterprets bits between same-size types. The interpreter
/// realizes it for scalar shapes and passes aggregates through unchanged
/// (lowering already verified the sizes agree).
pub fn eval_transmute(value: Value, to: &Ty) -> EvalResult<Outcome> {
    let target = match &**strip_perm(to) {
        TyKind::Prim(prim) => *prim,
        _ => return Ok(Outcome::Val(value)),
    };
    match (value, target) {
        (Value::Int(i), PrimTy::Int(_)) | (Value::Int(i), PrimTy::Uint(_)) => {
            Ok(Outcome::Val(Value::Int(IntVal::from_bits(target, i.to_bits()))))
        }
        (Value::Int(i), PrimTy::Float(FloatTy::F32)) => Ok(Outcome::Val(Value::Float(FloatVal {
            ty: FloatTy::F32,
            value: f32::from_bits(i.to_bits() as u32) as f64,
        }))),
        (Value::Int(i), PrimTy::Float(FloatTy::F64)) => Ok(Outcome::Val(Value::Float(FloatVal {
            ty: FloatTy::F64,
            value: f64::from_bits(i.to_bits() as u64),
        }))),
        (Value::Float(f), PrimTy::Int(_)) | (Value::Float(f), PrimTy::Uint(_)) => {
            let bits = match f.ty {
                FloatTy::F32 => (f.value as f32).to_bits() as u128,
                FloatTy::F64 => f.value.to_bits() as u128,
            };
            Ok(Outcome::Val(Value::Int(IntVal::from_bits(target, bits))))
        }
        (value, _) => Ok(Outcome::Val(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::types::{mk_prim, IntTy, UintTy};

    fn expect_cast_panic(outcome: Outcome) {
        match outcome {
            Outcome::Ctrl(ctrl) => assert_eq!(ctrl.code, PanicReason::Cast.code()),
            Outcome::Val(v) => panic!("expected Cast panic, got {}", v),
        }
    }

    #[test]
    fn nan_to_int_panics() {
        let nan = Value::Float(FloatVal { ty: FloatTy::F64, value: f64::NAN });
        expect_cast_panic(eval_cast(nan, &mk_prim(PrimTy::Int(IntTy::I32))).unwrap());
    }

    #[test]
    fn out_of_range_float_to_int_panics() {
        let big = Value::Float(FloatVal { ty: FloatTy::F64, value: 1e300 });
        expect_cast_panic(eval_cast(big, &mk_prim(PrimTy::Int(IntTy::I32))).unwrap());
    }

    #[test]
    fn surrogate_to_char_panics() {
        let v = Value::int(PrimTy::Uint(UintTy::U32), false, 0xD800);
        expect_cast_panic(eval_cast(v, &mk_prim(PrimTy::Char)).unwrap());
        let v = Value::int(PrimTy::Uint(UintTy::U32), false, 0x110000);
        expect_cast_panic(eval_cast(v, &mk_prim(PrimTy::Char)).unwrap());
    }

    #[test]
    fn narrowing_int_cast_truncates() {
        let v = Value::int(PrimTy::Int(IntTy::I32), false, 0x1FF);
        match eval_cast(v, &mk_prim(PrimTy::Uint(UintTy::U8))).unwrap() {
            Outcome::Val(Value::Int(i)) => assert_eq!(i.magnitude, 0xFF),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn float_bits_round_trip() {
        let f = Value::Float(FloatVal { ty: FloatTy::F64, value: 1.5 });
        let as_int = match eval_transmute(f, &mk_prim(PrimTy::Uint(UintTy::U64))).unwrap() {
            Outcome::Val(v) => v,
            other => panic!("unexpected {:?}", other),
        };
        match eval_transmute(as_int, &mk_prim(PrimTy::Float(FloatTy::F64))).unwrap() {
            Outcome::Val(Value::Float(f)) => assert_eq!(f.value, 1.5),
            other => panic!("unexpected {:?}", other),
        }
    }
}
