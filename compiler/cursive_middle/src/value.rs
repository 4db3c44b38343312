//! Runtime values, shared by the analyzers and the interpreter.
//!
//! Integers are kept in sign-magnitude form with a `u128` magnitude so that
//! every source integer type up to 128 bits has an exact, portable
//! representation; checked arithmetic reports overflow against the value's
//! own type bounds.

use std::fmt;

use cursive_ast::ast::RangeKind;
use cursive_ast::path::Path;
use cursive_ast::types::{FloatTy, IntTy, PrimTy, PtrState, RawPtrQual, Ty, UintTy};

use crate::store::Addr;

#[derive(Clone, Debug)]
pub enum Value {
    Bool(bool),
    /// A Unicode scalar value, stored as its codepoint.
    Char(u32),
    Unit,
    Int(IntVal),
    Float(FloatVal),
    Ptr(PtrVal),
    RawPtr(RawPtrVal),
    Tuple(Vec<Value>),
    Array(Vec<Value>),
    Range(RangeVal),
    Slice(SliceVal),
    Record(RecordVal),
    Enum(EnumVal),
    Modal(ModalVal),
    Union(UnionVal),
    Dynamic(DynamicVal),
    Str(StrVal),
    Bytes(BytesVal),
    ProcRef { module_path: Path, name: String },
    RecordCtor { path: Path },
}

#[derive(Clone, Debug)]
pub struct IntVal {
    pub ty: PrimTy,
    pub negative: bool,
    pub magnitude: u128,
}

#[derive(Clone, Debug)]
pub struct FloatVal {
    pub ty: FloatTy,
    pub value: f64,
}

#[derive(Copy, Clone, Debug)]
pub struct PtrVal {
    pub state: PtrState,
    pub addr: Addr,
}

#[derive(Copy, Clone, Debug)]
pub struct RawPtrVal {
    pub qual: RawPtrQual,
    pub addr: Addr,
}

#[derive(Clone, Debug)]
pub struct RangeVal {
    pub kind: RangeKind,
    pub lo: Option<Box<Value>>,
    pub hi: Option<Box<Value>>,
}

#[derive(Clone, Debug)]
pub struct SliceVal {
    pub base: Vec<Value>,
    pub range: RangeVal,
}

#[derive(Clone, Debug)]
pub struct RecordVal {
    pub ty: Ty,
    /// Declaration order; semantic equality is positional.
    pub fields: Vec<(String, Value)>,
}

#[derive(Clone, Debug)]
pub enum EnumPayload {
    Tuple(Vec<Value>),
    Record(Vec<(String, Value)>),
}

#[derive(Clone, Debug)]
pub struct EnumVal {
    /// Full variant path, `Enum.Variant`.
    pub path: Path,
    pub payload: Option<EnumPayload>,
}

#[derive(Clone, Debug)]
pub struct ModalVal {
    pub state: String,
    pub payload: Box<Value>,
}

#[derive(Clone, Debug)]
pub struct UnionVal {
    pub member: Ty,
    pub value: Box<Value>,
}

#[derive(Clone, Debug)]
pub struct DynamicVal {
    pub class_path: Path,
    pub data: RawPtrVal,
    pub concrete: Ty,
}

/// `View` borrows its bytes; `Managed` owns one heap allocation. This is a
/// value state, not an ownership state.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum StrState {
    View,
    Managed,
}

#[derive(Clone, Debug)]
pub struct StrVal {
    pub state: StrState,
    pub bytes: Vec<u8>,
    /// Capacity of the managed backing allocation; zero for views.
    pub cap: usize,
}

#[derive(Clone, Debug)]
pub struct BytesVal {
    pub state: StrState,
    pub bytes: Vec<u8>,
    pub cap: usize,
}

impl Value {
    pub fn int(ty: PrimTy, negative: bool, magnitude: u128) -> Value {
        // Canonical zero is non-negative.
        let negative = negative && magnitude != 0;
        Value::Int(IntVal { ty, negative, magnitude })
    }

    pub fn from_i64(ty: PrimTy, v: i64) -> Value {
        Value::int(ty, v < 0, v.unsigned_abs() as u128)
    }

    pub fn i32(v: i32) -> Value {
        Value::from_i64(PrimTy::Int(IntTy::I32), v as i64)
    }

    pub fn usize(v: u64) -> Value {
        Value::int(PrimTy::Uint(UintTy::Usize), false, v as u128)
    }

    pub fn str_view(bytes: impl Into<Vec<u8>>) -> Value {
        Value::Str(StrVal { state: StrState::View, bytes: bytes.into(), cap: 0 })
    }

    pub fn as_int(&self) -> Option<&IntVal> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl IntVal {
    pub fn zero(ty: PrimTy) -> IntVal {
        IntVal { ty, negative: false, magnitude: 0 }
    }

    pub fn bit_width(&self) -> u32 {
        match self.ty {
            PrimTy::Int(t) => t.bit_width(),
            PrimTy::Uint(t) => t.bit_width(),
            _ => 0,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.ty, PrimTy::Int(_))
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude == 0
    }

    /// The value as an `i128`, when it fits.
    pub fn to_i128(&self) -> Option<i128> {
        if self.negative {
            if self.magnitude > (1u128 << 127) {
                None
            } else {
                Some((self.magnitude as i128).wrapping_neg())
            }
        } else if self.magnitude > i128::MAX as u128 {
            None
        } else {
            Some(self.magnitude as i128)
        }
    }

    pub fn to_u64(&self) -> Option<u64> {
        if self.negative || self.magnitude > u64::MAX as u128 {
            None
        } else {
            Some(self.magnitude as u64)
        }
    }

    /// Whether the magnitude/sign pair is representable in this value's type.
    pub fn in_range(&self) -> bool {
        let width = self.bit_width();
        if self.is_signed() {
            let max_mag = if self.negative { 1u128 << (width - 1) } else { (1u128 << (width - 1)) - 1 };
            self.magnitude <= max_mag
        } else if self.negative {
            false
        } else if width == 128 {
            true
        } else {
            self.magnitude < (1u128 << width)
        }
    }

    /// The value's two's-complement bit pattern, truncated to its width.
    pub fn to_bits(&self) -> u128 {
        let width = self.bit_width();
        let mask = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
        if self.negative {
            self.magnitude.wrapping_neg() & mask
        } else {
            self.magnitude & mask
        }
    }

    /// Reinterprets a two's-complement bit pattern as a value of `ty`.
    pub fn from_bits(ty: PrimTy, bits: u128) -> IntVal {
        let (width, signed) = match ty {
            PrimTy::Int(t) => (t.bit_width(), true),
            PrimTy::Uint(t) => (t.bit_width(), false),
            _ => (0, false),
        };
        let mask = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
        let bits = bits & mask;
        if signed && width > 0 && (bits >> (width - 1)) & 1 == 1 {
            let magnitude = bits.wrapping_neg() & mask;
            IntVal { ty, negative: true, magnitude }
        } else {
            IntVal { ty, negative: false, magnitude: bits }
        }
    }
}

/// Result of a checked arithmetic op: the (wrapped) value and whether the
/// mathematically exact result escaped the type's range.
pub type Checked = (IntVal, bool);

fn normalize(mut v: IntVal) -> IntVal {
    if v.magnitude == 0 {
        v.negative = false;
    }
    v
}

fn wrap_to_type(ty: PrimTy, negative: bool, magnitude: u128, exact: bool) -> Checked {
    let candidate = normalize(IntVal { ty, negative, magnitude });
    if exact && candidate.in_range() {
        (candidate, false)
    } else {
        // Wrap through the bit pattern, like hardware would.
        let bits = candidate.to_bits();
        (IntVal::from_bits(ty, bits), true)
    }
}

pub fn checked_add(lhs: &IntVal, rhs: &IntVal) -> Checked {
    let ty = lhs.ty;
    if lhs.negative == rhs.negative {
        match lhs.magnitude.checked_add(rhs.magnitude) {
            Some(mag) => wrap_to_type(ty, lhs.negative, mag, true),
            None => {
                let mag = lhs.magnitude.wrapping_add(rhs.magnitude);
                wrap_to_type(ty, lhs.negative, mag, false)
            }
        }
    } else {
        let (neg, mag) = if lhs.magnitude >= rhs.magnitude {
            (lhs.negative, lhs.magnitude - rhs.magnitude)
        } else {
            (rhs.negative, rhs.magnitude - lhs.magnitude)
        };
        wrap_to_type(ty, neg, mag, true)
    }
}

pub fn checked_sub(lhs: &IntVal, rhs: &IntVal) -> Checked {
    let negated = IntVal { ty: rhs.ty, negative: !rhs.negative, magnitude: rhs.magnitude };
    checked_add(lhs, &normalize(negated))
}

pub fn checked_mul(lhs: &IntVal, rhs: &IntVal) -> Checked {
    let ty = lhs.ty;
    let neg = lhs.negative != rhs.negative;
    match lhs.magnitude.checked_mul(rhs.magnitude) {
        Some(mag) => wrap_to_type(ty, neg, mag, true),
        None => {
            let mag = lhs.magnitude.wrapping_mul(rhs.magnitude);
            wrap_to_type(ty, neg, mag, false)
        }
    }
}

/// Truncating division. The caller must reject a zero divisor first.
pub fn checked_div(lhs: &IntVal, rhs: &IntVal) -> Checked {
    debug_assert!(!rhs.is_zero());
    let neg = lhs.negative != rhs.negative;
    let mag = lhs.magnitude / rhs.magnitude;
    // MIN / -1 lands one past MAX and wraps; in_range flags it.
    wrap_to_type(lhs.ty, neg, mag, true)
}

pub fn checked_rem(lhs: &IntVal, rhs: &IntVal) -> Checked {
    debug_assert!(!rhs.is_zero());
    let mag = lhs.magnitude % rhs.magnitude;
    wrap_to_type(lhs.ty, lhs.negative, mag, true)
}

pub fn checked_neg(v: &IntVal) -> Checked {
    wrap_to_type(v.ty, !v.negative, v.magnitude, true)
}

/// Shift left; `count` must already be `< bit_width` (the `Shift` panic is
/// the caller's job).
pub fn shl(v: &IntVal, count: u32) -> IntVal {
    let bits = v.to_bits();
    IntVal::from_bits(v.ty, bits << count)
}

/// Shift right: arithmetic for signed values, logical for unsigned.
pub fn shr(v: &IntVal, count: u32) -> IntVal {
    let width = v.bit_width();
    let bits = v.to_bits();
    if v.is_signed() {
        // Sign-extend to 128 bits, then shift.
        let extended = if width < 128 && (bits >> (width - 1)) & 1 == 1 {
            bits | (u128::MAX << width)
        } else {
            bits
        };
        IntVal::from_bits(v.ty, ((extended as i128) >> count) as u128)
    } else {
        IntVal::from_bits(v.ty, bits >> count)
    }
}

pub fn bitop(op: fn(u128, u128) -> u128, lhs: &IntVal, rhs: &IntVal) -> IntVal {
    IntVal::from_bits(lhs.ty, op(lhs.to_bits(), rhs.to_bits()))
}

pub fn int_cmp(lhs: &IntVal, rhs: &IntVal) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (lhs.negative, rhs.negative) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => lhs.magnitude.cmp(&rhs.magnitude),
        (true, true) => rhs.magnitude.cmp(&lhs.magnitude),
    }
}

/// Structural value equality.
pub fn value_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Char(a), Value::Char(b)) => a == b,
        (Value::Unit, Value::Unit) => true,
        (Value::Int(a), Value::Int(b)) => {
            a.ty == b.ty && a.negative == b.negative && a.magnitude == b.magnitude
        }
        (Value::Float(a), Value::Float(b)) => a.ty == b.ty && a.value == b.value,
        (Value::Ptr(a), Value::Ptr(b)) => a.state == b.state && a.addr == b.addr,
        (Value::RawPtr(a), Value::RawPtr(b)) => a.qual == b.qual && a.addr == b.addr,
        (Value::Tuple(a), Value::Tuple(b)) | (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| value_equal(x, y))
        }
        (Value::Range(a), Value::Range(b)) => {
            a.kind == b.kind
                && opt_equal(&a.lo, &b.lo)
                && opt_equal(&a.hi, &b.hi)
        }
        (Value::Slice(a), Value::Slice(b)) => {
            a.base.len() == b.base.len()
                && a.base.iter().zip(&b.base).all(|(x, y)| value_equal(x, y))
                && a.range.kind == b.range.kind
                && opt_equal(&a.range.lo, &b.range.lo)
                && opt_equal(&a.range.hi, &b.range.hi)
        }
        (Value::Record(a), Value::Record(b)) => {
            cursive_ast::types::type_equiv(&a.ty, &b.ty)
                && a.fields.len() == b.fields.len()
                && a.fields.iter().zip(&b.fields).all(|((_, x), (_, y))| value_equal(x, y))
        }
        (Value::Enum(a), Value::Enum(b)) => {
            a.path == b.path
                && match (&a.payload, &b.payload) {
                    (None, None) => true,
                    (Some(EnumPayload::Tuple(x)), Some(EnumPayload::Tuple(y))) => {
                        x.len() == y.len() && x.iter().zip(y).all(|(a, b)| value_equal(a, b))
                    }
                    (Some(EnumPayload::Record(x)), Some(EnumPayload::Record(y))) => {
                        x.len() == y.len()
                            && x.iter().zip(y).all(|((_, a), (_, b))| value_equal(a, b))
                    }
                    _ => false,
                }
        }
        (Value::Modal(a), Value::Modal(b)) => {
            cursive_ast::path::fold_ident(&a.state) == cursive_ast::path::fold_ident(&b.state)
                && value_equal(&a.payload, &b.payload)
        }
        (Value::Union(a), Value::Union(b)) => {
            cursive_ast::types::type_equiv(&a.member, &b.member) && value_equal(&a.value, &b.value)
        }
        (Value::Dynamic(a), Value::Dynamic(b)) => {
            a.class_path == b.class_path && a.data.addr == b.data.addr
        }
        (Value::Str(a), Value::Str(b)) => a.state == b.state && a.bytes == b.bytes,
        (Value::Bytes(a), Value::Bytes(b)) => a.state == b.state && a.bytes == b.bytes,
        (
            Value::ProcRef { module_path: ap, name: an },
            Value::ProcRef { module_path: bp, name: bn },
        ) => ap == bp && cursive_ast::path::fold_ident(an) == cursive_ast::path::fold_ident(bn),
        (Value::RecordCtor { path: a }, Value::RecordCtor { path: b }) => a == b,
        _ => false,
    }
}

fn opt_equal(a: &Option<Box<Value>>, b: &Option<Box<Value>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => value_equal(a, b),
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        value_equal(self, other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Char(c) => match char::from_u32(*c) {
                Some(c) => write!(f, "{:?}", c),
                None => write!(f, "char({:#x})", c),
            },
            Value::Unit => f.write_str("()"),
            Value::Int(i) => {
                if i.negative {
                    f.write_str("-")?;
                }
                write!(f, "{}", i.magnitude)
            }
            Value::Float(v) => write!(f, "{}", v.value),
            Value::Ptr(p) => match p.state {
                PtrState::Valid => write!(f, "&#{}", p.addr),
                PtrState::Null => f.write_str("null"),
                PtrState::Expired => write!(f, "&expired#{}", p.addr),
            },
            Value::RawPtr(p) => write!(f, "*#{}", p.addr),
            Value::Tuple(elems) => {
                f.write_str("(")?;
                for (i, e) in elems.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str(")")
            }
            Value::Array(elems) => {
                f.write_str("[")?;
                for (i, e) in elems.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str("]")
            }
            Value::Range(r) => {
                if let Some(lo) = &r.lo {
                    write!(f, "{}", lo)?;
                }
                match r.kind {
                    RangeKind::ToInclusive | RangeKind::Inclusive => f.write_str("..=")?,
                    _ => f.write_str("..")?,
                }
                if let Some(hi) = &r.hi {
                    write!(f, "{}", hi)?;
                }
                Ok(())
            }
            Value::Slice(s) => write!(f, "slice[len {}]", s.base.len()),
            Value::Record(r) => {
                write!(f, "{} {{ ", r.ty)?;
                for (i, (name, v)) in r.fields.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", name, v)?;
                }
                f.write_str(" }")
            }
            Value::Enum(e) => {
                write!(f, "{}", e.path)?;
                match &e.payload {
                    None => Ok(()),
                    Some(EnumPayload::Tuple(elems)) => {
                        f.write_str("(")?;
                        for (i, v) in elems.iter().enumerate() {
                            if i != 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "{}", v)?;
                        }
                        f.write_str(")")
                    }
                    Some(EnumPayload::Record(fields)) => {
                        f.write_str(" { ")?;
                        for (i, (name, v)) in fields.iter().enumerate() {
                            if i != 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "{}: {}", name, v)?;
                        }
                        f.write_str(" }")
                    }
                }
            }
            Value::Modal(m) => write!(f, "@{} {}", m.state, m.payload),
            Value::Union(u) => write!(f, "{}", u.value),
            Value::Dynamic(d) => write!(f, "${} of {}", d.class_path, d.concrete),
            Value::Str(s) => write!(f, "{:?}", String::from_utf8_lossy(&s.bytes)),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.bytes.len()),
            Value::ProcRef { module_path, name } => write!(f, "{}.{}", module_path, name),
            Value::RecordCtor { path } => write!(f, "{}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::types::IntTy;

    fn i32v(v: i64) -> IntVal {
        match Value::from_i64(PrimTy::Int(IntTy::I32), v) {
            Value::Int(i) => i,
            _ => unreachable!(),
        }
    }

    #[test]
    fn add_overflow_at_type_bound() {
        let (sum, overflow) = checked_add(&i32v(i32::MAX as i64), &i32v(1));
        assert!(overflow);
        assert_eq!(sum.to_i128(), Some(i32::MIN as i128));

        let (sum, overflow) = checked_add(&i32v(1), &i32v(2));
        assert!(!overflow);
        assert_eq!(sum.to_i128(), Some(3));
    }

    #[test]
    fn min_div_minus_one_overflows() {
        let (_, overflow) = checked_div(&i32v(i32::MIN as i64), &i32v(-1));
        assert!(overflow);
    }

    #[test]
    fn sub_crosses_zero() {
        let (v, overflow) = checked_sub(&i32v(2), &i32v(5));
        assert!(!overflow);
        assert_eq!(v.to_i128(), Some(-3));
        assert!(v.negative);
    }

    #[test]
    fn shifts_match_hardware() {
        let v = shl(&i32v(1), 31);
        assert_eq!(v.to_i128(), Some(i32::MIN as i128));
        let back = shr(&v, 31);
        assert_eq!(back.to_i128(), Some(-1));
    }

    #[test]
    fn bits_round_trip_min() {
        let v = i32v(i32::MIN as i64);
        let bits = v.to_bits();
        let back = IntVal::from_bits(PrimTy::Int(IntTy::I32), bits);
        assert_eq!(back.to_i128(), Some(i32::MIN as i128));
        assert!(back.negative);
    }

    #[test]
    fn zero_is_canonical() {
        let (v, _) = checked_add(&i32v(-3), &i32v(3));
        assert!(!v.negative);
        assert!(value_equal(&Value::Int(v), &Value::i32(0)));
    }

    #[test]
    fn unsigned_wraps() {
        let max = IntVal { ty: PrimTy::Uint(UintTy::U8), negative: false, magnitude: 255 };
        let one = IntVal { ty: PrimTy::Uint(UintTy::U8), negative: false, magnitude: 1 };
        let (v, overflow) = checked_add(&max, &one);
        assert!(overflow);
        assert_eq!(v.magnitude, 0);
    }
}
