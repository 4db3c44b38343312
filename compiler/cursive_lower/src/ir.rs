//! The typed IR handed to the backend.
//!
//! IR is a tree: sequences and blocks of instructions, with leaf operands
//! expressed as [`IrValue`]s. Pure structural computations (projections,
//! aggregate literals, dyn packing) are not materialized as instructions;
//! they live in the derived-value table and are referenced through
//! `IrValue::Opaque`, so the backend (or the interpreter) can evaluate them
//! where they are cheapest.

use cursive_ast::ast::{BinOp, RangeKind, UnOp};
use cursive_ast::path::{Path, PathKey};
use cursive_ast::types::Ty;
use cursive_middle::index::IndexVec;
use cursive_middle::newtype_index;
use cursive_middle::panic::PanicReason;

newtype_index! {
    /// A virtual register local to one lowered procedure.
    pub struct LocalId
}

newtype_index! {
    /// Handle into the derived-value table.
    pub struct OpaqueId
}

#[derive(Clone, PartialEq, Debug)]
pub enum IrValue {
    Local(LocalId),
    /// A linker-level symbol; runtime symbols go through the alias table.
    Symbol(String),
    /// Constant bytes, little-endian, laid out per the value's type.
    Immediate(Vec<u8>),
    Opaque(OpaqueId),
}

impl IrValue {
    pub fn unit() -> IrValue {
        IrValue::Immediate(Vec::new())
    }
}

/// Pure structural operations referenced by `IrValue::Opaque`.
#[derive(Clone, PartialEq, Debug)]
pub enum DerivedValue {
    Field { base: IrValue, name: String },
    TupleElem { base: IrValue, index: usize },
    Index { base: IrValue, index: IrValue },
    Slice { base: IrValue, kind: RangeKind, lo: Option<IrValue>, hi: Option<IrValue> },
    Range { kind: RangeKind, lo: Option<IrValue>, hi: Option<IrValue> },
    TupleLit(Vec<IrValue>),
    ArrayLit(Vec<IrValue>),
    RecordLit { ty: Ty, fields: Vec<(String, IrValue)> },
    EnumLit { path: Path, discr: u64, payload: Vec<IrValue> },
    /// `{data, vtable}` fat-pointer construction.
    DynPack { concrete: Ty, class: Path, value: IrValue },
    UnionInject { member: Ty, discr: u64, value: IrValue },
    UnionPayload { member: Ty, value: IrValue },
    AddrOfVar { name: String },
    AddrOfField { base: IrValue, name: String },
    AddrOfIndex { base: IrValue, index: IrValue },
    /// Element count of an array/slice/managed buffer operand.
    Len { base: IrValue },
}

#[derive(Clone, PartialEq, Debug)]
pub enum LoopShape {
    Forever,
    While,
    /// Counted iteration over a lowered range.
    Range { binder: String },
}

#[derive(Clone, PartialEq, Debug)]
pub struct MatchArm {
    /// Discriminant(s) this arm covers; empty means default.
    pub discrs: Vec<u64>,
    /// Bindings extracted from the payload before the body runs.
    pub binds: Vec<Ir>,
    pub body: Ir,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Ir {
    Seq(Vec<Ir>),
    /// A lexical scope: `setup` establishes bindings, `body` runs inside it,
    /// and the scope's cleanup schedule runs on every exit path.
    Block { setup: Vec<Ir>, body: Box<Ir>, cleanup: Vec<Ir> },
    BindVar { name: String, value: IrValue },
    StoreVar { name: String, value: IrValue },
    /// Store that must not drop the previous value (partially-moved root).
    StoreVarNoDrop { name: String, value: IrValue },
    StoreGlobal { module: PathKey, name: String, value: IrValue },
    WritePtr { ptr: IrValue, value: IrValue },
    ReadVar { name: String, dest: LocalId },
    ReadPtr { ptr: IrValue, dest: LocalId },
    ReadPath { module: PathKey, name: String, dest: LocalId },
    Call { sym: String, args: Vec<IrValue>, dest: Option<LocalId> },
    /// Dynamic dispatch: read slot `slot` from the object's vtable and call
    /// through it with the data pointer as receiver.
    CallVTable { object: IrValue, slot: usize, args: Vec<IrValue>, dest: Option<LocalId> },
    UnaryOp { op: UnOp, operand: IrValue, dest: LocalId },
    BinaryOp { op: BinOp, lhs: IrValue, rhs: IrValue, dest: LocalId },
    Cast { value: IrValue, from: Ty, to: Ty, dest: LocalId },
    Transmute { value: IrValue, from: Ty, to: Ty, dest: LocalId },
    If { cond: IrValue, then_ir: Box<Ir>, else_ir: Option<Box<Ir>> },
    Loop { shape: LoopShape, cond: Option<IrValue>, body: Box<Ir> },
    /// Joins branch results into one local.
    Phi { dest: LocalId, sources: Vec<IrValue> },
    Match { scrutinee: IrValue, arms: Vec<MatchArm>, result: Option<LocalId> },
    Return { value: Option<IrValue> },
    Break,
    Continue,
    Region { alias: Option<String>, body: Box<Ir> },
    Frame { region: Option<IrValue>, body: Box<Ir> },
    Alloc { region: Option<IrValue>, value: IrValue, dest: LocalId },
    /// Raise a panic: store the record, run the scheduled cleanup, return.
    LowerPanic { reason: PanicReason, cleanup: Vec<Ir> },
    /// After a user call: if the callee panicked, run cleanup and return.
    PanicCheck { cleanup: Vec<Ir> },
    ClearPanic,
    InitPanicHandle { module: PathKey, poison_modules: Vec<PathKey> },
    CheckPoison { module: PathKey },
    CheckIndex { len: IrValue, index: IrValue },
    CheckRange { len: IrValue, lo: Option<IrValue>, hi: Option<IrValue>, kind: RangeKind },
    CheckSliceLen { expected: IrValue, actual: IrValue },
    /// Arithmetic guard: panic with `reason` when `op` on the operands
    /// overflows/divides by zero/shifts out of range.
    CheckOp { op: BinOp, reason: PanicReason, lhs: IrValue, rhs: IrValue },
    CheckCast { value: IrValue, from: Ty, to: Ty },
    /// Drop a binding's current value (scope exit or overwrite-on-assign).
    DropVar { name: String },
    DropGlobal { module: PathKey, name: String },
    Nop,
}

impl Ir {
    pub fn seq(items: Vec<Ir>) -> Ir {
        match items.len() {
            1 => items.into_iter().next().unwrap(),
            _ => Ir::Seq(items),
        }
    }
}

/// The lowering of one procedure.
#[derive(Clone, Debug)]
pub struct IrProc {
    pub sym: String,
    pub params: Vec<String>,
    pub body: Ir,
    /// Opaque operands used by `body`, indexed by `OpaqueId`.
    pub derived: IndexVec<OpaqueId, DerivedValue>,
    pub local_count: usize,
}

/// A module-level constant with a statically evaluated image.
#[derive(Clone, PartialEq, Debug)]
pub enum GlobalInit {
    /// Fully evaluated at compile time.
    Const { bytes: Vec<u8> },
    /// Zero-initialized; the module's init procedure stores into it.
    Zero { size: u64 },
}

#[derive(Clone, Debug)]
pub struct IrGlobal {
    pub module: PathKey,
    pub name: String,
    pub init: GlobalInit,
}
