//! Lowering from the typed Cursive AST to the backend IR: expressions,
//! statements, patterns, places, dynamic dispatch, structured parallelism,
//! and module statics, with panic, bounds, cast, and poison checks inserted
//! along the way.

pub mod checks;
pub mod globals;
pub mod ir;
pub mod lower;
pub mod symbols;

pub use ir::{DerivedValue, GlobalInit, Ir, IrGlobal, IrProc, IrValue, LocalId, OpaqueId};
pub use lower::{lower_proc, LowerCtx, LowerError, LowerErrorKind, LoweredProc, LowerResult};
