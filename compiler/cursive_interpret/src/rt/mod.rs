//! The in-process runtime model: heap quota accounting, the cooperative
//! parallel emulator, and spec tracing. The filesystem model lives in Σ
//! (`cursive_middle::store::fs`) because it is part of the world state.

pub mod heap;
pub mod par;
pub mod trace;
