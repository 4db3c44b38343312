//! The Cursive middle-end's shared model: runtime values, the Σ world the
//! interpreter and analyzers reason about, type layout, dynamic-dispatch
//! tables, and the panic-code taxonomy that binds lowering, interpreter, and
//! runtime together.

pub mod index;
pub mod layout;
pub mod panic;
pub mod store;
pub mod value;
pub mod vtable;

pub use panic::{PanicCode, PanicReason, PanicRecord};
pub use store::Sigma;
pub use value::Value;
