//! The Cursive abstract syntax tree and the resolved environment the
//! middle-end consumes.
//!
//! Everything in this crate is produced upstream by the parser and resolver;
//! the middle-end treats it as immutable input. The one piece of behavior
//! that lives here is identifier folding (`path::fold_ident`), because path
//! equality everywhere downstream must agree with the resolver's rules.

pub mod ast;
pub mod env;
pub mod path;
pub mod span;
pub mod types;

pub use path::{Path, PathKey};
pub use span::Span;
pub use types::{PermKind, PtrState, RawPtrQual, Ty, TyKind};
