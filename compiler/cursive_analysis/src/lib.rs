//! Static semantic analysis: ownership and modal-state tracking, region and
//! frame validation, and key/capability checking.
//!
//! Each analyzer walks a procedure body flow-sensitively and reports
//! [`AnalysisError`]s; results the lowering pass needs land in small side
//! tables keyed by expression id.

pub mod context;
pub mod errors;
pub mod keys;
pub mod ownership;
pub mod regions;

pub use errors::{AnalysisError, AnalysisErrorKind};

use cursive_ast::ast::ProcDecl;
use cursive_ast::env::ScopeContext;

/// Runs every analyzer over a procedure and collects the combined verdict.
pub fn check_proc(scx: &ScopeContext, proc: &ProcDecl) -> AnalysisOutput {
    let mut errors = Vec::new();
    let ownership = ownership::check_proc(scx, proc);
    errors.extend(ownership.errors.iter().cloned());
    errors.extend(regions::check_proc(scx, proc));
    errors.extend(keys::check_proc(proc));
    if cursive_ast::path::fold_ident(&proc.name) == "main" {
        errors.extend(context::check_main_signature(proc));
    }
    errors.extend(context::check_extern_signature(proc));
    AnalysisOutput { ownership, errors }
}

pub struct AnalysisOutput {
    pub ownership: ownership::OwnershipResults,
    pub errors: Vec<AnalysisError>,
}

impl AnalysisOutput {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}
