//! The evaluation context: Σ plus the in-process runtime model.

use std::path::PathBuf;

use cursive_ast::env::ScopeContext;
use cursive_ast::path::Path;
use cursive_middle::store::Sigma;

use crate::rt::heap::HeapModel;
use crate::rt::par::{CancelTokens, ParallelCtx, TaskTable};
use crate::rt::trace::SpecTrace;

/// Hard error from the interpreter: the input was malformed in a way the
/// upstream passes should have rejected. Language-level panics are control
/// flow, not `EvalError`s.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum EvalError {
    Ice(String),
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Creates an internal-compiler-error value; the interpreter's `bug!`.
pub fn ice(msg: impl Into<String>) -> EvalError {
    EvalError::Ice(msg.into())
}

#[derive(Clone, Debug, Default)]
pub struct MachineOptions {
    pub heap_quota: Option<u64>,
    /// Overrides the `CURSIVE_SPEC_TRACE_RUNTIME` environment variable.
    pub trace_path: Option<PathBuf>,
}

pub struct EvalContext<'a> {
    pub scx: &'a ScopeContext,
    pub sigma: Sigma,
    pub heap: HeapModel,
    pub trace: SpecTrace,
    pub tasks: TaskTable,
    pub tokens: CancelTokens,
    /// Innermost-last stack of open `parallel` contexts.
    pub par_stack: Vec<ParallelCtx>,
    /// The module whose body is currently executing; bare procedure names
    /// resolve against it first.
    pub current_module: Option<Path>,
    pub(crate) call_depth: usize,
}

pub(crate) const MAX_CALL_DEPTH: usize = 512;

impl<'a> EvalContext<'a> {
    pub fn new(scx: &'a ScopeContext, opts: MachineOptions) -> EvalContext<'a> {
        let trace = match opts.trace_path {
            Some(path) => SpecTrace::with_path(Some(path)),
            None => SpecTrace::from_env(),
        };
        EvalContext {
            scx,
            sigma: Sigma::new(),
            heap: HeapModel::new(opts.heap_quota),
            trace,
            tasks: TaskTable::default(),
            tokens: CancelTokens::default(),
            par_stack: Vec::new(),
            current_module: None,
            call_depth: 0,
        }
    }

    pub fn current_token(&self) -> Option<u64> {
        self.par_stack.last().map(|ctx| ctx.token)
    }
}
