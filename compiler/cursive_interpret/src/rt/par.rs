//! The cooperative parallel emulator.
//!
//! Structured-parallel blocks in interpreted programs run on this in-process
//! model: tasks execute in submission order, the first panic in a context
//! wins (later ones are swallowed but still cancel the context's token),
//! and cancel tokens form a parent chain polled at task entry.

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use cursive_middle::panic::PanicCode;

use crate::control::Outcome;

#[derive(Default)]
pub struct CancelTokens {
    tokens: FxHashMap<u64, TokenState>,
    next: u64,
}

struct TokenState {
    parent: Option<u64>,
    cancelled: bool,
}

impl CancelTokens {
    pub fn new_token(&mut self, parent: Option<u64>) -> u64 {
        self.next += 1;
        self.tokens.insert(self.next, TokenState { parent, cancelled: false });
        self.next
    }

    pub fn cancel(&mut self, id: u64) {
        if let Some(token) = self.tokens.get_mut(&id) {
            token.cancelled = true;
        }
    }

    /// Cancellation anywhere up the parent chain is observed here.
    pub fn is_cancelled(&self, mut id: u64) -> bool {
        loop {
            match self.tokens.get(&id) {
                Some(token) if token.cancelled => return true,
                Some(token) => match token.parent {
                    Some(parent) => id = parent,
                    None => return false,
                },
                None => return false,
            }
        }
    }
}

/// One `parallel(domain)` context.
pub struct ParallelCtx {
    pub domain: String,
    pub token: u64,
    /// First panic wins; everything later is swallowed.
    pub first_panic: Option<PanicCode>,
}

impl ParallelCtx {
    pub fn observe_panic(&mut self, code: PanicCode) {
        if self.first_panic.is_none() {
            debug!("parallel ctx ({}): first panic {:#06x}", self.domain, code);
            self.first_panic = Some(code);
        } else {
            trace!("parallel ctx ({}): swallowed panic {:#06x}", self.domain, code);
        }
    }
}

/// Completed spawn handles awaiting their `wait`.
#[derive(Default)]
pub struct TaskTable {
    tasks: FxHashMap<u64, Outcome>,
    next: u64,
}

impl TaskTable {
    pub fn insert(&mut self, outcome: Outcome) -> u64 {
        self.next += 1;
        self.tasks.insert(self.next, outcome);
        self.next
    }

    pub fn take(&mut self, handle: u64) -> Option<Outcome> {
        self.tasks.remove(&handle)
    }
}

/// Execution domains the context exposes.
pub fn domain_concurrency(name: &str) -> u64 {
    match name {
        "inline" => 1,
        // The emulator is sequential; the advertised width is nominal.
        "cpu" => 4,
        "gpu" => 64,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_token_sees_ancestor_cancellation() {
        let mut tokens = CancelTokens::default();
        let root = tokens.new_token(None);
        let mid = tokens.new_token(Some(root));
        let leaf = tokens.new_token(Some(mid));
        assert!(!tokens.is_cancelled(leaf));
        tokens.cancel(root);
        assert!(tokens.is_cancelled(leaf));
        assert!(tokens.is_cancelled(mid));
    }

    #[test]
    fn first_panic_wins() {
        let mut ctx = ParallelCtx { domain: "cpu".into(), token: 1, first_panic: None };
        ctx.observe_panic(0x0003);
        ctx.observe_panic(0x0006);
        assert_eq!(ctx.first_panic, Some(0x0003));
    }
}
