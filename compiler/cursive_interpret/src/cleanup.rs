//! Scope cleanup and typed drop logic.
//!
//! Cleanup items run in reverse insertion order when a scope ends. One
//! panicking item turns the scope's status to `Panic`; a second escalates
//! to `Abort` (process-level termination). Drops descend through
//! aggregates with an explicit worklist so deeply nested values cannot
//! overflow the host stack.

use std::collections::BTreeSet;

use tracing::trace;

use cursive_ast::path::fold_ident;
use cursive_middle::panic::{PanicCode, PanicReason};
use cursive_middle::store::{Binding, BindState, CleanupItem, Responsibility};
use cursive_middle::value::{EnumPayload, StrState, Value};

use crate::control::{Control, ControlKind, Outcome};
use crate::machine::{EvalContext, EvalResult};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DropStatus {
    Ok,
    Panic(PanicCode),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CleanupStatus {
    Ok,
    Panic(PanicCode),
    Abort,
}

/// Folds a scope's cleanup status into the outcome that was in flight when
/// the scope ended. A cleanup panic on top of an already-panicking outcome
/// escalates to abort.
pub fn merge_outcome(outcome: Outcome, status: CleanupStatus) -> Outcome {
    match status {
        CleanupStatus::Ok => outcome,
        CleanupStatus::Abort => Outcome::Ctrl(Control::abort()),
        CleanupStatus::Panic(code) => match &outcome {
            Outcome::Ctrl(ctrl) if ctrl.is_panic() => Outcome::Ctrl(Control::abort()),
            _ => Outcome::Ctrl(Control { kind: ControlKind::Panic, value: None, code }),
        },
    }
}

impl<'a> EvalContext<'a> {
    /// Runs the current scope's cleanup list in reverse insertion order.
    /// The scope stays on the stack while its items run; the caller pops
    /// afterwards.
    pub fn cleanup_current_scope(&mut self) -> CleanupStatus {
        let items: Vec<CleanupItem> = match self.sigma.current_scope() {
            Some(scope) => scope.cleanup.clone(),
            None => return CleanupStatus::Ok,
        };
        let mut panics = 0u32;
        let mut first_code = PanicReason::Other.code();
        for item in items.iter().rev() {
            let status = match self.run_cleanup_item(item) {
                Ok(status) => status,
                Err(_) => DropStatus::Panic(PanicReason::Other.code()),
            };
            if let DropStatus::Panic(code) = status {
                if panics == 0 {
                    first_code = code;
                }
                panics += 1;
            }
        }
        match panics {
            0 => CleanupStatus::Ok,
            1 => CleanupStatus::Panic(first_code),
            // A second panic during teardown is unrecoverable.
            _ => CleanupStatus::Abort,
        }
    }

    fn run_cleanup_item(&mut self, item: &CleanupItem) -> EvalResult<DropStatus> {
        match item {
            CleanupItem::DropBinding(binding) => self.drop_binding(binding),
            CleanupItem::DropStatic { module, name } => {
                trace!("drop_static: {}.{}", module, name);
                match self.sigma.static_addr(module, name) {
                    Some(addr) => match self.sigma.read_location(addr) {
                        Ok(value) => self.drop_value(value, &BTreeSet::new()),
                        Err(_) => Ok(DropStatus::Ok),
                    },
                    None => Ok(DropStatus::Ok),
                }
            }
            CleanupItem::DeferBlock(block) => {
                let block = block.clone();
                match self.eval_block(&block)? {
                    Outcome::Val(_) => Ok(DropStatus::Ok),
                    Outcome::Ctrl(ctrl) if ctrl.is_panic() => Ok(DropStatus::Panic(ctrl.code)),
                    // Return/break escaping a defer block degrades to a
                    // completed defer; the surrounding exit wins.
                    Outcome::Ctrl(_) => Ok(DropStatus::Ok),
                }
            }
        }
    }

    fn drop_binding(&mut self, binding: &Binding) -> EvalResult<DropStatus> {
        let Some(info) = self.sigma.bind_info_of(binding) else {
            return Ok(DropStatus::Ok);
        };
        if info.responsibility != Responsibility::Resp {
            return Ok(DropStatus::Ok);
        }
        let skip = match self.sigma.bind_state_of(binding) {
            None | Some(BindState::Moved) => return Ok(DropStatus::Ok),
            Some(BindState::Valid) => BTreeSet::new(),
            Some(BindState::PartiallyMoved { fields }) => fields.clone(),
        };
        let Some(value) = self.sigma.value_of_binding(binding).cloned() else {
            return Ok(DropStatus::Ok);
        };
        trace!("drop_binding: {} = {}", binding.name, value);
        // The binding may not be dropped twice.
        self.sigma.set_state(binding, BindState::Moved);
        self.drop_value(value, &skip)
    }

    /// Drops a value: frees managed buffers, invokes `Drop` impls, and
    /// descends into aggregates, skipping `skip_fields` at the top level.
    pub fn drop_value(
        &mut self,
        value: Value,
        skip_fields: &BTreeSet<String>,
    ) -> EvalResult<DropStatus> {
        let mut status = DropStatus::Ok;
        let mut worklist: Vec<Value> = Vec::new();
        self.push_drop_children(value, skip_fields, &mut worklist, &mut status)?;
        while let Some(value) = worklist.pop() {
            let empty = BTreeSet::new();
            let mut child_status = DropStatus::Ok;
            self.push_drop_children(value, &empty, &mut worklist, &mut child_status)?;
            // The first panic's code wins; later ones are still observed by
            // the scope-level counter through this status.
            if status == DropStatus::Ok {
                status = child_status;
            }
        }
        Ok(status)
    }

    /// Handles one value's own drop effect and queues its children.
    fn push_drop_children(
        &mut self,
        value: Value,
        skip_fields: &BTreeSet<String>,
        worklist: &mut Vec<Value>,
        status: &mut DropStatus,
    ) -> EvalResult<()> {
        match value {
            Value::Str(s) => {
                if s.state == StrState::Managed {
                    self.heap.dealloc_raw(s.cap.max(s.bytes.len()) as u64);
                    self.trace.record("heap", "free_str", &s.bytes.len().to_string());
                }
            }
            Value::Bytes(b) => {
                if b.state == StrState::Managed {
                    self.heap.dealloc_raw(b.cap.max(b.bytes.len()) as u64);
                    self.trace.record("heap", "free_bytes", &b.bytes.len().to_string());
                }
            }
            Value::Record(record) => {
                // A `Drop` impl runs before the fields unwind; its panic is
                // recorded and the children still drop.
                if self.scx.has_drop_impl(&record.ty) {
                    let drop_status = self.call_drop_method(&record.ty, &Value::Record(record.clone()))?;
                    if let DropStatus::Panic(code) = drop_status {
                        *status = DropStatus::Panic(code);
                    }
                }
                for (name, field) in record.fields {
                    if skip_fields.contains(&fold_ident(&name)) {
                        continue;
                    }
                    worklist.push(field);
                }
            }
            Value::Tuple(elems) | Value::Array(elems) => worklist.extend(elems),
            Value::Slice(slice) => worklist.extend(slice.base),
            Value::Enum(enum_val) => match enum_val.payload {
                Some(EnumPayload::Tuple(elems)) => worklist.extend(elems),
                Some(EnumPayload::Record(fields)) => {
                    worklist.extend(fields.into_iter().map(|(_, v)| v));
                }
                None => {}
            },
            Value::Modal(modal) => worklist.push(*modal.payload),
            Value::Union(union) => worklist.push(*union.value),
            // Scalars, pointers, views, handles: nothing owned.
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_ok_keeps_outcome() {
        let outcome = Outcome::Val(Value::i32(1));
        assert_eq!(merge_outcome(outcome.clone(), CleanupStatus::Ok), outcome);
    }

    #[test]
    fn cleanup_panic_replaces_value_outcome() {
        let merged = merge_outcome(
            Outcome::Val(Value::i32(1)),
            CleanupStatus::Panic(PanicReason::DivZero.code()),
        );
        match merged {
            Outcome::Ctrl(ctrl) => {
                assert_eq!(ctrl.kind, ControlKind::Panic);
                assert_eq!(ctrl.code, PanicReason::DivZero.code());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn second_panic_escalates_to_abort() {
        let merged = merge_outcome(
            Outcome::Ctrl(Control::panic(PanicReason::Bounds)),
            CleanupStatus::Panic(PanicReason::DivZero.code()),
        );
        match merged {
            Outcome::Ctrl(ctrl) => assert_eq!(ctrl.kind, ControlKind::Abort),
            other => panic!("unexpected {:?}", other),
        }
    }
}
