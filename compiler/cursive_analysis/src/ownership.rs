//! Flow-sensitive ownership and modal-state checking.
//!
//! Every binding carries a [`BindState`] lattice value (`Valid`, `Moved`,
//! `PartiallyMoved`). Uses are checked against the state at the use point;
//! control-flow joins take the conservative union (moved on any branch means
//! moved at the join). The lattice is finite-height, so one extra pass over
//! a loop body reaches the back-edge fixpoint.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use cursive_ast::ast::{
    Arg, Block, Expr, ExprKind, LoopKind, NodeId, Pattern, PatternKind, ProcDecl, Stmt, StmtKind,
};
use cursive_ast::env::ScopeContext;
use cursive_ast::path::{fold_ident, Path};
use cursive_ast::span::Span;
use cursive_ast::types::{strip_perm, Ty, TyKind};
use cursive_middle::store::{BindState, Movability, Responsibility};

use crate::errors::{AnalysisError, AnalysisErrorKind};

#[derive(Default)]
pub struct OwnershipResults {
    pub errors: Vec<AnalysisError>,
    /// Place expressions whose store must drop the old value first.
    pub drop_on_assign: FxHashSet<NodeId>,
    /// Field stores into a partially-moved root: lower as `StoreVarNoDrop`.
    pub no_drop_stores: FxHashSet<NodeId>,
}

#[derive(Clone, PartialEq, Debug)]
struct Slot {
    state: BindState,
    movability: Movability,
    responsibility: Responsibility,
    /// Known modal state of the value, when the type pins one down or a
    /// transition method established it.
    modal_state: Option<String>,
    modal_path: Option<Path>,
}

impl Slot {
    fn owned() -> Slot {
        Slot {
            state: BindState::Valid,
            movability: Movability::Mov,
            responsibility: Responsibility::Resp,
            modal_state: None,
            modal_path: None,
        }
    }
}

type ScopeMap = FxHashMap<String, Slot>;

#[derive(Clone, Default)]
struct Env {
    scopes: Vec<ScopeMap>,
}

impl Env {
    fn push(&mut self) {
        self.scopes.push(ScopeMap::default());
    }

    fn pop(&mut self) {
        self.scopes.pop();
    }

    fn bind(&mut self, name: &str, slot: Slot) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(fold_ident(name), slot);
        }
    }

    fn get(&self, name: &str) -> Option<&Slot> {
        let folded = fold_ident(name);
        self.scopes.iter().rev().find_map(|s| s.get(&folded))
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Slot> {
        let folded = fold_ident(name);
        self.scopes.iter_mut().rev().find_map(|s| s.get_mut(&folded))
    }

    /// Conservative union of two post-branch environments.
    fn join(&mut self, other: &Env) {
        for (mine, theirs) in self.scopes.iter_mut().zip(&other.scopes) {
            for (name, slot) in mine.iter_mut() {
                let Some(other_slot) = theirs.get(name) else { continue };
                slot.state = join_states(&slot.state, &other_slot.state);
                if slot.modal_state != other_slot.modal_state {
                    slot.modal_state = None;
                }
            }
        }
    }
}

fn join_states(a: &BindState, b: &BindState) -> BindState {
    match (a, b) {
        (BindState::Moved, _) | (_, BindState::Moved) => BindState::Moved,
        (BindState::Valid, BindState::Valid) => BindState::Valid,
        (BindState::PartiallyMoved { fields }, BindState::Valid)
        | (BindState::Valid, BindState::PartiallyMoved { fields }) => {
            BindState::PartiallyMoved { fields: fields.clone() }
        }
        (BindState::PartiallyMoved { fields: a }, BindState::PartiallyMoved { fields: b }) => {
            BindState::PartiallyMoved { fields: a.union(b).cloned().collect() }
        }
    }
}

pub fn check_proc(scx: &ScopeContext, proc: &ProcDecl) -> OwnershipResults {
    let mut ck = OwnershipCk {
        scx,
        results: OwnershipResults::default(),
        env: Env::default(),
    };
    ck.env.push();
    for param in &proc.params {
        let mut slot = Slot::owned();
        if !param.by_move {
            slot.responsibility = Responsibility::Alias;
        }
        apply_ty(&mut slot, scx, &param.ty);
        ck.env.bind(&param.name, slot);
    }
    if let Some(body) = &proc.body {
        ck.check_block(body);
    }
    ck.env.pop();
    ck.results
}

fn apply_ty(slot: &mut Slot, scx: &ScopeContext, ty: &Ty) {
    match &**strip_perm(ty) {
        TyKind::ModalState { path, state } => {
            slot.modal_path = Some(path.clone());
            slot.modal_state = Some(state.clone());
        }
        TyKind::Path(path) if scx.modal_decl(path).is_some() => {
            slot.modal_path = Some(path.clone());
            slot.modal_state = None;
        }
        _ => {}
    }
}

struct OwnershipCk<'a> {
    scx: &'a ScopeContext,
    results: OwnershipResults,
    env: Env,
}

impl<'a> OwnershipCk<'a> {
    fn error(&mut self, span: Span, kind: AnalysisErrorKind) {
        trace!("ownership error: {:?}", kind);
        self.results.errors.push(AnalysisError::new(span, kind));
    }

    /// Checks a block; returns true when control cannot fall out the end.
    fn check_block(&mut self, block: &Block) -> bool {
        self.env.push();
        let mut diverged = false;
        for stmt in &block.stmts {
            if diverged {
                break;
            }
            diverged = self.check_stmt(stmt);
        }
        if !diverged {
            if let Some(expr) = &block.expr {
                self.check_expr(expr);
            }
        }
        self.env.pop();
        diverged
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> bool {
        match &stmt.kind {
            StmtKind::Let { pattern, ty, init, .. } => {
                self.check_expr(init);
                self.bind_pattern(pattern, ty.as_ref().or_else(|| self.scx.expr_ty(init.id)));
                false
            }
            StmtKind::Assign { place, value } => {
                self.check_expr(value);
                self.check_assign_place(place);
                false
            }
            StmtKind::Expr(expr) => {
                self.check_expr(expr);
                false
            }
            StmtKind::Return(expr) => {
                if let Some(expr) = expr {
                    self.check_expr(expr);
                }
                true
            }
            StmtKind::Break(expr) => {
                if let Some(expr) = expr {
                    self.check_expr(expr);
                }
                true
            }
            StmtKind::Continue => true,
            StmtKind::Defer(block) => {
                // Deferred bodies run at scope exit with whatever is live
                // then; check them against the current approximation.
                let saved = self.env.clone();
                self.check_block(block);
                self.env = saved;
                false
            }
            StmtKind::Region { alias, body } => {
                self.env.push();
                if let Some(alias) = alias {
                    self.env.bind(
                        alias,
                        Slot {
                            responsibility: Responsibility::Alias,
                            movability: Movability::Immov,
                            modal_path: Some(cursive_ast::env::region_modal_path()),
                            modal_state: Some("Active".to_string()),
                            state: BindState::Valid,
                        },
                    );
                }
                let diverged = self.check_block(body);
                self.env.pop();
                diverged
            }
            StmtKind::Frame { body, .. } | StmtKind::KeyBlock { body, .. } => {
                self.check_block(body)
            }
            StmtKind::Parallel { domain, body } => {
                self.check_expr(domain);
                self.check_block(body);
                false
            }
            StmtKind::Loop { kind, body } => {
                if let LoopKind::While(cond) = kind {
                    self.check_expr(cond);
                }
                if let LoopKind::For { binder, iter } = kind {
                    self.check_expr(iter);
                    self.env.push();
                    self.env.bind(binder, Slot::owned());
                }
                // First pass establishes the body's effect; the second runs
                // from the joined entry state, which is the fixpoint for
                // this finite-height lattice.
                let entry = self.env.clone();
                self.check_block(body);
                self.env.join(&entry);
                let joined = self.env.clone();
                self.check_block(body);
                self.env.join(&joined);
                if let LoopKind::For { .. } = kind {
                    self.env.pop();
                }
                false
            }
            StmtKind::Error => false,
        }
    }

    fn bind_pattern(&mut self, pattern: &Pattern, ty: Option<&Ty>) {
        match &pattern.kind {
            PatternKind::Ident { name, .. } => {
                let mut slot = Slot::owned();
                if let Some(ty) = ty {
                    apply_ty(&mut slot, self.scx, ty);
                }
                self.env.bind(name, slot);
            }
            _ => {
                let mut names = Vec::new();
                pattern.bound_names(&mut names);
                for name in names {
                    self.env.bind(&name, Slot::owned());
                }
            }
        }
    }

    fn check_assign_place(&mut self, place: &Expr) {
        match &place.kind {
            ExprKind::Path(path) if path.segments.len() == 1 => {
                let name = &path.segments[0];
                let Some(slot) = self.env.get(name) else {
                    // Statics and the like; nothing to track locally.
                    return;
                };
                if slot.state == BindState::Valid
                    && slot.responsibility == Responsibility::Resp
                {
                    self.results.drop_on_assign.insert(place.id);
                }
                if let Some(slot) = self.env.get_mut(name) {
                    slot.state = BindState::Valid;
                }
            }
            ExprKind::Field { base, name: field } => {
                if let ExprKind::Path(path) = &base.kind {
                    if path.segments.len() == 1 {
                        let root = &path.segments[0];
                        let folded_field = fold_ident(field);
                        match self.env.get(root).map(|s| s.state.clone()) {
                            Some(BindState::Moved) => {
                                self.error(
                                    place.span,
                                    AnalysisErrorKind::UseAfterMove { name: root.clone() },
                                );
                            }
                            Some(BindState::PartiallyMoved { mut fields }) => {
                                if fields.remove(&folded_field) {
                                    self.results.no_drop_stores.insert(place.id);
                                } else {
                                    self.results.drop_on_assign.insert(place.id);
                                }
                                let state = if fields.is_empty() {
                                    BindState::Valid
                                } else {
                                    BindState::PartiallyMoved { fields }
                                };
                                if let Some(slot) = self.env.get_mut(root) {
                                    slot.state = state;
                                }
                            }
                            Some(BindState::Valid) => {
                                self.results.drop_on_assign.insert(place.id);
                            }
                            None => {}
                        }
                        return;
                    }
                }
                self.check_expr(base);
            }
            _ => self.check_expr(place),
        }
    }

    fn check_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Lit(_) | ExprKind::Error => {}
            ExprKind::Path(path) => {
                if path.segments.len() == 1 {
                    self.check_read(expr.span, &path.segments[0], None);
                }
            }
            ExprKind::Unary { expr, .. }
            | ExprKind::Cast { expr, .. }
            | ExprKind::Transmute { expr, .. }
            | ExprKind::Deref { expr }
            | ExprKind::Propagate { expr }
            | ExprKind::Wait { handle: expr } => self.check_expr(expr),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.check_expr(lhs);
                self.check_expr(rhs);
            }
            ExprKind::Call { callee, args } => {
                self.check_expr(callee);
                self.check_args(args);
            }
            ExprKind::MethodCall { recv, name, args } => {
                self.check_method_call(expr.span, recv, name, args);
            }
            ExprKind::Field { base, name } => {
                if let ExprKind::Path(path) = &base.kind {
                    if path.segments.len() == 1 {
                        self.check_read(expr.span, &path.segments[0], Some(name));
                        return;
                    }
                }
                self.check_expr(base);
            }
            ExprKind::TupleField { base, .. } => self.check_expr(base),
            ExprKind::Index { base, index } => {
                self.check_expr(base);
                self.check_expr(index);
            }
            ExprKind::Range { lo, hi, .. } => {
                if let Some(lo) = lo {
                    self.check_expr(lo);
                }
                if let Some(hi) = hi {
                    self.check_expr(hi);
                }
            }
            ExprKind::Tuple(elems) | ExprKind::Array(elems) => {
                for e in elems {
                    self.check_expr(e);
                }
            }
            ExprKind::RecordLit { fields, .. } => {
                for (_, e) in fields {
                    self.check_expr(e);
                }
            }
            ExprKind::EnumLit { payload, .. } => match payload {
                Some(cursive_ast::ast::EnumPayloadExpr::Tuple(elems)) => {
                    for e in elems {
                        self.check_expr(e);
                    }
                }
                Some(cursive_ast::ast::EnumPayloadExpr::Record(fields)) => {
                    for (_, e) in fields {
                        self.check_expr(e);
                    }
                }
                None => {}
            },
            ExprKind::AddrOf { place } => self.check_expr(place),
            ExprKind::Move { place } => self.check_move(place),
            ExprKind::Alloc { value, region } => {
                self.check_expr(value);
                if let Some(region) = region {
                    self.check_expr(region);
                }
            }
            ExprKind::If { cond, then_blk, else_expr } => {
                self.check_expr(cond);
                let before = self.env.clone();
                self.check_block(then_blk);
                let after_then = std::mem::replace(&mut self.env, before);
                if let Some(else_expr) = else_expr {
                    self.check_expr(else_expr);
                }
                self.env.join(&after_then);
            }
            ExprKind::Match { scrutinee, arms } => {
                self.check_expr(scrutinee);
                let before = self.env.clone();
                let mut joined: Option<Env> = None;
                for arm in arms {
                    self.env = before.clone();
                    self.env.push();
                    self.bind_pattern(&arm.pattern, self.scx.expr_ty(scrutinee.id));
                    if let Some(guard) = &arm.guard {
                        self.check_expr(guard);
                    }
                    self.check_expr(&arm.body);
                    self.env.pop();
                    match &mut joined {
                        None => joined = Some(self.env.clone()),
                        Some(j) => j.join(&self.env),
                    }
                }
                self.env = joined.unwrap_or(before);
            }
            ExprKind::Block(block) => {
                self.check_block(block);
            }
            ExprKind::Spawn { moves, body } => {
                for name in moves {
                    self.mark_moved(expr.span, name, None);
                }
                let saved = self.env.clone();
                self.check_block(body);
                self.env = saved;
            }
            ExprKind::Dispatch { range, chunk, body, binder, .. } => {
                self.check_expr(range);
                if let Some(chunk) = chunk {
                    self.check_expr(chunk);
                }
                self.env.push();
                self.env.bind(binder, Slot::owned());
                self.check_block(body);
                self.env.pop();
            }
        }
    }

    fn check_args(&mut self, args: &[Arg]) {
        for arg in args {
            if arg.by_move {
                if let ExprKind::Path(path) = &arg.expr.kind {
                    if path.segments.len() == 1 {
                        self.mark_moved(arg.expr.span, &path.segments[0], None);
                        continue;
                    }
                }
            }
            self.check_expr(&arg.expr);
        }
    }

    fn check_method_call(&mut self, span: Span, recv: &Expr, name: &str, args: &[Arg]) {
        self.check_expr(recv);
        self.check_args(args);
        // Modal receivers: state-specific methods need a known state, and a
        // transition annotation retargets the binding's state.
        let ExprKind::Path(path) = &recv.kind else { return };
        if path.segments.len() != 1 {
            return;
        }
        let binding = &path.segments[0];
        let Some((modal_path, current_state)) = self
            .env
            .get(binding)
            .map(|s| (s.modal_path.clone(), s.modal_state.clone()))
        else {
            return;
        };
        let Some(modal_path) = modal_path else { return };
        let Some(decl) = self.scx.modal_decl(&modal_path) else { return };
        let folded = fold_ident(name);
        let mut transition = None;
        let mut declaring_states = Vec::new();
        for state in &decl.states {
            for method in &state.methods {
                if fold_ident(&method.proc.name) == folded {
                    declaring_states.push(fold_ident(&state.name));
                    transition = method.transitions_to.clone();
                }
            }
        }
        if declaring_states.is_empty() {
            return;
        }
        match &current_state {
            None => {
                self.error(
                    span,
                    AnalysisErrorKind::StateRequired {
                        name: binding.clone(),
                        method: name.to_string(),
                    },
                );
            }
            Some(current) => {
                if !declaring_states.contains(&fold_ident(current)) {
                    self.error(
                        span,
                        AnalysisErrorKind::StateMismatch {
                            expected: declaring_states[0].clone(),
                            found: current.clone(),
                        },
                    );
                } else if let Some(next) = transition {
                    if let Some(slot) = self.env.get_mut(binding) {
                        slot.modal_state = Some(next);
                    }
                }
            }
        }
    }

    fn check_read(&mut self, span: Span, name: &str, field: Option<&str>) {
        let Some(state) = self.env.get(name).map(|s| s.state.clone()) else { return };
        match &state {
            BindState::Valid => {}
            BindState::Moved => {
                self.error(span, AnalysisErrorKind::UseAfterMove { name: name.to_string() });
            }
            BindState::PartiallyMoved { fields } => match field {
                Some(f) => {
                    if fields.contains(&fold_ident(f)) {
                        self.error(
                            span,
                            AnalysisErrorKind::UseOfMovedField {
                                name: name.to_string(),
                                field: f.to_string(),
                            },
                        );
                    }
                }
                None => {
                    let field = fields.iter().next().cloned().unwrap_or_default();
                    self.error(
                        span,
                        AnalysisErrorKind::UseOfMovedField { name: name.to_string(), field },
                    );
                }
            },
        }
    }

    fn check_move(&mut self, place: &Expr) {
        match &place.kind {
            ExprKind::Path(path) if path.segments.len() == 1 => {
                self.mark_moved(place.span, &path.segments[0], None);
            }
            ExprKind::Field { base, name } => {
                if let ExprKind::Path(path) = &base.kind {
                    if path.segments.len() == 1 {
                        self.mark_moved(place.span, &path.segments[0], Some(name));
                        return;
                    }
                }
                self.check_expr(base);
            }
            _ => self.check_expr(place),
        }
    }

    fn mark_moved(&mut self, span: Span, name: &str, field: Option<&str>) {
        let Some((movability, responsibility, state)) = self
            .env
            .get(name)
            .map(|s| (s.movability, s.responsibility, s.state.clone()))
        else {
            self.error(span, AnalysisErrorKind::UnknownBinding { name: name.to_string() });
            return;
        };
        if movability == Movability::Immov {
            self.error(span, AnalysisErrorKind::MoveOfImmovable { name: name.to_string() });
            return;
        }
        if responsibility == Responsibility::Alias {
            self.error(span, AnalysisErrorKind::MoveFromAlias { name: name.to_string() });
            return;
        }
        match (state, field) {
            (BindState::Moved, _) => {
                self.error(span, AnalysisErrorKind::UseAfterMove { name: name.to_string() });
            }
            (BindState::Valid, None) => {
                if let Some(slot) = self.env.get_mut(name) {
                    slot.state = BindState::Moved;
                }
            }
            (BindState::Valid, Some(f)) => {
                if let Some(slot) = self.env.get_mut(name) {
                    let mut fields = std::collections::BTreeSet::new();
                    fields.insert(fold_ident(f));
                    slot.state = BindState::PartiallyMoved { fields };
                }
            }
            (BindState::PartiallyMoved { fields }, None) => {
                let field = fields.iter().next().cloned().unwrap_or_default();
                self.error(
                    span,
                    AnalysisErrorKind::UseOfMovedField { name: name.to_string(), field },
                );
            }
            (BindState::PartiallyMoved { mut fields }, Some(f)) => {
                let folded = fold_ident(f);
                if !fields.insert(folded) {
                    self.error(
                        span,
                        AnalysisErrorKind::UseOfMovedField {
                            name: name.to_string(),
                            field: f.to_string(),
                        },
                    );
                } else if let Some(slot) = self.env.get_mut(name) {
                    slot.state = BindState::PartiallyMoved { fields };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::ast::*;
    use cursive_ast::types::{mk_prim, mk_unit, PrimTy};

    fn expr(id: u32, kind: ExprKind) -> Expr {
        Expr::new(NodeId(id), kind)
    }

    fn path_expr(id: u32, name: &str) -> Expr {
        expr(id, ExprKind::Path(Path::single(name)))
    }

    fn move_expr(id: u32, name: &str) -> Expr {
        expr(id, ExprKind::Move { place: Box::new(path_expr(id + 1000, name)) })
    }

    fn let_stmt(name: &str, init: Expr) -> Stmt {
        Stmt::new(StmtKind::Let {
            pattern: Pattern::new(PatternKind::Ident { name: name.into(), by_move: false }),
            ty: None,
            init,
            mutable: false,
        })
    }

    fn proc_with_body(stmts: Vec<Stmt>) -> ProcDecl {
        ProcDecl {
            name: "test".into(),
            params: vec![],
            ret: mk_unit(),
            body: Some(Block::new(stmts, None)),
            is_extern: false,
        }
    }

    fn int_lit(id: u32, v: i64) -> Expr {
        expr(
            id,
            ExprKind::Lit(Lit::Int {
                negative: v < 0,
                magnitude: v.unsigned_abs() as u128,
                ty: Some(mk_prim(PrimTy::Int(cursive_ast::types::IntTy::I32))),
            }),
        )
    }

    #[test]
    fn use_after_move_is_rejected() {
        let scx = ScopeContext::new();
        let proc = proc_with_body(vec![
            let_stmt("x", int_lit(1, 1)),
            let_stmt("y", move_expr(2, "x")),
            Stmt::new(StmtKind::Expr(path_expr(3, "x"))),
        ]);
        let results = check_proc(&scx, &proc);
        assert!(results
            .errors
            .iter()
            .any(|e| matches!(&e.kind, AnalysisErrorKind::UseAfterMove { name } if name == "x")));
    }

    #[test]
    fn reassignment_restores_validity() {
        let scx = ScopeContext::new();
        let proc = proc_with_body(vec![
            let_stmt("x", int_lit(1, 1)),
            let_stmt("y", move_expr(2, "x")),
            Stmt::new(StmtKind::Assign { place: path_expr(3, "x"), value: int_lit(4, 2) }),
            Stmt::new(StmtKind::Expr(path_expr(5, "x"))),
        ]);
        let results = check_proc(&scx, &proc);
        assert!(results.errors.is_empty(), "{:?}", results.errors);
        // Assigning over a moved binding does not drop the missing value.
        assert!(!results.drop_on_assign.contains(&NodeId(3)));
    }

    #[test]
    fn move_in_one_branch_moves_at_join() {
        let scx = ScopeContext::new();
        let if_expr = expr(
            10,
            ExprKind::If {
                cond: expr(11, ExprKind::Lit(Lit::Bool(true))).into(),
                then_blk: Block::new(
                    vec![Stmt::new(StmtKind::Expr(move_expr(12, "x")))],
                    None,
                ),
                else_expr: None,
            },
        );
        let proc = proc_with_body(vec![
            let_stmt("x", int_lit(1, 1)),
            Stmt::new(StmtKind::Expr(if_expr)),
            Stmt::new(StmtKind::Expr(path_expr(20, "x"))),
        ]);
        let results = check_proc(&scx, &proc);
        assert!(results
            .errors
            .iter()
            .any(|e| matches!(&e.kind, AnalysisErrorKind::UseAfterMove { name } if name == "x")));
    }

    #[test]
    fn loop_back_edge_sees_first_iteration_move() {
        let scx = ScopeContext::new();
        let body = Block::new(vec![Stmt::new(StmtKind::Expr(move_expr(10, "x")))], None);
        let proc = proc_with_body(vec![
            let_stmt("x", int_lit(1, 1)),
            Stmt::new(StmtKind::Loop { kind: LoopKind::Loop, body }),
        ]);
        let results = check_proc(&scx, &proc);
        // Second iteration moves an already-moved binding.
        assert!(results
            .errors
            .iter()
            .any(|e| matches!(&e.kind, AnalysisErrorKind::UseAfterMove { .. })));
    }

    #[test]
    fn field_move_then_whole_read_is_rejected() {
        let scx = ScopeContext::new();
        let field_move = expr(
            10,
            ExprKind::Move {
                place: Box::new(expr(
                    11,
                    ExprKind::Field { base: Box::new(path_expr(12, "r")), name: "a".into() },
                )),
            },
        );
        let proc = proc_with_body(vec![
            let_stmt("r", int_lit(1, 1)),
            Stmt::new(StmtKind::Expr(field_move)),
            Stmt::new(StmtKind::Expr(path_expr(20, "r"))),
        ]);
        let results = check_proc(&scx, &proc);
        assert!(results
            .errors
            .iter()
            .any(|e| matches!(&e.kind, AnalysisErrorKind::UseOfMovedField { .. })));
    }

    #[test]
    fn field_assign_into_partial_move_is_no_drop() {
        let scx = ScopeContext::new();
        let field_move = expr(
            10,
            ExprKind::Move {
                place: Box::new(expr(
                    11,
                    ExprKind::Field { base: Box::new(path_expr(12, "r")), name: "a".into() },
                )),
            },
        );
        let assign_place =
            expr(20, ExprKind::Field { base: Box::new(path_expr(21, "r")), name: "a".into() });
        let proc = proc_with_body(vec![
            let_stmt("r", int_lit(1, 1)),
            Stmt::new(StmtKind::Expr(field_move)),
            Stmt::new(StmtKind::Assign { place: assign_place, value: int_lit(22, 5) }),
            Stmt::new(StmtKind::Expr(path_expr(30, "r"))),
        ]);
        let results = check_proc(&scx, &proc);
        assert!(results.errors.is_empty(), "{:?}", results.errors);
        assert!(results.no_drop_stores.contains(&NodeId(20)));
    }
}
