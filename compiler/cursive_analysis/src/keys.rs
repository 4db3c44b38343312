//! Key acquisition checking.
//!
//! A key is a path-named abstract lock taken in read or write mode around a
//! block. Acquisition conflicts when the new path overlaps (is a prefix of,
//! or is prefixed by) a held path and either side wants write access.
//! Dynamic keys are opaque: they may stand for any path in their declared
//! scope, so they overlap everything.

use tracing::trace;

use cursive_ast::ast::{
    Block, Expr, ExprKind, KeyAcquire, KeyMode, LoopKind, ProcDecl, Stmt, StmtKind,
};
use cursive_ast::span::Span;

use crate::errors::{AnalysisError, AnalysisErrorKind};

pub fn check_proc(proc: &ProcDecl) -> Vec<AnalysisError> {
    let mut ck = KeyCk::default();
    if let Some(body) = &proc.body {
        ck.check_block(body);
    }
    ck.errors
}

fn overlap(a: &KeyAcquire, b: &KeyAcquire) -> bool {
    if a.dynamic || b.dynamic {
        return true;
    }
    a.path.is_prefix_of(&b.path) || b.path.is_prefix_of(&a.path)
}

/// Write excludes any overlap; read excludes overlapping writes.
fn conflicts(held: &KeyAcquire, requested: &KeyAcquire) -> bool {
    overlap(held, requested)
        && (held.mode == KeyMode::Write || requested.mode == KeyMode::Write)
}

#[derive(Default)]
struct KeyCk {
    errors: Vec<AnalysisError>,
    held: Vec<KeyAcquire>,
}

impl KeyCk {
    fn error(&mut self, span: Span, kind: AnalysisErrorKind) {
        trace!("key error: {:?}", kind);
        self.errors.push(AnalysisError::new(span, kind));
    }

    fn check_block(&mut self, block: &Block) {
        for stmt in &block.stmts {
            self.check_stmt(stmt);
        }
        if let Some(expr) = &block.expr {
            self.check_expr(expr);
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::KeyBlock { keys, release, body } => {
                let base = self.held.len();
                for key in keys {
                    let conflict = self
                        .held
                        .iter()
                        .find(|h| conflicts(h, key))
                        .map(|h| h.path.to_string());
                    match conflict {
                        Some(held) => self.error(
                            stmt.span,
                            AnalysisErrorKind::KeyConflict {
                                held,
                                requested: key.path.to_string(),
                            },
                        ),
                        None => self.held.push(key.clone()),
                    }
                }
                if *release {
                    // Keys were only needed for the acquisition check; the
                    // block body runs without them.
                    self.held.truncate(base);
                    self.check_block(body);
                } else {
                    self.check_block(body);
                    self.held.truncate(base);
                }
            }
            StmtKind::Let { init, .. } => self.check_expr(init),
            StmtKind::Assign { place, value } => {
                self.check_expr(place);
                self.check_expr(value);
            }
            StmtKind::Expr(expr)
            | StmtKind::Return(Some(expr))
            | StmtKind::Break(Some(expr)) => self.check_expr(expr),
            StmtKind::Return(None) | StmtKind::Break(None) | StmtKind::Continue => {}
            StmtKind::Defer(body)
            | StmtKind::Region { body, .. }
            | StmtKind::Frame { body, .. } => self.check_block(body),
            StmtKind::Parallel { domain, body } => {
                self.check_expr(domain);
                self.check_block(body);
            }
            StmtKind::Loop { kind, body } => {
                if let LoopKind::While(cond) = kind {
                    self.check_expr(cond);
                }
                if let LoopKind::For { iter, .. } = kind {
                    self.check_expr(iter);
                }
                self.check_block(body);
            }
            StmtKind::Error => {}
        }
    }

    /// Branch bodies may acquire and release keys internally; the held set
    /// at the join is the intersection of what each branch ends with.
    fn join_branches(&mut self, branch_ends: Vec<Vec<KeyAcquire>>) {
        let Some(first) = branch_ends.first() else { return };
        let intersection: Vec<KeyAcquire> = first
            .iter()
            .filter(|k| {
                branch_ends.iter().all(|end| {
                    end.iter().any(|other| {
                        other.path == k.path && other.mode == k.mode && other.dynamic == k.dynamic
                    })
                })
            })
            .cloned()
            .collect();
        self.held = intersection;
    }

    fn check_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::If { cond, then_blk, else_expr } => {
                self.check_expr(cond);
                let before = self.held.clone();
                self.check_block(then_blk);
                let after_then = std::mem::replace(&mut self.held, before.clone());
                if let Some(else_expr) = else_expr {
                    self.check_expr(else_expr);
                }
                let after_else = std::mem::replace(&mut self.held, before);
                self.join_branches(vec![after_then, after_else]);
            }
            ExprKind::Match { scrutinee, arms } => {
                self.check_expr(scrutinee);
                let before = self.held.clone();
                let mut ends = Vec::with_capacity(arms.len());
                for arm in arms {
                    self.held = before.clone();
                    if let Some(guard) = &arm.guard {
                        self.check_expr(guard);
                    }
                    self.check_expr(&arm.body);
                    ends.push(self.held.clone());
                }
                if ends.is_empty() {
                    self.held = before;
                } else {
                    self.join_branches(ends);
                }
            }
            ExprKind::Block(block) => self.check_block(block),
            ExprKind::Spawn { body, .. } => self.check_block(body),
            ExprKind::Dispatch { range, chunk, body, .. } => {
                self.check_expr(range);
                if let Some(chunk) = chunk {
                    self.check_expr(chunk);
                }
                self.check_block(body);
            }
            ExprKind::Unary { expr, .. }
            | ExprKind::Cast { expr, .. }
            | ExprKind::Transmute { expr, .. }
            | ExprKind::Deref { expr }
            | ExprKind::Propagate { expr }
            | ExprKind::Move { place: expr }
            | ExprKind::AddrOf { place: expr }
            | ExprKind::Wait { handle: expr } => self.check_expr(expr),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.check_expr(lhs);
                self.check_expr(rhs);
            }
            ExprKind::Call { callee, args } => {
                self.check_expr(callee);
                for arg in args {
                    self.check_expr(&arg.expr);
                }
            }
            ExprKind::MethodCall { recv, args, .. } => {
                self.check_expr(recv);
                for arg in args {
                    self.check_expr(&arg.expr);
                }
            }
            ExprKind::Field { base, .. } | ExprKind::TupleField { base, .. } => {
                self.check_expr(base)
            }
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
            ExprKind::Alloc { value, region } => {
                self.check_expr(value);
                if let Some(region) = region {
                    self.check_expr(region);
                }
            }
            ExprKind::Lit(_) | ExprKind::Path(_) | ExprKind::Error => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::path::Path;
    use cursive_ast::types::mk_unit;

    fn key(path: Vec<&str>, mode: KeyMode) -> KeyAcquire {
        KeyAcquire { path: Path::from_segments(path), mode, dynamic: false }
    }

    fn key_block(keys: Vec<KeyAcquire>, body: Block) -> Stmt {
        Stmt::new(StmtKind::KeyBlock { keys, release: false, body })
    }

    fn check(stmts: Vec<Stmt>) -> Vec<AnalysisError> {
        let proc = ProcDecl {
            name: "test".into(),
            params: vec![],
            ret: mk_unit(),
            body: Some(Block::new(stmts, None)),
            is_extern: false,
        };
        check_proc(&proc)
    }

    #[test]
    fn nested_write_under_write_prefix_conflicts() {
        let inner = key_block(vec![key(vec!["a", "b", "c"], KeyMode::Write)], Block::new(vec![], None));
        let outer = key_block(vec![key(vec!["a", "b"], KeyMode::Write)], Block::new(vec![inner], None));
        let errors = check(vec![outer]);
        assert!(errors.iter().any(|e| matches!(e.kind, AnalysisErrorKind::KeyConflict { .. })));
    }

    #[test]
    fn read_under_read_is_fine() {
        let inner = key_block(vec![key(vec!["a", "b"], KeyMode::Read)], Block::new(vec![], None));
        let outer = key_block(vec![key(vec!["a"], KeyMode::Read)], Block::new(vec![inner], None));
        assert!(check(vec![outer]).is_empty());
    }

    #[test]
    fn write_under_read_overlap_conflicts() {
        let inner = key_block(vec![key(vec!["a", "b"], KeyMode::Write)], Block::new(vec![], None));
        let outer = key_block(vec![key(vec!["a"], KeyMode::Read)], Block::new(vec![inner], None));
        let errors = check(vec![outer]);
        assert!(errors.iter().any(|e| matches!(e.kind, AnalysisErrorKind::KeyConflict { .. })));
    }

    #[test]
    fn disjoint_writes_are_fine() {
        let inner = key_block(vec![key(vec!["b"], KeyMode::Write)], Block::new(vec![], None));
        let outer = key_block(vec![key(vec!["a"], KeyMode::Write)], Block::new(vec![inner], None));
        assert!(check(vec![outer]).is_empty());
    }

    #[test]
    fn dynamic_key_conflicts_with_everything() {
        let dynamic = KeyAcquire { path: Path::single("d"), mode: KeyMode::Read, dynamic: true };
        let inner = key_block(
            vec![key(vec!["unrelated"], KeyMode::Write)],
            Block::new(vec![], None),
        );
        let outer = key_block(vec![dynamic], Block::new(vec![inner], None));
        let errors = check(vec![outer]);
        assert!(errors.iter().any(|e| matches!(e.kind, AnalysisErrorKind::KeyConflict { .. })));
    }

    #[test]
    fn sibling_blocks_release_between() {
        let first = key_block(vec![key(vec!["a"], KeyMode::Write)], Block::new(vec![], None));
        let second = key_block(vec![key(vec!["a"], KeyMode::Write)], Block::new(vec![], None));
        assert!(check(vec![first, second]).is_empty());
    }

    #[test]
    fn multi_key_block_checks_pairwise() {
        let both = key_block(
            vec![key(vec!["a"], KeyMode::Write), key(vec!["a", "b"], KeyMode::Read)],
            Block::new(vec![], None),
        );
        let errors = check(vec![both]);
        assert!(errors.iter().any(|e| matches!(e.kind, AnalysisErrorKind::KeyConflict { .. })));
    }
}
