//! Region and frame validation: nesting, alloc targeting, and the static
//! approximation of pointer-lifetime-vs-region checking.
//!
//! The dynamic side (generation tags, `ExpiredDeref`) lives in Σ; this pass
//! rejects the programs where the escape is already visible statically: an
//! `alloc` with no active region, a frame outside every region, and a
//! binding that captures a pointer into a region and is read after the
//! region's block ends.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

use cursive_ast::ast::{Block, Expr, ExprKind, LoopKind, ProcDecl, Stmt, StmtKind};
use cursive_ast::env::ScopeContext;
use cursive_ast::path::fold_ident;
use cursive_ast::span::Span;

use crate::errors::{AnalysisError, AnalysisErrorKind};

pub fn check_proc(_scx: &ScopeContext, proc: &ProcDecl) -> Vec<AnalysisError> {
    let mut ck = RegionCk::default();
    if let Some(body) = &proc.body {
        ck.check_block(body);
    }
    ck.errors
}

#[derive(Default)]
struct RegionCk {
    errors: Vec<AnalysisError>,
    /// Innermost-last stack of active region blocks; the entry holds the
    /// folded alias name when the block bound one.
    region_stack: SmallVec<[Option<String>; 4]>,
    /// Bindings known to hold a pointer into the region at the given depth.
    ptr_regions: FxHashMap<String, usize>,
    /// Bindings whose target region has ended.
    expired: FxHashMap<String, Span>,
}

impl RegionCk {
    fn error(&mut self, span: Span, kind: AnalysisErrorKind) {
        trace!("region error: {:?}", kind);
        self.errors.push(AnalysisError::new(span, kind));
    }

    fn resolve_region(&self, name: &str) -> Option<usize> {
        let folded = fold_ident(name);
        self.region_stack
            .iter()
            .rposition(|alias| alias.as_deref() == Some(folded.as_str()))
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
            StmtKind::Region { alias, body } => {
                self.region_stack.push(alias.as_ref().map(|a| fold_ident(a)));
                self.check_block(body);
                self.region_stack.pop();
                let ended = self.region_stack.len();
                // Everything pointing into the closed region is now expired.
                let stale: Vec<String> = self
                    .ptr_regions
                    .iter()
                    .filter(|(_, depth)| **depth >= ended)
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in stale {
                    self.ptr_regions.remove(&name);
                    self.expired.insert(name, stmt.span);
                }
            }
            StmtKind::Frame { region, body } => {
                match region {
                    Some(name) => {
                        if self.resolve_region(name).is_none() {
                            self.error(
                                stmt.span,
                                AnalysisErrorKind::UnknownRegion { name: name.clone() },
                            );
                        }
                    }
                    None => {
                        if self.region_stack.is_empty() {
                            self.error(stmt.span, AnalysisErrorKind::FrameOutsideRegion);
                        }
                    }
                }
                self.check_block(body);
            }
            StmtKind::Let { pattern, init, .. } => {
                self.check_expr(init);
                if let Some(depth) = self.expr_region_depth(init) {
                    let mut names = Vec::new();
                    pattern.bound_names(&mut names);
                    for name in names {
                        self.ptr_regions.insert(fold_ident(&name), depth);
                    }
                }
            }
            StmtKind::Assign { place, value } => {
                self.check_expr(value);
                self.check_expr(place);
                if let ExprKind::Path(path) = &place.kind {
                    if path.segments.len() == 1 {
                        let folded = fold_ident(&path.segments[0]);
                        match self.expr_region_depth(value) {
                            Some(depth) => {
                                self.expired.remove(&folded);
                                self.ptr_regions.insert(folded, depth);
                            }
                            None => {
                                self.expired.remove(&folded);
                                self.ptr_regions.remove(&folded);
                            }
                        }
                    }
                }
            }
            StmtKind::Expr(expr) | StmtKind::Return(Some(expr)) | StmtKind::Break(Some(expr)) => {
                self.check_expr(expr);
            }
            StmtKind::Return(None) | StmtKind::Break(None) | StmtKind::Continue => {}
            StmtKind::Defer(body) | StmtKind::KeyBlock { body, .. } => self.check_block(body),
            StmtKind::Parallel { domain, body } => {
                self.check_expr(domain);
                self.check_block(body);
            }
            StmtKind::Loop { kind, body } => {
                match kind {
                    LoopKind::While(cond) => self.check_expr(cond),
                    LoopKind::For { iter, .. } => self.check_expr(iter),
                    LoopKind::Loop => {}
                }
                self.check_block(body);
            }
            StmtKind::Error => {}
        }
    }

    /// The depth of the innermost region an expression allocates into, when
    /// the expression produces a pointer tied to that region.
    fn expr_region_depth(&mut self, expr: &Expr) -> Option<usize> {
        match &expr.kind {
            ExprKind::Alloc { region, .. } => match region {
                Some(region_expr) => match &region_expr.kind {
                    ExprKind::Path(path) if path.segments.len() == 1 => {
                        self.resolve_region(&path.segments[0])
                    }
                    _ => self.region_stack.len().checked_sub(1),
                },
                None => self.region_stack.len().checked_sub(1),
            },
            ExprKind::AddrOf { place } => self.expr_region_depth(place),
            ExprKind::Path(path) if path.segments.len() == 1 => {
                self.ptr_regions.get(&fold_ident(&path.segments[0])).copied()
            }
            _ => None,
        }
    }

    fn check_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Path(path) if path.segments.len() == 1 => {
                let folded = fold_ident(&path.segments[0]);
                if self.expired.contains_key(&folded) {
                    self.error(
                        expr.span,
                        AnalysisErrorKind::PointerOutlivesRegion {
                            name: path.segments[0].clone(),
                        },
                    );
                }
            }
            ExprKind::Alloc { value, region } => {
                self.check_expr(value);
                match region {
                    Some(region_expr) => {
                        if let ExprKind::Path(path) = &region_expr.kind {
                            if path.segments.len() == 1
                                && self.resolve_region(&path.segments[0]).is_none()
                            {
                                self.error(
                                    expr.span,
                                    AnalysisErrorKind::UnknownRegion {
                                        name: path.segments[0].clone(),
                                    },
                                );
                            }
                        }
                    }
                    None => {
                        if self.region_stack.is_empty() {
                            self.error(expr.span, AnalysisErrorKind::AllocOutsideRegion);
                        }
                    }
                }
            }
            ExprKind::Lit(_) | ExprKind::Error | ExprKind::Path(_) => {}
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
            ExprKind::If { cond, then_blk, else_expr } => {
                self.check_expr(cond);
                self.check_block(then_blk);
                if let Some(else_expr) = else_expr {
                    self.check_expr(else_expr);
                }
            }
            ExprKind::Match { scrutinee, arms } => {
                self.check_expr(scrutinee);
                for arm in arms {
                    if let Some(guard) = &arm.guard {
                        self.check_expr(guard);
                    }
                    self.check_expr(&arm.body);
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
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::ast::{NodeId, Pattern, PatternKind};
    use cursive_ast::path::Path;
    use cursive_ast::types::mk_unit;

    fn expr(id: u32, kind: ExprKind) -> Expr {
        Expr::new(NodeId(id), kind)
    }

    fn alloc_expr(id: u32) -> Expr {
        expr(
            id,
            ExprKind::Alloc {
                value: Box::new(expr(id + 100, ExprKind::Lit(cursive_ast::ast::Lit::Unit))),
                region: None,
            },
        )
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

    #[test]
    fn alloc_outside_region_is_rejected() {
        let proc = proc_with_body(vec![Stmt::new(StmtKind::Expr(alloc_expr(1)))]);
        let errors = check_proc(&ScopeContext::new(), &proc);
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, AnalysisErrorKind::AllocOutsideRegion)));
    }

    #[test]
    fn frame_outside_region_is_rejected() {
        let proc = proc_with_body(vec![Stmt::new(StmtKind::Frame {
            region: None,
            body: Block::new(vec![], None),
        })]);
        let errors = check_proc(&ScopeContext::new(), &proc);
        assert!(errors
            .iter()
            .any(|e| matches!(e.kind, AnalysisErrorKind::FrameOutsideRegion)));
    }

    #[test]
    fn pointer_read_after_region_end_is_rejected() {
        // region r { let p = &(alloc () in r); }  ... use p
        let addr_of = expr(
            1,
            ExprKind::AddrOf {
                place: Box::new(expr(
                    2,
                    ExprKind::Alloc {
                        value: Box::new(expr(3, ExprKind::Lit(cursive_ast::ast::Lit::Unit))),
                        region: Some(Box::new(expr(4, ExprKind::Path(Path::single("r"))))),
                    },
                )),
            },
        );
        let region_stmt = Stmt::new(StmtKind::Region {
            alias: Some("r".into()),
            body: Block::new(
                vec![Stmt::new(StmtKind::Let {
                    pattern: Pattern::new(PatternKind::Ident { name: "p".into(), by_move: false }),
                    ty: None,
                    init: addr_of,
                    mutable: false,
                })],
                None,
            ),
        });
        let proc = proc_with_body(vec![
            region_stmt,
            Stmt::new(StmtKind::Expr(expr(10, ExprKind::Path(Path::single("p"))))),
        ]);
        let errors = check_proc(&ScopeContext::new(), &proc);
        assert!(errors
            .iter()
            .any(|e| matches!(&e.kind, AnalysisErrorKind::PointerOutlivesRegion { name } if name == "p")));
    }

    #[test]
    fn alloc_in_named_region_is_fine() {
        let region_stmt = Stmt::new(StmtKind::Region {
            alias: Some("r".into()),
            body: Block::new(
                vec![Stmt::new(StmtKind::Expr(expr(
                    1,
                    ExprKind::Alloc {
                        value: Box::new(expr(2, ExprKind::Lit(cursive_ast::ast::Lit::Unit))),
                        region: Some(Box::new(expr(3, ExprKind::Path(Path::single("r"))))),
                    },
                )))],
                None,
            ),
        });
        let proc = proc_with_body(vec![region_stmt]);
        assert!(check_proc(&ScopeContext::new(), &proc).is_empty());
    }
}
