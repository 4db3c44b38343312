//! Lowering from the typed AST to IR.
//!
//! Every expression lowers to a result operand plus a sequence of setup
//! instructions; statements lower to instruction sequences. The context
//! tracks the cleanup schedule of every open scope so that panic paths and
//! early returns drop exactly what is live.

pub(crate) mod expr;
mod pat;
mod place;
mod stmt;

use std::fmt;

use rustc_hash::FxHashMap;
use tracing::debug;

use cursive_analysis::ownership::OwnershipResults;
use cursive_ast::ast::{Block, ProcDecl};
use cursive_ast::env::ScopeContext;
use cursive_ast::path::Path;
use cursive_ast::span::Span;
use cursive_ast::types::{strip_perm, Ty, TyKind};
use cursive_middle::index::IndexVec;
use cursive_middle::layout::{LayoutCx, LayoutError};

use crate::ir::{DerivedValue, Ir, IrProc, IrValue, LocalId, OpaqueId};
use crate::symbols;

#[derive(Clone, Debug)]
pub struct LowerError {
    pub span: Span,
    pub kind: LowerErrorKind,
}

#[derive(Clone, Debug)]
pub enum LowerErrorKind {
    WriteThroughImmRaw,
    TransmuteSizeMismatch { from: u64, to: u64 },
    UnknownProc { path: String },
    UnknownMethod { ty: String, name: String },
    Layout(LayoutError),
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LowerErrorKind::WriteThroughImmRaw => {
                f.write_str("write through `*imm` raw pointer")
            }
            LowerErrorKind::TransmuteSizeMismatch { from, to } => {
                write!(f, "transmute between sizes {} and {}", from, to)
            }
            LowerErrorKind::UnknownProc { path } => write!(f, "unknown procedure `{}`", path),
            LowerErrorKind::UnknownMethod { ty, name } => {
                write!(f, "no method `{}` on `{}`", name, ty)
            }
            LowerErrorKind::Layout(err) => write!(f, "layout failure: {:?}", err),
        }
    }
}

/// The result of lowering one expression: instructions to run first, then
/// the operand holding the value.
pub struct LowerResult {
    pub setup: Vec<Ir>,
    pub value: IrValue,
}

impl LowerResult {
    pub fn pure(value: IrValue) -> LowerResult {
        LowerResult { setup: Vec::new(), value }
    }
}

pub struct LowerCtx<'a> {
    pub scx: &'a ScopeContext,
    pub own: &'a OwnershipResults,
    pub layouts: LayoutCx<'a>,
    pub derived: IndexVec<OpaqueId, DerivedValue>,
    pub errors: Vec<LowerError>,
    /// Interned string/bytes literal data, emitted as constant symbols.
    pub str_data: Vec<(String, Vec<u8>)>,
    /// Procedures synthesized for spawn/dispatch bodies.
    pub nested: Vec<IrProc>,
    str_intern: FxHashMap<Vec<u8>, String>,
    module: Path,
    next_local: usize,
    /// Cleanup items per open scope, declaration order (run reversed).
    scopes: Vec<Vec<Ir>>,
}

impl<'a> LowerCtx<'a> {
    pub fn new(scx: &'a ScopeContext, own: &'a OwnershipResults, module: Path) -> LowerCtx<'a> {
        LowerCtx {
            scx,
            own,
            layouts: LayoutCx::new(scx),
            derived: IndexVec::new(),
            errors: Vec::new(),
            str_data: Vec::new(),
            nested: Vec::new(),
            str_intern: FxHashMap::default(),
            module,
            next_local: 0,
            scopes: Vec::new(),
        }
    }

    pub fn module(&self) -> &Path {
        &self.module
    }

    pub fn fresh_local(&mut self) -> LocalId {
        let id = LocalId(self.next_local as u32);
        self.next_local += 1;
        id
    }

    pub fn local_count(&self) -> usize {
        self.next_local
    }

    pub fn opaque(&mut self, value: DerivedValue) -> IrValue {
        IrValue::Opaque(self.derived.push(value))
    }

    pub fn intern_bytes(&mut self, bytes: &[u8]) -> IrValue {
        if let Some(sym) = self.str_intern.get(bytes) {
            return IrValue::Symbol(sym.clone());
        }
        let sym = format!("cursive$str${}", self.str_data.len());
        self.str_intern.insert(bytes.to_vec(), sym.clone());
        self.str_data.push((sym.clone(), bytes.to_vec()));
        IrValue::Symbol(sym)
    }

    pub fn error(&mut self, span: Span, kind: LowerErrorKind) {
        self.errors.push(LowerError { span, kind });
    }

    // Scope / cleanup tracking.

    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn pop_scope(&mut self) -> Vec<Ir> {
        let items = self.scopes.pop().unwrap_or_default();
        items.into_iter().rev().collect()
    }

    pub fn schedule_cleanup(&mut self, item: Ir) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(item);
        }
    }

    /// The full cleanup sequence a panic at this point must run: every open
    /// scope, innermost first, each reversed.
    pub fn cleanup_on_panic(&self) -> Vec<Ir> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev().cloned())
            .collect()
    }

    /// Whether dropping a value of `ty` has an effect (owned heap bytes or
    /// a `Drop` impl somewhere inside).
    pub fn ty_needs_drop(&self, ty: &Ty) -> bool {
        self.ty_needs_drop_inner(ty, 0)
    }

    fn ty_needs_drop_inner(&self, ty: &Ty, depth: usize) -> bool {
        if depth > 32 {
            return true;
        }
        match &**strip_perm(ty) {
            TyKind::Path(path) => {
                if *path == cursive_ast::env::string_path()
                    || *path == cursive_ast::env::bytes_path()
                {
                    return true;
                }
                if self.scx.has_drop_impl(ty) {
                    return true;
                }
                match self.scx.type_decl(path) {
                    Some(cursive_ast::env::TypeDecl::Record(r)) => r
                        .fields
                        .iter()
                        .any(|f| self.ty_needs_drop_inner(&f.ty, depth + 1)),
                    Some(cursive_ast::env::TypeDecl::Enum(e)) => {
                        e.variants.iter().any(|v| match &v.payload {
                            None => false,
                            Some(cursive_ast::ast::VariantPayload::Tuple(tys)) => {
                                tys.iter().any(|t| self.ty_needs_drop_inner(t, depth + 1))
                            }
                            Some(cursive_ast::ast::VariantPayload::Record(fields)) => fields
                                .iter()
                                .any(|f| self.ty_needs_drop_inner(&f.ty, depth + 1)),
                        })
                    }
                    Some(cursive_ast::env::TypeDecl::Modal(m)) => m.states.iter().any(|s| {
                        s.fields.iter().any(|f| self.ty_needs_drop_inner(&f.ty, depth + 1))
                    }),
                    None => false,
                }
            }
            TyKind::ModalState { path, .. } => {
                *path == cursive_ast::env::string_path()
                    || *path == cursive_ast::env::bytes_path()
                    || self.scx.has_drop_impl(ty)
            }
            TyKind::Array { elem, .. } | TyKind::Slice { elem } => {
                self.ty_needs_drop_inner(elem, depth + 1)
            }
            TyKind::Tuple(elems) | TyKind::Union(elems) => {
                elems.iter().any(|t| self.ty_needs_drop_inner(t, depth + 1))
            }
            _ => false,
        }
    }
}

/// One procedure's complete lowering: the main body plus the procedures
/// synthesized for its spawn/dispatch bodies and the literal data it needs.
pub struct LoweredProc {
    pub proc: IrProc,
    pub nested: Vec<IrProc>,
    pub str_data: Vec<(String, Vec<u8>)>,
    pub errors: Vec<LowerError>,
}

/// Lowers one procedure body to IR.
pub fn lower_proc(
    scx: &ScopeContext,
    own: &OwnershipResults,
    module: &Path,
    proc: &ProcDecl,
) -> LoweredProc {
    debug!("lower_proc: {}.{}", module, proc.name);
    let mut cx = LowerCtx::new(scx, own, module.clone());
    let body = match &proc.body {
        Some(body) => lower_block_scoped(&mut cx, body),
        None => Ir::Nop,
    };
    LoweredProc {
        proc: IrProc {
            sym: symbols::proc_sym(module, &proc.name),
            params: proc.params.iter().map(|p| p.name.clone()).collect(),
            body,
            derived: cx.derived,
            local_count: cx.next_local,
        },
        nested: cx.nested,
        str_data: cx.str_data,
        errors: cx.errors,
    }
}

/// Lowers a block as its own scope: setup, body, and the scope's cleanup
/// schedule, which runs on every exit path.
pub fn lower_block_scoped(cx: &mut LowerCtx<'_>, block: &Block) -> Ir {
    cx.push_scope();
    let mut body = Vec::new();
    for stmt in &block.stmts {
        body.push(stmt::lower_stmt(cx, stmt));
    }
    if let Some(tail) = &block.expr {
        let result = expr::lower_expr(cx, tail);
        body.extend(result.setup);
    }
    let cleanup = cx.pop_scope();
    Ir::Block { setup: Vec::new(), body: Box::new(Ir::seq(body)), cleanup }
}

/// Like [`lower_block_scoped`] but hands the block's trailing value back.
pub fn lower_block_valued(cx: &mut LowerCtx<'_>, block: &Block) -> (Ir, IrValue) {
    cx.push_scope();
    let mut body = Vec::new();
    for stmt in &block.stmts {
        body.push(stmt::lower_stmt(cx, stmt));
    }
    let value = match &block.expr {
        Some(tail) => {
            let result = expr::lower_expr(cx, tail);
            body.extend(result.setup);
            result.value
        }
        None => IrValue::unit(),
    };
    let cleanup = cx.pop_scope();
    (Ir::Block { setup: Vec::new(), body: Box::new(Ir::seq(body)), cleanup }, value)
}
