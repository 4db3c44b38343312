//! The typed AST the middle-end consumes.
//!
//! Expressions carry a `NodeId` that keys into the resolver's per-expression
//! type table (`env::ScopeContext::expr_tys`). Statements and declarations
//! are plain data; the analyzers attach their results in side tables keyed
//! by `NodeId` or binding identity, never by mutating these nodes.

use crate::path::Path;
use crate::span::Span;
use crate::types::Ty;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub u32);

pub const DUMMY_NODE_ID: NodeId = NodeId(u32::MAX);

#[derive(Clone, Debug)]
pub struct Expr {
    pub id: NodeId,
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Lit(Lit),
    /// A resolved name: binding, static, proc reference, record constructor,
    /// or payloadless enum variant. The resolver decides which.
    Path(Path),
    Unary { op: UnOp, expr: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { callee: Box<Expr>, args: Vec<Arg> },
    MethodCall { recv: Box<Expr>, name: String, args: Vec<Arg> },
    Field { base: Box<Expr>, name: String },
    TupleField { base: Box<Expr>, index: usize },
    Index { base: Box<Expr>, index: Box<Expr> },
    Range { kind: RangeKind, lo: Option<Box<Expr>>, hi: Option<Box<Expr>> },
    Tuple(Vec<Expr>),
    Array(Vec<Expr>),
    RecordLit { path: Path, fields: Vec<(String, Expr)> },
    EnumLit { path: Path, payload: Option<EnumPayloadExpr> },
    Cast { expr: Box<Expr>, ty: Ty },
    Transmute { expr: Box<Expr>, ty: Ty },
    /// `&place` — a safe pointer to a place.
    AddrOf { place: Box<Expr> },
    /// `*expr` for both safe and raw pointers; the operand type decides
    /// which checks apply.
    Deref { expr: Box<Expr> },
    /// `move place` — transfers responsibility out of the place.
    Move { place: Box<Expr> },
    /// `alloc v` / `alloc v in r`.
    Alloc { value: Box<Expr>, region: Option<Box<Expr>> },
    If { cond: Box<Expr>, then_blk: Block, else_expr: Option<Box<Expr>> },
    Match { scrutinee: Box<Expr>, arms: Vec<Arm> },
    Block(Block),
    /// `spawn { … }`; `moves` lists the captures taken by value.
    Spawn { moves: Vec<String>, body: Block },
    /// `wait h` — blocks on a spawn handle, propagating its panic.
    Wait { handle: Box<Expr> },
    Dispatch {
        range: Box<Expr>,
        binder: String,
        chunk: Option<Box<Expr>>,
        reduce: Option<Reducer>,
        ordered: bool,
        body: Block,
    },
    /// `expr?` — forwards the error member of a result union.
    Propagate { expr: Box<Expr> },
    /// Produced by upstream error recovery; lowers to an `ErrorExpr` panic.
    Error,
}

#[derive(Clone, Debug)]
pub enum Lit {
    Bool(bool),
    Char(u32),
    Unit,
    Int { negative: bool, magnitude: u128, ty: Option<Ty> },
    Float { value: f64, ty: Option<Ty> },
    Str(Vec<u8>),
    Bytes(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct Arg {
    pub expr: Expr,
    /// `move` argument: responsibility transfers to the callee.
    pub by_move: bool,
}

impl Arg {
    pub fn by_value(expr: Expr) -> Arg {
        Arg { expr, by_move: false }
    }

    pub fn by_move(expr: Expr) -> Arg {
        Arg { expr, by_move: true }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinOp::Shl | BinOp::Shr)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RangeKind {
    /// `..hi`
    To,
    /// `..=hi`
    ToInclusive,
    /// `..`
    Full,
    /// `lo..`
    From,
    /// `lo..hi`
    Exclusive,
    /// `lo..=hi`
    Inclusive,
}

#[derive(Clone, Debug)]
pub enum EnumPayloadExpr {
    Tuple(Vec<Expr>),
    Record(Vec<(String, Expr)>),
}

/// The reduction operator of a `dispatch … reduce`.
#[derive(Clone, Debug)]
pub enum Reducer {
    Add,
    Mul,
    Min,
    Max,
    And,
    Or,
    /// A user procedure, applied as `f(acc, item)`.
    Proc(Path),
}

#[derive(Clone, Debug)]
pub struct Arm {
    pub pattern: Pattern,
    pub guard: Option<Box<Expr>>,
    pub body: Expr,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    /// Trailing expression: the block's value when present.
    pub expr: Option<Box<Expr>>,
    pub span: Span,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>, expr: Option<Expr>) -> Block {
        Block { stmts, expr: expr.map(Box::new), span: Span::default() }
    }
}

#[derive(Clone, Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum StmtKind {
    /// `let pat = init` / `var pat = init`; `var` bindings are reassignable.
    Let { pattern: Pattern, ty: Option<Ty>, init: Expr, mutable: bool },
    Assign { place: Expr, value: Expr },
    Expr(Expr),
    Return(Option<Expr>),
    Break(Option<Expr>),
    Continue,
    Defer(Block),
    /// `region r { … }`; `alias` binds a `Region@Active` handle.
    Region { alias: Option<String>, body: Block },
    /// `frame in r { … }`; omitted region means the innermost one.
    Frame { region: Option<String>, body: Block },
    KeyBlock { keys: Vec<KeyAcquire>, release: bool, body: Block },
    /// `parallel(domain) { … }` fork/join block.
    Parallel { domain: Expr, body: Block },
    Loop { kind: LoopKind, body: Block },
    Error,
}

#[derive(Clone, Debug)]
pub enum LoopKind {
    Loop,
    While(Expr),
    For { binder: String, iter: Expr },
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum KeyMode {
    Read,
    Write,
}

#[derive(Clone, Debug)]
pub struct KeyAcquire {
    pub path: Path,
    pub mode: KeyMode,
    /// Runtime-acquired keys are opaque: they may stand for any path under
    /// their declared scope.
    pub dynamic: bool,
}

#[derive(Clone, Debug)]
pub struct Pattern {
    pub kind: PatternKind,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum PatternKind {
    Wildcard,
    /// Binds the whole scrutinee; `by_move` takes responsibility.
    Ident { name: String, by_move: bool },
    Lit(Lit),
    Tuple(Vec<Pattern>),
    Record { path: Path, fields: Vec<FieldPat> },
    Enum { path: Path, payload: Option<EnumPayloadPat> },
    /// `Type@State { fields }` — matches one modal state.
    Modal { path: Path, state: String, fields: Option<Vec<FieldPat>> },
}

#[derive(Clone, Debug)]
pub struct FieldPat {
    pub name: String,
    /// Shorthand `Rec { x }` binds the field under its own name.
    pub pattern: Option<Pattern>,
}

#[derive(Clone, Debug)]
pub enum EnumPayloadPat {
    Tuple(Vec<Pattern>),
    Record(Vec<FieldPat>),
}

// Declarations.

#[derive(Clone, Debug)]
pub struct ModuleDecl {
    pub path: Path,
    /// Modules whose init must have run before this one's; panic in any of
    /// them poisons this module too.
    pub eager_deps: Vec<Path>,
    pub statics: Vec<StaticDecl>,
    pub procs: Vec<ProcDecl>,
}

#[derive(Clone, Debug)]
pub struct StaticDecl {
    pub name: String,
    pub ty: Ty,
    pub init: Expr,
    /// `static x = move place` — without the `move`, a place initializer
    /// yields an immovable alias binding.
    pub is_move: bool,
}

#[derive(Clone, Debug)]
pub struct ProcDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Ty,
    pub body: Option<Block>,
    pub is_extern: bool,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub ty: Ty,
    pub by_move: bool,
}

#[derive(Clone, Debug)]
pub struct RecordDecl {
    pub path: Path,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<ProcDecl>,
}

#[derive(Clone, Debug)]
pub struct FieldDecl {
    pub name: String,
    pub ty: Ty,
}

#[derive(Clone, Debug)]
pub struct EnumDecl {
    pub path: Path,
    pub variants: Vec<VariantDecl>,
}

#[derive(Clone, Debug)]
pub struct VariantDecl {
    pub name: String,
    pub payload: Option<VariantPayload>,
    /// Explicit discriminant; defaults to the variant's index.
    pub discr: Option<u64>,
}

#[derive(Clone, Debug)]
pub enum VariantPayload {
    Tuple(Vec<Ty>),
    Record(Vec<FieldDecl>),
}

#[derive(Clone, Debug)]
pub struct ModalDecl {
    pub path: Path,
    pub states: Vec<StateDecl>,
}

#[derive(Clone, Debug)]
pub struct StateDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<StateMethodDecl>,
}

#[derive(Clone, Debug)]
pub struct StateMethodDecl {
    pub proc: ProcDecl,
    /// The state the receiver transitions to when this method returns.
    pub transitions_to: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ClassDecl {
    pub path: Path,
    pub methods: Vec<ClassMethodDecl>,
}

#[derive(Clone, Debug)]
pub struct ClassMethodDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Ty,
    /// Default body; impls that omit an override dispatch here.
    pub default_body: Option<Block>,
}

#[derive(Clone, Debug)]
pub struct ImplDecl {
    pub class_path: Path,
    pub self_ty: Ty,
    pub methods: Vec<ProcDecl>,
}

impl Expr {
    pub fn new(id: NodeId, kind: ExprKind) -> Expr {
        Expr { id, kind, span: Span::default() }
    }

    /// Whether this expression is a place (something with an address) as
    /// opposed to a value computation.
    pub fn is_place(&self) -> bool {
        match &self.kind {
            ExprKind::Path(_) => true,
            ExprKind::Field { base, .. } | ExprKind::TupleField { base, .. } => base.is_place(),
            ExprKind::Index { base, .. } => base.is_place(),
            ExprKind::Deref { .. } => true,
            _ => false,
        }
    }
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Stmt {
        Stmt { kind, span: Span::default() }
    }
}

impl Pattern {
    pub fn new(kind: PatternKind) -> Pattern {
        Pattern { kind, span: Span::default() }
    }

    /// All names the pattern binds, in source order.
    pub fn bound_names(&self, out: &mut Vec<String>) {
        match &self.kind {
            PatternKind::Wildcard | PatternKind::Lit(_) => {}
            PatternKind::Ident { name, .. } => out.push(name.clone()),
            PatternKind::Tuple(elems) => {
                for p in elems {
                    p.bound_names(out);
                }
            }
            PatternKind::Record { fields, .. } => {
                for f in fields {
                    match &f.pattern {
                        Some(p) => p.bound_names(out),
                        None => out.push(f.name.clone()),
                    }
                }
            }
            PatternKind::Enum { payload, .. } => match payload {
                Some(EnumPayloadPat::Tuple(elems)) => {
                    for p in elems {
                        p.bound_names(out);
                    }
                }
                Some(EnumPayloadPat::Record(fields)) => {
                    for f in fields {
                        match &f.pattern {
                            Some(p) => p.bound_names(out),
                            None => out.push(f.name.clone()),
                        }
                    }
                }
                None => {}
            },
            PatternKind::Modal { fields, .. } => {
                if let Some(fields) = fields {
                    for f in fields {
                        match &f.pattern {
                            Some(p) => p.bound_names(out),
                            None => out.push(f.name.clone()),
                        }
                    }
                }
            }
        }
    }
}
