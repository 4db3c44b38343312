//! Whole-program scenarios run through the interpreter: the executable
//! contract between lowering, the runtime model, and the language rules.

use cursive_ast::ast::*;
use cursive_ast::env::{context_path, ScopeContext, TypeDecl};
use cursive_ast::path::Path;
use cursive_ast::types::{mk_path, mk_prim, IntTy, PrimTy, Ty};
use cursive_interpret::{
    run_program, run_program_in, EvalContext, MachineOptions,
};
use cursive_middle::panic::PanicReason;

/// Tiny AST builder; every expression gets a distinct id.
struct B {
    next: u32,
}

impl B {
    fn new() -> B {
        B { next: 0 }
    }

    fn e(&mut self, kind: ExprKind) -> Expr {
        self.next += 1;
        Expr::new(NodeId(self.next), kind)
    }

    fn int(&mut self, v: i64) -> Expr {
        self.e(ExprKind::Lit(Lit::Int {
            negative: v < 0,
            magnitude: v.unsigned_abs() as u128,
            ty: Some(mk_prim(PrimTy::Int(IntTy::I32))),
        }))
    }

    fn str_lit(&mut self, s: &str) -> Expr {
        self.e(ExprKind::Lit(Lit::Str(s.as_bytes().to_vec())))
    }

    fn var(&mut self, name: &str) -> Expr {
        self.e(ExprKind::Path(Path::single(name)))
    }

    fn path(&mut self, segments: Vec<&str>) -> Expr {
        self.e(ExprKind::Path(Path::from_segments(segments)))
    }

    fn bin(&mut self, op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        self.e(ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
    }

    fn let_stmt(&mut self, name: &str, init: Expr) -> Stmt {
        Stmt::new(StmtKind::Let {
            pattern: Pattern::new(PatternKind::Ident { name: name.into(), by_move: false }),
            ty: None,
            init,
            mutable: false,
        })
    }

    fn ret(&mut self, expr: Expr) -> Stmt {
        Stmt::new(StmtKind::Return(Some(expr)))
    }

    fn method(&mut self, recv: Expr, name: &str, args: Vec<Expr>) -> Expr {
        self.e(ExprKind::MethodCall {
            recv: Box::new(recv),
            name: name.into(),
            args: args.into_iter().map(Arg::by_value).collect(),
        })
    }

    fn call(&mut self, callee: Expr, args: Vec<Expr>) -> Expr {
        self.e(ExprKind::Call {
            callee: Box::new(callee),
            args: args.into_iter().map(Arg::by_value).collect(),
        })
    }

    fn cast_i32(&mut self, expr: Expr) -> Expr {
        self.e(ExprKind::Cast {
            expr: Box::new(expr),
            ty: mk_prim(PrimTy::Int(IntTy::I32)),
        })
    }
}

fn i32_ty() -> Ty {
    mk_prim(PrimTy::Int(IntTy::I32))
}

fn main_proc(body: Block) -> ProcDecl {
    ProcDecl {
        name: "main".into(),
        params: vec![Param { name: "ctx".into(), ty: mk_path(context_path()), by_move: true }],
        ret: i32_ty(),
        body: Some(body),
        is_extern: false,
    }
}

fn program(scx: &mut ScopeContext, body: Block) {
    scx.register_module(ModuleDecl {
        path: Path::single("app"),
        eager_deps: vec![],
        statics: vec![],
        procs: vec![main_proc(body)],
    });
}

fn option_decl() -> TypeDecl {
    TypeDecl::Enum(EnumDecl {
        path: Path::single("Option"),
        variants: vec![
            VariantDecl { name: "None".into(), payload: None, discr: None },
            VariantDecl {
                name: "Some".into(),
                payload: Some(VariantPayload::Tuple(vec![i32_ty()])),
                discr: None,
            },
        ],
    })
}

#[test]
fn integer_evaluation_exits_with_sum() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let one = b.int(1);
    let two = b.int(2);
    let sum = b.bin(BinOp::Add, one, two);
    let let_x = b.let_stmt("x", sum);
    let x = b.var("x");
    let ret = b.ret(x);
    program(&mut scx, Block::new(vec![let_x, ret], None));
    assert_eq!(run_program(&scx, MachineOptions::default()).unwrap(), 3);
}

#[test]
fn managed_string_builds_and_frees_once() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let lit_ab = b.str_lit("ab");
    let from = b.path(vec!["String", "from"]);
    let from_call = b.call(from, vec![lit_ab]);
    let let_s = b.let_stmt("s", from_call);
    let s1 = b.var("s");
    let lit_cd = b.str_lit("cd");
    let append = b.method(s1, "append", vec![lit_cd]);
    let append_stmt = Stmt::new(StmtKind::Expr(append));
    let s2 = b.var("s");
    let length = b.method(s2, "length", vec![]);
    let cast = b.cast_i32(length);
    let ret = b.ret(cast);
    program(&mut scx, Block::new(vec![let_s, append_stmt, ret], None));

    let mut ecx = EvalContext::new(&scx, MachineOptions::default());
    assert_eq!(run_program_in(&mut ecx).unwrap(), 4);
    // Exactly one deallocation, of the 4-byte backing buffer.
    assert_eq!(ecx.heap.dealloc_log, vec![4]);
    assert_eq!(ecx.heap.live_bytes, 0);
}

#[test]
fn region_alloc_reads_back_through_pointer() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let seven = b.int(7);
    let r = b.var("r");
    let alloc = b.e(ExprKind::Alloc { value: Box::new(seven), region: Some(Box::new(r)) });
    let addr_of = b.e(ExprKind::AddrOf { place: Box::new(alloc) });
    let let_p = b.let_stmt("p", addr_of);
    let p = b.var("p");
    let deref = b.e(ExprKind::Deref { expr: Box::new(p) });
    let ret = b.ret(deref);
    let region = Stmt::new(StmtKind::Region {
        alias: Some("r".into()),
        body: Block::new(vec![let_p, ret], None),
    });
    program(&mut scx, Block::new(vec![region], None));
    assert_eq!(run_program(&scx, MachineOptions::default()).unwrap(), 7);
}

#[test]
fn pointer_escaping_region_panics_expired_deref() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let unit = b.e(ExprKind::Lit(Lit::Unit));
    let let_q = b.let_stmt("q", unit);
    let seven = b.int(7);
    let r = b.var("r");
    let alloc = b.e(ExprKind::Alloc { value: Box::new(seven), region: Some(Box::new(r)) });
    let addr_of = b.e(ExprKind::AddrOf { place: Box::new(alloc) });
    let q_place = b.var("q");
    let assign = Stmt::new(StmtKind::Assign { place: q_place, value: addr_of });
    let region = Stmt::new(StmtKind::Region {
        alias: Some("r".into()),
        body: Block::new(vec![assign], None),
    });
    let q = b.var("q");
    let deref = b.e(ExprKind::Deref { expr: Box::new(q) });
    let ret = b.ret(deref);
    program(&mut scx, Block::new(vec![let_q, region, ret], None));
    assert_eq!(
        run_program(&scx, MachineOptions::default()).unwrap(),
        PanicReason::ExpiredDeref.code() as i32
    );
}

#[test]
fn enum_payload_matches_out() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    scx.register_type(option_decl());
    let five = b.int(5);
    let some = b.e(ExprKind::EnumLit {
        path: Path::from_segments(vec!["Option", "Some"]),
        payload: Some(EnumPayloadExpr::Tuple(vec![five])),
    });
    let let_v = b.let_stmt("v", some);
    let v = b.var("v");
    let x = b.var("x");
    let zero = b.int(0);
    let match_expr = b.e(ExprKind::Match {
        scrutinee: Box::new(v),
        arms: vec![
            Arm {
                pattern: Pattern::new(PatternKind::Enum {
                    path: Path::from_segments(vec!["Option", "Some"]),
                    payload: Some(EnumPayloadPat::Tuple(vec![Pattern::new(
                        PatternKind::Ident { name: "x".into(), by_move: false },
                    )])),
                }),
                guard: None,
                body: x,
            },
            Arm {
                pattern: Pattern::new(PatternKind::Enum {
                    path: Path::from_segments(vec!["Option", "None"]),
                    payload: None,
                }),
                guard: None,
                body: zero,
            },
        ],
    });
    let ret = b.ret(match_expr);
    program(&mut scx, Block::new(vec![let_v, ret], None));
    assert_eq!(run_program(&scx, MachineOptions::default()).unwrap(), 5);
}

#[test]
fn poisoned_module_panics_init_on_access() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let one = b.int(1);
    let zero = b.int(0);
    let div = b.bin(BinOp::Div, one, zero);
    scx.register_module(ModuleDecl {
        path: Path::single("a"),
        eager_deps: vec![],
        statics: vec![StaticDecl { name: "x".into(), ty: i32_ty(), init: div, is_move: false }],
        procs: vec![],
    });
    let read = b.path(vec!["a", "x"]);
    let ret = b.ret(read);
    scx.register_module(ModuleDecl {
        path: Path::single("b"),
        eager_deps: vec![],
        statics: vec![],
        procs: vec![main_proc(Block::new(vec![ret], None))],
    });
    assert_eq!(
        run_program(&scx, MachineOptions::default()).unwrap(),
        PanicReason::InitPanic.code() as i32
    );
}

#[test]
fn eagerly_dependent_module_is_poisoned_before_main() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let one = b.int(1);
    let zero = b.int(0);
    let div = b.bin(BinOp::Div, one, zero);
    scx.register_module(ModuleDecl {
        path: Path::single("a"),
        eager_deps: vec![],
        statics: vec![StaticDecl { name: "x".into(), ty: i32_ty(), init: div, is_move: false }],
        procs: vec![],
    });
    let answer = b.int(42);
    let ret = b.ret(answer);
    scx.register_module(ModuleDecl {
        path: Path::single("b"),
        eager_deps: vec![Path::single("a")],
        statics: vec![],
        procs: vec![main_proc(Block::new(vec![ret], None))],
    });
    // Poison reaches `b` eagerly, so main never runs.
    assert_eq!(
        run_program(&scx, MachineOptions::default()).unwrap(),
        PanicReason::InitPanic.code() as i32
    );
}

#[test]
fn dispatch_reduce_sums_the_range() {
    for chunk in [None, Some(7i64), Some(100)] {
        let mut b = B::new();
        let mut scx = ScopeContext::new();
        let lo = b.int(0);
        let hi = b.int(100);
        let range = b.e(ExprKind::Range {
            kind: RangeKind::Exclusive,
            lo: Some(Box::new(lo)),
            hi: Some(Box::new(hi)),
        });
        let i = b.var("i");
        let chunk_expr = chunk.map(|c| Box::new(b.int(c)));
        let dispatch = b.e(ExprKind::Dispatch {
            range: Box::new(range),
            binder: "i".into(),
            chunk: chunk_expr,
            reduce: Some(Reducer::Add),
            ordered: true,
            body: Block::new(vec![], Some(i)),
        });
        let ret = b.ret(dispatch);
        program(&mut scx, Block::new(vec![ret], None));
        assert_eq!(run_program(&scx, MachineOptions::default()).unwrap(), 4950);
    }
}

#[test]
fn index_past_end_panics_bounds() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let elems = vec![b.int(1), b.int(2), b.int(3)];
    let array = b.e(ExprKind::Array(elems));
    let let_a = b.let_stmt("a", array);
    let a = b.var("a");
    let three = b.int(3);
    let index = b.e(ExprKind::Index { base: Box::new(a), index: Box::new(three) });
    let ret = b.ret(index);
    program(&mut scx, Block::new(vec![let_a, ret], None));
    assert_eq!(
        run_program(&scx, MachineOptions::default()).unwrap(),
        PanicReason::Bounds.code() as i32
    );
}

#[test]
fn last_index_succeeds() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let elems = vec![b.int(1), b.int(2), b.int(3)];
    let array = b.e(ExprKind::Array(elems));
    let let_a = b.let_stmt("a", array);
    let a = b.var("a");
    let two = b.int(2);
    let index = b.e(ExprKind::Index { base: Box::new(a), index: Box::new(two) });
    let ret = b.ret(index);
    program(&mut scx, Block::new(vec![let_a, ret], None));
    assert_eq!(run_program(&scx, MachineOptions::default()).unwrap(), 3);
}

#[test]
fn backwards_range_panics_bounds() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let elems = vec![b.int(1), b.int(2), b.int(3)];
    let array = b.e(ExprKind::Array(elems));
    let let_a = b.let_stmt("a", array);
    let a = b.var("a");
    let lo = b.int(2);
    let hi = b.int(1);
    let range = b.e(ExprKind::Range {
        kind: RangeKind::Exclusive,
        lo: Some(Box::new(lo)),
        hi: Some(Box::new(hi)),
    });
    let slice = b.e(ExprKind::Index { base: Box::new(a), index: Box::new(range) });
    let let_s = b.let_stmt("s", slice);
    let zero = b.int(0);
    let ret = b.ret(zero);
    program(&mut scx, Block::new(vec![let_a, let_s, ret], None));
    assert_eq!(
        run_program(&scx, MachineOptions::default()).unwrap(),
        PanicReason::Bounds.code() as i32
    );
}

#[test]
fn spawn_panic_surfaces_at_wait() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let one = b.int(1);
    let zero = b.int(0);
    let div = b.bin(BinOp::Div, one, zero);
    let spawn = b.e(ExprKind::Spawn {
        moves: vec![],
        body: Block::new(vec![], Some(div)),
    });
    let let_h = b.let_stmt("h", spawn);
    let h = b.var("h");
    let wait = b.e(ExprKind::Wait { handle: Box::new(h) });
    let ret = b.ret(wait);
    program(&mut scx, Block::new(vec![let_h, ret], None));
    assert_eq!(
        run_program(&scx, MachineOptions::default()).unwrap(),
        PanicReason::DivZero.code() as i32
    );
}

#[test]
fn defer_runs_in_reverse_on_scope_exit() {
    // var order = 0; { defer order = order * 2; defer order = order + 3 }
    // Reverse execution leaves (0 + 3) * 2 = 6.
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let zero = b.int(0);
    let let_order = b.let_stmt("order", zero);
    let place1 = b.var("order");
    let lhs1 = b.var("order");
    let two = b.int(2);
    let mul = b.bin(BinOp::Mul, lhs1, two);
    let defer1 = Stmt::new(StmtKind::Defer(Block::new(
        vec![Stmt::new(StmtKind::Assign { place: place1, value: mul })],
        None,
    )));
    let place2 = b.var("order");
    let lhs2 = b.var("order");
    let three = b.int(3);
    let add = b.bin(BinOp::Add, lhs2, three);
    let defer2 = Stmt::new(StmtKind::Defer(Block::new(
        vec![Stmt::new(StmtKind::Assign { place: place2, value: add })],
        None,
    )));
    let inner = Stmt::new(StmtKind::Expr(b.e(ExprKind::Block(Block::new(
        vec![defer1, defer2],
        None,
    )))));
    let order = b.var("order");
    let ret = b.ret(order);
    program(&mut scx, Block::new(vec![let_order, inner, ret], None));
    assert_eq!(run_program(&scx, MachineOptions::default()).unwrap(), 6);
}

#[test]
fn bytes_append_empty_is_noop() {
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let lit = b.e(ExprKind::Lit(Lit::Bytes(b"abc".to_vec())));
    let from = b.path(vec!["Bytes", "from"]);
    let from_call = b.call(from, vec![lit]);
    let let_bs = b.let_stmt("bs", from_call);
    let bs1 = b.var("bs");
    let empty = b.e(ExprKind::Lit(Lit::Bytes(Vec::new())));
    let append = b.method(bs1, "append", vec![empty]);
    let append_stmt = Stmt::new(StmtKind::Expr(append));
    let bs2 = b.var("bs");
    let length = b.method(bs2, "length", vec![]);
    let cast = b.cast_i32(length);
    let ret = b.ret(cast);
    program(&mut scx, Block::new(vec![let_bs, append_stmt, ret], None));
    assert_eq!(run_program(&scx, MachineOptions::default()).unwrap(), 3);
}

#[test]
fn frame_reset_expires_frame_allocations() {
    // region r { alloc 1 in r; frame { q = &(alloc 2 in r) } *q } -> expired
    let mut b = B::new();
    let mut scx = ScopeContext::new();
    let unit = b.e(ExprKind::Lit(Lit::Unit));
    let let_q = b.let_stmt("q", unit);
    let one = b.int(1);
    let r1 = b.var("r");
    let alloc1 = b.e(ExprKind::Alloc { value: Box::new(one), region: Some(Box::new(r1)) });
    let alloc1_stmt = Stmt::new(StmtKind::Expr(alloc1));
    let two = b.int(2);
    let r2 = b.var("r");
    let alloc2 = b.e(ExprKind::Alloc { value: Box::new(two), region: Some(Box::new(r2)) });
    let addr_of = b.e(ExprKind::AddrOf { place: Box::new(alloc2) });
    let q_place = b.var("q");
    let frame = Stmt::new(StmtKind::Frame {
        region: Some("r".into()),
        body: Block::new(
            vec![Stmt::new(StmtKind::Assign { place: q_place, value: addr_of })],
            None,
        ),
    });
    let q = b.var("q");
    let deref = b.e(ExprKind::Deref { expr: Box::new(q) });
    let ret = b.ret(deref);
    let region = Stmt::new(StmtKind::Region {
        alias: Some("r".into()),
        body: Block::new(vec![alloc1_stmt, frame, ret], None),
    });
    program(&mut scx, Block::new(vec![let_q, region], None));
    assert_eq!(
        run_program(&scx, MachineOptions::default()).unwrap(),
        PanicReason::ExpiredDeref.code() as i32
    );
}
