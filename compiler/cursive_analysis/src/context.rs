//! Capability checks rooted at `Context`.
//!
//! `main` is the sole entry point for capabilities: it must take the
//! context record by move and return `i32`. Extern procedures are the one
//! boundary `Context` may never cross.

use cursive_ast::ast::ProcDecl;
use cursive_ast::env::context_path;
use cursive_ast::span::Span;
use cursive_ast::types::{strip_perm, IntTy, PrimTy, Ty, TyKind};

use crate::errors::{AnalysisError, AnalysisErrorKind};

fn is_context_ty(ty: &Ty) -> bool {
    match &**strip_perm(ty) {
        TyKind::Path(path) => *path == context_path(),
        _ => false,
    }
}

fn contains_context(ty: &Ty) -> bool {
    match &**strip_perm(ty) {
        TyKind::Path(path) => *path == context_path(),
        TyKind::Ptr { elem, .. } | TyKind::RawPtr { elem, .. } => contains_context(elem),
        TyKind::Array { elem, .. } | TyKind::Slice { elem } => contains_context(elem),
        TyKind::Tuple(elems) | TyKind::Union(elems) => elems.iter().any(contains_context),
        _ => false,
    }
}

/// `main` must be exactly `(move ctx: Context) -> i32`.
pub fn check_main_signature(proc: &ProcDecl) -> Vec<AnalysisError> {
    let ok = proc.params.len() == 1
        && proc.params[0].by_move
        && is_context_ty(&proc.params[0].ty)
        && matches!(&**strip_perm(&proc.ret), TyKind::Prim(PrimTy::Int(IntTy::I32)));
    if ok {
        Vec::new()
    } else {
        vec![AnalysisError::new(Span::default(), AnalysisErrorKind::BadMainSignature)]
    }
}

/// Rejects `Context` (or anything embedding it) in an extern signature.
pub fn check_extern_signature(proc: &ProcDecl) -> Vec<AnalysisError> {
    if !proc.is_extern {
        return Vec::new();
    }
    let leaks = proc.params.iter().any(|p| contains_context(&p.ty))
        || contains_context(&proc.ret);
    if leaks {
        vec![AnalysisError::new(
            Span::default(),
            AnalysisErrorKind::ContextAcrossFfi { proc: proc.name.clone() },
        )]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::ast::Param;
    use cursive_ast::types::{mk_path, mk_prim};

    fn context_ty() -> Ty {
        mk_path(context_path())
    }

    fn i32_ty() -> Ty {
        mk_prim(PrimTy::Int(IntTy::I32))
    }

    fn main_proc(params: Vec<Param>, ret: Ty) -> ProcDecl {
        ProcDecl { name: "main".into(), params, ret, body: None, is_extern: false }
    }

    #[test]
    fn canonical_main_passes() {
        let proc = main_proc(
            vec![Param { name: "ctx".into(), ty: context_ty(), by_move: true }],
            i32_ty(),
        );
        assert!(check_main_signature(&proc).is_empty());
    }

    #[test]
    fn by_ref_context_fails() {
        let proc = main_proc(
            vec![Param { name: "ctx".into(), ty: context_ty(), by_move: false }],
            i32_ty(),
        );
        assert!(!check_main_signature(&proc).is_empty());
    }

    #[test]
    fn wrong_return_fails() {
        let proc = main_proc(
            vec![Param { name: "ctx".into(), ty: context_ty(), by_move: true }],
            cursive_ast::types::mk_unit(),
        );
        assert!(!check_main_signature(&proc).is_empty());
    }

    #[test]
    fn extern_cannot_take_context() {
        let proc = ProcDecl {
            name: "ffi".into(),
            params: vec![Param { name: "ctx".into(), ty: context_ty(), by_move: true }],
            ret: cursive_ast::types::mk_unit(),
            body: None,
            is_extern: true,
        };
        assert!(!check_extern_signature(&proc).is_empty());
    }
}
