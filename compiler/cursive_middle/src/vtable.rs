//! Vtable layout and dispatch symbol naming.
//!
//! A vtable is `{size, align, drop_sym}` followed by one slot per class
//! method in declaration order; callers index method `i` at slot `i + 3`.

use tracing::debug;

use cursive_ast::ast::{ClassDecl, ImplDecl};
use cursive_ast::env::ScopeContext;
use cursive_ast::path::{fold_ident, Path};
use cursive_ast::types::Ty;

/// Number of header slots before the first method pointer.
pub const VTABLE_HEADER_SLOTS: usize = 3;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Vtable {
    pub class_path: Path,
    pub size: u64,
    pub align: u64,
    /// Absent when the concrete type has no `Drop` impl.
    pub drop_sym: Option<String>,
    /// One symbol per class method, declaration order.
    pub method_syms: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum VtableError {
    UnknownClass(Path),
    MissingMethod { class: Path, method: String },
}

/// The stable slot of `name` within `class`'s method table (method index,
/// not counting header slots).
pub fn vslot(class: &ClassDecl, name: &str) -> Option<usize> {
    let folded = fold_ident(name);
    class.methods.iter().position(|m| fold_ident(&m.name) == folded)
}

/// Mangles the symbol of an impl method: `cursive$impl$<Class>$<Type>$<m>`.
pub fn impl_method_sym(class_path: &Path, self_ty: &Ty, method: &str) -> String {
    format!(
        "cursive$impl${}${}${}",
        mangle_path(class_path),
        mangle_ty(self_ty),
        fold_ident(method)
    )
}

/// Symbol of a class's default method body.
pub fn default_method_sym(class_path: &Path, method: &str) -> String {
    format!("cursive$class${}${}$default", mangle_path(class_path), fold_ident(method))
}

pub fn drop_sym(self_ty: &Ty) -> String {
    format!("cursive$drop${}", mangle_ty(self_ty))
}

/// The symbol naming the emitted vtable constant itself.
pub fn vtable_sym(class_path: &Path, self_ty: &Ty) -> String {
    format!("vt${}${}", mangle_path(class_path), mangle_ty(self_ty))
}

fn mangle_path(path: &Path) -> String {
    path.segments.iter().map(|s| fold_ident(s)).collect::<Vec<_>>().join("$")
}

fn mangle_ty(ty: &Ty) -> String {
    // Types reaching dispatch are nominal; display form is stable for them.
    ty.to_string()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Builds the vtable for `impl_decl`'s type viewed as `class`.
///
/// Methods the impl overrides get the impl symbol; methods it omits fall
/// back to the class's default body. An omitted method with no default is
/// an error the resolver should have caught, reported here defensively.
pub fn build_vtable(
    scx: &ScopeContext,
    impl_decl: &ImplDecl,
    size: u64,
    align: u64,
) -> Result<Vtable, VtableError> {
    let class = scx
        .class_decl(&impl_decl.class_path)
        .ok_or_else(|| VtableError::UnknownClass(impl_decl.class_path.clone()))?;
    let mut method_syms = Vec::with_capacity(class.methods.len());
    for method in &class.methods {
        let folded = fold_ident(&method.name);
        let overridden = impl_decl
            .methods
            .iter()
            .any(|m| fold_ident(&m.name) == folded);
        let sym = if overridden {
            impl_method_sym(&impl_decl.class_path, &impl_decl.self_ty, &method.name)
        } else if method.default_body.is_some() {
            default_method_sym(&impl_decl.class_path, &method.name)
        } else {
            return Err(VtableError::MissingMethod {
                class: impl_decl.class_path.clone(),
                method: method.name.clone(),
            });
        };
        method_syms.push(sym);
    }
    let drop_sym = if scx.has_drop_impl(&impl_decl.self_ty) {
        Some(drop_sym(&impl_decl.self_ty))
    } else {
        None
    };
    let vtable = Vtable {
        class_path: impl_decl.class_path.clone(),
        size,
        align,
        drop_sym,
        method_syms,
    };
    debug!("build_vtable: {} ({} methods)", vtable_sym(&impl_decl.class_path, &impl_decl.self_ty), vtable.method_syms.len());
    Ok(vtable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursive_ast::ast::{Block, ClassMethodDecl, ProcDecl};
    use cursive_ast::types::{mk_prim, PrimTy};

    fn class() -> ClassDecl {
        ClassDecl {
            path: Path::single("Show"),
            methods: vec![
                ClassMethodDecl {
                    name: "fmt".into(),
                    params: vec![],
                    ret: cursive_ast::types::mk_unit(),
                    default_body: None,
                },
                ClassMethodDecl {
                    name: "brief".into(),
                    params: vec![],
                    ret: cursive_ast::types::mk_unit(),
                    default_body: Some(Block::new(vec![], None)),
                },
            ],
        }
    }

    fn impl_of(methods: Vec<&str>) -> ImplDecl {
        ImplDecl {
            class_path: Path::single("Show"),
            self_ty: mk_prim(PrimTy::Bool),
            methods: methods
                .into_iter()
                .map(|name| ProcDecl {
                    name: name.into(),
                    params: vec![],
                    ret: cursive_ast::types::mk_unit(),
                    body: Some(Block::new(vec![], None)),
                    is_extern: false,
                })
                .collect(),
        }
    }

    #[test]
    fn slots_follow_declaration_order() {
        let c = class();
        assert_eq!(vslot(&c, "fmt"), Some(0));
        assert_eq!(vslot(&c, "Brief"), Some(1));
        assert_eq!(vslot(&c, "missing"), None);
    }

    #[test]
    fn omitted_override_points_at_default() {
        let mut scx = ScopeContext::new();
        scx.register_class(class());
        let imp = impl_of(vec!["fmt"]);
        let vt = build_vtable(&scx, &imp, 1, 1).unwrap();
        assert!(vt.method_syms[0].starts_with("cursive$impl$"));
        assert!(vt.method_syms[1].ends_with("$default"));
        assert!(vt.drop_sym.is_none());
    }

    #[test]
    fn missing_method_without_default_errors() {
        let mut scx = ScopeContext::new();
        scx.register_class(class());
        let imp = impl_of(vec!["brief"]);
        assert!(matches!(
            build_vtable(&scx, &imp, 1, 1),
            Err(VtableError::MissingMethod { .. })
        ));
    }
}
