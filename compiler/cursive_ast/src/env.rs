//! The resolved environment handed to the middle-end by the resolver.

use rustc_hash::FxHashMap;

use crate::ast::{
    ClassDecl, EnumDecl, ImplDecl, ModalDecl, ModuleDecl, NodeId, ProcDecl, RecordDecl,
    VariantDecl,
};
use crate::path::{fold_ident, Path, PathKey};
use crate::types::{type_equiv, Ty};

#[derive(Clone, Debug)]
pub enum TypeDecl {
    Record(RecordDecl),
    Enum(EnumDecl),
    Modal(ModalDecl),
}

/// Everything the resolver knows: declarations by path, per-module bodies in
/// initialization order, and the resolved type of every expression.
#[derive(Default)]
pub struct ScopeContext {
    pub types: FxHashMap<PathKey, TypeDecl>,
    pub classes: FxHashMap<PathKey, ClassDecl>,
    pub impls: Vec<ImplDecl>,
    pub modules: FxHashMap<PathKey, ModuleDecl>,
    /// Module init order; a module appears after its eager dependencies.
    pub module_order: Vec<Path>,
    pub expr_tys: FxHashMap<NodeId, Ty>,
}

impl ScopeContext {
    pub fn new() -> ScopeContext {
        ScopeContext::default()
    }

    pub fn register_type(&mut self, decl: TypeDecl) {
        let path = match &decl {
            TypeDecl::Record(r) => &r.path,
            TypeDecl::Enum(e) => &e.path,
            TypeDecl::Modal(m) => &m.path,
        };
        self.types.insert(path.key(), decl);
    }

    pub fn register_class(&mut self, decl: ClassDecl) {
        self.classes.insert(decl.path.key(), decl);
    }

    pub fn register_module(&mut self, decl: ModuleDecl) {
        self.module_order.push(decl.path.clone());
        self.modules.insert(decl.path.key(), decl);
    }

    pub fn type_decl(&self, path: &Path) -> Option<&TypeDecl> {
        self.types.get(&path.key())
    }

    pub fn record_decl(&self, path: &Path) -> Option<&RecordDecl> {
        match self.types.get(&path.key())? {
            TypeDecl::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn enum_decl(&self, path: &Path) -> Option<&EnumDecl> {
        match self.types.get(&path.key())? {
            TypeDecl::Enum(e) => Some(e),
            _ => None,
        }
    }

    pub fn modal_decl(&self, path: &Path) -> Option<&ModalDecl> {
        match self.types.get(&path.key())? {
            TypeDecl::Modal(m) => Some(m),
            _ => None,
        }
    }

    pub fn class_decl(&self, path: &Path) -> Option<&ClassDecl> {
        self.classes.get(&path.key())
    }

    pub fn module(&self, path: &Path) -> Option<&ModuleDecl> {
        self.modules.get(&path.key())
    }

    /// Looks up `Enum.Variant` given the full variant path.
    pub fn enum_variant(&self, path: &Path) -> Option<(&EnumDecl, usize, &VariantDecl)> {
        let variant = path.last()?;
        let decl = self.enum_decl(&path.parent())?;
        let folded = fold_ident(variant);
        let idx = decl.variants.iter().position(|v| fold_ident(&v.name) == folded)?;
        Some((decl, idx, &decl.variants[idx]))
    }

    /// Finds the procedure `module.name`.
    pub fn proc(&self, path: &Path) -> Option<&ProcDecl> {
        let name = path.last()?;
        let module = self.module(&path.parent())?;
        let folded = fold_ident(name);
        module.procs.iter().find(|p| fold_ident(&p.name) == folded)
    }

    /// The impl of `class_path` for `self_ty`, if any.
    pub fn impl_for(&self, class_path: &Path, self_ty: &Ty) -> Option<&ImplDecl> {
        self.impls
            .iter()
            .find(|i| i.class_path == *class_path && type_equiv(&i.self_ty, self_ty))
    }

    /// Whether `self_ty` implements the built-in `Drop` class.
    pub fn has_drop_impl(&self, self_ty: &Ty) -> bool {
        self.impl_for(&drop_class_path(), self_ty).is_some()
    }

    pub fn expr_ty(&self, id: NodeId) -> Option<&Ty> {
        self.expr_tys.get(&id)
    }
}

/// The built-in capability record every `main` receives.
pub fn context_path() -> Path {
    Path::single("Context")
}

pub fn drop_class_path() -> Path {
    Path::single("Drop")
}

pub fn region_modal_path() -> Path {
    Path::single("Region")
}

pub fn string_path() -> Path {
    Path::single("String")
}

pub fn bytes_path() -> Path {
    Path::single("Bytes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VariantDecl;

    #[test]
    fn enum_variant_lookup_folds_names() {
        let mut scx = ScopeContext::new();
        scx.register_type(TypeDecl::Enum(EnumDecl {
            path: Path::single("Option"),
            variants: vec![
                VariantDecl { name: "None".into(), payload: None, discr: None },
                VariantDecl { name: "Some".into(), payload: None, discr: None },
            ],
        }));
        let (_, idx, variant) =
            scx.enum_variant(&Path::from_segments(vec!["option", "SOME"])).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(variant.name, "Some");
    }
}
