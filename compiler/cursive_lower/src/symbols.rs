//! Symbol mangling and the builtin alias table.

use rustc_hash::FxHashMap;

use cursive_ast::path::{fold_ident, Path};

/// Mangles a user procedure: module segments and name joined by `$` under
/// the `cursive$` prefix.
pub fn proc_sym(module: &Path, name: &str) -> String {
    let mut out = String::from("cursive");
    for segment in &module.segments {
        out.push('$');
        out.push_str(&fold_ident(segment));
    }
    out.push('$');
    out.push_str(&fold_ident(name));
    out
}

pub fn init_sym(module: &Path) -> String {
    proc_sym(module, "init")
}

pub fn deinit_sym(module: &Path) -> String {
    proc_sym(module, "deinit")
}

pub fn global_sym(module: &Path, name: &str) -> String {
    format!("cursive$static${}${}", mangle_segments(module), fold_ident(name))
}

pub fn poison_flag_sym(module: &Path) -> String {
    format!("cursive$poison${}", mangle_segments(module))
}

fn mangle_segments(path: &Path) -> String {
    path.segments.iter().map(|s| fold_ident(s)).collect::<Vec<_>>().join("$")
}

/// Runtime symbols referenced from lowered code. Lowering emits the
/// language-level name; the alias table maps it to the runtime's exported
/// symbol, so the runtime can rename without touching the lowering rules.
pub struct BuiltinSyms {
    table: FxHashMap<&'static str, &'static str>,
}

impl BuiltinSyms {
    pub fn new() -> BuiltinSyms {
        let mut table = FxHashMap::default();
        table.insert("panic", "cursive_rt_panic");
        table.insert("parallel_work_panic", "cursive_rt_parallel_work_panic");
        table.insert("alloc_raw", "cursive_rt_alloc_raw");
        table.insert("dealloc_raw", "cursive_rt_dealloc_raw");
        table.insert("heap_with_quota", "cursive_rt_heap_with_quota");
        table.insert("string_from", "cursive_rt_string_from");
        table.insert("string_append", "cursive_rt_string_append");
        table.insert("string_free", "cursive_rt_string_free");
        table.insert("bytes_append", "cursive_rt_bytes_append");
        table.insert("bytes_free", "cursive_rt_bytes_free");
        table.insert("region_new_scoped", "cursive_rt_region_new_scoped");
        table.insert("region_alloc", "cursive_rt_region_alloc");
        table.insert("region_reset_unchecked", "cursive_rt_region_reset_unchecked");
        table.insert("region_freeze", "cursive_rt_region_freeze");
        table.insert("region_thaw", "cursive_rt_region_thaw");
        table.insert("region_free_unchecked", "cursive_rt_region_free_unchecked");
        table.insert("parallel_begin", "cursive_rt_parallel_begin");
        table.insert("parallel_join", "cursive_rt_parallel_join");
        table.insert("spawn_task", "cursive_rt_spawn_task");
        table.insert("spawn_wait", "cursive_rt_spawn_wait");
        table.insert("dispatch_run", "cursive_rt_dispatch_run");
        table.insert("cancel_token_new", "cursive_rt_cancel_token_new");
        table.insert("cancel_token_cancel", "cursive_rt_cancel_token_cancel");
        table.insert("fs_open", "cursive_rt_fs_open");
        table.insert("fs_read", "cursive_rt_fs_read");
        table.insert("fs_write", "cursive_rt_fs_write");
        table.insert("fs_close", "cursive_rt_fs_close");
        table.insert("fs_dir_open", "cursive_rt_fs_dir_open");
        table.insert("fs_dir_next", "cursive_rt_fs_dir_next");
        table.insert("context_init", "cursive_rt_context_init");
        BuiltinSyms { table }
    }

    pub fn resolve(&self, name: &str) -> Option<&'static str> {
        self.table.get(name).copied()
    }
}

impl Default for BuiltinSyms {
    fn default() -> BuiltinSyms {
        BuiltinSyms::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_syms_fold_and_join() {
        let module = Path::from_segments(vec!["App", "Net"]);
        assert_eq!(proc_sym(&module, "Send"), "cursive$app$net$send");
        assert_eq!(init_sym(&module), "cursive$app$net$init");
    }

    #[test]
    fn builtin_table_resolves_runtime_names() {
        let syms = BuiltinSyms::new();
        assert_eq!(syms.resolve("panic"), Some("cursive_rt_panic"));
        assert_eq!(syms.resolve("missing"), None);
    }
}
