//! Builtin procedures and methods: managed strings/bytes, regions, and the
//! `Context` capability objects (filesystem, heap, execution domains).

use tracing::trace;

use cursive_ast::ast::Expr;
use cursive_ast::path::{fold_ident, Path};
use cursive_ast::types::{mk_path, Ty};
use cursive_middle::panic::PanicReason;
use cursive_middle::store::fs::{canonicalize_path, FileSystemHandle, IoErrorKind};
use cursive_middle::value::{
    BytesVal, DynamicVal, EnumVal, ModalVal, RawPtrVal, StrState, StrVal, UnionVal, Value,
};

use crate::control::{Control, Outcome};
use crate::expr::{int_of, region_target_of, PlaceOut};
use crate::machine::{ice, EvalContext, EvalResult};
use crate::rt::heap::HeapModel;

pub fn is_builtin_proc(path: &Path) -> bool {
    match path.segments.len() {
        1 => fold_ident(&path.segments[0]) == "free_unchecked",
        2 => {
            let owner = fold_ident(&path.segments[0]);
            let name = fold_ident(&path.segments[1]);
            matches!(
                (owner.as_str(), name.as_str()),
                ("string", "from") | ("bytes", "from") | ("region", "new_scoped")
            )
        }
        _ => false,
    }
}

pub fn call_builtin_proc(
    ecx: &mut EvalContext<'_>,
    path: &Path,
    mut args: Vec<Value>,
) -> EvalResult<Outcome> {
    let name = fold_ident(path.last().unwrap_or_default());
    match name.as_str() {
        "from" => {
            let source = args.pop().ok_or_else(|| ice("from without operand"))?;
            let as_bytes = fold_ident(&path.segments[0]) == "bytes";
            managed_from(ecx, source, as_bytes)
        }
        "new_scoped" => {
            let (tag, target) = ecx.sigma.push_region();
            ecx.trace.record("region", "new_scoped", &format!("target {}", target));
            Ok(Outcome::Val(region_handle(tag, target, "Active")))
        }
        "free_unchecked" => {
            let handle = args.pop().ok_or_else(|| ice("free_unchecked without region"))?;
            let Some(target) = region_target_of(&handle) else {
                return Err(ice(format!("free_unchecked of {}", handle)));
            };
            ecx.sigma.free_region(target);
            ecx.trace.record("region", "free_unchecked", &format!("target {}", target));
            Ok(Outcome::unit())
        }
        other => Err(ice(format!("builtin proc `{}`", other))),
    }
}

fn region_handle(tag: u64, target: u64, state: &str) -> Value {
    Value::Modal(ModalVal {
        state: state.to_string(),
        payload: Box::new(Value::Tuple(vec![Value::usize(tag), Value::usize(target)])),
    })
}

/// Copies source bytes into a fresh managed buffer, charging the heap.
fn managed_from(
    ecx: &mut EvalContext<'_>,
    source: Value,
    as_bytes: bool,
) -> EvalResult<Outcome> {
    let bytes = match &source {
        Value::Str(s) => s.bytes.clone(),
        Value::Bytes(b) => b.bytes.clone(),
        other => return Err(ice(format!("from of {}", other))),
    };
    let cap = bytes.len();
    if ecx.heap.alloc_raw(cap as u64).is_err() {
        return Ok(Outcome::Ctrl(Control::panic(PanicReason::Other)));
    }
    trace!("managed_from: {} bytes", cap);
    let value = if as_bytes {
        Value::Bytes(BytesVal { state: StrState::Managed, bytes, cap })
    } else {
        Value::Str(StrVal { state: StrState::Managed, bytes, cap })
    };
    Ok(Outcome::Val(value))
}

/// String/Bytes instance methods. Returns the updated receiver (for place
/// write-back) alongside the call result.
pub fn buffer_method(
    ecx: &mut EvalContext<'_>,
    recv: Value,
    name: &str,
    mut args: Vec<Value>,
) -> EvalResult<(Option<Value>, Outcome)> {
    let folded = fold_ident(name);
    match folded.as_str() {
        "length" => {
            let len = match &recv {
                Value::Str(s) => s.bytes.len(),
                Value::Bytes(b) => b.bytes.len(),
                _ => return Err(ice("length receiver")),
            };
            Ok((None, Outcome::Val(Value::usize(len as u64))))
        }
        "as_view" => {
            let view = match &recv {
                Value::Str(s) => {
                    Value::Str(StrVal { state: StrState::View, bytes: s.bytes.clone(), cap: 0 })
                }
                Value::Bytes(b) => Value::Bytes(BytesVal {
                    state: StrState::View,
                    bytes: b.bytes.clone(),
                    cap: 0,
                }),
                _ => return Err(ice("as_view receiver")),
            };
            Ok((None, Outcome::Val(view)))
        }
        "append" => {
            let suffix = args.pop().ok_or_else(|| ice("append without operand"))?;
            let suffix_bytes = match &suffix {
                Value::Str(s) => s.bytes.clone(),
                Value::Bytes(b) => b.bytes.clone(),
                other => return Err(ice(format!("append of {}", other))),
            };
            let (mut bytes, mut cap, was_view, is_bytes) = match recv {
                Value::Str(s) => (s.bytes, s.cap, s.state == StrState::View, false),
                Value::Bytes(b) => (b.bytes, b.cap, b.state == StrState::View, true),
                other => return Err(ice(format!("append receiver {}", other))),
            };
            // Appending to a view widens it to managed first (a copy).
            if was_view {
                cap = bytes.len();
                if ecx.heap.alloc_raw(cap as u64).is_err() {
                    return Ok((None, Outcome::Ctrl(Control::panic(PanicReason::Other))));
                }
            }
            let needed = bytes.len() + suffix_bytes.len();
            if needed > cap {
                let new_cap = HeapModel::grow_cap(cap, needed);
                if ecx.heap.grow(cap as u64, new_cap as u64).is_err() {
                    return Ok((None, Outcome::Ctrl(Control::panic(PanicReason::Other))));
                }
                cap = new_cap;
            }
            bytes.extend_from_slice(&suffix_bytes);
            let updated = if is_bytes {
                Value::Bytes(BytesVal { state: StrState::Managed, bytes, cap })
            } else {
                Value::Str(StrVal { state: StrState::Managed, bytes, cap })
            };
            Ok((Some(updated), Outcome::unit()))
        }
        other => Err(ice(format!("buffer method `{}`", other))),
    }
}

// Regions.

pub fn region_method(
    ecx: &mut EvalContext<'_>,
    recv: &Expr,
    recv_value: Value,
    state: &str,
    name: &str,
    mut args: Vec<Value>,
) -> EvalResult<Outcome> {
    let folded = fold_ident(name);
    let Some(target) = region_target_of(&recv_value) else {
        return Err(ice("region method on non-region"));
    };
    let tag = match &recv_value {
        Value::Modal(m) => match &*m.payload {
            Value::Tuple(elems) => elems.first().and_then(int_of).unwrap_or(0),
            _ => 0,
        },
        _ => 0,
    };
    match folded.as_str() {
        "alloc" => {
            if fold_ident(state) != "active" {
                return Ok(Outcome::Ctrl(Control::panic(PanicReason::Other)));
            }
            let value = args.pop().ok_or_else(|| ice("region alloc without value"))?;
            match ecx.sigma.alloc_in_region(target, value) {
                Some(addr) => {
                    ecx.trace.record("region", "alloc", &format!("target {}", target));
                    Ok(Outcome::Val(Value::Ptr(cursive_middle::value::PtrVal {
                        state: cursive_ast::types::PtrState::Valid,
                        addr,
                    })))
                }
                None => Ok(Outcome::Ctrl(Control::panic(PanicReason::ExpiredDeref))),
            }
        }
        "freeze" | "thaw" => {
            let frozen = folded == "freeze";
            if let Some(region) = ecx.sigma.region_by_target_mut(target) {
                region.frozen = frozen;
            }
            let next = if frozen { "Frozen" } else { "Active" };
            let handle = region_handle(tag, target, next);
            write_back(ecx, recv, handle.clone())?;
            ecx.trace.record("region", &folded, &format!("target {}", target));
            Ok(Outcome::Val(handle))
        }
        "reset_unchecked" => {
            ecx.sigma.region_reset_to_mark(target, 0);
            ecx.trace.record("region", "reset_unchecked", &format!("target {}", target));
            Ok(Outcome::unit())
        }
        "free_unchecked" => {
            ecx.sigma.free_region(target);
            ecx.trace.record("region", "free_unchecked", &format!("target {}", target));
            Ok(Outcome::unit())
        }
        other => Err(ice(format!("region method `{}`", other))),
    }
}

fn write_back(ecx: &mut EvalContext<'_>, recv: &Expr, value: Value) -> EvalResult<()> {
    if !recv.is_place() {
        return Ok(());
    }
    if let PlaceOut::Place(addr) = ecx.eval_place(recv)? {
        let _ = ecx.sigma.write_location(addr, value);
    }
    Ok(())
}

// Context capabilities.

pub fn is_context_record(ty: &Ty) -> bool {
    matches!(
        &**cursive_ast::types::strip_perm(ty),
        cursive_ast::types::TyKind::Path(path) if *path == cursive_ast::env::context_path()
    )
}

pub fn is_capability_class(path: &Path) -> bool {
    let folded = fold_ident(path.last().unwrap_or_default());
    matches!(folded.as_str(), "filesystem" | "heapallocator" | "reactor")
}

/// Builds the `Context` record `main` receives.
pub fn make_context(ecx: &mut EvalContext<'_>) -> Value {
    let fs_addr = ecx.sigma.alloc_addr();
    ecx.sigma
        .fs_handles
        .insert(fs_addr, FileSystemHandle { parent: None, base: None });
    let capability = |class: &str, addr| {
        Value::Dynamic(DynamicVal {
            class_path: Path::single(class),
            data: RawPtrVal { qual: cursive_ast::types::RawPtrQual::Mut, addr },
            concrete: cursive_ast::types::mk_unit(),
        })
    };
    let heap_addr = ecx.sigma.alloc_addr();
    let reactor_addr = ecx.sigma.alloc_addr();
    Value::Record(cursive_middle::value::RecordVal {
        ty: mk_path(cursive_ast::env::context_path()),
        fields: vec![
            ("fs".to_string(), capability("FileSystem", fs_addr)),
            ("heap".to_string(), capability("HeapAllocator", heap_addr)),
            ("reactor".to_string(), capability("Reactor", reactor_addr)),
        ],
    })
}

/// `ctx.cpu()` / `ctx.gpu()` / `ctx.inline()` name execution domains.
pub fn context_method(
    _ecx: &mut EvalContext<'_>,
    name: &str,
    _args: Vec<Value>,
) -> EvalResult<Outcome> {
    let folded = fold_ident(name);
    match folded.as_str() {
        "cpu" | "gpu" | "inline" => Ok(Outcome::Val(Value::str_view(folded.into_bytes()))),
        other => Err(ice(format!("context method `{}`", other))),
    }
}

pub fn capability_method(
    ecx: &mut EvalContext<'_>,
    recv: Value,
    name: &str,
    args: Vec<Value>,
) -> EvalResult<Outcome> {
    let Value::Dynamic(dyn_val) = &recv else {
        return Err(ice("capability receiver"));
    };
    let class = fold_ident(dyn_val.class_path.last().unwrap_or_default());
    match class.as_str() {
        "filesystem" => fs_method(ecx, dyn_val.data.addr, name, args),
        "heapallocator" => heap_method(ecx, name, args),
        "reactor" => Err(ice("reactor has no methods in the core")),
        other => Err(ice(format!("capability `{}`", other))),
    }
}

fn heap_method(
    ecx: &mut EvalContext<'_>,
    name: &str,
    mut args: Vec<Value>,
) -> EvalResult<Outcome> {
    match fold_ident(name).as_str() {
        "with_quota" => {
            let quota = args
                .pop()
                .as_ref()
                .and_then(int_of)
                .ok_or_else(|| ice("with_quota operand"))?;
            // The sub-allocator narrows the model's remaining budget.
            ecx.heap.quota = Some(match ecx.heap.quota {
                Some(existing) => existing.min(ecx.heap.live_bytes + quota),
                None => ecx.heap.live_bytes + quota,
            });
            ecx.trace.record("heap", "with_quota", &quota.to_string());
            Ok(Outcome::unit())
        }
        other => Err(ice(format!("heap method `{}`", other))),
    }
}

// Filesystem.

fn io_error_value(kind: IoErrorKind) -> Value {
    let name = match kind {
        IoErrorKind::NotFound => "NotFound",
        IoErrorKind::PermissionDenied => "PermissionDenied",
        IoErrorKind::AlreadyExists => "AlreadyExists",
        IoErrorKind::InvalidPath => "InvalidPath",
        IoErrorKind::Busy => "Busy",
        IoErrorKind::IoFailure => "IoFailure",
    };
    Value::Enum(EnumVal {
        path: Path::from_segments(vec!["IoError", name]),
        payload: None,
    })
}

fn ok_union(member: Ty, value: Value) -> Value {
    Value::Union(UnionVal { member, value: Box::new(value) })
}

fn err_union(kind: IoErrorKind) -> Value {
    Value::Union(UnionVal {
        member: mk_path(Path::single("IoError")),
        value: Box::new(io_error_value(kind)),
    })
}

fn value_bytes(v: &Value) -> Option<Vec<u8>> {
    match v {
        Value::Str(s) => Some(s.bytes.clone()),
        Value::Bytes(b) => Some(b.bytes.clone()),
        _ => None,
    }
}

fn fs_method(
    ecx: &mut EvalContext<'_>,
    fs_addr: u64,
    name: &str,
    mut args: Vec<Value>,
) -> EvalResult<Outcome> {
    let base = ecx
        .sigma
        .fs_handles
        .get(&fs_addr)
        .and_then(|h| h.base.clone());
    let folded = fold_ident(name);
    trace!("fs_method: {} (base {:?})", folded, base);

    // `restricted(base)` derives a narrowed capability.
    if folded == "restricted" {
        let new_base = args
            .pop()
            .as_ref()
            .and_then(value_bytes)
            .ok_or_else(|| ice("restricted operand"))?;
        let new_base = match canonicalize_path(&new_base, base.as_deref()) {
            Ok(p) => p,
            Err(kind) => return Ok(Outcome::Val(err_union(kind))),
        };
        let new_addr = ecx.sigma.alloc_addr();
        ecx.sigma.fs_handles.insert(
            new_addr,
            FileSystemHandle { parent: Some(fs_addr), base: Some(new_base) },
        );
        return Ok(Outcome::Val(Value::Dynamic(DynamicVal {
            class_path: Path::single("FileSystem"),
            data: RawPtrVal { qual: cursive_ast::types::RawPtrQual::Mut, addr: new_addr },
            concrete: cursive_ast::types::mk_unit(),
        })));
    }

    let path_arg = |args: &mut Vec<Value>| -> Option<Vec<u8>> {
        args.first().and_then(value_bytes).map(|b| {
            args.remove(0);
            b
        })
    };

    match folded.as_str() {
        "read_file" => {
            let Some(raw) = path_arg(&mut args) else { return Err(ice("read_file path")) };
            let path = match canonicalize_path(&raw, base.as_deref()) {
                Ok(p) => p,
                Err(kind) => return Ok(Outcome::Val(err_union(kind))),
            };
            match ecx.sigma.fs_state.read_file(&path) {
                Ok(bytes) => {
                    let cap = bytes.len();
                    if ecx.heap.alloc_raw(cap as u64).is_err() {
                        return Ok(Outcome::Ctrl(Control::panic(PanicReason::Other)));
                    }
                    Ok(Outcome::Val(ok_union(
                        mk_path(cursive_ast::env::string_path()),
                        Value::Str(StrVal { state: StrState::Managed, bytes, cap }),
                    )))
                }
                Err(kind) => Ok(Outcome::Val(err_union(kind))),
            }
        }
        "write_file" => {
            let Some(raw) = path_arg(&mut args) else { return Err(ice("write_file path")) };
            let Some(data) = args.first().and_then(value_bytes) else {
                return Err(ice("write_file data"));
            };
            let path = match canonicalize_path(&raw, base.as_deref()) {
                Ok(p) => p,
                Err(kind) => return Ok(Outcome::Val(err_union(kind))),
            };
            match ecx.sigma.fs_state.write_file(&path, &data) {
                Ok(()) => Ok(Outcome::Val(ok_union(cursive_ast::types::mk_unit(), Value::Unit))),
                Err(kind) => Ok(Outcome::Val(err_union(kind))),
            }
        }
        "exists" => {
            let Some(raw) = path_arg(&mut args) else { return Err(ice("exists path")) };
            let path = match canonicalize_path(&raw, base.as_deref()) {
                Ok(p) => p,
                Err(kind) => return Ok(Outcome::Val(err_union(kind))),
            };
            match ecx.sigma.fs_state.exists(&path) {
                Ok(b) => Ok(Outcome::Val(ok_union(
                    cursive_ast::types::mk_prim(cursive_ast::types::PrimTy::Bool),
                    Value::Bool(b),
                ))),
                Err(kind) => Ok(Outcome::Val(err_union(kind))),
            }
        }
        "remove" => {
            let Some(raw) = path_arg(&mut args) else { return Err(ice("remove path")) };
            let path = match canonicalize_path(&raw, base.as_deref()) {
                Ok(p) => p,
                Err(kind) => return Ok(Outcome::Val(err_union(kind))),
            };
            match ecx.sigma.fs_state.remove(&path) {
                Ok(()) => Ok(Outcome::Val(ok_union(cursive_ast::types::mk_unit(), Value::Unit))),
                Err(kind) => Ok(Outcome::Val(err_union(kind))),
            }
        }
        "create_dir" => {
            let Some(raw) = path_arg(&mut args) else { return Err(ice("create_dir path")) };
            let path = match canonicalize_path(&raw, base.as_deref()) {
                Ok(p) => p,
                Err(kind) => return Ok(Outcome::Val(err_union(kind))),
            };
            match ecx.sigma.fs_state.create_dir(&path) {
                Ok(()) => Ok(Outcome::Val(ok_union(cursive_ast::types::mk_unit(), Value::Unit))),
                Err(kind) => Ok(Outcome::Val(err_union(kind))),
            }
        }
        "read_dir" => {
            let Some(raw) = path_arg(&mut args) else { return Err(ice("read_dir path")) };
            let path = match canonicalize_path(&raw, base.as_deref()) {
                Ok(p) => p,
                Err(kind) => return Ok(Outcome::Val(err_union(kind))),
            };
            match ecx.sigma.fs_state.open_dir(&path) {
                Ok(id) => {
                    let mut names = Vec::new();
                    while let Some(name) = ecx.sigma.fs_state.dir_next(id) {
                        names.push(Value::str_view(name.into_bytes()));
                    }
                    Ok(Outcome::Val(ok_union(
                        std::rc::Rc::new(cursive_ast::types::TyKind::Slice {
                            elem: mk_path(cursive_ast::env::string_path()),
                        }),
                        Value::Array(names),
                    )))
                }
                Err(kind) => Ok(Outcome::Val(err_union(kind))),
            }
        }
        "write_stdout" => {
            let Some(data) = args.first().and_then(value_bytes) else {
                return Err(ice("write_stdout data"));
            };
            match ecx.sigma.fs_state.write_stdout(&data) {
                Ok(()) => Ok(Outcome::Val(ok_union(cursive_ast::types::mk_unit(), Value::Unit))),
                Err(kind) => Ok(Outcome::Val(err_union(kind))),
            }
        }
        "write_stderr" => {
            let Some(data) = args.first().and_then(value_bytes) else {
                return Err(ice("write_stderr data"));
            };
            match ecx.sigma.fs_state.write_stderr(&data) {
                Ok(()) => Ok(Outcome::Val(ok_union(cursive_ast::types::mk_unit(), Value::Unit))),
                Err(kind) => Ok(Outcome::Val(err_union(kind))),
            }
        }
        "kind" => {
            let Some(raw) = path_arg(&mut args) else { return Err(ice("kind path")) };
            let path = match canonicalize_path(&raw, base.as_deref()) {
                Ok(p) => p,
                Err(kind) => return Ok(Outcome::Val(err_union(kind))),
            };
            match ecx.sigma.fs_state.kind(&path) {
                Ok(kind) => {
                    let name = match kind {
                        cursive_middle::store::fs::FsEntryKind::File => "File",
                        cursive_middle::store::fs::FsEntryKind::Dir => "Dir",
                        cursive_middle::store::fs::FsEntryKind::Other => "Other",
                    };
                    Ok(Outcome::Val(ok_union(
                        mk_path(Path::single("FileKind")),
                        Value::Enum(EnumVal {
                            path: Path::from_segments(vec!["FileKind", name]),
                            payload: None,
                        }),
                    )))
                }
                Err(kind) => Ok(Outcome::Val(err_union(kind))),
            }
        }
        other => Err(ice(format!("fs method `{}`", other))),
    }
}
