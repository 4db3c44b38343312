//! The in-memory filesystem model behind the `Context.fs` capability.
//!
//! Operations go through [`FsState`]; a fault-injection table (`failmap`)
//! can force any (operation, path) pair to fail with a chosen error, which
//! is how error paths get exercised without a real disk.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use unicode_normalization::UnicodeNormalization;

use crate::store::Addr;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum IoErrorKind {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidPath,
    Busy,
    IoFailure,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum FsOp {
    OpenRead,
    OpenWrite,
    OpenAppend,
    CreateWrite,
    ReadFile,
    ReadBytes,
    WriteFile,
    WriteStdout,
    WriteStderr,
    Exists,
    Remove,
    OpenDir,
    CreateDir,
    EnsureDir,
    Kind,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum FsEntryKind {
    File,
    Dir,
    Other,
}

#[derive(Clone, Debug, Default)]
pub struct FsEntry {
    pub kind: Option<FsEntryKind>,
    pub bytes: Vec<u8>,
}

impl FsEntry {
    pub fn file(bytes: impl Into<Vec<u8>>) -> FsEntry {
        FsEntry { kind: Some(FsEntryKind::File), bytes: bytes.into() }
    }

    pub fn dir() -> FsEntry {
        FsEntry { kind: Some(FsEntryKind::Dir), bytes: Vec::new() }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum FsHandleState {
    OpenRead,
    OpenWrite,
    OpenAppend,
    Closed,
}

#[derive(Clone, Debug)]
pub struct FsHandle {
    pub state: FsHandleState,
    pub pos: usize,
    pub path: String,
}

#[derive(Clone, Debug)]
pub struct DirIterState {
    pub path: String,
    pub entries: Vec<String>,
    pub pos: usize,
}

/// The capability object a program sees; `base` restricts every path the
/// handle may reach.
#[derive(Clone, Debug)]
pub struct FileSystemHandle {
    pub parent: Option<Addr>,
    pub base: Option<String>,
}

#[derive(Default)]
pub struct FsState {
    /// Canonical path → entry. A `BTreeMap` keeps the world deterministic.
    pub entries: BTreeMap<String, FsEntry>,
    pub handles: FxHashMap<u64, FsHandle>,
    pub diriters: FxHashMap<u64, DirIterState>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Fault injection: the next matching op fails with the given error.
    pub failmap: FxHashMap<(FsOp, String), IoErrorKind>,
    next_handle: u64,
}

/// Canonicalizes `path` against an optional restriction base. Rejects
/// `..` segments, embedded NULs, and invalid UTF-8; under a base, rejects
/// absolute paths and anything that escapes the base prefix.
pub fn canonicalize_path(raw: &[u8], base: Option<&str>) -> Result<String, IoErrorKind> {
    let path = std::str::from_utf8(raw).map_err(|_| IoErrorKind::InvalidPath)?;
    if path.is_empty() || path.contains('\0') {
        return Err(IoErrorKind::InvalidPath);
    }
    let absolute = path.starts_with('/');
    if base.is_some() && absolute {
        return Err(IoErrorKind::PermissionDenied);
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(IoErrorKind::InvalidPath),
            s => segments.push(s),
        }
    }
    let joined = segments.join("/");
    let canonical = match base {
        Some(base) => {
            let base = base.trim_end_matches('/');
            if joined.is_empty() {
                base.to_string()
            } else {
                format!("{}/{}", base, joined)
            }
        }
        None if absolute => format!("/{}", joined),
        None => joined,
    };
    if let Some(base) = base {
        let base = base.trim_end_matches('/');
        if canonical != base && !canonical.starts_with(&format!("{}/", base)) {
            return Err(IoErrorKind::PermissionDenied);
        }
    }
    if canonical.is_empty() {
        return Err(IoErrorKind::InvalidPath);
    }
    Ok(canonical)
}

/// The sort key for directory listings: case-folded, NFC-normalized.
fn dir_order_key(name: &str) -> String {
    name.nfc().flat_map(char::to_lowercase).collect()
}

impl FsState {
    pub fn new() -> FsState {
        FsState { next_handle: 1, ..FsState::default() }
    }

    fn check_fail(&mut self, op: FsOp, path: &str) -> Result<(), IoErrorKind> {
        match self.failmap.remove(&(op, path.to_string())) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn inject_failure(&mut self, op: FsOp, path: &str, err: IoErrorKind) {
        self.failmap.insert((op, path.to_string()), err);
    }

    pub fn exists(&mut self, path: &str) -> Result<bool, IoErrorKind> {
        self.check_fail(FsOp::Exists, path)?;
        Ok(self.entries.contains_key(path))
    }

    pub fn kind(&mut self, path: &str) -> Result<FsEntryKind, IoErrorKind> {
        self.check_fail(FsOp::Kind, path)?;
        match self.entries.get(path).and_then(|e| e.kind) {
            Some(kind) => Ok(kind),
            None => Err(IoErrorKind::NotFound),
        }
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, IoErrorKind> {
        self.check_fail(FsOp::ReadFile, path)?;
        match self.entries.get(path) {
            Some(entry) if entry.kind == Some(FsEntryKind::File) => Ok(entry.bytes.clone()),
            Some(_) => Err(IoErrorKind::PermissionDenied),
            None => Err(IoErrorKind::NotFound),
        }
    }

    pub fn write_file(&mut self, path: &str, bytes: &[u8]) -> Result<(), IoErrorKind> {
        self.check_fail(FsOp::WriteFile, path)?;
        match self.entries.get_mut(path) {
            Some(entry) if entry.kind == Some(FsEntryKind::Dir) => {
                Err(IoErrorKind::PermissionDenied)
            }
            Some(entry) => {
                entry.kind = Some(FsEntryKind::File);
                entry.bytes = bytes.to_vec();
                Ok(())
            }
            None => {
                self.entries.insert(path.to_string(), FsEntry::file(bytes.to_vec()));
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, path: &str) -> Result<(), IoErrorKind> {
        self.check_fail(FsOp::Remove, path)?;
        match self.entries.remove(path) {
            Some(_) => Ok(()),
            None => Err(IoErrorKind::NotFound),
        }
    }

    pub fn create_dir(&mut self, path: &str) -> Result<(), IoErrorKind> {
        self.check_fail(FsOp::CreateDir, path)?;
        if self.entries.contains_key(path) {
            return Err(IoErrorKind::AlreadyExists);
        }
        self.entries.insert(path.to_string(), FsEntry::dir());
        Ok(())
    }

    pub fn ensure_dir(&mut self, path: &str) -> Result<(), IoErrorKind> {
        self.check_fail(FsOp::EnsureDir, path)?;
        match self.entries.get(path) {
            Some(entry) if entry.kind == Some(FsEntryKind::Dir) => Ok(()),
            Some(_) => Err(IoErrorKind::AlreadyExists),
            None => {
                self.entries.insert(path.to_string(), FsEntry::dir());
                Ok(())
            }
        }
    }

    pub fn open(&mut self, op: FsOp, path: &str) -> Result<u64, IoErrorKind> {
        self.check_fail(op, path)?;
        let state = match op {
            FsOp::OpenRead => {
                match self.entries.get(path) {
                    Some(e) if e.kind == Some(FsEntryKind::File) => {}
                    Some(_) => return Err(IoErrorKind::PermissionDenied),
                    None => return Err(IoErrorKind::NotFound),
                }
                FsHandleState::OpenRead
            }
            FsOp::OpenWrite | FsOp::CreateWrite => {
                if op == FsOp::CreateWrite && self.entries.contains_key(path) {
                    return Err(IoErrorKind::AlreadyExists);
                }
                self.entries.insert(path.to_string(), FsEntry::file(Vec::new()));
                FsHandleState::OpenWrite
            }
            FsOp::OpenAppend => {
                self.entries.entry(path.to_string()).or_insert_with(|| FsEntry::file(Vec::new()));
                FsHandleState::OpenAppend
            }
            _ => return Err(IoErrorKind::IoFailure),
        };
        let id = self.next_handle;
        self.next_handle += 1;
        let pos = match state {
            FsHandleState::OpenAppend => {
                self.entries.get(path).map_or(0, |e| e.bytes.len())
            }
            _ => 0,
        };
        self.handles.insert(id, FsHandle { state, pos, path: path.to_string() });
        Ok(id)
    }

    pub fn handle_read(&mut self, id: u64, len: usize) -> Result<Vec<u8>, IoErrorKind> {
        let handle = self.handles.get_mut(&id).ok_or(IoErrorKind::IoFailure)?;
        if handle.state != FsHandleState::OpenRead {
            return Err(IoErrorKind::PermissionDenied);
        }
        let entry = self.entries.get(&handle.path).ok_or(IoErrorKind::NotFound)?;
        let start = handle.pos.min(entry.bytes.len());
        let end = (start + len).min(entry.bytes.len());
        handle.pos = end;
        Ok(entry.bytes[start..end].to_vec())
    }

    pub fn handle_write(&mut self, id: u64, bytes: &[u8]) -> Result<(), IoErrorKind> {
        let handle = self.handles.get_mut(&id).ok_or(IoErrorKind::IoFailure)?;
        match handle.state {
            FsHandleState::OpenWrite | FsHandleState::OpenAppend => {}
            _ => return Err(IoErrorKind::PermissionDenied),
        }
        let entry = self.entries.get_mut(&handle.path).ok_or(IoErrorKind::NotFound)?;
        let end = handle.pos + bytes.len();
        if entry.bytes.len() < end {
            entry.bytes.resize(end, 0);
        }
        entry.bytes[handle.pos..end].copy_from_slice(bytes);
        handle.pos = end;
        Ok(())
    }

    pub fn close_handle(&mut self, id: u64) {
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.state = FsHandleState::Closed;
        }
    }

    /// Opens a directory iterator. Entries come out sorted by the
    /// case-folded, composition-normalized name.
    pub fn open_dir(&mut self, path: &str) -> Result<u64, IoErrorKind> {
        self.check_fail(FsOp::OpenDir, path)?;
        match self.entries.get(path) {
            Some(e) if e.kind == Some(FsEntryKind::Dir) => {}
            Some(_) => return Err(IoErrorKind::PermissionDenied),
            None => return Err(IoErrorKind::NotFound),
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut names: Vec<String> = self
            .entries
            .keys()
            .filter_map(|k| {
                let rest = k.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        names.sort_by_key(|n| dir_order_key(n));
        let id = self.next_handle;
        self.next_handle += 1;
        self.diriters.insert(id, DirIterState { path: path.to_string(), entries: names, pos: 0 });
        Ok(id)
    }

    pub fn dir_next(&mut self, id: u64) -> Option<String> {
        let iter = self.diriters.get_mut(&id)?;
        let name = iter.entries.get(iter.pos).cloned()?;
        iter.pos += 1;
        Some(name)
    }

    pub fn write_stdout(&mut self, bytes: &[u8]) -> Result<(), IoErrorKind> {
        self.check_fail(FsOp::WriteStdout, "-")?;
        self.stdout.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_stderr(&mut self, bytes: &[u8]) -> Result<(), IoErrorKind> {
        self.check_fail(FsOp::WriteStderr, "-")?;
        self.stderr.extend_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_rejects_dotdot_and_nul() {
        assert_eq!(canonicalize_path(b"a/../b", None), Err(IoErrorKind::InvalidPath));
        assert_eq!(canonicalize_path(b"a\0b", None), Err(IoErrorKind::InvalidPath));
        assert_eq!(canonicalize_path(b"a//b/./c", None), Ok("a/b/c".to_string()));
    }

    #[test]
    fn restricted_base_rejects_absolute_and_escape() {
        assert_eq!(
            canonicalize_path(b"/etc/passwd", Some("jail")),
            Err(IoErrorKind::PermissionDenied)
        );
        assert_eq!(canonicalize_path(b"data/x", Some("jail")), Ok("jail/data/x".to_string()));
    }

    #[test]
    fn invalid_utf8_is_invalid_path() {
        assert_eq!(canonicalize_path(&[0xFF, 0xFE], None), Err(IoErrorKind::InvalidPath));
    }

    #[test]
    fn dir_listing_is_folded_sorted() {
        let mut fs = FsState::new();
        fs.create_dir("d").unwrap();
        fs.write_file("d/Zeta", b"").unwrap();
        fs.write_file("d/alpha", b"").unwrap();
        fs.write_file("d/Beta", b"").unwrap();
        let id = fs.open_dir("d").unwrap();
        let mut names = Vec::new();
        while let Some(n) = fs.dir_next(id) {
            names.push(n);
        }
        assert_eq!(names, vec!["alpha", "Beta", "Zeta"]);
    }

    #[test]
    fn failmap_fires_once() {
        let mut fs = FsState::new();
        fs.write_file("f", b"hi").unwrap();
        fs.inject_failure(FsOp::ReadFile, "f", IoErrorKind::Busy);
        assert_eq!(fs.read_file("f"), Err(IoErrorKind::Busy));
        assert_eq!(fs.read_file("f"), Ok(b"hi".to_vec()));
    }

    #[test]
    fn append_positions_at_end() {
        let mut fs = FsState::new();
        fs.write_file("log", b"abc").unwrap();
        let h = fs.open(FsOp::OpenAppend, "log").unwrap();
        fs.handle_write(h, b"def").unwrap();
        assert_eq!(fs.read_file("log"), Ok(b"abcdef".to_vec()));
    }
}
