//! Σ: the single mutable world the interpreter executes against and the
//! static analyses reason about. It owns the store, the scope stack, the
//! region stack, the runtime tags that decide whether an address is still
//! readable, and the per-module poison flags.

pub mod fs;

use std::collections::BTreeSet;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

use cursive_ast::ast::Block;
use cursive_ast::path::{fold_ident, PathKey};

use crate::value::Value;
use self::fs::{FileSystemHandle, FsState};

pub type Addr = u64;
pub type ScopeId = u64;
pub type BindId = u64;
pub type RegionTag = u64;
pub type RegionTarget = u64;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Movability {
    Mov,
    Immov,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Responsibility {
    /// This binding drops its value on scope exit.
    Resp,
    /// Another binding is responsible; this one only observes.
    Alias,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BindState {
    Valid,
    Moved,
    PartiallyMoved { fields: BTreeSet<String> },
}

impl BindState {
    /// Whether a read of `field` (or of the whole value, `None`) is allowed.
    pub fn permits_read(&self, field: Option<&str>) -> bool {
        match self {
            BindState::Valid => true,
            BindState::Moved => false,
            BindState::PartiallyMoved { fields } => match field {
                Some(f) => !fields.contains(&fold_ident(f)),
                None => fields.is_empty(),
            },
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BindInfo {
    pub movability: Movability,
    pub responsibility: Responsibility,
}

impl BindInfo {
    pub fn owned() -> BindInfo {
        BindInfo { movability: Movability::Mov, responsibility: Responsibility::Resp }
    }

    pub fn alias() -> BindInfo {
        BindInfo { movability: Movability::Mov, responsibility: Responsibility::Alias }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Binding {
    pub scope_id: ScopeId,
    pub bind_id: BindId,
    pub name: String,
    pub addr: Addr,
}

#[derive(Clone, Debug)]
pub enum BindingValue {
    Val(Value),
    Alias { addr: Addr },
}

#[derive(Clone, Debug)]
pub enum CleanupItem {
    DropBinding(Binding),
    DropStatic { module: PathKey, name: String },
    DeferBlock(Rc<Block>),
}

#[derive(Default, Debug)]
pub struct ScopeEntry {
    pub id: ScopeId,
    /// Insertion order; executed in reverse at pop.
    pub cleanup: Vec<CleanupItem>,
    names: FxHashMap<String, SmallVec<[BindId; 4]>>,
    vals: FxHashMap<BindId, BindingValue>,
    states: FxHashMap<BindId, BindState>,
    infos: FxHashMap<BindId, BindInfo>,
    addrs: FxHashMap<BindId, Addr>,
    next_bind_id: BindId,
}

#[derive(Clone, Debug)]
pub struct RegionEntry {
    pub tag: RegionTag,
    pub target: RegionTarget,
    pub scope: ScopeId,
    /// Every address allocated into this region, in allocation order; frames
    /// record a mark into this list and truncate back to it.
    pub allocs: Vec<Addr>,
    pub frozen: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RuntimeTagKind {
    Region,
    Scope,
    /// Static storage: live for the whole life of Σ.
    Static,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct RuntimeTag {
    pub kind: RuntimeTagKind,
    pub id: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AddrProj {
    Field(String),
    Tuple(usize),
    Index(usize),
}

/// A derived address: a view into a field/element of the value at `base`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AddrView {
    pub base: Addr,
    pub proj: AddrProj,
}

/// Failure modes of a raw store access; the caller maps these onto the
/// `NullDeref`/`ExpiredDeref` panics.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemError {
    Expired,
    Unmapped,
}

#[derive(Default)]
pub struct Sigma {
    pub store: FxHashMap<Addr, Value>,
    pub scope_stack: Vec<ScopeEntry>,
    pub region_stack: Vec<RegionEntry>,
    pub addr_tags: FxHashMap<Addr, RuntimeTag>,
    pub addr_views: FxHashMap<Addr, AddrView>,
    pub fs_state: FsState,
    pub fs_handles: FxHashMap<Addr, FileSystemHandle>,
    pub binding_by_addr: FxHashMap<Addr, Binding>,
    pub static_addrs: FxHashMap<(PathKey, String), Addr>,
    pub poison_flags: FxHashMap<PathKey, Addr>,
    next_addr: Addr,
    next_scope_id: ScopeId,
    next_region_tag: RegionTag,
    next_region_target: RegionTarget,
}

impl Sigma {
    pub fn new() -> Sigma {
        Sigma {
            next_addr: 1,
            next_scope_id: 1,
            next_region_tag: 1,
            next_region_target: 1,
            ..Sigma::default()
        }
    }

    /// Monotone address allocation; addresses are never reused.
    pub fn alloc_addr(&mut self) -> Addr {
        let addr = self.next_addr;
        self.next_addr += 1;
        addr
    }

    // Scopes.

    pub fn push_scope(&mut self) -> ScopeId {
        let id = self.next_scope_id;
        self.next_scope_id += 1;
        trace!("push_scope: {}", id);
        self.scope_stack.push(ScopeEntry { id, ..ScopeEntry::default() });
        id
    }

    /// Removes the innermost scope and hands it back; the caller must have
    /// run its cleanup list first (the interpreter's `cleanup_scope`).
    pub fn pop_scope(&mut self) -> Option<ScopeEntry> {
        let scope = self.scope_stack.pop()?;
        trace!("pop_scope: {}", scope.id);
        for addr in scope.addrs.values() {
            // Alias bindings borrow someone else's address; only addresses
            // this scope itself tagged expire with it.
            let owned = matches!(
                self.addr_tags.get(addr),
                Some(RuntimeTag { kind: RuntimeTagKind::Scope, id }) if *id == scope.id
            );
            if owned {
                self.addr_tags.remove(addr);
                self.binding_by_addr.remove(addr);
            }
        }
        Some(scope)
    }

    pub fn current_scope(&self) -> Option<&ScopeEntry> {
        self.scope_stack.last()
    }

    pub fn current_scope_mut(&mut self) -> Option<&mut ScopeEntry> {
        self.scope_stack.last_mut()
    }

    pub fn current_scope_id(&self) -> ScopeId {
        self.scope_stack.last().map_or(0, |s| s.id)
    }

    pub fn append_cleanup(&mut self, item: CleanupItem) -> bool {
        match self.scope_stack.last_mut() {
            Some(scope) => {
                scope.cleanup.push(item);
                true
            }
            None => false,
        }
    }

    // Bindings.

    /// Inserts a binding into the current scope. Direct values get a fresh
    /// scope-tagged address so pointers to them have provenance.
    pub fn bind_val(
        &mut self,
        name: &str,
        value: BindingValue,
        info: BindInfo,
    ) -> Option<Binding> {
        let addr = match &value {
            BindingValue::Val(_) => self.alloc_addr(),
            BindingValue::Alias { addr } => *addr,
        };
        let scope = self.scope_stack.last_mut()?;
        let bind_id = scope.next_bind_id;
        scope.next_bind_id += 1;
        let binding =
            Binding { scope_id: scope.id, bind_id, name: name.to_string(), addr };
        scope.names.entry(fold_ident(name)).or_default().push(bind_id);
        let is_direct = matches!(value, BindingValue::Val(_));
        scope.vals.insert(bind_id, value);
        scope.states.insert(bind_id, BindState::Valid);
        scope.infos.insert(bind_id, info);
        scope.addrs.insert(bind_id, addr);
        if is_direct {
            let scope_id = scope.id;
            self.addr_tags
                .insert(addr, RuntimeTag { kind: RuntimeTagKind::Scope, id: scope_id });
            self.binding_by_addr.insert(addr, binding.clone());
        }
        trace!("bind_val: {} -> {:?}", name, binding);
        Some(binding)
    }

    /// Innermost-wins lookup across the scope stack; within a scope, the
    /// latest binding of the name shadows earlier ones.
    pub fn lookup_bind(&self, name: &str) -> Option<Binding> {
        let folded = fold_ident(name);
        for scope in self.scope_stack.iter().rev() {
            if let Some(ids) = scope.names.get(&folded) {
                if let Some(&bind_id) = ids.last() {
                    return Some(Binding {
                        scope_id: scope.id,
                        bind_id,
                        name: name.to_string(),
                        addr: scope.addrs.get(&bind_id).copied().unwrap_or(0),
                    });
                }
            }
        }
        None
    }

    fn scope_of(&self, binding: &Binding) -> Option<&ScopeEntry> {
        self.scope_stack.iter().find(|s| s.id == binding.scope_id)
    }

    fn scope_of_mut(&mut self, binding: &Binding) -> Option<&mut ScopeEntry> {
        self.scope_stack.iter_mut().find(|s| s.id == binding.scope_id)
    }

    pub fn binding_value_of(&self, binding: &Binding) -> Option<&BindingValue> {
        self.scope_of(binding)?.vals.get(&binding.bind_id)
    }

    pub fn bind_state_of(&self, binding: &Binding) -> Option<&BindState> {
        self.scope_of(binding)?.states.get(&binding.bind_id)
    }

    pub fn bind_info_of(&self, binding: &Binding) -> Option<BindInfo> {
        self.scope_of(binding)?.infos.get(&binding.bind_id).copied()
    }

    pub fn update_val(&mut self, binding: &Binding, value: Value) -> bool {
        match self.scope_of_mut(binding) {
            Some(scope) => {
                scope.vals.insert(binding.bind_id, BindingValue::Val(value));
                true
            }
            None => false,
        }
    }

    pub fn set_state(&mut self, binding: &Binding, state: BindState) -> bool {
        match self.scope_of_mut(binding) {
            Some(scope) => {
                scope.states.insert(binding.bind_id, state);
                true
            }
            None => false,
        }
    }

    /// Resolves a binding to the value it denotes, chasing one alias hop.
    pub fn value_of_binding(&self, binding: &Binding) -> Option<&Value> {
        match self.binding_value_of(binding)? {
            BindingValue::Val(v) => Some(v),
            BindingValue::Alias { addr } => self.read_addr(*addr).ok(),
        }
    }

    // Raw store access.

    pub fn addr_tag(&self, addr: Addr) -> Option<RuntimeTag> {
        self.addr_tags.get(&addr).copied()
    }

    pub fn tag_active(&self, tag: RuntimeTag) -> bool {
        match tag.kind {
            RuntimeTagKind::Scope => self.scope_stack.iter().any(|s| s.id == tag.id),
            RuntimeTagKind::Region => {
                self.region_stack.iter().any(|r| r.target == tag.id)
            }
            RuntimeTagKind::Static => true,
        }
    }

    pub fn read_addr(&self, addr: Addr) -> Result<&Value, MemError> {
        match self.addr_tag(addr) {
            Some(tag) if self.tag_active(tag) => {
                self.store.get(&addr).ok_or(MemError::Unmapped)
            }
            Some(_) | None => Err(MemError::Expired),
        }
    }

    pub fn write_addr(&mut self, addr: Addr, value: Value) -> Result<(), MemError> {
        match self.addr_tag(addr) {
            Some(tag) if self.tag_active(tag) => {
                self.store.insert(addr, value);
                Ok(())
            }
            Some(_) | None => Err(MemError::Expired),
        }
    }

    /// Reads the value a (possibly derived) address denotes: a binding's
    /// slot, a projection view into another location, or a raw store cell.
    pub fn read_location(&self, addr: Addr) -> Result<Value, MemError> {
        match self.addr_tag(addr) {
            Some(tag) if self.tag_active(tag) => {}
            Some(_) | None => {
                // Views carry no tag of their own; everything else is dead.
                if !self.addr_views.contains_key(&addr) {
                    return Err(MemError::Expired);
                }
            }
        }
        if let Some(binding) = self.binding_by_addr.get(&addr) {
            return match self.binding_value_of(binding) {
                Some(BindingValue::Val(v)) => Ok(v.clone()),
                Some(BindingValue::Alias { addr }) => self.read_location(*addr),
                None => Err(MemError::Unmapped),
            };
        }
        if let Some(view) = self.addr_views.get(&addr) {
            let base = self.read_location(view.base)?;
            return project_value(&base, &view.proj).ok_or(MemError::Unmapped);
        }
        self.store.get(&addr).cloned().ok_or(MemError::Unmapped)
    }

    /// Writes through a (possibly derived) address; view writes read the
    /// base, replace the projected slot, and write the base back.
    pub fn write_location(&mut self, addr: Addr, value: Value) -> Result<(), MemError> {
        match self.addr_tag(addr) {
            Some(tag) if self.tag_active(tag) => {}
            Some(_) | None => {
                if !self.addr_views.contains_key(&addr) {
                    return Err(MemError::Expired);
                }
            }
        }
        if let Some(binding) = self.binding_by_addr.get(&addr).cloned() {
            return match self.binding_value_of(&binding) {
                Some(BindingValue::Val(_)) | None => {
                    if self.update_val(&binding, value) {
                        Ok(())
                    } else {
                        Err(MemError::Unmapped)
                    }
                }
                Some(BindingValue::Alias { addr }) => self.write_location(*addr, value),
            };
        }
        if let Some(view) = self.addr_views.get(&addr).cloned() {
            let mut base = self.read_location(view.base)?;
            if !store_into_projection(&mut base, &view.proj, value) {
                return Err(MemError::Unmapped);
            }
            return self.write_location(view.base, base);
        }
        self.store.insert(addr, value);
        Ok(())
    }

    /// Registers a derived address viewing a projection of `base`.
    pub fn view_addr(&mut self, base: Addr, proj: AddrProj) -> Addr {
        let addr = self.alloc_addr();
        self.addr_views.insert(addr, AddrView { base, proj });
        addr
    }

    // Regions.

    pub fn push_region(&mut self) -> (RegionTag, RegionTarget) {
        let tag = self.next_region_tag;
        self.next_region_tag += 1;
        let target = self.next_region_target;
        self.next_region_target += 1;
        let scope = self.current_scope_id();
        trace!("push_region: tag {} target {}", tag, target);
        self.region_stack.push(RegionEntry {
            tag,
            target,
            scope,
            allocs: Vec::new(),
            frozen: false,
        });
        (tag, target)
    }

    pub fn region_by_target(&self, target: RegionTarget) -> Option<&RegionEntry> {
        self.region_stack.iter().find(|r| r.target == target)
    }

    pub fn region_by_target_mut(&mut self, target: RegionTarget) -> Option<&mut RegionEntry> {
        self.region_stack.iter_mut().find(|r| r.target == target)
    }

    pub fn innermost_region(&self) -> Option<&RegionEntry> {
        self.region_stack.last()
    }

    /// Places `value` at a fresh address tagged with the region's target.
    pub fn alloc_in_region(&mut self, target: RegionTarget, value: Value) -> Option<Addr> {
        let addr = self.alloc_addr();
        let region = self.region_by_target_mut(target)?;
        region.allocs.push(addr);
        self.addr_tags.insert(addr, RuntimeTag { kind: RuntimeTagKind::Region, id: target });
        self.store.insert(addr, value);
        Some(addr)
    }

    /// Tears the region down; every address it allocated expires.
    pub fn free_region(&mut self, target: RegionTarget) -> Option<RegionEntry> {
        let idx = self.region_stack.iter().position(|r| r.target == target)?;
        let region = self.region_stack.remove(idx);
        trace!("free_region: target {} ({} allocs)", target, region.allocs.len());
        for addr in &region.allocs {
            self.addr_tags.remove(addr);
        }
        Some(region)
    }

    /// The region's current allocation index, for frame marks.
    pub fn region_mark(&self, target: RegionTarget) -> Option<usize> {
        self.region_by_target(target).map(|r| r.allocs.len())
    }

    /// Truncates allocations performed after `mark`; the truncated addresses
    /// expire while the region itself stays live.
    pub fn region_reset_to_mark(&mut self, target: RegionTarget, mark: usize) -> bool {
        let truncated: Vec<Addr> = match self.region_by_target_mut(target) {
            Some(region) => region.allocs.split_off(mark.min(region.allocs.len())),
            None => return false,
        };
        for addr in truncated {
            self.addr_tags.remove(&addr);
        }
        true
    }

    // Statics and poisoning.

    pub fn static_addr(&self, module: &PathKey, name: &str) -> Option<Addr> {
        self.static_addrs.get(&(module.clone(), fold_ident(name))).copied()
    }

    pub fn insert_static(&mut self, module: PathKey, name: &str, addr: Addr) {
        self.static_addrs.insert((module, fold_ident(name)), addr);
    }

    /// Allocates static storage holding `value`; the address stays live for
    /// the whole life of Σ.
    pub fn alloc_static(&mut self, module: PathKey, name: &str, value: Value) -> Addr {
        let addr = self.alloc_addr();
        self.addr_tags.insert(addr, RuntimeTag { kind: RuntimeTagKind::Static, id: 0 });
        self.store.insert(addr, value);
        self.insert_static(module, name, addr);
        addr
    }

    /// The address of the module's poison flag, creating it (unset) on first
    /// use. The flag lives outside every scope and region.
    pub fn poison_flag_addr(&mut self, module: &PathKey) -> Addr {
        if let Some(&addr) = self.poison_flags.get(module) {
            return addr;
        }
        let addr = self.alloc_addr();
        self.store.insert(addr, Value::Bool(false));
        self.poison_flags.insert(module.clone(), addr);
        addr
    }

    pub fn poisoned_module(&self, module: &PathKey) -> bool {
        self.poison_flags
            .get(module)
            .and_then(|addr| self.store.get(addr))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Poison is sticky; there is no way to clear it.
    pub fn set_poisoned(&mut self, module: &PathKey) {
        let addr = self.poison_flag_addr(module);
        trace!("set_poisoned: {}", module);
        self.store.insert(addr, Value::Bool(true));
    }

    pub fn poisoned_modules(&self) -> Vec<PathKey> {
        let mut out: Vec<PathKey> = self
            .poison_flags
            .keys()
            .filter(|m| self.poisoned_module(m))
            .cloned()
            .collect();
        out.sort();
        out
    }
}

/// Projects a field/tuple/index slot out of an aggregate value.
pub fn project_value(base: &Value, proj: &AddrProj) -> Option<Value> {
    match (base, proj) {
        (Value::Record(r), AddrProj::Field(name)) => {
            let folded = fold_ident(name);
            r.fields.iter().find(|(n, _)| fold_ident(n) == folded).map(|(_, v)| v.clone())
        }
        (Value::Modal(m), AddrProj::Field(name)) => project_value(&m.payload, &AddrProj::Field(name.clone())),
        (Value::Tuple(elems), AddrProj::Tuple(i)) => elems.get(*i).cloned(),
        (Value::Array(elems), AddrProj::Index(i)) | (Value::Tuple(elems), AddrProj::Index(i)) => {
            elems.get(*i).cloned()
        }
        _ => None,
    }
}

fn store_into_projection(base: &mut Value, proj: &AddrProj, value: Value) -> bool {
    match (base, proj) {
        (Value::Record(r), AddrProj::Field(name)) => {
            let folded = fold_ident(name);
            match r.fields.iter_mut().find(|(n, _)| fold_ident(n) == folded) {
                Some((_, slot)) => {
                    *slot = value;
                    true
                }
                None => false,
            }
        }
        (Value::Modal(m), AddrProj::Field(name)) => {
            store_into_projection(&mut m.payload, &AddrProj::Field(name.clone()), value)
        }
        (Value::Tuple(elems), AddrProj::Tuple(i))
        | (Value::Array(elems), AddrProj::Index(i))
        | (Value::Tuple(elems), AddrProj::Index(i)) => match elems.get_mut(*i) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_addrs_expire_at_pop() {
        let mut sigma = Sigma::new();
        sigma.push_scope();
        let b = sigma
            .bind_val("x", BindingValue::Val(Value::i32(7)), BindInfo::owned())
            .unwrap();
        assert_eq!(sigma.read_location(b.addr), Ok(Value::i32(7)));
        sigma.pop_scope();
        assert!(sigma.lookup_bind("x").is_none());
        assert_eq!(sigma.read_location(b.addr), Err(MemError::Expired));
    }

    #[test]
    fn view_reads_and_writes_project() {
        let mut sigma = Sigma::new();
        sigma.push_scope();
        let b = sigma
            .bind_val(
                "t",
                BindingValue::Val(Value::Tuple(vec![Value::i32(1), Value::i32(2)])),
                BindInfo::owned(),
            )
            .unwrap();
        let view = sigma.view_addr(b.addr, AddrProj::Tuple(1));
        assert_eq!(sigma.read_location(view), Ok(Value::i32(2)));
        sigma.write_location(view, Value::i32(9)).unwrap();
        assert_eq!(
            sigma.read_location(b.addr),
            Ok(Value::Tuple(vec![Value::i32(1), Value::i32(9)]))
        );
    }

    #[test]
    fn region_allocs_expire_at_free() {
        let mut sigma = Sigma::new();
        sigma.push_scope();
        let (_tag, target) = sigma.push_region();
        let addr = sigma.alloc_in_region(target, Value::i32(7)).unwrap();
        assert_eq!(sigma.read_addr(addr).unwrap(), &Value::i32(7));
        sigma.free_region(target);
        assert_eq!(sigma.read_addr(addr), Err(MemError::Expired));
    }

    #[test]
    fn frame_reset_expires_only_later_allocs() {
        let mut sigma = Sigma::new();
        sigma.push_scope();
        let (_, target) = sigma.push_region();
        let before = sigma.alloc_in_region(target, Value::i32(1)).unwrap();
        let mark = sigma.region_mark(target).unwrap();
        let inside = sigma.alloc_in_region(target, Value::i32(2)).unwrap();
        assert!(sigma.region_reset_to_mark(target, mark));
        assert!(sigma.read_addr(before).is_ok());
        assert_eq!(sigma.read_addr(inside), Err(MemError::Expired));
    }

    #[test]
    fn innermost_binding_wins() {
        let mut sigma = Sigma::new();
        sigma.push_scope();
        sigma.bind_val("x", BindingValue::Val(Value::i32(1)), BindInfo::owned()).unwrap();
        sigma.push_scope();
        sigma.bind_val("x", BindingValue::Val(Value::i32(2)), BindInfo::owned()).unwrap();
        let b = sigma.lookup_bind("x").unwrap();
        assert_eq!(sigma.value_of_binding(&b), Some(&Value::i32(2)));
        sigma.pop_scope();
        let b = sigma.lookup_bind("x").unwrap();
        assert_eq!(sigma.value_of_binding(&b), Some(&Value::i32(1)));
    }

    #[test]
    fn poison_is_sticky() {
        let mut sigma = Sigma::new();
        let m = PathKey::new(vec!["a"]);
        assert!(!sigma.poisoned_module(&m));
        sigma.set_poisoned(&m);
        assert!(sigma.poisoned_module(&m));
        assert_eq!(sigma.poisoned_modules(), vec![m]);
    }
}
