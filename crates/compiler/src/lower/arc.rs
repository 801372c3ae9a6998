//! ARC cleanup tracking.
//!
//! Every owned allocation registers a cleanup; the cleanup stack is LIFO
//! and scope depth is simply the stack length at entry to a lexical block.
//! Exiting a scope (normally or through return/break/continue) emits the
//! active cleanups above the target depth in reverse order. Ownership
//! transfer disables a cleanup without emitting it.

use crate::ir::NodeIndex;
use crate::types::TypeIndex;

/// Dense index into the cleanup stack.
pub type CleanupHandle = u32;

/// Sentinel handle for values with no cleanup.
pub const INVALID_CLEANUP: CleanupHandle = u32::MAX;

/// Refcount sentinel that disables retain/release, used for
/// string-literal-like objects.
pub const IMMORTAL_REFCOUNT: i64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Heap object header size. The header is
/// `[u32 metadata_ptr, i64 refcount]`; user data starts at offset 12.
pub const HEAP_HEADER_SIZE: u32 = 12;

/// Byte offset of the refcount within the header.
pub const REFCOUNT_OFFSET: u32 = 4;

/// Size of one metadata record:
/// `[u32 type_id, u32 size, u32 destructor_table_index]`.
pub const METADATA_RECORD_SIZE: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupKind {
    /// Release an owned reference on scope exit.
    Release,
    /// End a borrow scope (no refcount traffic; native path bookkeeping).
    EndBorrow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupState {
    /// Registered ahead of initialization; not yet emitted on exit paths.
    Dormant,
    /// Disabled by ownership transfer.
    Dead,
    Active,
}

#[derive(Debug, Clone)]
pub struct Cleanup {
    pub kind: CleanupKind,
    pub node: NodeIndex,
    pub ty: TypeIndex,
    pub state: CleanupState,
}

/// LIFO cleanup stack.
#[derive(Debug, Default)]
pub struct CleanupStack {
    items: Vec<Cleanup>,
}

impl CleanupStack {
    pub fn new() -> CleanupStack {
        CleanupStack { items: Vec::new() }
    }

    pub fn depth(&self) -> usize {
        self.items.len()
    }

    pub fn push(&mut self, kind: CleanupKind, node: NodeIndex, ty: TypeIndex) -> CleanupHandle {
        let handle = self.items.len() as CleanupHandle;
        self.items.push(Cleanup {
            kind,
            node,
            ty,
            state: CleanupState::Active,
        });
        handle
    }

    /// Register a cleanup before its value is fully initialized; it must
    /// be activated before it participates in exits.
    pub fn push_dormant(
        &mut self,
        kind: CleanupKind,
        node: NodeIndex,
        ty: TypeIndex,
    ) -> CleanupHandle {
        let handle = self.push(kind, node, ty);
        self.items[handle as usize].state = CleanupState::Dormant;
        handle
    }

    pub fn activate(&mut self, handle: CleanupHandle) {
        if handle != INVALID_CLEANUP {
            self.items[handle as usize].state = CleanupState::Active;
        }
    }

    /// Disable a cleanup (ownership transferred out of the scope).
    pub fn disable(&mut self, handle: CleanupHandle) {
        if handle != INVALID_CLEANUP {
            self.items[handle as usize].state = CleanupState::Dead;
        }
    }

    pub fn state(&self, handle: CleanupHandle) -> Option<CleanupState> {
        self.items.get(handle as usize).map(|c| c.state)
    }

    /// Any active cleanup above `depth`?
    pub fn has_active_above(&self, depth: usize) -> bool {
        self.items[depth.min(self.items.len())..]
            .iter()
            .any(|c| c.state == CleanupState::Active)
    }

    /// Call `emitter` once per active cleanup above `depth`, in reverse
    /// (LIFO) order. The stack itself is not modified: the same cleanups
    /// may be emitted again on a sibling exit path.
    pub fn emit_to_depth<F>(&self, depth: usize, mut emitter: F)
    where
        F: FnMut(CleanupKind, NodeIndex, TypeIndex),
    {
        let start = depth.min(self.items.len());
        for c in self.items[start..].iter().rev() {
            if c.state == CleanupState::Active {
                emitter(c.kind, c.node, c.ty);
            }
        }
    }

    /// Drop cleanups above `depth` on real scope exit.
    pub fn truncate(&mut self, depth: usize) {
        self.items.truncate(depth);
    }
}

/// An IR value paired with its cleanup handle. `for_owned` values carry a
/// +1 reference owned by the current scope; `for_trivial` values carry
/// nothing.
#[derive(Debug, Clone, Copy)]
pub struct ManagedValue {
    pub node: NodeIndex,
    pub handle: CleanupHandle,
}

impl ManagedValue {
    pub fn for_owned(node: NodeIndex, handle: CleanupHandle) -> ManagedValue {
        ManagedValue { node, handle }
    }

    pub fn for_trivial(node: NodeIndex) -> ManagedValue {
        ManagedValue {
            node,
            handle: INVALID_CLEANUP,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.handle != INVALID_CLEANUP
    }

    /// Transfer ownership: disable the cleanup and yield the bare node.
    pub fn forward(self, cleanups: &mut CleanupStack) -> NodeIndex {
        cleanups.disable(self.handle);
        self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u32) -> NodeIndex {
        NodeIndex(i)
    }

    #[test]
    fn test_lifo_emission_order() {
        let mut cs = CleanupStack::new();
        cs.push(CleanupKind::Release, n(1), TypeIndex::I64);
        cs.push(CleanupKind::Release, n(2), TypeIndex::I64);
        cs.push(CleanupKind::Release, n(3), TypeIndex::I64);
        let mut seen = Vec::new();
        cs.emit_to_depth(0, |_, node, _| seen.push(node.0));
        assert_eq!(seen, vec![3, 2, 1]);
    }

    #[test]
    fn test_emit_respects_depth() {
        let mut cs = CleanupStack::new();
        cs.push(CleanupKind::Release, n(1), TypeIndex::I64);
        let depth = cs.depth();
        cs.push(CleanupKind::Release, n(2), TypeIndex::I64);
        let mut seen = Vec::new();
        cs.emit_to_depth(depth, |_, node, _| seen.push(node.0));
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn test_forward_disables() {
        let mut cs = CleanupStack::new();
        let h = cs.push(CleanupKind::Release, n(7), TypeIndex::I64);
        let mv = ManagedValue::for_owned(n(7), h);
        assert!(mv.is_owned());
        let node = mv.forward(&mut cs);
        assert_eq!(node, n(7));
        assert_eq!(cs.state(h), Some(CleanupState::Dead));
        let mut seen = Vec::new();
        cs.emit_to_depth(0, |_, node, _| seen.push(node.0));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_dormant_not_emitted_until_activated() {
        let mut cs = CleanupStack::new();
        let h = cs.push_dormant(CleanupKind::Release, n(4), TypeIndex::I64);
        assert!(!cs.has_active_above(0));
        cs.activate(h);
        assert!(cs.has_active_above(0));
    }

    #[test]
    fn test_trivial_value_has_no_cleanup() {
        let mut cs = CleanupStack::new();
        let mv = ManagedValue::for_trivial(n(9));
        assert!(!mv.is_owned());
        mv.forward(&mut cs);
        assert_eq!(cs.depth(), 0);
    }

    #[test]
    fn test_emission_does_not_pop() {
        let mut cs = CleanupStack::new();
        cs.push(CleanupKind::Release, n(1), TypeIndex::I64);
        cs.emit_to_depth(0, |_, _, _| {});
        assert_eq!(cs.depth(), 1);
        cs.truncate(0);
        assert_eq!(cs.depth(), 0);
    }
}
