//! The live tree store: node and property ownership, the primitive
//! mutators the transaction journal drives, the query surface, and the
//! notifier/mirror seams.
//!
//! Locking model: `tree_lock` (the internal state mutex) guards all
//! structural reads and writes in short critical sections; the coarse
//! application mutex (`lock_exclusive`) serializes whole transactions and
//! is released around notifier dispatch. No notifier or mirror callback
//! runs while `tree_lock` is held.

pub mod arena;
pub mod error;
pub mod node;
pub mod notify;
pub mod snapshot;
mod tree;

pub use arena::PropertyRecord;
pub use error::StoreError;
pub use node::NodeRef;
pub use notify::{ChangeEvent, ReconfigNotifier, Rejection, TreeMirror};
pub use snapshot::{NodeSnapshot, TreeSnapshot};

use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::lock_api::ArcMutexGuard;

use livetree_core::{NodeFlags, NodeId, Phandle, PropId, PropValue, SubscriberId};

use crate::notify::{MirrorSet, NotifierBus};
use crate::tree::TreeState;

/// Owned guard for the coarse application mutex. Held from transaction
/// begin through commit, dropped and re-acquired around notifier dispatch.
pub struct ApplyGuard {
    _guard: ArcMutexGuard<parking_lot::RawMutex, ()>,
}

pub(crate) struct TreeInner {
    pub(crate) state: Mutex<TreeState>,
    pub(crate) apply_mutex: Arc<Mutex<()>>,
    pub(crate) bus: NotifierBus,
    pub(crate) mirrors: MirrorSet,
}

/// Handle to one live tree. Cheap to clone; all methods take `&self` and
/// may be called from any thread.
#[derive(Clone)]
pub struct DeviceTree {
    inner: Arc<TreeInner>,
}

impl Default for DeviceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTree {
    /// A fresh tree holding only the root node at `/`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TreeInner {
                state: Mutex::new(TreeState::new()),
                apply_mutex: Arc::new(Mutex::new(())),
                bus: NotifierBus::default(),
                mirrors: MirrorSet::default(),
            }),
        }
    }

    fn node_ref(&self, id: NodeId) -> NodeRef {
        let state = self.inner.state.lock();
        let shared = state.arena.node(id).shared.clone();
        shared.get();
        NodeRef::adopt(self.inner.clone(), id, shared)
    }

    // ========================================================================
    // Query surface
    // ========================================================================

    pub fn root(&self) -> NodeRef {
        let root = self.inner.state.lock().root;
        self.node_ref(root)
    }

    /// Re-acquire a handle from a bare id, if the slot is still occupied.
    pub fn node(&self, id: NodeId) -> Option<NodeRef> {
        let state = self.inner.state.lock();
        if !state.arena.node_exists(id) {
            return None;
        }
        let shared = state.arena.node(id).shared.clone();
        shared.get();
        Some(NodeRef::adopt(self.inner.clone(), id, shared))
    }

    pub fn find_node_by_path(&self, path: &str) -> Option<NodeRef> {
        let id = self.inner.state.lock().find_by_path(path)?;
        Some(self.node_ref(id))
    }

    pub fn find_node_by_phandle(&self, phandle: Phandle) -> Option<NodeRef> {
        let id = self.inner.state.lock().find_by_phandle(phandle)?;
        Some(self.node_ref(id))
    }

    pub fn get_child_by_name(&self, parent: &NodeRef, name: &str) -> Option<NodeRef> {
        let id = self.inner.state.lock().child_by_name(parent.id(), name)?;
        Some(self.node_ref(id))
    }

    /// Snapshot of the global all-nodes chain: every attached node, in
    /// chain order.
    pub fn all_nodes(&self) -> Vec<NodeRef> {
        let state = self.inner.state.lock();
        state
            .all_nodes
            .iter()
            .map(|id| {
                let shared = state.arena.node(*id).shared.clone();
                shared.get();
                NodeRef::adopt(self.inner.clone(), *id, shared)
            })
            .collect()
    }

    /// Read a property by id, wherever it currently lives (live list, dead
    /// list, or a journal entry).
    pub fn property_record(&self, prop: PropId) -> Option<PropertyRecord> {
        let state = self.inner.state.lock();
        if !state.arena.prop_exists(prop) {
            return None;
        }
        Some(state.arena.prop(prop).record(prop))
    }

    pub fn find_property_id(&self, node: NodeId, name: &str) -> Option<PropId> {
        self.inner.state.lock().find_property(node, name)
    }

    // ========================================================================
    // Builders
    // ========================================================================

    /// Build a dynamic, detached, empty node. The handle returned carries
    /// the creation reference.
    pub fn create_node(
        &self,
        name: &str,
        type_name: Option<&str>,
        path: &str,
        phandle: Phandle,
    ) -> NodeRef {
        let mut state = self.inner.state.lock();
        let id = state.create_node(name, type_name, path, phandle);
        let shared = state.arena.node(id).shared.clone();
        NodeRef::adopt(self.inner.clone(), id, shared)
    }

    /// Build a dynamic property. The caller owns it until it is linked into
    /// a live list (or freed).
    pub fn create_property(&self, name: &str, value: PropValue) -> PropId {
        self.inner.state.lock().create_property(name, value)
    }

    /// Dynamic deep copy of an existing property with a fresh identity.
    pub fn copy_property(&self, source: PropId) -> Option<PropId> {
        let mut state = self.inner.state.lock();
        if !state.arena.prop_exists(source) {
            return None;
        }
        Some(state.copy_property(source))
    }

    /// Release a property that is not linked into any list. Journal
    /// teardown uses this for edits that never became permanent.
    pub fn free_property(&self, prop: PropId) {
        let mut state = self.inner.state.lock();
        if state.arena.prop_exists(prop) {
            state.arena.free_prop(prop);
        }
    }

    // ========================================================================
    // Primitive mutators (journal backend; no notification, no hooks)
    // ========================================================================

    pub fn raw_set_parent(&self, node: &NodeRef, parent: &NodeRef) -> Result<(), StoreError> {
        self.inner.state.lock().set_parent(node.id(), parent.id())
    }

    pub fn raw_attach(&self, node: &NodeRef) -> Result<(), StoreError> {
        self.inner.state.lock().attach(node.id())
    }

    pub fn raw_detach(&self, node: &NodeRef) -> Result<(), StoreError> {
        self.inner.state.lock().detach(node.id())
    }

    pub fn raw_add_property(&self, node: &NodeRef, prop: PropId) -> Result<(), StoreError> {
        self.inner.state.lock().add_property(node.id(), prop)
    }

    pub fn raw_remove_property(&self, node: &NodeRef, prop: PropId) -> Result<(), StoreError> {
        self.inner.state.lock().remove_property(node.id(), prop)
    }

    /// Swap in `new_prop` for the live property of the same name; returns
    /// the displaced property, now on the dead list.
    pub fn raw_update_property(&self, node: &NodeRef, new_prop: PropId) -> Result<PropId, StoreError> {
        self.inner.state.lock().update_property(node.id(), new_prop)
    }

    /// Take a property off the node's dead list. Returns whether it was
    /// found there; revert paths treat `false` as a journal-invariant
    /// violation.
    pub fn raw_unlink_dead(&self, node: &NodeRef, prop: PropId) -> bool {
        self.inner.state.lock().unlink_dead(node.id(), prop)
    }

    /// Set a collaborator flag bit (`POPULATED`, `POPULATED_BUS`). The
    /// tree stores these for the device factory and never interprets them.
    pub fn set_node_flag(&self, node: &NodeRef, flags: NodeFlags) -> Result<(), StoreError> {
        self.inner.state.lock().change_flags(node.id(), flags, true)
    }

    /// Clear a collaborator flag bit.
    pub fn clear_node_flag(&self, node: &NodeRef, flags: NodeFlags) -> Result<(), StoreError> {
        self.inner.state.lock().change_flags(node.id(), flags, false)
    }

    // ========================================================================
    // Reclamation
    // ========================================================================

    /// Free detached, unreferenced node slots. Returns how many were
    /// reclaimed.
    pub fn reap(&self) -> usize {
        self.inner.state.lock().reap()
    }

    /// Recursively free a detached subtree without journaling, consuming
    /// the handle. It is a programmer error to call this on an attached
    /// subtree.
    pub fn free_tree(&self, node: NodeRef) -> Result<(), StoreError> {
        let id = node.id();
        let mut state = self.inner.state.lock();
        // handle release touches only the shared atomics, safe under the
        // tree lock, and the lock keeps reap from racing the free
        drop(node);
        state.free_subtree(id)
    }

    // ========================================================================
    // Notifiers and mirrors
    // ========================================================================

    pub fn register_notifier(&self, notifier: Arc<dyn ReconfigNotifier>) -> SubscriberId {
        self.inner.bus.register(notifier)
    }

    pub fn unregister_notifier(&self, id: SubscriberId) -> bool {
        self.inner.bus.unregister(id)
    }

    /// Dispatch an event to every registered notifier in order; first
    /// rejection wins, later notifiers still run.
    pub fn dispatch(&self, event: &ChangeEvent) -> Result<(), Rejection> {
        self.inner.bus.dispatch(event)
    }

    pub fn register_mirror(&self, mirror: Arc<dyn TreeMirror>) {
        self.inner.mirrors.register(mirror);
    }

    /// Run a closure over each registered mirror, in registration order.
    pub fn for_each_mirror(&self, f: impl FnMut(&dyn TreeMirror)) {
        self.inner.mirrors.for_each(f);
    }

    // ========================================================================
    // Coarse application mutex
    // ========================================================================

    /// Acquire the coarse application mutex. Transactions hold this from
    /// begin through commit, dropping it only around notifier dispatch.
    pub fn lock_exclusive(&self) -> ApplyGuard {
        ApplyGuard {
            _guard: self.inner.apply_mutex.lock_arc(),
        }
    }

    // ========================================================================
    // Captures
    // ========================================================================

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot::capture(&self.inner.state.lock())
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        self.snapshot().fingerprint()
    }
}
