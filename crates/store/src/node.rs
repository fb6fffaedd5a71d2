//! Refcounted node handles.

use std::fmt;
use std::sync::Arc;

use livetree_core::{NodeFlags, NodeId, Phandle};

use crate::TreeInner;
use crate::arena::{NodeShared, PropertyRecord};

/// Handle to one live-tree node. Holding a `NodeRef` keeps the node's slot
/// alive: the refcount is bumped on acquisition and dropped on release, and
/// a slot is reclaimed only when the count is zero and the node is
/// detached. Clone and drop never take the tree lock.
pub struct NodeRef {
    pub(crate) inner: Arc<TreeInner>,
    pub(crate) id: NodeId,
    pub(crate) shared: Arc<NodeShared>,
}

impl NodeRef {
    /// Wrap an id whose refcount has already been bumped by the caller.
    pub(crate) fn adopt(inner: Arc<TreeInner>, id: NodeId, shared: Arc<NodeShared>) -> Self {
        Self { inner, id, shared }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> String {
        self.inner.state.lock().arena.node(self.id).data.name.clone()
    }

    pub fn path(&self) -> String {
        self.inner.state.lock().arena.node(self.id).data.path.clone()
    }

    pub fn type_name(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .arena
            .node(self.id)
            .data
            .type_name
            .clone()
    }

    pub fn phandle(&self) -> Phandle {
        self.inner.state.lock().arena.node(self.id).data.phandle
    }

    pub fn flags(&self) -> NodeFlags {
        self.inner.state.lock().arena.node(self.id).data.flags
    }

    pub fn is_detached(&self) -> bool {
        self.shared.is_detached()
    }

    /// Current reference count, for diagnostics and lifecycle tests.
    pub fn refcount(&self) -> u32 {
        self.shared.refcount()
    }

    pub fn parent(&self) -> Option<NodeRef> {
        let state = self.inner.state.lock();
        let parent = state.arena.node(self.id).data.parent?;
        let shared = state.arena.node(parent).shared.clone();
        shared.get();
        Some(NodeRef::adopt(self.inner.clone(), parent, shared))
    }

    /// Snapshot of the node's children, in sibling order.
    pub fn children(&self) -> Vec<NodeRef> {
        let state = self.inner.state.lock();
        state
            .arena
            .node(self.id)
            .data
            .children
            .iter()
            .map(|child| {
                let shared = state.arena.node(*child).shared.clone();
                shared.get();
                NodeRef::adopt(self.inner.clone(), *child, shared)
            })
            .collect()
    }

    /// Snapshot of the node's live properties, in list order.
    pub fn properties(&self) -> Vec<PropertyRecord> {
        let state = self.inner.state.lock();
        state
            .arena
            .node(self.id)
            .data
            .properties
            .iter()
            .map(|prop| state.arena.prop(*prop).record(*prop))
            .collect()
    }

    pub fn find_property(&self, name: &str) -> Option<PropertyRecord> {
        let state = self.inner.state.lock();
        let prop = state.find_property(self.id, name)?;
        Some(state.arena.prop(prop).record(prop))
    }

    /// Whether the node's `status` permits a device: okay/ok, or absent.
    pub fn is_available(&self) -> bool {
        self.inner.state.lock().device_available(self.id)
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        self.shared.get();
        Self {
            inner: self.inner.clone(),
            id: self.id,
            shared: self.shared.clone(),
        }
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.shared.put();
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeRef {}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef({})", self.id)
    }
}
