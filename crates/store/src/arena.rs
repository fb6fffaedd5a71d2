//! Slotted storage for nodes and properties.
//!
//! Slots are addressed by stable `NodeId`/`PropId` handles. A node slot is
//! recycled only once its refcount is zero and the node carries the
//! `DETACHED` flag; a property slot is recycled when the owning list (live,
//! dead, or a journal entry) releases it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use livetree_core::{NodeFlags, NodeId, Phandle, PropFlags, PropId, PropValue};
use uuid::Uuid;

/// Refcount and detach state shared with outstanding `NodeRef` handles so
/// that handle clone/drop never needs the tree lock.
#[derive(Debug)]
pub(crate) struct NodeShared {
    refs: AtomicU32,
    detached: AtomicBool,
}

impl NodeShared {
    pub(crate) fn new(initial_refs: u32, detached: bool) -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicU32::new(initial_refs),
            detached: AtomicBool::new(detached),
        })
    }

    pub(crate) fn get(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference, returning the remaining count. A live node whose
    /// count reaches zero is a hard bug in the caller; it is diagnosed here
    /// and the node is never freed in that state.
    pub(crate) fn put(&self) -> u32 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "refcount underflow");
        let remaining = prev.saturating_sub(1);
        if remaining == 0 && !self.detached.load(Ordering::Acquire) {
            log::error!("refcount dropped to zero on a live node");
            debug_assert!(false, "refcount dropped to zero on a live node");
        }
        remaining
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn set_detached(&self, detached: bool) {
        self.detached.store(detached, Ordering::Release);
    }
}

#[derive(Debug)]
pub(crate) struct NodeData {
    pub name: String,
    pub type_name: Option<String>,
    pub path: String,
    pub phandle: Phandle,
    pub flags: NodeFlags,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Live properties, ordered. Names are unique within this list.
    pub properties: Vec<PropId>,
    /// Properties detached by journaled edits, retained for revert.
    pub dead_properties: Vec<PropId>,
}

pub(crate) struct NodeSlot {
    pub shared: Arc<NodeShared>,
    pub data: NodeData,
}

#[derive(Debug, Clone)]
pub(crate) struct PropData {
    pub name: String,
    pub value: PropValue,
    pub flags: PropFlags,
    pub unique_id: Uuid,
}

/// Owned view of one property, handed out by the query surface. The
/// `unique_id` disambiguates same-named live/dead properties in external
/// mirrors.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRecord {
    pub id: PropId,
    pub name: String,
    pub value: PropValue,
    pub flags: PropFlags,
    pub unique_id: Uuid,
}

impl PropData {
    pub(crate) fn record(&self, id: PropId) -> PropertyRecord {
        PropertyRecord {
            id,
            name: self.name.clone(),
            value: self.value.clone(),
            flags: self.flags,
            unique_id: self.unique_id,
        }
    }
}

#[derive(Default)]
pub(crate) struct Arena {
    nodes: Vec<Option<NodeSlot>>,
    free_nodes: Vec<usize>,
    props: Vec<Option<PropData>>,
    free_props: Vec<usize>,
}

impl Arena {
    pub(crate) fn alloc_node(&mut self, data: NodeData, initial_refs: u32) -> NodeId {
        let detached = data.flags.contains(NodeFlags::DETACHED);
        let slot = NodeSlot {
            shared: NodeShared::new(initial_refs, detached),
            data,
        };
        match self.free_nodes.pop() {
            Some(index) => {
                self.nodes[index] = Some(slot);
                NodeId::from_index(index)
            }
            None => {
                self.nodes.push(Some(slot));
                NodeId::from_index(self.nodes.len() - 1)
            }
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> &NodeSlot {
        self.nodes[id.index()].as_ref().expect("stale node id")
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut NodeSlot {
        self.nodes[id.index()].as_mut().expect("stale node id")
    }

    pub(crate) fn node_exists(&self, id: NodeId) -> bool {
        self.nodes.get(id.index()).is_some_and(Option::is_some)
    }

    /// Release a node slot along with its live and dead properties.
    /// Callers are responsible for the detached/refcount preconditions.
    pub(crate) fn free_node(&mut self, id: NodeId) {
        let slot = self.nodes[id.index()].take().expect("stale node id");
        for prop in slot.data.properties.into_iter().chain(slot.data.dead_properties) {
            self.free_prop(prop);
        }
        self.free_nodes.push(id.index());
    }

    pub(crate) fn alloc_prop(&mut self, data: PropData) -> PropId {
        match self.free_props.pop() {
            Some(index) => {
                self.props[index] = Some(data);
                PropId::from_index(index)
            }
            None => {
                self.props.push(Some(data));
                PropId::from_index(self.props.len() - 1)
            }
        }
    }

    pub(crate) fn prop(&self, id: PropId) -> &PropData {
        self.props[id.index()].as_ref().expect("stale property id")
    }

    pub(crate) fn prop_exists(&self, id: PropId) -> bool {
        self.props.get(id.index()).is_some_and(Option::is_some)
    }

    pub(crate) fn free_prop(&mut self, id: PropId) {
        self.props[id.index()].take().expect("stale property id");
        self.free_props.push(id.index());
    }

    /// Ids of every occupied node slot, in slot order.
    pub(crate) fn node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| NodeId::from_index(index)))
            .collect()
    }
}
