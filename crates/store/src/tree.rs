//! The locked tree state: linkage, lookups, and the five primitive
//! mutators. Everything here runs under the tree lock held by the
//! `DeviceTree` façade; methods take `&mut self`/`&self` and never block.

use livetree_core::{NodeFlags, NodeId, Phandle, PropFlags, PropId, PropValue, path};
use uuid::Uuid;

use crate::arena::{Arena, NodeData, PropData};
use crate::error::StoreError;

pub(crate) struct TreeState {
    pub arena: Arena,
    pub root: NodeId,
    /// Global chain of all attached nodes. Each live node appears exactly
    /// once; order is insertion order and carries no semantic weight.
    pub all_nodes: Vec<NodeId>,
}

impl TreeState {
    pub(crate) fn new() -> Self {
        let mut arena = Arena::default();
        let root = arena.alloc_node(
            NodeData {
                name: String::new(),
                type_name: None,
                path: "/".to_string(),
                phandle: Phandle::NONE,
                flags: NodeFlags::empty(),
                parent: None,
                children: Vec::new(),
                properties: Vec::new(),
                dead_properties: Vec::new(),
            },
            // the tree's own reference
            1,
        );
        Self {
            arena,
            root,
            all_nodes: vec![root],
        }
    }

    // ========================================================================
    // Builders
    // ========================================================================

    /// Create a dynamic, detached, empty node. The returned node carries one
    /// reference (the creation reference handed back to the caller).
    pub(crate) fn create_node(
        &mut self,
        name: &str,
        type_name: Option<&str>,
        full_path: &str,
        phandle: Phandle,
    ) -> NodeId {
        self.arena.alloc_node(
            NodeData {
                name: name.to_string(),
                type_name: type_name.map(str::to_string),
                path: full_path.to_string(),
                phandle,
                flags: NodeFlags::DYNAMIC | NodeFlags::DETACHED,
                parent: None,
                children: Vec::new(),
                properties: Vec::new(),
                dead_properties: Vec::new(),
            },
            1,
        )
    }

    /// Create a dynamic property from raw parts. Owned by the caller until
    /// linked into a live list.
    pub(crate) fn create_property(&mut self, name: &str, value: PropValue) -> PropId {
        self.arena.alloc_prop(PropData {
            name: name.to_string(),
            value,
            flags: PropFlags::DYNAMIC,
            unique_id: Uuid::now_v7(),
        })
    }

    /// Deep copy of an existing property with a fresh identity.
    pub(crate) fn copy_property(&mut self, source: PropId) -> PropId {
        let mut data = self.arena.prop(source).clone();
        data.flags = PropFlags::DYNAMIC;
        data.unique_id = Uuid::now_v7();
        self.arena.alloc_prop(data)
    }

    // ========================================================================
    // Primitive mutators
    // ========================================================================

    /// Splice a detached node under its parent and onto the all-nodes chain.
    /// The tree takes its own reference to the node.
    pub(crate) fn attach(&mut self, id: NodeId) -> Result<(), StoreError> {
        let parent = {
            let slot = self.arena.node(id);
            if !slot.data.flags.contains(NodeFlags::DETACHED) {
                return Err(StoreError::Invalid(format!(
                    "attach of already-attached node {}",
                    slot.data.path
                )));
            }
            slot.data.parent.ok_or_else(|| {
                StoreError::Invalid(format!("attach of parentless node {}", slot.data.path))
            })?
        };

        self.arena.node_mut(parent).data.children.insert(0, id);
        self.all_nodes.push(id);
        let slot = self.arena.node_mut(id);
        slot.data.flags.remove(NodeFlags::DETACHED);
        slot.shared.set_detached(false);
        slot.shared.get();
        Ok(())
    }

    /// Unsplice a node from its parent and the all-nodes chain. The node is
    /// flagged detached but not freed; the tree drops its reference.
    pub(crate) fn detach(&mut self, id: NodeId) -> Result<(), StoreError> {
        let parent = {
            let slot = self.arena.node(id);
            if slot.data.flags.contains(NodeFlags::DETACHED) {
                return Err(StoreError::Invalid(format!(
                    "detach of already-detached node {}",
                    slot.data.path
                )));
            }
            slot.data.parent.ok_or_else(|| {
                StoreError::Invalid(format!("detach of parentless node {}", slot.data.path))
            })?
        };

        self.arena
            .node_mut(parent)
            .data
            .children
            .retain(|child| *child != id);
        self.all_nodes.retain(|node| *node != id);
        let slot = self.arena.node_mut(id);
        slot.data.flags.insert(NodeFlags::DETACHED);
        slot.shared.set_detached(true);
        slot.shared.put();
        Ok(())
    }

    /// Link a property at the head of the node's live list. Fails if a live
    /// property of the same name exists.
    pub(crate) fn add_property(&mut self, node: NodeId, prop: PropId) -> Result<(), StoreError> {
        let name = self.arena.prop(prop).name.clone();
        if self.find_property(node, &name).is_some() {
            return Err(StoreError::AlreadyExists(name));
        }
        self.arena.node_mut(node).data.properties.insert(0, prop);
        Ok(())
    }

    /// Unlink a property from the live list and push it onto the owner's
    /// dead list. The memory is retained so a later revert can re-link it.
    pub(crate) fn remove_property(&mut self, node: NodeId, prop: PropId) -> Result<(), StoreError> {
        let data = &mut self.arena.node_mut(node).data;
        let Some(index) = data.properties.iter().position(|p| *p == prop) else {
            return Err(StoreError::NotFound(format!(
                "property {prop} not on live list of {}",
                data.path
            )));
        };
        data.properties.remove(index);
        data.dead_properties.push(prop);
        Ok(())
    }

    /// Swap a live property for a new one of the same name, in place. The
    /// displaced property moves to the dead list and its id is returned.
    pub(crate) fn update_property(
        &mut self,
        node: NodeId,
        new_prop: PropId,
    ) -> Result<PropId, StoreError> {
        let name = self.arena.prop(new_prop).name.clone();
        let Some(old) = self.find_property(node, &name) else {
            return Err(StoreError::NotFound(format!("no live property named {name}")));
        };
        let data = &mut self.arena.node_mut(node).data;
        let index = data
            .properties
            .iter()
            .position(|p| *p == old)
            .expect("live list changed underfoot");
        data.properties[index] = new_prop;
        data.dead_properties.push(old);
        Ok(old)
    }

    /// Remove a property from the owner's dead list, returning whether it
    /// was found there. Revert paths require `true` (journal invariant).
    pub(crate) fn unlink_dead(&mut self, node: NodeId, prop: PropId) -> bool {
        let dead = &mut self.arena.node_mut(node).data.dead_properties;
        match dead.iter().position(|p| *p == prop) {
            Some(index) => {
                dead.remove(index);
                true
            }
            None => false,
        }
    }

    /// Set or clear collaborator flag bits. Lifecycle bits are owned by the
    /// attach/detach primitives and refused here.
    pub(crate) fn change_flags(
        &mut self,
        node: NodeId,
        flags: NodeFlags,
        set: bool,
    ) -> Result<(), StoreError> {
        const COLLABORATOR: NodeFlags = NodeFlags::POPULATED.union(NodeFlags::POPULATED_BUS);
        if !COLLABORATOR.contains(flags) {
            return Err(StoreError::Invalid(format!(
                "flag bits {flags:?} are not collaborator bits"
            )));
        }
        let data = &mut self.arena.node_mut(node).data;
        if set {
            data.flags.insert(flags);
        } else {
            data.flags.remove(flags);
        }
        Ok(())
    }

    /// Point a detached node at its future parent.
    pub(crate) fn set_parent(&mut self, node: NodeId, parent: NodeId) -> Result<(), StoreError> {
        let slot = self.arena.node_mut(node);
        if !slot.data.flags.contains(NodeFlags::DETACHED) {
            return Err(StoreError::Invalid(format!(
                "reparenting attached node {}",
                slot.data.path
            )));
        }
        slot.data.parent = Some(parent);
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub(crate) fn find_by_path(&self, target: &str) -> Option<NodeId> {
        let mut current = self.root;
        for component in path::components(target) {
            current = self.child_by_name(current, component)?;
        }
        Some(current)
    }

    pub(crate) fn find_by_phandle(&self, phandle: Phandle) -> Option<NodeId> {
        if !phandle.is_valid() {
            return None;
        }
        self.all_nodes
            .iter()
            .copied()
            .find(|id| self.arena.node(*id).data.phandle == phandle)
    }

    pub(crate) fn child_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.arena
            .node(parent)
            .data
            .children
            .iter()
            .copied()
            .find(|child| self.arena.node(*child).data.name == name)
    }

    pub(crate) fn find_property(&self, node: NodeId, name: &str) -> Option<PropId> {
        self.arena
            .node(node)
            .data
            .properties
            .iter()
            .copied()
            .find(|prop| self.arena.prop(*prop).name == name)
    }

    /// Whether the node's `status` permits device use: okay/ok, or no
    /// `status` property at all.
    pub(crate) fn device_available(&self, node: NodeId) -> bool {
        match self.find_property(node, "status") {
            None => true,
            Some(prop) => matches!(self.arena.prop(prop).value.as_str(), Some("okay") | Some("ok")),
        }
    }

    // ========================================================================
    // Reclamation
    // ========================================================================

    /// Free every node slot that is detached with no outstanding
    /// references. Returns the number of nodes reclaimed. A detached node
    /// that still has linked children is kept (its subtree must go through
    /// `free_subtree`), so child parent links never dangle.
    pub(crate) fn reap(&mut self) -> usize {
        let mut reclaimed = 0;
        for id in self.arena.node_ids() {
            let slot = self.arena.node(id);
            if slot.shared.is_detached()
                && slot.shared.refcount() == 0
                && slot.data.children.is_empty()
            {
                self.arena.free_node(id);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Recursively free a detached subtree without journaling. Outstanding
    /// references are a caller bug; they are diagnosed, not honored.
    pub(crate) fn free_subtree(&mut self, id: NodeId) -> Result<(), StoreError> {
        {
            let slot = self.arena.node(id);
            if !slot.data.flags.contains(NodeFlags::DETACHED) {
                return Err(StoreError::Invalid(format!(
                    "free of attached subtree {}",
                    slot.data.path
                )));
            }
        }
        self.free_subtree_inner(id, true);
        Ok(())
    }

    fn free_subtree_inner(&mut self, id: NodeId, is_root: bool) {
        let children = self.arena.node(id).data.children.clone();
        for child in children {
            self.free_subtree_inner(child, false);
        }
        let slot = self.arena.node_mut(id);
        // descendants are unlinked wholesale, without journaling
        slot.data.children.clear();
        slot.data.flags.insert(NodeFlags::DETACHED);
        slot.shared.set_detached(true);
        if !is_root {
            // drop the tree's reference taken at attach
            slot.shared.put();
        }
        let refs = slot.shared.refcount();
        if refs != 0 {
            log::error!(
                "freeing subtree node {} with {} outstanding reference(s)",
                slot.data.path,
                refs
            );
        }
        self.all_nodes.retain(|node| *node != id);
        self.arena.free_node(id);
    }
}
