//! The journaled tree-mutation engine.
//!
//! A transaction records primitive edits without touching the tree, then
//! applies them atomically: pre-change notifiers run outside the coarse
//! application mutex (and may veto), the tree-store primitives run under
//! the tree lock, and the infallible mirror hooks run last. Revert is the
//! mirror image in reverse order. Either every edit lands or none does.

use livetree_core::{ChangeKind, NodeId, PropId, PropValue};
use livetree_store::{ApplyGuard, ChangeEvent, DeviceTree, NodeRef, PropertyRecord};

use crate::error::EngineError;

/// Transaction lifecycle. `Applying`/`Reverting` are only observable from
/// notifier callbacks running inside the respective operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Ready,
    InProgress,
    Applying,
    Applied,
    Reverting,
    Aborted,
    Destroyed,
}

/// One recorded primitive edit. Node handles are refcount-bumped for the
/// lifetime of the entry; property ids stay valid because a journaled
/// property is owned by exactly one list at a time.
#[derive(Debug)]
pub(crate) enum ChangeOp {
    AttachNode {
        node: NodeRef,
    },
    DetachNode {
        node: NodeRef,
    },
    AddProperty {
        node: NodeRef,
        prop: PropId,
    },
    RemoveProperty {
        node: NodeRef,
        prop: PropId,
    },
    /// `old_prop` is the property displaced by the update: captured at
    /// record time for staged reads and notifications, overwritten at
    /// apply time with the id actually displaced so revert re-links the
    /// exact memory.
    UpdateProperty {
        node: NodeRef,
        new_prop: PropId,
        old_prop: PropId,
    },
}

#[derive(Debug)]
pub(crate) struct ChangeEntry {
    pub(crate) op: ChangeOp,
    /// The entry's new property is currently linked into the tree.
    installed: bool,
    /// The entry's new property has been handed back to the arena.
    released: bool,
}

impl ChangeEntry {
    fn new(op: ChangeOp) -> Self {
        Self {
            op,
            installed: false,
            released: false,
        }
    }

    pub(crate) fn kind(&self) -> ChangeKind {
        match self.op {
            ChangeOp::AttachNode { .. } => ChangeKind::AttachNode,
            ChangeOp::DetachNode { .. } => ChangeKind::DetachNode,
            ChangeOp::AddProperty { .. } => ChangeKind::AddProperty,
            ChangeOp::RemoveProperty { .. } => ChangeKind::RemoveProperty,
            ChangeOp::UpdateProperty { .. } => ChangeKind::UpdateProperty,
        }
    }

    pub(crate) fn node(&self) -> &NodeRef {
        match &self.op {
            ChangeOp::AttachNode { node }
            | ChangeOp::DetachNode { node }
            | ChangeOp::AddProperty { node, .. }
            | ChangeOp::RemoveProperty { node, .. }
            | ChangeOp::UpdateProperty { node, .. } => node,
        }
    }
}

/// An ordered, replayable journal of primitive tree edits with inverse
/// semantics. See the module docs for the apply/revert protocol.
pub struct Transaction {
    tree: DeviceTree,
    state: TxState,
    entries: Vec<ChangeEntry>,
    guard: Option<ApplyGuard>,
}

impl Transaction {
    pub fn new(tree: DeviceTree) -> Self {
        Self {
            tree,
            state: TxState::Ready,
            entries: Vec::new(),
            guard: None,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    /// Node ids mentioned anywhere in the journal, in first-touch order.
    pub(crate) fn touched_nodes(&self) -> Vec<NodeId> {
        let mut touched = Vec::new();
        for entry in &self.entries {
            let id = entry.node().id();
            if !touched.contains(&id) {
                touched.push(id);
            }
        }
        touched
    }

    fn expect_state(&self, want: TxState, op: &'static str) -> Result<(), EngineError> {
        if self.state == want {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Acquire the coarse application mutex and start recording.
    pub fn begin(&mut self) -> Result<(), EngineError> {
        self.expect_state(TxState::Ready, "begin")?;
        self.guard = Some(self.tree.lock_exclusive());
        self.state = TxState::InProgress;
        Ok(())
    }

    pub(crate) fn record(&mut self, op: ChangeOp) -> Result<(), EngineError> {
        self.expect_state(TxState::InProgress, "record")?;
        self.entries.push(ChangeEntry::new(op));
        Ok(())
    }

    /// Stage an attach of a detached node (parent already set).
    pub fn attach_node(&mut self, node: &NodeRef) -> Result<(), EngineError> {
        self.record(ChangeOp::AttachNode { node: node.clone() })
    }

    /// Stage a detach of a live node.
    pub fn detach_node(&mut self, node: &NodeRef) -> Result<(), EngineError> {
        self.record(ChangeOp::DetachNode { node: node.clone() })
    }

    /// Stage a property addition. Collisions surface as `AlreadyExists`
    /// when the transaction is applied.
    pub fn add_property(
        &mut self,
        node: &NodeRef,
        name: &str,
        value: PropValue,
    ) -> Result<(), EngineError> {
        self.expect_state(TxState::InProgress, "record")?;
        let prop = self.tree.create_property(name, value);
        self.record(ChangeOp::AddProperty {
            node: node.clone(),
            prop,
        })
    }

    /// Stage removal of the property the node would expose at this point
    /// in the transaction.
    pub fn remove_property(&mut self, node: &NodeRef, name: &str) -> Result<(), EngineError> {
        self.expect_state(TxState::InProgress, "record")?;
        let prop = self
            .effective_property(node.id(), name)
            .ok_or_else(|| EngineError::NotFound(format!("property {name}")))?;
        self.record(ChangeOp::RemoveProperty {
            node: node.clone(),
            prop,
        })
    }

    /// Stage replacement of the property the node would expose at this
    /// point in the transaction.
    pub fn update_property(
        &mut self,
        node: &NodeRef,
        name: &str,
        value: PropValue,
    ) -> Result<(), EngineError> {
        self.expect_state(TxState::InProgress, "record")?;
        let old_prop = self
            .effective_property(node.id(), name)
            .ok_or_else(|| EngineError::NotFound(format!("property {name}")))?;
        let new_prop = self.tree.create_property(name, value);
        self.record(ChangeOp::UpdateProperty {
            node: node.clone(),
            new_prop,
            old_prop,
        })
    }

    // ========================================================================
    // Transaction-aware reads
    // ========================================================================

    /// What the journal says about a named property of `node`:
    /// `Some(Some(id))` staged-present, `Some(None)` staged-removed,
    /// `None` untouched by this transaction.
    fn staged_property(&self, node: NodeId, name: &str) -> Option<Option<PropId>> {
        for entry in self.entries.iter().rev() {
            if entry.node().id() != node {
                continue;
            }
            match &entry.op {
                ChangeOp::AddProperty { prop, .. } if self.prop_name(*prop) == name => {
                    return Some(Some(*prop));
                }
                ChangeOp::UpdateProperty { new_prop, .. } if self.prop_name(*new_prop) == name => {
                    return Some(Some(*new_prop));
                }
                ChangeOp::RemoveProperty { prop, .. } if self.prop_name(*prop) == name => {
                    return Some(None);
                }
                _ => {}
            }
        }
        None
    }

    /// The property id the node would expose for `name` if this
    /// transaction were committed: staged edits first, live tree second.
    pub(crate) fn effective_property(&self, node: NodeId, name: &str) -> Option<PropId> {
        match self.staged_property(node, name) {
            Some(staged) => staged,
            None => self.tree.find_property_id(node, name),
        }
    }

    /// The value the node would expose for `name` if this transaction were
    /// committed. Validators inside the transaction see their own staged
    /// edits; concurrent readers using the plain query surface do not.
    pub fn find_property(&self, node: &NodeRef, name: &str) -> Option<PropValue> {
        let prop = self.effective_property(node.id(), name)?;
        Some(self.tree.property_record(prop)?.value)
    }

    /// The child the node would expose for `name` if this transaction were
    /// committed: staged attaches and detaches first, live tree second.
    pub fn find_child(&self, parent: &NodeRef, name: &str) -> Option<NodeRef> {
        for entry in self.entries.iter().rev() {
            match &entry.op {
                ChangeOp::AttachNode { node } => {
                    if node.parent().is_some_and(|p| p.id() == parent.id()) && node.name() == name {
                        return Some(node.clone());
                    }
                }
                ChangeOp::DetachNode { node } => {
                    if node.parent().is_some_and(|p| p.id() == parent.id()) && node.name() == name {
                        return None;
                    }
                }
                _ => {}
            }
        }
        self.tree.get_child_by_name(parent, name)
    }

    fn prop_name(&self, prop: PropId) -> String {
        self.tree
            .property_record(prop)
            .map(|record| record.name)
            .unwrap_or_default()
    }

    fn prop_record(&self, prop: PropId) -> PropertyRecord {
        self.tree
            .property_record(prop)
            .expect("journaled property vanished from the arena")
    }

    // ========================================================================
    // Notifications and hooks
    // ========================================================================

    fn entry_event(&self, index: usize, inverse: bool) -> ChangeEvent {
        let entry = &self.entries[index];
        let kind = if inverse {
            entry.kind().inverse()
        } else {
            entry.kind()
        };
        let node = entry.node().clone();
        let (prop, old_prop) = match &entry.op {
            ChangeOp::AttachNode { .. } | ChangeOp::DetachNode { .. } => (None, None),
            ChangeOp::AddProperty { prop, .. } | ChangeOp::RemoveProperty { prop, .. } => {
                (Some(self.prop_record(*prop)), None)
            }
            ChangeOp::UpdateProperty {
                new_prop, old_prop, ..
            } => {
                let (current, previous) = if inverse {
                    (*old_prop, *new_prop)
                } else {
                    (*new_prop, *old_prop)
                };
                (
                    Some(self.prop_record(current)),
                    Some(self.prop_record(previous)),
                )
            }
        };
        ChangeEvent {
            kind,
            node,
            prop,
            old_prop,
        }
    }

    fn run_mirrors(&self, index: usize, inverse: bool) {
        let entry = &self.entries[index];
        match &entry.op {
            ChangeOp::AttachNode { node } => self.tree.for_each_mirror(|mirror| {
                if inverse {
                    mirror.node_detached(node);
                } else {
                    mirror.node_attached(node);
                }
            }),
            ChangeOp::DetachNode { node } => self.tree.for_each_mirror(|mirror| {
                if inverse {
                    mirror.node_attached(node);
                } else {
                    mirror.node_detached(node);
                }
            }),
            ChangeOp::AddProperty { node, prop } => {
                let record = self.prop_record(*prop);
                self.tree.for_each_mirror(|mirror| {
                    if inverse {
                        mirror.property_removed(node, &record);
                    } else {
                        mirror.property_added(node, &record);
                    }
                });
            }
            ChangeOp::RemoveProperty { node, prop } => {
                let record = self.prop_record(*prop);
                self.tree.for_each_mirror(|mirror| {
                    if inverse {
                        mirror.property_added(node, &record);
                    } else {
                        mirror.property_removed(node, &record);
                    }
                });
            }
            ChangeOp::UpdateProperty {
                node,
                new_prop,
                old_prop,
            } => {
                let new_record = self.prop_record(*new_prop);
                let old_record = self.prop_record(*old_prop);
                self.tree.for_each_mirror(|mirror| {
                    if inverse {
                        mirror.property_updated(node, &old_record, &new_record);
                    } else {
                        mirror.property_updated(node, &new_record, &old_record);
                    }
                });
            }
        }
    }

    // ========================================================================
    // Apply
    // ========================================================================

    /// Apply the journal to the live tree. On any failure the tree is left
    /// exactly as it was and the transaction drops to `Ready` (only
    /// `destroy` is legal from there with a journal in hand).
    pub fn apply(&mut self) -> Result<(), EngineError> {
        self.expect_state(TxState::InProgress, "apply")?;
        self.state = TxState::Applying;
        log::debug!("transaction: applying {} entries", self.entries.len());

        // Pre-change notifications run outside the coarse mutex so
        // observers can take the tree lock for reads.
        self.guard = None;
        for index in 0..self.entries.len() {
            if let Err(rejection) = self.tree.dispatch(&self.entry_event(index, false)) {
                for notified in (0..index).rev() {
                    let _ = self.tree.dispatch(&self.entry_event(notified, true));
                }
                self.release_created();
                self.state = TxState::Ready;
                return Err(EngineError::Veto(rejection.reason));
            }
        }
        self.guard = Some(self.tree.lock_exclusive());

        // Primitives, in order; partial failure unwinds in reverse and
        // leaves no residue, not even on dead lists.
        for index in 0..self.entries.len() {
            if let Err(error) = self.apply_entry(index) {
                log::error!("transaction: error applying entry {index}: {error}");
                for applied in (0..index).rev() {
                    self.revert_entry(applied);
                }
                self.release_created();
                self.guard = None;
                self.state = TxState::Ready;
                return Err(error.into());
            }
        }

        // Post-change side effects; not permitted to fail.
        for index in 0..self.entries.len() {
            self.run_mirrors(index, false);
        }

        self.guard = None;
        self.state = TxState::Applied;
        log::debug!("transaction: applied");
        Ok(())
    }

    fn apply_entry(&mut self, index: usize) -> Result<(), livetree_store::StoreError> {
        enum Prim {
            Attach(NodeRef),
            Detach(NodeRef),
            Add(NodeRef, PropId),
            Remove(NodeRef, PropId),
            Update(NodeRef, PropId),
        }
        let prim = match &self.entries[index].op {
            ChangeOp::AttachNode { node } => Prim::Attach(node.clone()),
            ChangeOp::DetachNode { node } => Prim::Detach(node.clone()),
            ChangeOp::AddProperty { node, prop } => Prim::Add(node.clone(), *prop),
            ChangeOp::RemoveProperty { node, prop } => Prim::Remove(node.clone(), *prop),
            ChangeOp::UpdateProperty { node, new_prop, .. } => {
                Prim::Update(node.clone(), *new_prop)
            }
        };
        match prim {
            Prim::Attach(node) => self.tree.raw_attach(&node),
            Prim::Detach(node) => self.tree.raw_detach(&node),
            Prim::Add(node, prop) => {
                self.tree.raw_add_property(&node, prop)?;
                self.entries[index].installed = true;
                Ok(())
            }
            Prim::Remove(node, prop) => self.tree.raw_remove_property(&node, prop),
            Prim::Update(node, new_prop) => {
                let displaced = self.tree.raw_update_property(&node, new_prop)?;
                if let ChangeOp::UpdateProperty { old_prop, .. } = &mut self.entries[index].op {
                    *old_prop = displaced;
                }
                self.entries[index].installed = true;
                Ok(())
            }
        }
    }

    /// Invert one applied entry's primitive. Best-effort: failures are
    /// logged because the callers have nowhere to go back to.
    fn revert_entry(&mut self, index: usize) {
        enum Prim {
            Attach(NodeRef),
            Detach(NodeRef),
            Add(NodeRef, PropId),
            Remove(NodeRef, PropId),
            Update(NodeRef, PropId, PropId),
        }
        let prim = match &self.entries[index].op {
            ChangeOp::AttachNode { node } => Prim::Attach(node.clone()),
            ChangeOp::DetachNode { node } => Prim::Detach(node.clone()),
            ChangeOp::AddProperty { node, prop } => Prim::Add(node.clone(), *prop),
            ChangeOp::RemoveProperty { node, prop } => Prim::Remove(node.clone(), *prop),
            ChangeOp::UpdateProperty {
                node,
                new_prop,
                old_prop,
            } => Prim::Update(node.clone(), *new_prop, *old_prop),
        };
        match prim {
            Prim::Attach(node) => {
                if let Err(error) = self.tree.raw_detach(&node) {
                    log::error!("revert: detach failed: {error}");
                }
            }
            Prim::Detach(node) => {
                if let Err(error) = self.tree.raw_attach(&node) {
                    log::error!("revert: attach failed: {error}");
                }
            }
            Prim::Add(node, prop) => match self.tree.raw_remove_property(&node, prop) {
                Ok(()) => self.entries[index].installed = false,
                Err(error) => log::error!("revert: remove_property failed: {error}"),
            },
            Prim::Remove(node, prop) => {
                // journal invariant: the removed property is retained on
                // the owner's dead list
                assert!(
                    self.tree.raw_unlink_dead(&node, prop),
                    "property scheduled for revert is not on the dead list"
                );
                if let Err(error) = self.tree.raw_add_property(&node, prop) {
                    log::error!("revert: add_property failed: {error}");
                }
            }
            Prim::Update(node, new_prop, old_prop) => {
                assert!(
                    self.tree.raw_unlink_dead(&node, old_prop),
                    "property scheduled for revert is not on the dead list"
                );
                match self.tree.raw_update_property(&node, old_prop) {
                    Ok(displaced) => {
                        if displaced != new_prop {
                            log::error!("revert: update displaced an unexpected property");
                        }
                        self.entries[index].installed = false;
                    }
                    Err(error) => log::error!("revert: update_property failed: {error}"),
                }
            }
        }
    }

    // ========================================================================
    // Revert
    // ========================================================================

    /// Undo an applied transaction, entry by entry in reverse order, and
    /// destroy the journal. A notifier may veto the revert before any tree
    /// edit is undone; past that point revert proceeds best-effort.
    pub fn revert(&mut self) -> Result<(), EngineError> {
        self.expect_state(TxState::Applied, "revert")?;
        self.state = TxState::Reverting;
        log::debug!("transaction: reverting {} entries", self.entries.len());

        for index in (0..self.entries.len()).rev() {
            if let Err(rejection) = self.tree.dispatch(&self.entry_event(index, true)) {
                for notified in index + 1..self.entries.len() {
                    let _ = self.tree.dispatch(&self.entry_event(notified, false));
                }
                self.state = TxState::Applied;
                return Err(EngineError::Veto(rejection.reason));
            }
        }

        self.guard = Some(self.tree.lock_exclusive());
        for index in (0..self.entries.len()).rev() {
            self.revert_entry(index);
        }
        for index in (0..self.entries.len()).rev() {
            self.run_mirrors(index, true);
        }
        self.guard = None;

        // Properties this transaction introduced are now parked on dead
        // lists; hand them back so a reverted transaction leaks nothing.
        self.release_created();
        self.entries.clear();
        self.state = TxState::Ready;
        self.tree.reap();
        Ok(())
    }

    // ========================================================================
    // Abort / destroy
    // ========================================================================

    /// Discard a journal that was never applied. Releases the coarse
    /// mutex; the tree is untouched.
    pub fn abort(&mut self) -> Result<(), EngineError> {
        self.expect_state(TxState::InProgress, "abort")?;
        self.release_created();
        self.entries.clear();
        self.guard = None;
        self.state = TxState::Aborted;
        self.tree.reap();
        Ok(())
    }

    /// Free the journal. From `Applied` this is the "make permanent" path:
    /// entries are freed but tree edits stay in place.
    pub fn destroy(&mut self) -> Result<(), EngineError> {
        match self.state {
            TxState::Ready | TxState::Aborted => {
                self.release_created();
                self.entries.clear();
            }
            TxState::Applied => {
                self.entries.clear();
            }
            _ => {
                return Err(EngineError::InvalidState {
                    op: "destroy",
                    state: self.state,
                });
            }
        }
        self.guard = None;
        self.state = TxState::Destroyed;
        self.tree.reap();
        Ok(())
    }

    /// Free new properties that never became (or no longer are) part of
    /// the tree: floating after an abort, or parked on a dead list after a
    /// rollback or revert.
    fn release_created(&mut self) {
        for index in 0..self.entries.len() {
            let (node, prop) = match &self.entries[index].op {
                ChangeOp::AddProperty { node, prop } => (node.clone(), *prop),
                ChangeOp::UpdateProperty { node, new_prop, .. } => (node.clone(), *new_prop),
                _ => continue,
            };
            if self.entries[index].installed || self.entries[index].released {
                continue;
            }
            self.tree.raw_unlink_dead(&node, prop);
            self.tree.free_property(prop);
            self.entries[index].released = true;
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        match self.state {
            TxState::Ready | TxState::InProgress | TxState::Aborted => {
                self.release_created();
            }
            _ => {}
        }
    }
}
