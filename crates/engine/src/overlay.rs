//! The overlay engine: walks a fragment against a live target, records the
//! primitive edits into a transaction, and derives the device-state ledger
//! that drives create/destroy device notifications.

use livetree_core::{ChangeKind, NodeId, PropValue, path};
use livetree_store::{ChangeEvent, DeviceTree, NodeRef};

use crate::error::EngineError;
use crate::fragment::{Fragment, OverlayInfo, TargetSpec};
use crate::transaction::{ChangeOp, Transaction};

/// One node whose "would a device instantiate" state flipped under a
/// transaction.
#[derive(Debug, Clone)]
pub(crate) struct DeviceDelta {
    pub node: NodeRef,
    pub prev_present: bool,
    pub new_present: bool,
}

/// An applied overlay: the transaction that carries its edits, its
/// resolved targets, and the settled device-state ledger.
pub(crate) struct Overlay {
    pub txn: Transaction,
    pub touched: Vec<NodeId>,
    pub ledger: Vec<DeviceDelta>,
}

pub(crate) fn resolve_target(tree: &DeviceTree, spec: &TargetSpec) -> Result<NodeRef, EngineError> {
    match spec {
        TargetSpec::Phandle(handle) => tree
            .find_node_by_phandle(*handle)
            .ok_or_else(|| EngineError::NotFound(format!("target phandle {:#x}", handle.raw()))),
        TargetSpec::Path(target_path) => tree
            .find_node_by_path(target_path)
            .ok_or_else(|| EngineError::NotFound(format!("target path {target_path}"))),
    }
}

/// Walk one fragment against one live target, recording every primitive
/// edit. Lookups go through the transaction so edits staged earlier in the
/// same changeset are visible: a collision with a staged add becomes an
/// update, and a staged child is recursed into rather than duplicated.
pub(crate) fn apply_fragment(
    txn: &mut Transaction,
    tree: &DeviceTree,
    target: &NodeRef,
    fragment: &Fragment,
) -> Result<(), EngineError> {
    for frag_prop in &fragment.properties {
        // 'name' is a derived reflection of the node name; never merged
        if frag_prop.name == "name" {
            continue;
        }
        let (removal, prop_name) = path::removal_name(&frag_prop.name);
        let existing = txn.effective_property(target.id(), prop_name);
        if removal {
            // removing what is not there is a no-op, not an error
            if let Some(prop) = existing {
                txn.record(ChangeOp::RemoveProperty {
                    node: target.clone(),
                    prop,
                })?;
            }
            continue;
        }
        let new_prop = tree.create_property(prop_name, frag_prop.value.clone());
        match existing {
            Some(old_prop) => txn.record(ChangeOp::UpdateProperty {
                node: target.clone(),
                new_prop,
                old_prop,
            })?,
            None => txn.record(ChangeOp::AddProperty {
                node: target.clone(),
                prop: new_prop,
            })?,
        }
    }

    for child in &fragment.children {
        let (removal, child_name) = path::removal_name(&child.name);
        match txn.find_child(target, child_name) {
            Some(existing) => {
                if removal {
                    txn.record(ChangeOp::DetachNode { node: existing })?;
                } else {
                    apply_fragment(txn, tree, &existing, child)?;
                }
            }
            None => {
                if removal {
                    continue;
                }
                let child_path = path::join(&target.path(), child_name);
                let node = tree.create_node(
                    child_name,
                    child.type_name.as_deref(),
                    &child_path,
                    child.phandle,
                );
                tree.raw_set_parent(&node, target)?;
                txn.record(ChangeOp::AttachNode { node: node.clone() })?;
                apply_fragment(txn, tree, &node, child)?;
            }
        }
    }

    Ok(())
}

/// Whether a node would instantiate a device: attached, with a non-empty
/// `compatible`, and a `status` that is okay/ok or absent.
fn present(attached: bool, compatible: Option<&PropValue>, status: Option<&PropValue>) -> bool {
    attached
        && compatible.is_some_and(|value| !value.is_empty())
        && status.is_none_or(|value| matches!(value.as_str(), Some("okay") | Some("ok")))
}

/// Depth of `node` below `target` (1 when they coincide), or `None` when
/// the node is not in the target's subtree.
fn depth_below(target: &NodeRef, node: &NodeRef) -> Option<usize> {
    let mut depth = 1;
    let mut current = node.clone();
    loop {
        if current.id() == target.id() {
            return Some(depth);
        }
        current = current.parent()?;
        depth += 1;
    }
}

/// Scan a freshly applied journal and compute, for every touched node, the
/// device-state transition it underwent. The new state is evaluated
/// against the post-apply tree; the previous state is reconstructed by
/// walking the journal backwards from it.
pub(crate) fn compute_ledger(
    tree: &DeviceTree,
    txn: &Transaction,
    targets: &[(NodeRef, usize)],
) -> Vec<DeviceDelta> {
    let mut ledger = Vec::new();

    for node_id in txn.touched_nodes() {
        let Some(node) = tree.node(node_id) else {
            continue;
        };

        // device-depth cap, relative to the first target covering the node
        if let Some((target, depth_cap)) = targets
            .iter()
            .find(|(target, _)| depth_below(target, &node).is_some())
            && *depth_cap != 0
            && depth_below(target, &node).is_some_and(|depth| depth > *depth_cap)
        {
            log::debug!("skipping device transition for {} (beyond depth cap)", node.path());
            continue;
        }

        let new_present = present(
            !node.is_detached(),
            node.find_property("compatible").map(|p| p.value).as_ref(),
            node.find_property("status").map(|p| p.value).as_ref(),
        );

        // Reconstruct the pre-transaction view of the three inputs by
        // undoing this node's journal entries, newest first.
        let mut attached_prev = !node.is_detached();
        let mut compatible_prev = node.find_property("compatible").map(|p| p.value);
        let mut status_prev = node.find_property("status").map(|p| p.value);
        for entry in txn.entries().iter().rev() {
            if entry.node().id() != node_id {
                continue;
            }
            match &entry.op {
                ChangeOp::AttachNode { .. } => attached_prev = false,
                ChangeOp::DetachNode { .. } => attached_prev = true,
                ChangeOp::AddProperty { prop, .. } => {
                    if let Some(record) = tree.property_record(*prop) {
                        match record.name.as_str() {
                            "compatible" => compatible_prev = None,
                            "status" => status_prev = None,
                            _ => {}
                        }
                    }
                }
                ChangeOp::RemoveProperty { prop, .. } => {
                    if let Some(record) = tree.property_record(*prop) {
                        match record.name.as_str() {
                            "compatible" => compatible_prev = Some(record.value),
                            "status" => status_prev = Some(record.value),
                            _ => {}
                        }
                    }
                }
                ChangeOp::UpdateProperty { old_prop, .. } => {
                    if let Some(record) = tree.property_record(*old_prop) {
                        match record.name.as_str() {
                            "compatible" => compatible_prev = Some(record.value),
                            "status" => status_prev = Some(record.value),
                            _ => {}
                        }
                    }
                }
            }
        }
        let prev_present = present(attached_prev, compatible_prev.as_ref(), status_prev.as_ref());

        if prev_present != new_present {
            ledger.push(DeviceDelta {
                node,
                prev_present,
                new_present,
            });
        }
    }

    ledger
}

/// Emit `DynamicCreateDevice`/`DynamicDestroyDevice` for every ledger
/// entry. Forward dispatch announces the new state in ledger order; revert
/// announces the previous state in reverse order. Handler failures are
/// logged, never fatal.
pub(crate) fn dispatch_device_events(tree: &DeviceTree, ledger: &[DeviceDelta], revert: bool) {
    let deltas: Vec<&DeviceDelta> = if revert {
        ledger.iter().rev().collect()
    } else {
        ledger.iter().collect()
    };
    for delta in deltas {
        let state = if revert {
            delta.prev_present
        } else {
            delta.new_present
        };
        let kind = if state {
            ChangeKind::DynamicCreateDevice
        } else {
            ChangeKind::DynamicDestroyDevice
        };
        if let Err(rejection) =
            tree.dispatch(&ChangeEvent::structural(kind, delta.node.clone()))
        {
            log::warn!(
                "device handler failed for {}: {}",
                delta.node.path(),
                rejection
            );
        }
    }
}

/// Resolve, walk, and atomically apply a changeset of target/fragment
/// pairs under a single transaction, then settle the device ledger.
pub(crate) fn apply_changeset(
    tree: &DeviceTree,
    infos: &[OverlayInfo],
) -> Result<Overlay, EngineError> {
    if infos.is_empty() {
        return Err(EngineError::InvalidFragment("empty changeset".to_string()));
    }

    let mut txn = Transaction::new(tree.clone());
    txn.begin()?;

    let mut targets = Vec::new();
    for info in infos {
        let target = match resolve_target(tree, &info.target) {
            Ok(target) => target,
            Err(error) => {
                let _ = txn.abort();
                return Err(error);
            }
        };
        if let Err(error) = apply_fragment(&mut txn, tree, &target, &info.fragment) {
            let _ = txn.abort();
            return Err(error);
        }
        targets.push((target, info.device_depth));
    }

    if let Err(error) = txn.apply() {
        let _ = txn.destroy();
        return Err(error);
    }

    let ledger = compute_ledger(tree, &txn, &targets);
    dispatch_device_events(tree, &ledger, false);

    let touched = txn.touched_nodes();
    Ok(Overlay {
        txn,
        touched,
        ledger,
    })
}
