use std::sync::Arc;

use livetree_core::{ChangeKind, Phandle, PropValue};
use livetree_engine::{EngineError, TxState};
use livetree_harness::{RecordingNotifier, TestHost, VetoNotifier};
use livetree_store::{NodeRef, PropertyRecord, TreeMirror};
use parking_lot::Mutex;

// ============================================================================
// State machine
// ============================================================================

#[test]
fn recording_requires_begin() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let root = host.tree().find_node_by_path("/root").expect("/root");

    let mut txn = host.engine.transaction();
    assert_eq!(txn.state(), TxState::Ready);
    assert!(matches!(
        txn.add_property(&root, "k", PropValue::from_str("v")),
        Err(EngineError::InvalidState { .. })
    ));
    assert!(matches!(txn.apply(), Err(EngineError::InvalidState { .. })));
    assert!(matches!(txn.revert(), Err(EngineError::InvalidState { .. })));

    txn.begin()?;
    assert_eq!(txn.state(), TxState::InProgress);
    assert!(matches!(txn.begin(), Err(EngineError::InvalidState { .. })));
    txn.abort()?;
    assert_eq!(txn.state(), TxState::Aborted);
    assert!(matches!(txn.abort(), Err(EngineError::InvalidState { .. })));
    txn.destroy()?;
    assert_eq!(txn.state(), TxState::Destroyed);
    Ok(())
}

#[test]
fn abort_leaves_tree_untouched() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let before = host.tree().fingerprint();
    let root = host.tree().find_node_by_path("/root").expect("/root");

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.add_property(&root, "staged", PropValue::from_str("v"))?;
    txn.detach_node(&root)?;
    txn.abort()?;

    assert_eq!(host.tree().fingerprint(), before);
    assert!(host.tree().find_node_by_path("/root").is_some());
    Ok(())
}

// ============================================================================
// Staged reads (transaction-aware helpers)
// ============================================================================

#[test]
fn staged_property_visible_inside_transaction_only() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let root = host.tree().find_node_by_path("/root").expect("/root");

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.add_property(&root, "k", PropValue::from_str("v"))?;

    // the transaction sees its own staged edit
    assert_eq!(txn.find_property(&root, "k"), Some(PropValue::from_str("v")));
    // a plain reader does not
    assert!(root.find_property("k").is_none());

    txn.apply()?;
    assert_eq!(
        root.find_property("k").map(|p| p.value),
        Some(PropValue::from_str("v"))
    );

    txn.revert()?;
    assert!(root.find_property("k").is_none());
    Ok(())
}

#[test]
fn staged_remove_and_update_chain() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let root = host.tree().find_node_by_path("/root").expect("/root");

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.add_property(&root, "k", PropValue::from_u32(1))?;
    // update of a staged add resolves against the journal
    txn.update_property(&root, "k", PropValue::from_u32(2))?;
    assert_eq!(txn.find_property(&root, "k"), Some(PropValue::from_u32(2)));

    txn.remove_property(&root, "k")?;
    assert_eq!(txn.find_property(&root, "k"), None);
    // live property still consulted below the journal
    assert_eq!(
        txn.find_property(&root, "compatible"),
        Some(PropValue::from_str("v1"))
    );

    // updating a property nothing would expose is refused at record time
    assert!(matches!(
        txn.update_property(&root, "k", PropValue::from_u32(3)),
        Err(EngineError::NotFound(_))
    ));

    txn.apply()?;
    assert!(root.find_property("k").is_none());
    txn.destroy()?;
    Ok(())
}

// ============================================================================
// Apply / revert round trips
// ============================================================================

#[test]
fn update_then_revert_restores_value_and_order() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let before = host.tree().fingerprint();
    let root = host.tree().find_node_by_path("/root").expect("/root");

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.update_property(&root, "compatible", PropValue::from_str("v2"))?;
    txn.apply()?;
    assert_eq!(host.prop_str("/root", "compatible").as_deref(), Some("v2"));

    txn.revert()?;
    assert_eq!(host.prop_str("/root", "compatible").as_deref(), Some("v1"));
    assert_eq!(host.tree().fingerprint(), before);
    Ok(())
}

#[test]
fn revert_relinks_the_same_property_memory() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let root = host.tree().find_node_by_path("/root").expect("/root");
    let original = root.find_property("compatible").expect("compatible");

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.remove_property(&root, "compatible")?;
    txn.apply()?;
    assert!(root.find_property("compatible").is_none());

    txn.revert()?;
    let restored = root.find_property("compatible").expect("compatible restored");
    // identity, not a copy: external mirrors key on this
    assert_eq!(restored.id, original.id);
    assert_eq!(restored.unique_id, original.unique_id);
    Ok(())
}

#[test]
fn detach_then_revert_restores_subtree() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let before = host.tree().fingerprint();
    let a = host.tree().find_node_by_path("/root/a").expect("/root/a");

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.detach_node(&a)?;
    txn.apply()?;
    assert!(host.tree().find_node_by_path("/root/a").is_none());

    txn.revert()?;
    assert!(host.tree().find_node_by_path("/root/a").is_some());
    assert_eq!(host.tree().fingerprint(), before);
    Ok(())
}

#[test]
fn destroy_after_apply_makes_edits_permanent() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let before = host.tree().fingerprint();
    let root = host.tree().find_node_by_path("/root").expect("/root");

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.add_property(&root, "keep", PropValue::from_u32(1))?;
    txn.apply()?;
    txn.destroy()?;

    assert_eq!(
        root.find_property("keep").map(|p| p.value),
        Some(PropValue::from_u32(1))
    );
    assert_ne!(host.tree().fingerprint(), before);
    Ok(())
}

// ============================================================================
// Failure paths
// ============================================================================

#[test]
fn mid_apply_failure_rolls_back_everything() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let before = host.tree().fingerprint();
    let root = host.tree().find_node_by_path("/root").expect("/root");
    let a = host.tree().find_node_by_path("/root/a").expect("/root/a");

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.detach_node(&a)?;
    txn.add_property(&root, "first", PropValue::from_u32(1))?;
    // collides with the seeded property at apply time
    txn.add_property(&root, "compatible", PropValue::from_str("v9"))?;
    txn.add_property(&root, "never-reached", PropValue::from_u32(2))?;

    let result = txn.apply();
    assert!(matches!(result, Err(EngineError::Store(_))));
    assert_eq!(txn.state(), TxState::Ready);
    assert_eq!(host.tree().fingerprint(), before);
    assert!(host.tree().find_node_by_path("/root/a").is_some());
    txn.destroy()?;
    Ok(())
}

#[test]
fn veto_on_first_event_leaves_tree_byte_identical() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let before = host.tree().fingerprint();
    host.tree().register_notifier(Arc::new(VetoNotifier::new(
        ChangeKind::AddProperty,
        "/root",
    )));
    let root = host.tree().find_node_by_path("/root").expect("/root");

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.add_property(&root, "k", PropValue::from_u32(1))?;
    assert!(matches!(txn.apply(), Err(EngineError::Veto(_))));

    assert_eq!(host.tree().fingerprint(), before);
    txn.destroy()?;
    assert_eq!(host.tree().fingerprint(), before);
    Ok(())
}

#[test]
fn veto_mid_stream_reverse_notifies_earlier_entries() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let recorder = Arc::new(RecordingNotifier::new());
    host.tree().register_notifier(recorder.clone());
    host.tree().register_notifier(Arc::new(VetoNotifier::new(
        ChangeKind::DetachNode,
        "/root/a",
    )));

    let root = host.tree().find_node_by_path("/root").expect("/root");
    let a = host.tree().find_node_by_path("/root/a").expect("/root/a");

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.add_property(&root, "k", PropValue::from_u32(1))?;
    txn.detach_node(&a)?;
    assert!(matches!(txn.apply(), Err(EngineError::Veto(_))));

    let events = recorder.events();
    let kinds: Vec<ChangeKind> = events.iter().map(|e| e.kind).collect();
    // forward add, vetoed detach, then the add announced undone
    assert_eq!(
        kinds,
        vec![
            ChangeKind::AddProperty,
            ChangeKind::DetachNode,
            ChangeKind::RemoveProperty,
        ]
    );
    assert!(root.find_property("k").is_none());
    txn.destroy()?;
    Ok(())
}

// ============================================================================
// Mirror hooks
// ============================================================================

#[derive(Default)]
struct RecordingMirror {
    calls: Mutex<Vec<String>>,
}

impl RecordingMirror {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl TreeMirror for RecordingMirror {
    fn node_attached(&self, node: &NodeRef) {
        self.calls.lock().push(format!("attach {}", node.path()));
    }

    fn node_detached(&self, node: &NodeRef) {
        self.calls.lock().push(format!("detach {}", node.path()));
    }

    fn property_added(&self, node: &NodeRef, prop: &PropertyRecord) {
        self.calls.lock().push(format!("add {} {}", node.path(), prop.name));
    }

    fn property_removed(&self, node: &NodeRef, prop: &PropertyRecord) {
        self.calls
            .lock()
            .push(format!("remove {} {}", node.path(), prop.name));
    }

    fn property_updated(&self, node: &NodeRef, prop: &PropertyRecord, old: &PropertyRecord) {
        self.calls
            .lock()
            .push(format!("update {} {}<-{}", node.path(), prop.name, old.name));
    }
}

#[test]
fn mirror_hooks_fire_after_apply_and_inverse_on_revert() -> Result<(), Box<dyn std::error::Error>> {
    let host = TestHost::new()?;
    let mirror = Arc::new(RecordingMirror::default());
    host.tree().register_mirror(mirror.clone());

    let root = host.tree().find_node_by_path("/root").expect("/root");
    let node = host.tree().create_node("fresh", None, "/root/fresh", Phandle::NONE);
    host.tree().raw_set_parent(&node, &root)?;

    let mut txn = host.engine.transaction();
    txn.begin()?;
    txn.attach_node(&node)?;
    txn.add_property(&node, "compatible", PropValue::from_str("f"))?;
    txn.apply()?;

    assert_eq!(
        mirror.calls(),
        vec!["attach /root/fresh".to_string(), "add /root/fresh compatible".to_string()]
    );

    txn.revert()?;
    assert_eq!(
        mirror.calls()[2..],
        [
            "remove /root/fresh compatible".to_string(),
            "detach /root/fresh".to_string()
        ]
    );
    Ok(())
}

// ============================================================================
// Serialization across threads
// ============================================================================

#[test]
fn concurrent_transactions_serialize_on_the_application_mutex()
-> Result<(), Box<dyn std::error::Error>> {
    let host = Arc::new(TestHost::new()?);
    let before = host.tree().fingerprint();

    let mut handles = Vec::new();
    for worker in 0..4 {
        let host = host.clone();
        handles.push(std::thread::spawn(move || {
            for round in 0..8 {
                let root = host.tree().find_node_by_path("/root").expect("/root");
                let mut txn = host.engine.transaction();
                txn.begin().expect("begin");
                txn.add_property(
                    &root,
                    &format!("w{worker}-r{round}"),
                    PropValue::from_u32(round),
                )
                .expect("record");
                txn.apply().expect("apply");
                txn.revert().expect("revert");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    assert_eq!(host.tree().fingerprint(), before);
    Ok(())
}
