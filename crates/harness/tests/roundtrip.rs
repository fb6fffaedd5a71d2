//! Round-trip properties over randomized fragments: apply-then-revert must
//! restore the tree bit-for-bit, stacked overlays must unwind cleanly, and
//! the device ledger must agree with the availability predicate.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use livetree_core::{ChangeKind, PropValue};
use livetree_engine::{Fragment, OverlayInfo, TargetSpec};
use livetree_harness::{RecordingNotifier, TestHost};

const PROP_NAMES: &[&str] = &["alpha", "beta", "gamma", "status", "compatible"];
const CHILD_NAMES: &[&str] = &["a", "north", "south", "uart@0"];

fn random_value(rng: &mut StdRng) -> PropValue {
    match rng.gen_range(0..4) {
        0 => PropValue::from_u32(rng.gen_range(0..1000)),
        1 => PropValue::from_str("okay"),
        2 => PropValue::from_str("disabled"),
        _ => PropValue::from_str("dev,random"),
    }
}

fn random_fragment(rng: &mut StdRng, depth: usize) -> Fragment {
    let mut fragment = Fragment::new("__overlay__");
    for _ in 0..rng.gen_range(0..4) {
        let name = PROP_NAMES[rng.gen_range(0..PROP_NAMES.len())];
        if rng.gen_bool(0.25) {
            fragment = fragment.with_property(format!("-{name}"), PropValue::empty());
        } else {
            fragment = fragment.with_property(name, random_value(rng));
        }
    }
    if depth > 0 {
        for _ in 0..rng.gen_range(0..3) {
            let name = CHILD_NAMES[rng.gen_range(0..CHILD_NAMES.len())];
            if rng.gen_bool(0.2) {
                fragment = fragment.with_child(Fragment::new(format!("-{name}")));
            } else {
                let mut child = random_fragment(rng, depth - 1);
                child.name = name.to_string();
                fragment = fragment.with_child(child);
            }
        }
    }
    fragment
}

fn random_overlay(rng: &mut StdRng) -> OverlayInfo {
    let target = if rng.gen_bool(0.5) { "/root" } else { "/root/a" };
    OverlayInfo::new(
        TargetSpec::Path(target.to_string()),
        random_fragment(rng, 2),
    )
}

// ============================================================================
// Apply followed by revert restores the exact tree
// ============================================================================

#[test]
fn apply_revert_restores_the_exact_tree() -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = StdRng::seed_from_u64(0x1eaf);
    for round in 0..60 {
        let host = TestHost::new()?;
        let before = host.tree().fingerprint();

        let id = host
            .engine
            .overlay_apply(random_overlay(&mut rng))
            .unwrap_or_else(|e| panic!("round {round}: apply failed: {e}"));
        host.engine
            .overlay_destroy(id)
            .unwrap_or_else(|e| panic!("round {round}: destroy failed: {e}"));

        assert_eq!(
            host.tree().fingerprint(),
            before,
            "round {round}: tree not restored"
        );
    }
    Ok(())
}

// ============================================================================
// Stacked overlays unwound in reverse restore the initial tree
// ============================================================================

#[test]
fn stacked_overlays_unwind_to_the_initial_tree() -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = StdRng::seed_from_u64(0x57ac);
    for round in 0..20 {
        let host = TestHost::new()?;
        let before = host.tree().fingerprint();

        let mut ids = Vec::new();
        for _ in 0..rng.gen_range(2..6) {
            // an earlier overlay may have detached the drawn target; the
            // failed apply must leave no trace
            match host.engine.overlay_apply(random_overlay(&mut rng)) {
                Ok(id) => ids.push(id),
                Err(livetree_engine::EngineError::NotFound(_)) => {}
                Err(other) => panic!("round {round}: apply failed: {other}"),
            }
        }
        for id in ids.into_iter().rev() {
            host.engine.overlay_destroy(id)?;
        }

        assert_eq!(
            host.tree().fingerprint(),
            before,
            "round {round}: tree not restored"
        );
    }
    Ok(())
}

#[test]
fn destroy_all_is_equivalent_to_reverse_teardown() -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = StdRng::seed_from_u64(0xa11);
    let host = TestHost::new()?;
    let before = host.tree().fingerprint();

    for _ in 0..5 {
        match host.engine.overlay_apply(random_overlay(&mut rng)) {
            Ok(_) | Err(livetree_engine::EngineError::NotFound(_)) => {}
            Err(other) => panic!("apply failed: {other}"),
        }
    }
    host.engine.overlay_destroy_all();
    assert_eq!(host.tree().fingerprint(), before);
    Ok(())
}

// ============================================================================
// Ledger transitions agree with the availability predicate
// ============================================================================

fn device_predicate(host: &TestHost, node: livetree_core::NodeId) -> bool {
    let Some(node) = host.tree().node(node) else {
        return false;
    };
    let compatible = node
        .find_property("compatible")
        .is_some_and(|p| !p.value.is_empty());
    !node.is_detached() && compatible && node.is_available()
}

#[test]
fn ledger_matches_predicate_on_post_apply_tree() -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = StdRng::seed_from_u64(0x9d9e);
    for _ in 0..40 {
        let host = TestHost::new()?;
        let recorder = Arc::new(RecordingNotifier::new());
        host.tree().register_notifier(recorder.clone());

        let id = host.engine.overlay_apply(random_overlay(&mut rng))?;
        for event in recorder.events() {
            match event.kind {
                ChangeKind::DynamicCreateDevice => {
                    assert!(
                        device_predicate(&host, event.node),
                        "create announced for {} but predicate is false",
                        event.path
                    );
                }
                ChangeKind::DynamicDestroyDevice => {
                    assert!(
                        !device_predicate(&host, event.node),
                        "destroy announced for {} but predicate is true",
                        event.path
                    );
                }
                _ => {}
            }
        }
        host.engine.overlay_destroy(id)?;
    }
    Ok(())
}

// ============================================================================
// Concurrent applies serialize
// ============================================================================

#[test]
fn concurrent_overlay_applies_serialize() -> Result<(), Box<dyn std::error::Error>> {
    let host = Arc::new(TestHost::new()?);
    let before = host.tree().fingerprint();

    let mut handles = Vec::new();
    for worker in 0..4 {
        let host = host.clone();
        handles.push(std::thread::spawn(move || {
            for round in 0..6 {
                let fragment = Fragment::new("__overlay__")
                    .with_property(format!("w{worker}-r{round}"), worker as u32);
                let info =
                    OverlayInfo::new(TargetSpec::Path("/root".to_string()), fragment);
                host.engine.overlay_apply(info).expect("overlay apply");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    // every apply landed whole
    let root = host.tree().find_node_by_path("/root").expect("/root");
    for worker in 0..4 {
        for round in 0..6 {
            assert!(root.find_property(&format!("w{worker}-r{round}")).is_some());
        }
    }
    assert_eq!(host.engine.overlay_ids().len(), 24);

    host.engine.overlay_destroy_all();
    assert_eq!(host.tree().fingerprint(), before);
    Ok(())
}
