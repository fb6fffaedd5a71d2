//! The process-wide, ordered collection of applied overlays.
//!
//! Overlays stack: a later overlay may depend on the effects of an earlier
//! one, so removal is permitted only for overlays that are topmost-safe,
//! meaning no strictly-later overlay touches any node this one touches.

use parking_lot::Mutex;

use livetree_core::OverlayId;
use livetree_store::DeviceTree;

use crate::error::EngineError;
use crate::overlay::{Overlay, dispatch_device_events};

struct RegistryEntry {
    id: OverlayId,
    overlay: Overlay,
}

#[derive(Default)]
pub(crate) struct OverlayRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u32,
    entries: Vec<RegistryEntry>,
}

impl OverlayRegistry {
    /// Register a freshly applied overlay, allocating its dense id.
    pub(crate) fn insert(&self, overlay: Overlay) -> OverlayId {
        let mut state = self.inner.lock();
        let id = OverlayId::from_raw(state.next_id);
        state.next_id += 1;
        state.entries.push(RegistryEntry { id, overlay });
        id
    }

    pub(crate) fn ids(&self) -> Vec<OverlayId> {
        self.inner.lock().entries.iter().map(|entry| entry.id).collect()
    }

    /// Remove one overlay if it is topmost-safe, reverting its transaction
    /// and re-announcing the device states it displaced. A non-topmost
    /// overlay fails with `Busy` and nothing changes.
    pub(crate) fn destroy(&self, tree: &DeviceTree, id: OverlayId) -> Result<(), EngineError> {
        let mut entry = {
            let mut state = self.inner.lock();
            let index = state
                .entries
                .iter()
                .position(|entry| entry.id == id)
                .ok_or_else(|| EngineError::NotFound(format!("overlay {id}")))?;
            let touched = &state.entries[index].overlay.touched;
            let blocked = state.entries[index + 1..].iter().any(|later| {
                later
                    .overlay
                    .touched
                    .iter()
                    .any(|node| touched.contains(node))
            });
            if blocked {
                return Err(EngineError::Busy(id));
            }
            state.entries.remove(index)
        };

        dispatch_device_events(tree, &entry.overlay.ledger, true);
        if let Err(error) = entry.overlay.txn.revert() {
            // the revert was vetoed before any edit was undone; put the
            // overlay back and re-announce its device states
            dispatch_device_events(tree, &entry.overlay.ledger, false);
            let mut state = self.inner.lock();
            let index = state
                .entries
                .iter()
                .position(|later| later.id > id)
                .unwrap_or(state.entries.len());
            state.entries.insert(index, entry);
            return Err(error);
        }
        let _ = entry.overlay.txn.destroy();
        Ok(())
    }

    /// Tear down every overlay, newest to oldest. By induction each step
    /// is topmost-safe; failures are logged and teardown continues.
    pub(crate) fn destroy_all(&self, tree: &DeviceTree) {
        loop {
            let Some(mut entry) = self.inner.lock().entries.pop() else {
                break;
            };
            dispatch_device_events(tree, &entry.overlay.ledger, true);
            if let Err(error) = entry.overlay.txn.revert() {
                log::error!("failed to revert overlay {}: {error}", entry.id);
                continue;
            }
            let _ = entry.overlay.txn.destroy();
        }
    }
}
