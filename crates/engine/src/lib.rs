//! Overlay and transaction engine for the live configuration tree.
//!
//! The `Engine` is the principal boundary: it applies self-describing
//! overlay fragments to live targets with full transactional semantics,
//! stacks them in a registry that enforces stack-order teardown, and
//! exposes the raw transaction machinery for hosts that batch their own
//! edits (hotplug bus code and the like).

pub mod error;
pub mod fragment;
mod overlay;
mod registry;
pub mod transaction;

pub use error::EngineError;
pub use fragment::{Fragment, FragmentProp, OverlayInfo, TargetSpec};
pub use transaction::{Transaction, TxState};

use livetree_core::OverlayId;
use livetree_store::DeviceTree;

use crate::registry::OverlayRegistry;

/// Engine façade over one live tree. Methods take `&self` and may be
/// called from any thread; overlay application serializes on the tree's
/// coarse application mutex, so observers see all of an overlay's edits or
/// none of them.
pub struct Engine {
    tree: DeviceTree,
    registry: OverlayRegistry,
}

impl Engine {
    pub fn new(tree: DeviceTree) -> Self {
        Self {
            tree,
            registry: OverlayRegistry::default(),
        }
    }

    pub fn tree(&self) -> &DeviceTree {
        &self.tree
    }

    /// A fresh transaction for batching raw edits. Entries are recorded
    /// against this engine's tree and applied on commit.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.tree.clone())
    }

    /// Apply a single target/fragment pair. On success the overlay is
    /// registered and its id returned; on any failure the tree is exactly
    /// as it was.
    pub fn overlay_apply(&self, info: OverlayInfo) -> Result<OverlayId, EngineError> {
        self.overlay_apply_changeset(vec![info])
    }

    /// Apply a changeset of target/fragment pairs in listed order under a
    /// single transaction; a failure in the kth pair reverts 1..k.
    pub fn overlay_apply_changeset(
        &self,
        infos: Vec<OverlayInfo>,
    ) -> Result<OverlayId, EngineError> {
        let applied = overlay::apply_changeset(&self.tree, &infos)?;
        Ok(self.registry.insert(applied))
    }

    /// Remove an applied overlay. Fails with `Busy` when a later overlay
    /// still touches any node this one touches; nothing changes then.
    pub fn overlay_destroy(&self, id: OverlayId) -> Result<(), EngineError> {
        self.registry.destroy(&self.tree, id)
    }

    /// Tear down every applied overlay, newest to oldest.
    pub fn overlay_destroy_all(&self) {
        self.registry.destroy_all(&self.tree);
    }

    /// Ids of currently applied overlays, in apply order.
    pub fn overlay_ids(&self) -> Vec<OverlayId> {
        self.registry.ids()
    }
}
