use livetree_core::{ChangeKind, NodeId, Phandle, PropValue};
use livetree_engine::Engine;
use livetree_store::{
    ChangeEvent, DeviceTree, NodeRef, ReconfigNotifier, Rejection, StoreError,
};
use parking_lot::Mutex;

/// A live tree plus engine, pre-seeded with the standard scenario layout:
/// `/root` carrying `status = "okay"` and `compatible = "v1"`, and
/// `/root/a` carrying `compatible = "x"`.
pub struct TestHost {
    pub engine: Engine,
}

impl TestHost {
    pub fn new() -> Result<Self, StoreError> {
        let host = Self::empty();
        host.seed_child(
            "/",
            "root",
            Phandle::NONE,
            &[("status", PropValue::from_str("okay")), ("compatible", PropValue::from_str("v1"))],
        )?;
        host.seed_child(
            "/root",
            "a",
            Phandle::NONE,
            &[("compatible", PropValue::from_str("x"))],
        )?;
        Ok(host)
    }

    /// A bare tree holding only the root node.
    pub fn empty() -> Self {
        Self {
            engine: Engine::new(DeviceTree::new()),
        }
    }

    pub fn tree(&self) -> &DeviceTree {
        self.engine.tree()
    }

    /// Splice a node with initial properties directly into the live tree,
    /// bypassing the journal. Seeding only.
    pub fn seed_child(
        &self,
        parent_path: &str,
        name: &str,
        phandle: Phandle,
        props: &[(&str, PropValue)],
    ) -> Result<NodeRef, StoreError> {
        let tree = self.tree();
        let parent = tree
            .find_node_by_path(parent_path)
            .ok_or_else(|| StoreError::NotFound(parent_path.to_string()))?;
        let path = livetree_core::path::join(&parent.path(), name);
        let node = tree.create_node(name, None, &path, phandle);
        tree.raw_set_parent(&node, &parent)?;
        tree.raw_attach(&node)?;
        for (prop_name, value) in props {
            let prop = tree.create_property(prop_name, value.clone());
            tree.raw_add_property(&node, prop)?;
        }
        Ok(node)
    }

    /// Add one property to an existing live node, bypassing the journal.
    pub fn seed_property(
        &self,
        path: &str,
        name: &str,
        value: PropValue,
    ) -> Result<(), StoreError> {
        let tree = self.tree();
        let node = tree
            .find_node_by_path(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let prop = tree.create_property(name, value);
        tree.raw_add_property(&node, prop)
    }

    /// Convenience: the string value of a property, if the node and the
    /// property exist.
    pub fn prop_str(&self, path: &str, name: &str) -> Option<String> {
        let node = self.tree().find_node_by_path(path)?;
        let record = node.find_property(name)?;
        record.value.as_str().map(str::to_string)
    }
}

/// One observed bus event, flattened for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub kind: ChangeKind,
    pub node: NodeId,
    pub path: String,
    pub prop: Option<String>,
}

/// Notifier that records every event it sees, in dispatch order.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn count_for(&self, kind: ChangeKind, path: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind && e.path == path)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ReconfigNotifier for RecordingNotifier {
    fn notify(&self, event: &ChangeEvent) -> Result<(), Rejection> {
        self.events.lock().push(RecordedEvent {
            kind: event.kind,
            node: event.node.id(),
            path: event.node.path(),
            prop: event.prop.as_ref().map(|p| p.name.clone()),
        });
        Ok(())
    }
}

/// Notifier that rejects every event matching one kind and node path.
pub struct VetoNotifier {
    kind: ChangeKind,
    path: String,
}

impl VetoNotifier {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

impl ReconfigNotifier for VetoNotifier {
    fn notify(&self, event: &ChangeEvent) -> Result<(), Rejection> {
        if event.kind == self.kind && event.node.path() == self.path {
            return Err(Rejection::new(format!(
                "{} on {} declined",
                self.kind.as_str(),
                self.path
            )));
        }
        Ok(())
    }
}
