//! In-process publish/subscribe bus for tree reconfiguration events, plus
//! the infallible mirror-hook seam used by external state (sysfs-style
//! exporters, device factories).

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use livetree_core::{ChangeKind, SubscriberId};

use crate::arena::PropertyRecord;
use crate::node::NodeRef;

/// One reconfiguration event. Property kinds carry the property involved;
/// `UpdateProperty` additionally carries the property being displaced.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub node: NodeRef,
    pub prop: Option<PropertyRecord>,
    pub old_prop: Option<PropertyRecord>,
}

impl ChangeEvent {
    pub fn structural(kind: ChangeKind, node: NodeRef) -> Self {
        Self {
            kind,
            node,
            prop: None,
            old_prop: None,
        }
    }
}

/// A notifier's refusal of a pending change.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

/// Observer of tree reconfiguration. Pre-change dispatch may veto by
/// returning an error; post-settle device events ignore the return value.
pub trait ReconfigNotifier: Send + Sync {
    fn notify(&self, event: &ChangeEvent) -> Result<(), Rejection>;
}

/// Infallible side-effect hooks run after a change lands (and after its
/// inverse on revert). This is where external mirrors are reconciled.
#[allow(unused_variables)]
pub trait TreeMirror: Send + Sync {
    fn node_attached(&self, node: &NodeRef) {}
    fn node_detached(&self, node: &NodeRef) {}
    fn property_added(&self, node: &NodeRef, prop: &PropertyRecord) {}
    fn property_removed(&self, node: &NodeRef, prop: &PropertyRecord) {}
    fn property_updated(&self, node: &NodeRef, prop: &PropertyRecord, old: &PropertyRecord) {}
}

#[derive(Default)]
pub(crate) struct NotifierBus {
    subscribers: Mutex<Vec<(SubscriberId, Arc<dyn ReconfigNotifier>)>>,
}

impl NotifierBus {
    pub(crate) fn register(&self, notifier: Arc<dyn ReconfigNotifier>) -> SubscriberId {
        let id = SubscriberId::new();
        self.subscribers.lock().push((id, notifier));
        id
    }

    pub(crate) fn unregister(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Run every subscriber in registration order. All of them see the
    /// event even after a rejection, so observer state machines stay in
    /// sync; the first rejection wins and is returned.
    pub(crate) fn dispatch(&self, event: &ChangeEvent) -> Result<(), Rejection> {
        let subscribers: Vec<_> = self.subscribers.lock().clone();
        let mut outcome = Ok(());
        for (_, subscriber) in &subscribers {
            if let Err(rejection) = subscriber.notify(event)
                && outcome.is_ok()
            {
                outcome = Err(rejection);
            }
        }
        if let Err(rejection) = &outcome {
            log::debug!(
                "{} on {} vetoed: {}",
                event.kind.as_str(),
                event.node.id(),
                rejection
            );
        }
        outcome
    }
}

#[derive(Default)]
pub(crate) struct MirrorSet {
    mirrors: Mutex<Vec<Arc<dyn TreeMirror>>>,
}

impl MirrorSet {
    pub(crate) fn register(&self, mirror: Arc<dyn TreeMirror>) {
        self.mirrors.lock().push(mirror);
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(&dyn TreeMirror)) {
        let mirrors: Vec<_> = self.mirrors.lock().clone();
        for mirror in &mirrors {
            f(mirror.as_ref());
        }
    }
}
