use livetree_core::OverlayId;
use livetree_store::StoreError;
use thiserror::Error;

use crate::transaction::TxState;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A notifier declined the change; nothing was modified.
    #[error("change vetoed by notifier: {0}")]
    Veto(String),

    /// The overlay is not topmost; a later overlay still touches its nodes.
    #[error("overlay {0} is not topmost")]
    Busy(OverlayId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal transaction transition: {op} in state {state:?}")]
    InvalidState { op: &'static str, state: TxState },

    #[error("invalid fragment: {0}")]
    InvalidFragment(String),
}
