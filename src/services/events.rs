//! Change notifications for transfer records.
//!
//! Published after a mutation has committed. Subscribers that fall behind
//! lose events instead of slowing the writers down.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEventKind {
    Created,
    Downloaded,
    Deleted,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub kind: TransferEventKind,
    pub link_id: String,
    /// Used to scope delivery; not part of the payload.
    #[serde(skip)]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_count: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct TransferEvents {
    tx: broadcast::Sender<TransferEvent>,
}

impl TransferEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: TransferEvent) {
        // No receivers is the normal case.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }
}

impl Default for TransferEvents {
    fn default() -> Self {
        Self::new(256)
    }
}
