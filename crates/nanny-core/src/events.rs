//! Operator-facing events.
//!
//! Conditions a nanny cannot fix on its own become [`ManualCheck`] events.
//! Each one is logged once at warn with the legacy `PLEASE CHECK MANUALLY`
//! marker and broadcast to subscribers (the daemon counts them per kind).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualCheck {
    pub kind: String,
    pub entity_id: String,
    pub reason: String,
}

impl ManualCheck {
    pub fn new(kind: impl Into<String>, entity_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            entity_id: entity_id.into(),
            reason: reason.into(),
        }
    }

    pub fn log(&self) {
        tracing::warn!(
            kind = %self.kind,
            entity_id = %self.entity_id,
            "PLEASE CHECK MANUALLY - {} {}: {}",
            self.kind,
            self.entity_id,
            self.reason
        );
    }
}

pub struct EventBus {
    sender: broadcast::Sender<ManualCheck>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Log the event and hand it to subscribers. Returns the number of
    /// receivers it reached.
    pub fn publish(&self, event: ManualCheck) -> Result<usize, EventError> {
        event.log();
        if self.sender.receiver_count() == 0 {
            return Ok(0);
        }
        self.sender.send(event).map_err(|_| EventError::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManualCheck> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
