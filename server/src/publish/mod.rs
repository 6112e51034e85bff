//! Outbound outcome events.
//!
//! Outcomes are audit metadata. A failed publish is logged and never undoes
//! the write it describes.

#[cfg(feature = "kafka")]
mod kafka;

#[cfg(feature = "kafka")]
pub use kafka::KafkaPublisher;

use crate::error::Result;
use async_trait::async_trait;
use rowsync_engine::{OutcomeStatus, SyncOutcomeEvent};
use std::sync::Mutex;
use tracing::info;

#[async_trait]
pub trait OutcomePublisher: Send + Sync {
    async fn publish(&self, outcome: &SyncOutcomeEvent) -> Result<()>;
}

/// Writes each outcome as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl OutcomePublisher for LogPublisher {
    async fn publish(&self, outcome: &SyncOutcomeEvent) -> Result<()> {
        let status = match outcome.status {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Error => "error",
        };
        info!(
            target: "rowsync_server::outcome",
            key = %outcome.message_key(),
            sync_id = %outcome.provenance_id,
            direction = ?outcome.direction,
            operation = ?outcome.event.operation,
            status,
            error = outcome.error_message.as_deref().unwrap_or(""),
            "sync outcome"
        );
        Ok(())
    }
}

/// Keeps outcomes in memory.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    outcomes: Mutex<Vec<SyncOutcomeEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<SyncOutcomeEvent> {
        match self.outcomes.lock() {
            Ok(outcomes) => outcomes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl OutcomePublisher for RecordingPublisher {
    async fn publish(&self, outcome: &SyncOutcomeEvent) -> Result<()> {
        match self.outcomes.lock() {
            Ok(mut outcomes) => outcomes.push(outcome.clone()),
            Err(poisoned) => poisoned.into_inner().push(outcome.clone()),
        }
        Ok(())
    }
}
