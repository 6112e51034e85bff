//! Inbound change feeds.
//!
//! A feed yields raw [`FeedMessage`]s in per-partition order and hands out an
//! [`Acker`]. A message's position is acknowledged only after the pipeline is
//! done with it, so anything unacknowledged is delivered again after a
//! restart.

mod file;
#[cfg(feature = "kafka")]
mod kafka;
mod memory;
mod offsets;

pub use file::NdjsonSource;
#[cfg(feature = "kafka")]
pub use kafka::KafkaSource;
pub use memory::{MemoryAcker, MemorySource};
pub use offsets::OffsetTracker;

use crate::error::Result;
use async_trait::async_trait;
use rowsync_engine::System;
use std::sync::Arc;

/// One record pulled from a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

impl FeedMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Option<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload,
        }
    }

    /// Messages sharing a partition key are processed in order by one worker.
    pub fn partition_key(&self) -> String {
        format!("{}/{}", self.topic, self.partition)
    }
}

#[async_trait]
pub trait EventSource: Send {
    /// The next message, or `None` once a finite feed is exhausted.
    async fn next(&mut self) -> Result<Option<FeedMessage>>;

    fn acker(&self) -> Arc<dyn Acker>;

    /// Release the feed, persisting acknowledged positions.
    async fn close(&mut self) -> Result<()>;
}

/// Acknowledges processed positions.
pub trait Acker: Send + Sync {
    fn ack(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}

/// Maps topics to the system that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRouter {
    system_a_prefix: String,
    system_b_prefix: String,
}

impl TopicRouter {
    pub fn new(system_a_prefix: impl Into<String>, system_b_prefix: impl Into<String>) -> Self {
        Self {
            system_a_prefix: system_a_prefix.into(),
            system_b_prefix: system_b_prefix.into(),
        }
    }

    pub fn system_for(&self, topic: &str) -> Option<System> {
        if topic.starts_with(&self.system_a_prefix) {
            Some(System::A)
        } else if topic.starts_with(&self.system_b_prefix) {
            Some(System::B)
        } else {
            None
        }
    }

    /// Regex subscriptions covering both prefixes.
    pub fn patterns(&self) -> Vec<String> {
        [&self.system_a_prefix, &self.system_b_prefix]
            .iter()
            .map(|prefix| format!("^{}.*", prefix.replace('.', "\\.")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_prefix() {
        let router = TopicRouter::new("mysql.sync.", "postgres.sync.");
        assert_eq!(router.system_for("mysql.sync.legacy_db.users"), Some(System::A));
        assert_eq!(router.system_for("postgres.sync.public.users"), Some(System::B));
        assert_eq!(router.system_for("sync.events"), None);
        assert_eq!(
            router.patterns(),
            vec!["^mysql\\.sync\\..*".to_string(), "^postgres\\.sync\\..*".to_string()]
        );
    }

    #[test]
    fn partition_key() {
        let message = FeedMessage::new("mysql.sync.users", 3, 10, None);
        assert_eq!(message.partition_key(), "mysql.sync.users/3");
    }
}
