//! Kafka change feed.

use super::{Acker, EventSource, FeedMessage, OffsetTracker, TopicRouter};
use crate::config::FeedConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const COMMIT_INTERVAL: Duration = Duration::from_secs(5);

fn feed_error(e: rdkafka::error::KafkaError) -> SyncError {
    SyncError::Feed(e.to_string())
}

/// Consumes both systems' change topics under one consumer group.
///
/// Offsets are committed from the [`OffsetTracker`], never from the consumer
/// position, so unacknowledged messages are redelivered after a restart.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    tracker: Arc<OffsetTracker>,
    last_commit: Instant,
}

struct TrackerAcker(Arc<OffsetTracker>);

impl Acker for TrackerAcker {
    fn ack(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.0.ack(topic, partition, offset);
        Ok(())
    }
}

impl KafkaSource {
    pub fn connect(config: &FeedConfig) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(feed_error)?;

        let router = TopicRouter::new(
            config.system_a_topic_prefix.clone(),
            config.system_b_topic_prefix.clone(),
        );
        let patterns = router.patterns();
        let topics: Vec<&str> = patterns.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(feed_error)?;
        info!(
            servers = %config.bootstrap_servers,
            group = %config.group_id,
            ?patterns,
            "Subscribed to change topics"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            tracker: Arc::new(OffsetTracker::new()),
            last_commit: Instant::now(),
        })
    }

    /// Drop offsets of partitions a rebalance took away; the new owner
    /// commits them.
    fn drop_revoked(&self) -> Result<()> {
        let assignment = self.consumer.assignment().map_err(feed_error)?;
        let assigned: HashSet<(String, i32)> = assignment
            .elements()
            .iter()
            .map(|elem| (elem.topic().to_string(), elem.partition()))
            .collect();
        self.tracker
            .retain(|topic, partition| assigned.contains(&(topic.to_string(), partition)));
        Ok(())
    }

    fn commit(&self, mode: CommitMode) -> Result<()> {
        self.drop_revoked()?;
        let positions = self.tracker.positions();
        if positions.is_empty() {
            return Ok(());
        }
        let mut tpl = TopicPartitionList::new();
        for (topic, partition, next) in positions {
            tpl.add_partition_offset(&topic, partition, Offset::Offset(next))
                .map_err(feed_error)?;
        }
        self.consumer.commit(&tpl, mode).map_err(feed_error)
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    async fn next(&mut self) -> Result<Option<FeedMessage>> {
        if self.last_commit.elapsed() >= COMMIT_INTERVAL {
            if let Err(e) = self.commit(CommitMode::Async) {
                warn!(error = %e, "Offset commit failed");
            }
            self.last_commit = Instant::now();
        }

        let message = {
            let borrowed = self.consumer.recv().await.map_err(feed_error)?;
            FeedMessage::new(
                borrowed.topic(),
                borrowed.partition(),
                borrowed.offset(),
                borrowed.payload().map(<[u8]>::to_vec),
            )
        };
        self.tracker
            .observe(&message.topic, message.partition, message.offset);
        Ok(Some(message))
    }

    fn acker(&self) -> Arc<dyn Acker> {
        Arc::new(TrackerAcker(self.tracker.clone()))
    }

    async fn close(&mut self) -> Result<()> {
        let committed = self.commit(CommitMode::Sync);
        self.consumer.unsubscribe();
        info!(positions = ?self.tracker.positions(), "Kafka feed closed");
        committed
    }
}
