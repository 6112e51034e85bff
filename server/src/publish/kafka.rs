//! Kafka outcome publisher.

use super::OutcomePublisher;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use rowsync_engine::SyncOutcomeEvent;
use std::time::Duration;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn connect(bootstrap_servers: &str, topic: impl Into<String>) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "10000")
            .set("acks", "all")
            .create()
            .map_err(|e| SyncError::Publish(e.to_string()))?;

        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }
}

#[async_trait]
impl OutcomePublisher for KafkaPublisher {
    async fn publish(&self, outcome: &SyncOutcomeEvent) -> Result<()> {
        let payload =
            serde_json::to_vec(outcome).map_err(|e| SyncError::Publish(e.to_string()))?;
        let key = outcome.message_key();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "sync-id",
                value: Some(outcome.provenance_id.as_str()),
            })
            .insert(Header {
                key: "content-type",
                value: Some("application/json"),
            });

        let record = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| SyncError::Publish(e.to_string()))?;
        Ok(())
    }
}
