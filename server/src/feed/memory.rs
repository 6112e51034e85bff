//! Channel-backed feed for tests and embedding.

use super::{Acker, EventSource, FeedMessage};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<FeedMessage>,
    acker: Arc<MemoryAcker>,
}

/// Records every acknowledgement.
#[derive(Debug, Default)]
pub struct MemoryAcker {
    acked: Mutex<Vec<(String, i32, i64)>>,
}

impl MemoryAcker {
    pub fn acked(&self) -> Vec<(String, i32, i64)> {
        match self.acked.lock() {
            Ok(acked) => acked.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn acked_offsets(&self) -> Vec<i64> {
        let mut offsets: Vec<i64> = self.acked().into_iter().map(|(_, _, o)| o).collect();
        offsets.sort_unstable();
        offsets
    }
}

impl Acker for MemoryAcker {
    fn ack(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let entry = (topic.to_string(), partition, offset);
        match self.acked.lock() {
            Ok(mut acked) => acked.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
        Ok(())
    }
}

impl MemorySource {
    /// A finite feed that ends after `messages`.
    pub fn new(messages: impl IntoIterator<Item = FeedMessage>) -> Self {
        let (tx, source) = Self::channel();
        for message in messages {
            let _ = tx.send(message);
        }
        source
    }

    /// An open feed that ends when the sender is dropped.
    pub fn channel() -> (mpsc::UnboundedSender<FeedMessage>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            rx,
            acker: Arc::new(MemoryAcker::default()),
        };
        (tx, source)
    }

    pub fn ack_log(&self) -> Arc<MemoryAcker> {
        self.acker.clone()
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn next(&mut self) -> Result<Option<FeedMessage>> {
        Ok(self.rx.recv().await)
    }

    fn acker(&self) -> Arc<dyn Acker> {
        self.acker.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finite_feed_ends() {
        let mut source = MemorySource::new(vec![
            FeedMessage::new("t", 0, 0, None),
            FeedMessage::new("t", 0, 1, None),
        ]);
        let log = source.ack_log();

        while let Some(message) = source.next().await.unwrap() {
            source
                .acker()
                .ack(&message.topic, message.partition, message.offset)
                .unwrap();
        }
        assert_eq!(log.acked_offsets(), vec![0, 1]);
    }
}
