//! Feed reader and partition workers.
//!
//! The reader pulls from the feed and routes each message to a worker by its
//! partition key, so one partition is always handled by one worker in order.
//! A worker acknowledges a message only after the dispatcher is done with it.

use super::Dispatcher;
use crate::error::Result;
use crate::feed::{Acker, EventSource, FeedMessage, TopicRouter};
use crate::health::SyncMetrics;
use crate::shutdown;
use rowsync_engine::ChangeEvent;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Exponential backoff for retrying transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt`, starting at 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

pub struct Pipeline {
    dispatcher: Arc<Dispatcher>,
    router: TopicRouter,
    workers: usize,
    capacity: usize,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(dispatcher: Arc<Dispatcher>, router: TopicRouter) -> Self {
        Self {
            dispatcher,
            router,
            workers: 4,
            capacity: 256,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Queue length per worker.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn slot(&self, message: &FeedMessage) -> usize {
        let mut hasher = DefaultHasher::new();
        message.partition_key().hash(&mut hasher);
        (hasher.finish() % self.workers as u64) as usize
    }

    /// Consume `source` until it is exhausted or shutdown is triggered.
    pub async fn run(
        &self,
        mut source: Box<dyn EventSource>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let metrics = self.dispatcher.metrics().clone();
        let acker = source.acker();

        let mut senders = Vec::with_capacity(self.workers);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let (tx, rx) = mpsc::channel(self.capacity);
            let worker = Worker {
                id,
                dispatcher: self.dispatcher.clone(),
                router: self.router.clone(),
                acker: acker.clone(),
                metrics: metrics.clone(),
                retry: self.retry.clone(),
                shutdown: shutdown.clone(),
            };
            senders.push(tx);
            handles.push(tokio::spawn(worker.run(rx)));
        }
        info!(workers = self.workers, capacity = self.capacity, "Sync pipeline started");

        let stopped = shutdown::wait(shutdown.clone());
        tokio::pin!(stopped);
        metrics.set_feed_connected(true);
        let mut failures = 0u32;

        loop {
            let next = tokio::select! {
                _ = &mut stopped => break,
                next = source.next() => next,
            };

            match next {
                Ok(Some(message)) => {
                    if failures > 0 {
                        info!(failures, "Feed recovered");
                        failures = 0;
                        metrics.set_feed_connected(true);
                    }
                    let slot = self.slot(&message);
                    metrics.queue_enqueued();
                    if senders[slot].send(message).await.is_err() {
                        metrics.queue_dequeued();
                        warn!(worker = slot, "Worker stopped, no longer reading the feed");
                        break;
                    }
                }
                Ok(None) => {
                    info!("Feed exhausted");
                    break;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    metrics.set_feed_connected(false);
                    let delay = self.retry.delay_for_attempt(failures);
                    warn!(error = %e, attempt = failures, ?delay, "Feed read failed, retrying");
                    tokio::select! {
                        _ = &mut stopped => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        drop(senders);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        metrics.set_feed_connected(false);
        info!("Sync pipeline stopped");
        source.close().await
    }
}

struct Worker {
    id: usize,
    dispatcher: Arc<Dispatcher>,
    router: TopicRouter,
    acker: Arc<dyn Acker>,
    metrics: Arc<SyncMetrics>,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<FeedMessage>) {
        while let Some(message) = rx.recv().await {
            self.metrics.queue_dequeued();
            if *self.shutdown.borrow() {
                break;
            }
            if !self.handle(&message).await {
                break;
            }
        }

        // Queued messages stay unacked and are redelivered after a restart.
        rx.close();
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            self.metrics.queue_dequeued();
            dropped += 1;
        }
        debug!(worker = self.id, dropped, "Worker stopped");
    }

    /// Process and acknowledge one message. Returns `false` when shutdown
    /// interrupted a retry; the message is then left unacknowledged.
    async fn handle(&self, message: &FeedMessage) -> bool {
        let Some(event) = self.decode(message) else {
            self.ack(message);
            return true;
        };

        let mut attempt = 0u32;
        loop {
            match self.dispatcher.process(&event).await {
                Ok(disposition) => {
                    debug!(
                        worker = self.id,
                        topic = %message.topic,
                        offset = message.offset,
                        ?disposition,
                        "Processed"
                    );
                    break;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        worker = self.id,
                        topic = %message.topic,
                        offset = message.offset,
                        attempt,
                        ?delay,
                        error = %e,
                        "Target unavailable, retrying"
                    );
                    tokio::select! {
                        _ = shutdown::wait(self.shutdown.clone()) => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.ack(message);
        true
    }

    fn decode(&self, message: &FeedMessage) -> Option<ChangeEvent> {
        let Some(bytes) = message.payload.as_deref() else {
            debug!(topic = %message.topic, offset = message.offset, "Skipping tombstone");
            return None;
        };

        let names = self.dispatcher.registry().names();
        let hint = self
            .router
            .system_for(&message.topic)
            .map(|system| names.canonical(system));

        match ChangeEvent::decode(bytes, hint) {
            Ok(Some(event)) => Some(event),
            Ok(None) => {
                debug!(topic = %message.topic, offset = message.offset, "Skipping empty message");
                None
            }
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Undecodable message"
                );
                self.metrics.record_undecodable(&message.topic);
                None
            }
        }
    }

    fn ack(&self, message: &FeedMessage) {
        if let Err(e) = self
            .acker
            .ack(&message.topic, message.partition, message.offset)
        {
            warn!(topic = %message.topic, offset = message.offset, error = %e, "Ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn zeroth_attempt_uses_initial_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), policy.initial_delay);
    }
}
