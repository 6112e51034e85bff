//! Counters shared by the dispatcher, workers and the health surface.

use super::snapshot::{HealthSnapshot, TableStats};
use crate::error::Result;
use chrono::Utc;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use rowsync_engine::System;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const WINDOW_MINUTES: i64 = 60;

#[derive(Debug, Default)]
pub struct SyncMetrics {
    applied: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
    denied: AtomicU64,
    loop_discards: AtomicU64,
    fail_opens: AtomicU64,
    transport_errors: AtomicU64,
    latency_total_us: AtomicU64,
    latency_count: AtomicU64,
    queue_depth: AtomicI64,
    system_a_up: AtomicBool,
    system_b_up: AtomicBool,
    feed_connected: AtomicBool,
    tables: DashMap<String, TableStats>,
    window: Mutex<RollingWindow>,
}

/// Plain copy of the lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub applied: u64,
    pub errors: u64,
    pub skipped: u64,
    pub denied: u64,
    pub loop_discards: u64,
    pub fail_opens: u64,
    pub transport_errors: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, system: &str, table: &str) -> RefMut<'_, String, TableStats> {
        self.tables.entry(table_key(system, table)).or_default()
    }

    pub fn record_applied(&self, system: &str, table: &str, latency: Duration) {
        self.applied.fetch_add(1, Ordering::Relaxed);
        self.latency_total_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.table(system, table).applied += 1;
        self.record_window(true);
    }

    /// A per-event mapping or resolution error.
    pub fn record_error(&self, system: &str, table: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.table(system, table).errors += 1;
        self.record_window(false);
    }

    /// A feed message that is not a change event; counted under its topic.
    pub fn record_undecodable(&self, topic: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.tables.entry(topic.to_string()).or_default().errors += 1;
        self.record_window(false);
    }

    pub fn record_skipped(&self, system: &str, table: &str) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self.table(system, table).skipped += 1;
    }

    pub fn record_denied(&self, system: &str, table: &str) {
        self.denied.fetch_add(1, Ordering::Relaxed);
        self.table(system, table).denied += 1;
    }

    /// Loop discards never count towards the error rate.
    pub fn record_loop_discard(&self) {
        self.loop_discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail_open(&self) {
        self.fail_opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
        self.record_window(false);
    }

    pub fn queue_enqueued(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_dequeued(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some((d - 1).max(0)));
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn set_store_up(&self, system: System, up: bool) {
        let flag = match system {
            System::A => &self.system_a_up,
            System::B => &self.system_b_up,
        };
        flag.store(up, Ordering::Relaxed);
    }

    pub fn store_up(&self, system: System) -> bool {
        match system {
            System::A => self.system_a_up.load(Ordering::Relaxed),
            System::B => self.system_b_up.load(Ordering::Relaxed),
        }
    }

    pub fn set_feed_connected(&self, connected: bool) {
        self.feed_connected.store(connected, Ordering::Relaxed);
    }

    pub fn counters(&self) -> Counters {
        Counters {
            applied: self.applied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            loop_discards: self.loop_discards.load(Ordering::Relaxed),
            fail_opens: self.fail_opens.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }

    pub fn table_stats(&self, system: &str, table: &str) -> TableStats {
        self.tables
            .get(&table_key(system, table))
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    pub fn average_latency_ms(&self) -> f64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.latency_total_us.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }

    /// Successes and errors over the last hour.
    pub fn rolling_counts(&self) -> (u64, u64) {
        match self.window.lock() {
            Ok(mut window) => window.totals(current_minute()),
            Err(poisoned) => poisoned.into_inner().totals(current_minute()),
        }
    }

    /// Point-in-time snapshot; disk usage is measured on `data_dir`.
    pub fn snapshot(&self, data_dir: &Path) -> Result<HealthSnapshot> {
        let counters = self.counters();
        let (success_count, error_count) = self.rolling_counts();
        let tables: BTreeMap<String, TableStats> = self
            .tables
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        Ok(HealthSnapshot {
            timestamp: Utc::now(),
            system_a_connector_up: self.store_up(System::A),
            system_b_connector_up: self.store_up(System::B),
            feed_connected: self.feed_connected.load(Ordering::Relaxed),
            error_count,
            success_count,
            skipped_count: counters.skipped,
            denied_count: counters.denied,
            loop_discard_count: counters.loop_discards,
            fail_open_count: counters.fail_opens,
            queue_size: self.queue_depth(),
            average_latency_ms: self.average_latency_ms(),
            memory_usage_bytes: super::snapshot::resident_memory_bytes(),
            disk_usage_percent: super::snapshot::disk_usage_percent(data_dir)?,
            tables,
        })
    }

    fn record_window(&self, success: bool) {
        let minute = current_minute();
        match self.window.lock() {
            Ok(mut window) => window.record(minute, success),
            Err(poisoned) => poisoned.into_inner().record(minute, success),
        }
    }
}

/// Per-table stats key; the same table name exists on both systems.
fn table_key(system: &str, table: &str) -> String {
    format!("{system}.{table}")
}

fn current_minute() -> i64 {
    Utc::now().timestamp() / 60
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    minute: i64,
    success: u64,
    errors: u64,
}

/// Per-minute buckets covering the last hour.
#[derive(Debug, Default)]
struct RollingWindow {
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    fn record(&mut self, minute: i64, success: bool) {
        self.evict(minute);
        if self.buckets.back().map(|b| b.minute) != Some(minute) {
            self.buckets.push_back(Bucket {
                minute,
                success: 0,
                errors: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            if success {
                bucket.success += 1;
            } else {
                bucket.errors += 1;
            }
        }
    }

    fn totals(&mut self, minute: i64) -> (u64, u64) {
        self.evict(minute);
        self.buckets
            .iter()
            .fold((0, 0), |(s, e), b| (s + b.success, e + b.errors))
    }

    fn evict(&mut self, minute: i64) {
        while self
            .buckets
            .front()
            .is_some_and(|b| b.minute <= minute - WINDOW_MINUTES)
        {
            self.buckets.pop_front();
        }
    }
}
