//! Feed-to-store runs of the partitioned worker pipeline.

mod common;

use common::{envelope, Harness, JAN};
use rowsync_server::feed::{FeedMessage, MemorySource, NdjsonSource, TopicRouter};
use rowsync_server::shutdown::Shutdown;
use rowsync_server::sync::{Pipeline, RetryPolicy};
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

const USERS_TOPIC: &str = "mysql.sync.legacy_db.users";

fn pipeline(h: Harness) -> Pipeline {
    Pipeline::new(
        Arc::new(h.dispatcher),
        TopicRouter::new("mysql.sync.", "postgres.sync."),
    )
    .with_workers(2)
    .with_capacity(8)
    .with_retry(RetryPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
    })
}

fn user_message(offset: i64, id: i64) -> FeedMessage {
    let value = envelope(
        "c",
        "users",
        JAN,
        json!({"id": id, "username": format!("user{id}"), "is_active": 1}),
    );
    FeedMessage::new(USERS_TOPIC, 0, offset, Some(value.to_string().into_bytes()))
}

#[tokio::test]
async fn every_message_is_acked_once_handled() {
    let h = Harness::new();
    let b = h.b.clone();
    let metrics = h.metrics.clone();

    let source = MemorySource::new(vec![
        user_message(0, 1),
        user_message(1, 2),
        FeedMessage::new(USERS_TOPIC, 0, 2, None),
        FeedMessage::new(USERS_TOPIC, 0, 3, Some(b"not json".to_vec())),
    ]);
    let acks = source.ack_log();

    let shutdown = Shutdown::new();
    pipeline(h)
        .run(Box::new(source), shutdown.subscribe())
        .await
        .unwrap();

    assert_eq!(acks.acked_offsets(), vec![0, 1, 2, 3]);
    assert_eq!(b.rows("users").len(), 2);
    assert_eq!(metrics.counters().applied, 2);
    assert_eq!(metrics.counters().errors, 1);
    assert_eq!(metrics.queue_depth(), 0);
}

#[tokio::test]
async fn transport_errors_are_retried_before_ack() {
    let h = Harness::new();
    let b = h.b.clone();
    let metrics = h.metrics.clone();
    b.fail_next_writes(2);

    let source = MemorySource::new(vec![user_message(0, 1)]);
    let acks = source.ack_log();

    let shutdown = Shutdown::new();
    pipeline(h)
        .run(Box::new(source), shutdown.subscribe())
        .await
        .unwrap();

    assert_eq!(acks.acked_offsets(), vec![0]);
    assert_eq!(b.rows("users").len(), 1);
    assert_eq!(metrics.counters().transport_errors, 2);
}

#[tokio::test]
async fn shutdown_leaves_unwritten_message_unacked() {
    let h = Harness::new();
    h.b.set_down(true);
    let metrics = h.metrics.clone();

    let (tx, source) = MemorySource::channel();
    let acks = source.ack_log();
    // Same partition: the first blocks its worker, the rest wait in its queue
    for offset in 0..3 {
        tx.send(user_message(offset, offset + 1)).unwrap();
    }

    let shutdown = Shutdown::new();
    let pipeline = pipeline(h);
    let rx = shutdown.subscribe();
    let running = tokio::spawn(async move { pipeline.run(Box::new(source), rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.trigger();

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(acks.acked().is_empty());
    assert_eq!(metrics.queue_depth(), 0);
    drop(tx);
}

#[tokio::test]
async fn ndjson_feed_end_to_end() {
    let h = Harness::new();
    let b = h.b.clone();

    let lines = [
        json!({"topic": USERS_TOPIC, "value": envelope("c", "users", JAN, json!({"id": 1, "username": "ada"}))}),
        json!({"topic": USERS_TOPIC, "value": envelope("u", "users", JAN + 1, json!({"id": 1, "username": "ada l."}))}),
        json!({"topic": "mysql.sync.legacy_db.orders", "partition": 1, "value": null}),
    ];
    let feed: String = lines.iter().map(|line| format!("{line}\n")).collect();
    let source = NdjsonSource::from_reader(Cursor::new(feed.into_bytes()));

    // One worker keeps both users events in order
    let shutdown = Shutdown::new();
    pipeline(h)
        .with_workers(1)
        .run(Box::new(source), shutdown.subscribe())
        .await
        .unwrap();

    let users = b.rows("users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["username"], json!("ada l."));
}
