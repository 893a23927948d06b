//! S5 — Partial completion / retry. A transport failure leaves the row
//! `Stored | Failed` with `attempts = 1`; once the retry backoff passes, the
//! worker re-leases and retries, and on success the row disappears from
//! future claims.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;
use wh_coordinator::ImmediateStrategy;
use wh_worker::PublisherWorker;

#[tokio::test]
async fn failed_publish_is_retried_and_eventually_succeeds() {
    let Some(pool) = wh_testkit::maybe_test_pool().await.unwrap() else {
        eprintln!("SKIP: WH_DATABASE_URL not set");
        return;
    };

    let stream_id = Uuid::new_v4();
    let identity = wh_testkit::test_identity("publisher");
    let config = wh_testkit::test_config();

    let strategy = Arc::new(ImmediateStrategy::new(pool.clone(), identity.clone(), config));
    let transport = Arc::new(wh_testkit::RecordingTransport::new());
    transport.fail_next(1);

    let msg = wh_testkit::new_outbox_message(stream_id, 1);
    let msg_id = msg.message_id;
    strategy.queue_outbox_message(msg).await.unwrap();

    let worker = PublisherWorker::new(strategy.clone(), transport.clone(), Duration::from_millis(50), 2, false, 4);

    // First tick: claims the row, the transport fails it.
    worker.tick().await.unwrap();
    assert!(transport.published().is_empty(), "the failing call must not have recorded a publish");

    let (status, attempts): (i32, i32) =
        sqlx::query_as("select status, attempts from wh_outbox where message_id = $1").bind(msg_id).fetch_one(&pool).await.unwrap();
    assert_eq!(status & wh_envelope::status::FAILED, wh_envelope::status::FAILED);
    assert_eq!(attempts, 1);

    // scheduled_for is now in the future; immediately retrying claims nothing new.
    worker.tick().await.unwrap();
    assert!(transport.published().is_empty());

    // Force the retry window open and let the worker reclaim + succeed.
    sqlx::query("update wh_outbox set scheduled_for = now() - interval '1 second' where message_id = $1")
        .bind(msg_id)
        .execute(&pool)
        .await
        .unwrap();

    worker.tick().await.unwrap();
    let published = transport.published();
    assert_eq!(published.len(), 1, "the retried publish should succeed this time");

    let row_exists: Option<(Uuid,)> =
        sqlx::query_as("select message_id from wh_outbox where message_id = $1").bind(msg_id).fetch_optional(&pool).await.unwrap();
    assert!(row_exists.is_none(), "fully completed row must be deleted in non-debug mode");
}
