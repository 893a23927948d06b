//! S3 — Deduplication. The same inbox message, delivered to the service
//! concurrently with a fixed `message_id`, is stored exactly once: only one
//! caller's batch returns it as newly stored.

use uuid::Uuid;
use wh_db::ProcessWorkBatchInput;

#[tokio::test]
async fn concurrent_delivery_of_the_same_message_id_is_stored_once() {
    let Some(pool) = wh_testkit::maybe_test_pool().await.unwrap() else {
        eprintln!("SKIP: WH_DATABASE_URL not set");
        return;
    };

    let stream_id = Uuid::new_v4();
    let message_id = Uuid::new_v4();
    let config = wh_testkit::test_config();

    let instances: Vec<_> = (0..3).map(|i| wh_testkit::test_identity(&format!("dedupe-{i}"))).collect();

    let mut handles = Vec::new();
    for instance in instances {
        let pool = pool.clone();
        let msg = wh_testkit::new_inbox_message(message_id, stream_id, "test-handler");
        handles.push(tokio::spawn(async move {
            let mut input = ProcessWorkBatchInput::heartbeat_only(instance);
            input.config = config;
            input.new_inbox_messages = vec![msg];
            wh_db::process_work_batch(&pool, input).await
        }));
    }

    let mut newly_stored_count = 0;
    for h in handles {
        let claimed = h.await.unwrap().unwrap();
        if claimed.iter().any(|r| r.message_id == message_id && r.newly_stored) {
            newly_stored_count += 1;
        }
    }

    assert_eq!(newly_stored_count, 1, "exactly one caller should observe the fresh insert (property 2)");

    let (dedupe_count,): (i64,) = sqlx::query_as("select count(*) from wh_message_dedupe where message_id = $1")
        .bind(message_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(dedupe_count, 1, "MessageDedupe must contain exactly one row for the id");

    let (inbox_count,): (i64,) = sqlx::query_as("select count(*) from wh_inbox where message_id = $1")
        .bind(message_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(inbox_count, 1, "inbox table must contain exactly one row for the id");
}
