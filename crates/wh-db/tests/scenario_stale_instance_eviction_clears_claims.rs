//! Property 4: an instance that stops heartbeating past `stale_threshold`
//! has every claim released within one subsequent procedure call — its
//! rows go back to `instance_id IS NULL` and its `wh_active_stream` rows
//! disappear.

use std::time::Duration;

use uuid::Uuid;
use wh_db::{InstanceIdentity, ProcedureConfig, ProcessWorkBatchInput};

fn identity(label: &str) -> InstanceIdentity {
    InstanceIdentity {
        instance_id: Uuid::new_v4(),
        service_name: format!("wh-db-test-{label}"),
        host_name: "test-host".to_string(),
        process_id: std::process::id() as i32,
        metadata: serde_json::Value::Null,
    }
}

fn config() -> ProcedureConfig {
    ProcedureConfig { lease_seconds: 300, stale_threshold_seconds: 1, flags: 0, partition_count: 64 }
}

#[tokio::test]
async fn stale_instance_loses_its_claims_on_the_next_call() {
    let Some(pool) = wh_testkit_pool().await else {
        eprintln!("SKIP: WH_DATABASE_URL not set");
        return;
    };

    let stream_id = Uuid::new_v4();
    let dying = identity("dying");
    let cfg = config();

    let mut input = ProcessWorkBatchInput::heartbeat_only(dying.clone());
    input.config = cfg;
    input.new_outbox_messages = vec![wh_testkit_message(stream_id)];
    wh_db::process_work_batch(&pool, input).await.unwrap();

    let (claimed_before,): (i64,) = sqlx::query_as("select count(*) from wh_active_stream where assigned_instance_id = $1")
        .bind(dying.instance_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(claimed_before, 1);

    tokio::time::sleep(Duration::from_secs(cfg.stale_threshold_seconds as u64 + 1)).await;

    let survivor = identity("survivor");
    wh_db::process_work_batch(&pool, ProcessWorkBatchInput::heartbeat_only(survivor)).await.unwrap();

    let (still_owned,): (i64,) = sqlx::query_as("select count(*) from wh_active_stream where assigned_instance_id = $1")
        .bind(dying.instance_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(still_owned, 0, "the stale instance's active-stream rows must be gone");

    let (orphaned_rows,): (i64,) = sqlx::query_as("select count(*) from wh_outbox where stream_id = $1 and instance_id is null")
        .bind(stream_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(orphaned_rows, 1, "the stale instance's outbox claim must be released");
}

async fn wh_testkit_pool() -> Option<sqlx::PgPool> {
    if std::env::var(wh_db::ENV_DB_URL).is_err() {
        return None;
    }
    Some(wh_db::testkit_db_pool().await.unwrap())
}

fn wh_testkit_message(stream_id: Uuid) -> wh_db::NewOutboxMessage {
    wh_db::NewOutboxMessage {
        message_id: Uuid::new_v4(),
        destination: "test.destination".to_string(),
        envelope_type: "TestEnvelope".to_string(),
        envelope_data: serde_json::json!({}),
        metadata: serde_json::Value::Null,
        stream_id,
        event: None,
    }
}
