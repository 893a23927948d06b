//! Shared fixtures for scenario tests that exercise the coordination
//! procedure, the worker loops, and the perspective/receptor dispatch path
//! end to end against a real Postgres instance.
//!
//! Every helper here is a thin wrapper over `wh-db`/`wh-coordinator`/
//! `wh-worker` — this crate adds no behavior of its own, only convenience
//! for assembling fixtures and recording what a fake collaborator observed.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use wh_db::{InstanceIdentity, NewInboxMessage, NewOutboxMessage, ProcedureConfig};

pub mod fakes;

pub use fakes::{RecordedPublish, RecordingPerspectiveHandler, RecordingReceptorHandler, RecordingTransport};

/// Connects to `WH_DATABASE_URL` and runs migrations, for scenario tests
/// that need a real schema. Returns `None` (rather than erroring) when the
/// env var is unset, so the caller can skip instead of failing CI runs
/// that don't have Postgres available.
pub async fn maybe_test_pool() -> Result<Option<PgPool>> {
    if std::env::var(wh_db::ENV_DB_URL).is_err() {
        return Ok(None);
    }
    Ok(Some(wh_db::testkit_db_pool().await?))
}

/// A distinct `InstanceIdentity` for a fixture instance, labeled so
/// assertions can tell which instance produced a row.
pub fn test_identity(label: &str) -> InstanceIdentity {
    InstanceIdentity {
        instance_id: Uuid::new_v4(),
        service_name: format!("wh-testkit-{label}"),
        host_name: "test-host".to_string(),
        process_id: std::process::id() as i32,
        metadata: Value::Null,
    }
}

pub fn test_config() -> ProcedureConfig {
    ProcedureConfig {
        lease_seconds: 2,
        stale_threshold_seconds: 1,
        flags: 0,
        partition_count: 64,
    }
}

/// Builds a `NewOutboxMessage` with a fresh `message_id`, for a given
/// `stream_id`, carrying a trivial JSON payload tagged with `seq` so tests
/// can assert relative ordering.
pub fn new_outbox_message(stream_id: Uuid, seq: u32) -> NewOutboxMessage {
    NewOutboxMessage {
        message_id: Uuid::new_v4(),
        destination: "test.destination".to_string(),
        envelope_type: "TestEnvelope".to_string(),
        envelope_data: serde_json::json!({ "seq": seq }),
        metadata: Value::Null,
        stream_id,
        event: None,
    }
}

/// Builds a `NewInboxMessage` with a given fixed `message_id` — callers
/// driving dedup scenarios reuse the same id across concurrent calls.
pub fn new_inbox_message(message_id: Uuid, stream_id: Uuid, handler_name: &str) -> NewInboxMessage {
    NewInboxMessage {
        message_id,
        handler_name: handler_name.to_string(),
        envelope_type: "TestEnvelope".to_string(),
        envelope_data: serde_json::json!({ "received_at": Utc::now().to_rfc3339() }),
        metadata: Value::Null,
        stream_id,
        event: None,
    }
}
