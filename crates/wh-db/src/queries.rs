//! Read-mostly helpers used by the workers, the daemon status surface, and
//! the CLI. None of these touch leases or the status bitfield beyond plain
//! reads — all mutation goes through `process_work_batch`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use wh_envelope::{AssociationType, MessageAssociation};

/// One row of the append-only event store (§3 `EventStore`).
#[derive(Debug, Clone)]
pub struct EventRow {
    pub event_id: Uuid,
    pub stream_id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_data: Value,
    pub metadata: Value,
    pub sequence_number: i64,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

fn row_to_event(row: sqlx::postgres::PgRow) -> Result<EventRow> {
    Ok(EventRow {
        event_id: row.try_get("event_id")?,
        stream_id: row.try_get("stream_id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        event_type: row.try_get("event_type")?,
        event_data: row.try_get("event_data")?,
        metadata: row.try_get("metadata")?,
        sequence_number: row.try_get("sequence_number")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Events for `stream_id` strictly after `after_event_id`'s position in the
/// stream (or from the beginning, if `after_event_id` is `None`), ordered by
/// `version` ascending. Used by the perspective worker to replay a stream
/// past its checkpoint (§4.6).
pub async fn fetch_events_for_stream_since(
    pool: &PgPool,
    stream_id: Uuid,
    after_event_id: Option<Uuid>,
    limit: i64,
) -> Result<Vec<EventRow>> {
    let rows = sqlx::query(
        r#"
        select e.event_id, e.stream_id, e.aggregate_id, e.aggregate_type, e.event_type,
               e.event_data, e.metadata, e.sequence_number, e.version, e.created_at
        from wh_event_store e
        where e.stream_id = $1
          and ($2::uuid is null or e.sequence_number > (
                select sequence_number from wh_event_store where event_id = $2
              ))
        order by e.version asc
        limit $3
        "#,
    )
    .bind(stream_id)
    .bind(after_event_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("fetch_events_for_stream_since failed")?;

    rows.into_iter().map(row_to_event).collect()
}

/// One row of `wh_perspective_checkpoint` (§3).
#[derive(Debug, Clone)]
pub struct PerspectiveCheckpointRow {
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub last_event_id: Option<Uuid>,
    pub status: i32,
    pub error: Option<String>,
    pub attempts: i32,
    pub lease_expiry: Option<DateTime<Utc>>,
}

/// Checkpoints for `perspective_name` whose stream has events past the
/// checkpoint's `last_event_id` (or has never been checkpointed), claimed
/// for this caller before being returned — mirroring the outbox/inbox claim
/// shape in `procedure.rs`'s `reclaim_orphans`, so two workers bound to the
/// same `perspective_name` cannot both replay the same stream. Discovery
/// (first query) and claim (second query's `ON CONFLICT ... DO UPDATE ...
/// WHERE`, the actual point of mutual exclusion) are separate statements
/// because a never-before-checkpointed stream has no existing row to lock
/// with `FOR UPDATE`; the guarded upsert only returns a row that was either
/// absent or unleased at the moment it ran, so a row another caller claimed
/// in between is silently excluded here rather than double-claimed.
/// `ingest_perspective_completion`/`ingest_perspective_failure` null the
/// lease back out once the worker reports an outcome.
pub async fn list_streams_with_pending_events(
    pool: &PgPool,
    perspective_name: &str,
    limit: i64,
    lease_seconds: i64,
) -> Result<Vec<PerspectiveCheckpointRow>> {
    let candidates = sqlx::query(
        r#"
        select distinct on (e.stream_id) e.stream_id
        from wh_event_store e
        left join wh_perspective_checkpoint c
               on c.stream_id = e.stream_id and c.perspective_name = $1
        where (c.lease_expiry is null or c.lease_expiry < now())
          and (
                c.stream_id is null
                or c.last_event_id is null
                or e.sequence_number > (
                     select sequence_number from wh_event_store where event_id = c.last_event_id
                   )
              )
        order by e.stream_id, e.sequence_number desc
        limit $2
        "#,
    )
    .bind(perspective_name)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_streams_with_pending_events: select candidates")?;

    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let stream_ids: Vec<Uuid> = candidates.iter().map(|r| r.get::<Uuid, _>("stream_id")).collect();

    let rows = sqlx::query(
        r#"
        insert into wh_perspective_checkpoint (stream_id, perspective_name, status, attempts, lease_expiry)
        select s, $1, 0, 0, now() + make_interval(secs => $3)
        from unnest($2::uuid[]) as t(s)
        on conflict (stream_id, perspective_name) do update
            set lease_expiry = now() + make_interval(secs => $3)
            where wh_perspective_checkpoint.lease_expiry is null
               or wh_perspective_checkpoint.lease_expiry < now()
        returning stream_id, perspective_name, last_event_id, status, error, attempts, lease_expiry
        "#,
    )
    .bind(perspective_name)
    .bind(&stream_ids)
    .bind(lease_seconds as f64)
    .fetch_all(pool)
    .await
    .context("list_streams_with_pending_events: claim checkpoints")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(PerspectiveCheckpointRow {
            stream_id: row.try_get("stream_id")?,
            perspective_name: row.try_get("perspective_name")?,
            last_event_id: row.try_get("last_event_id")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
            lease_expiry: row.try_get("lease_expiry")?,
        });
    }
    Ok(out)
}

/// One row of `wh_receptor_processing` (§3).
#[derive(Debug, Clone)]
pub struct ReceptorProcessingRow {
    pub event_id: Uuid,
    pub receptor_name: String,
    pub status: i32,
    pub error: Option<String>,
    pub attempts: i32,
    pub lease_expiry: Option<DateTime<Utc>>,
}

/// Unprocessed `(event_id, receptor_name)` rows for `receptor_name`, claimed
/// for this caller (`lease_expiry` pushed out under `FOR UPDATE SKIP
/// LOCKED`, mirroring `procedure.rs`'s `reclaim_orphans`) before being
/// returned joined with their event payload, so two workers bound to the
/// same `receptor_name` cannot both dispatch the same row, and the receptor
/// worker can act without a second round trip.
/// `ingest_receptor_completion`/`ingest_receptor_failure` null the lease
/// back out once the worker reports an outcome.
pub async fn list_pending_receptor_work(
    pool: &PgPool,
    receptor_name: &str,
    limit: i64,
    lease_seconds: i64,
) -> Result<Vec<(ReceptorProcessingRow, EventRow)>> {
    let rows = sqlx::query(
        r#"
        with claimed as (
            update wh_receptor_processing r
            set lease_expiry = now() + make_interval(secs => $3)
            from (
                select r2.event_id, r2.receptor_name
                from wh_receptor_processing r2
                join wh_event_store e2 on e2.event_id = r2.event_id
                where r2.receptor_name = $1
                  and (r2.status & 8) = 0  -- ReceptorProcessed bit unset
                  and (r2.lease_expiry is null or r2.lease_expiry < now())
                order by e2.sequence_number asc
                limit $2
                for update of r2 skip locked
            ) pick
            where r.event_id = pick.event_id and r.receptor_name = pick.receptor_name
            returning r.event_id, r.receptor_name, r.status, r.error, r.attempts, r.lease_expiry
        )
        select c.event_id, c.receptor_name, c.status, c.error, c.attempts, c.lease_expiry,
               e.stream_id, e.aggregate_id, e.aggregate_type, e.event_type, e.event_data,
               e.metadata, e.sequence_number, e.version, e.created_at
        from claimed c
        join wh_event_store e on e.event_id = c.event_id
        order by e.sequence_number asc
        "#,
    )
    .bind(receptor_name)
    .bind(limit)
    .bind(lease_seconds as f64)
    .fetch_all(pool)
    .await
    .context("list_pending_receptor_work failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let processing = ReceptorProcessingRow {
            event_id: row.try_get("event_id")?,
            receptor_name: row.try_get("receptor_name")?,
            status: row.try_get("status")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
            lease_expiry: row.try_get("lease_expiry")?,
        };
        let event = EventRow {
            event_id: processing.event_id,
            stream_id: row.try_get("stream_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            metadata: row.try_get("metadata")?,
            sequence_number: row.try_get("sequence_number")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
        };
        out.push((processing, event));
    }
    Ok(out)
}

/// Register (or update) a `MessageAssociation` (§3). Data-driven dispatch:
/// the static table built at startup from config is mirrored here so the
/// event-append phase of `process_work_batch` can auto-create checkpoint
/// rows the moment an event type is first seen.
pub async fn upsert_message_association(pool: &PgPool, assoc: &MessageAssociation) -> Result<()> {
    sqlx::query(
        r#"
        insert into wh_message_association (message_type, association_type, target_name, service_name)
        values ($1, $2, $3, $4)
        on conflict (message_type, association_type, target_name, service_name) do nothing
        "#,
    )
    .bind(&assoc.message_type)
    .bind(assoc.association_type.as_str())
    .bind(&assoc.target_name)
    .bind(&assoc.service_name)
    .execute(pool)
    .await
    .context("upsert_message_association failed")?;
    Ok(())
}

/// All associations of a given kind for `service_name`, used to build the
/// static dispatch table at worker startup.
pub async fn list_message_associations(
    pool: &PgPool,
    association_type: AssociationType,
    service_name: &str,
) -> Result<Vec<MessageAssociation>> {
    let rows = sqlx::query(
        r#"
        select message_type, association_type, target_name, service_name
        from wh_message_association
        where association_type = $1 and service_name = $2
        "#,
    )
    .bind(association_type.as_str())
    .bind(service_name)
    .fetch_all(pool)
    .await
    .context("list_message_associations failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let association_type = match row.try_get::<String, _>("association_type")?.as_str() {
            "perspective" => AssociationType::Perspective,
            _ => AssociationType::Receptor,
        };
        out.push(MessageAssociation {
            message_type: row.try_get("message_type")?,
            association_type,
            target_name: row.try_get("target_name")?,
            service_name: row.try_get("service_name")?,
        });
    }
    Ok(out)
}

/// One row of `wh_active_stream` (§3), used by the ordered stream processor
/// to discover which streams this instance currently owns.
#[derive(Debug, Clone)]
pub struct ActiveStreamRow {
    pub stream_id: Uuid,
    pub partition_number: i32,
    pub assigned_instance_id: Uuid,
    pub lease_expiry: DateTime<Utc>,
}

pub async fn list_active_streams_for_instance(pool: &PgPool, instance_id: Uuid) -> Result<Vec<ActiveStreamRow>> {
    let rows = sqlx::query(
        r#"
        select stream_id, partition_number, assigned_instance_id, lease_expiry
        from wh_active_stream
        where assigned_instance_id = $1
        order by stream_id
        "#,
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await
    .context("list_active_streams_for_instance failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ActiveStreamRow {
            stream_id: row.try_get("stream_id")?,
            partition_number: row.try_get("partition_number")?,
            assigned_instance_id: row.try_get("assigned_instance_id")?,
            lease_expiry: row.try_get("lease_expiry")?,
        });
    }
    Ok(out)
}
