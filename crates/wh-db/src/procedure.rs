//! `process_work_batch` — the single atomic coordination entry point (§4.2).
//!
//! Every phase below corresponds 1:1 to a numbered phase in the design: the
//! whole function runs inside one `sqlx::Transaction`, so either every
//! side effect commits or the caller sees no state change at all. There is
//! no PL/pgSQL stored routine here — the "single database transaction"
//! requirement is satisfied identically by running ordinary parameterized
//! SQL statements against one `Transaction<'_, Postgres>`, which is how
//! every other write in this crate already talks to Postgres. See
//! `DESIGN.md` for why that reading of §4.2 was chosen over hand-written
//! PL/pgSQL.
//!
//! Gated behind the `procedure` feature so that only `wh-coordinator` can
//! call it — every other crate linking `wh-db` sees a smaller, read-mostly
//! surface.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use wh_envelope::status::{terminal_bit, FAILED, PUBLISHED};
use wh_envelope::WorkDomain;

use crate::types::{
    is_debug_mode, ClaimedWorkRow, Completion, Failure, InstanceIdentity, LeaseRenewal,
    NewInboxMessage, NewOutboxMessage, PerspectiveCompletion, PerspectiveFailure, ProcedureConfig,
    ProcessWorkBatchInput, ReceptorCompletion, ReceptorFailure,
};

pub async fn process_work_batch(
    pool: &PgPool,
    input: ProcessWorkBatchInput,
) -> Result<Vec<ClaimedWorkRow>> {
    let mut tx = pool.begin().await.context("process_work_batch: begin")?;

    let caller = input.identity.instance_id;
    let cfg = input.config;

    // Phase 1: instance heartbeat.
    heartbeat(&mut tx, &input.identity).await?;

    // Phase 2: stale eviction.
    evict_stale_instances(&mut tx, cfg.stale_threshold_seconds).await?;

    // Phase 3: instance ranking.
    let live_ids = live_instance_ids(&mut tx).await?;
    let live_instance_count = live_ids.len();
    let rank = wh_partition::rank_of(caller, &live_ids)
        .context("process_work_batch: caller not found among live instances after heartbeat")?;

    // Phase 4 + 5: completion/failure ingest. Track touched streams for phase 6.
    let mut touched_streams: HashSet<Uuid> = HashSet::new();
    let mut excluded_ids: HashSet<Uuid> = HashSet::new();

    for c in &input.outbox_completions {
        excluded_ids.insert(c.message_id);
        if let Some(stream_id) = ingest_completion(&mut tx, WorkDomain::Outbox, c, cfg).await? {
            touched_streams.insert(stream_id);
        }
    }
    for c in &input.inbox_completions {
        excluded_ids.insert(c.message_id);
        if let Some(stream_id) = ingest_completion(&mut tx, WorkDomain::Inbox, c, cfg).await? {
            touched_streams.insert(stream_id);
        }
    }
    for f in &input.outbox_failures {
        excluded_ids.insert(f.message_id);
        if let Some(stream_id) = ingest_failure(&mut tx, WorkDomain::Outbox, f).await? {
            touched_streams.insert(stream_id);
        }
    }
    for f in &input.inbox_failures {
        excluded_ids.insert(f.message_id);
        if let Some(stream_id) = ingest_failure(&mut tx, WorkDomain::Inbox, f).await? {
            touched_streams.insert(stream_id);
        }
    }
    for c in &input.receptor_completions {
        ingest_receptor_completion(&mut tx, c).await?;
    }
    for f in &input.receptor_failures {
        ingest_receptor_failure(&mut tx, f).await?;
    }
    for c in &input.perspective_completions {
        ingest_perspective_completion(&mut tx, c).await?;
    }
    for f in &input.perspective_failures {
        ingest_perspective_failure(&mut tx, f).await?;
    }

    // Phase 6: stream cleanup.
    for stream_id in &touched_streams {
        cleanup_stream_if_drained(&mut tx, *stream_id).await?;
    }

    // Phase 7: lease renewal.
    for r in &input.lease_renewals {
        renew_lease(&mut tx, caller, r, cfg.lease_seconds).await?;
    }

    // Phase 8: new-message persistence.
    let mut newly_stored: HashSet<Uuid> = HashSet::new();
    let mut event_candidates: Vec<(Uuid, Uuid, Uuid, String, String, serde_json::Value, serde_json::Value)> =
        Vec::new();

    for m in &input.new_outbox_messages {
        if persist_new_outbox(&mut tx, &input.identity, m, cfg).await? {
            newly_stored.insert(m.message_id);
            if let Some(ev) = &m.event {
                event_candidates.push((
                    m.message_id,
                    m.stream_id,
                    ev.aggregate_id,
                    ev.aggregate_type.clone(),
                    ev.event_type.clone(),
                    m.envelope_data.clone(),
                    m.metadata.clone(),
                ));
            }
        }
    }
    for m in &input.new_inbox_messages {
        if persist_new_inbox(&mut tx, &input.identity, m, cfg).await? {
            newly_stored.insert(m.message_id);
            if let Some(ev) = &m.event {
                event_candidates.push((
                    m.message_id,
                    m.stream_id,
                    ev.aggregate_id,
                    ev.aggregate_type.clone(),
                    ev.event_type.clone(),
                    m.envelope_data.clone(),
                    m.metadata.clone(),
                ));
            }
        }
    }

    // Phase 9: event-store append, inside the same transaction. Each insert
    // recomputes max(version)+1 for its stream and sees every earlier
    // insert from this same batch (same transaction, same connection), so
    // same-stream events in one batch get contiguous versions without
    // needing a separate window-function pass.
    for (event_id, stream_id, aggregate_id, aggregate_type, event_type, event_data, metadata) in
        &event_candidates
    {
        append_event(
            &mut tx,
            *event_id,
            *stream_id,
            *aggregate_id,
            aggregate_type,
            event_type,
            event_data,
            metadata,
        )
        .await?;
    }

    // Phase 10: orphan reclamation.
    let orphaned_outbox = reclaim_orphans(
        &mut tx,
        WorkDomain::Outbox,
        caller,
        live_instance_count,
        rank,
        cfg.lease_seconds,
        &excluded_ids,
    )
    .await?;
    let orphaned_inbox = reclaim_orphans(
        &mut tx,
        WorkDomain::Inbox,
        caller,
        live_instance_count,
        rank,
        cfg.lease_seconds,
        &excluded_ids,
    )
    .await?;

    let mut orphaned: HashSet<Uuid> = HashSet::new();
    orphaned.extend(orphaned_outbox);
    orphaned.extend(orphaned_inbox);

    // Phase 11: result.
    let mut result = Vec::new();
    let outbox_ids: Vec<Uuid> = newly_stored
        .iter()
        .copied()
        .chain(orphaned.iter().copied())
        .collect();
    result.extend(fetch_claimed(&mut tx, WorkDomain::Outbox, caller, &outbox_ids, &newly_stored).await?);
    result.extend(fetch_claimed(&mut tx, WorkDomain::Inbox, caller, &outbox_ids, &newly_stored).await?);

    result.sort_by(|a, b| (a.stream_id, a.sequence_order).cmp(&(b.stream_id, b.sequence_order)));

    if let Some(max) = input.max_batch_size {
        result.truncate(max.max(0) as usize);
    }

    tx.commit().await.context("process_work_batch: commit")?;
    Ok(result)
}

async fn heartbeat(tx: &mut Transaction<'_, Postgres>, identity: &InstanceIdentity) -> Result<()> {
    sqlx::query(
        r#"
        insert into wh_service_instance (instance_id, service_name, host_name, process_id, metadata, last_heartbeat)
        values ($1, $2, $3, $4, $5, now())
        on conflict (instance_id) do update
            set last_heartbeat = now(),
                service_name   = excluded.service_name,
                host_name      = excluded.host_name,
                process_id     = excluded.process_id,
                metadata       = excluded.metadata
        "#,
    )
    .bind(identity.instance_id)
    .bind(&identity.service_name)
    .bind(&identity.host_name)
    .bind(identity.process_id)
    .bind(&identity.metadata)
    .execute(&mut **tx)
    .await
    .context("heartbeat failed")?;
    Ok(())
}

async fn evict_stale_instances(tx: &mut Transaction<'_, Postgres>, stale_threshold_seconds: i64) -> Result<()> {
    let stale_ids: Vec<Uuid> = sqlx::query(
        r#"
        delete from wh_service_instance
        where last_heartbeat < now() - make_interval(secs => $1)
        returning instance_id
        "#,
    )
    .bind(stale_threshold_seconds as f64)
    .fetch_all(&mut **tx)
    .await
    .context("evict_stale_instances: delete")?
    .into_iter()
    .map(|row| row.get::<Uuid, _>("instance_id"))
    .collect();

    if stale_ids.is_empty() {
        return Ok(());
    }

    // wh_active_stream rows cascade-delete via the FK on assigned_instance_id.
    sqlx::query("update wh_outbox set instance_id = null, lease_expiry = null where instance_id = any($1)")
        .bind(&stale_ids)
        .execute(&mut **tx)
        .await
        .context("evict_stale_instances: release outbox claims")?;

    sqlx::query("update wh_inbox set instance_id = null, lease_expiry = null where instance_id = any($1)")
        .bind(&stale_ids)
        .execute(&mut **tx)
        .await
        .context("evict_stale_instances: release inbox claims")?;

    Ok(())
}

async fn live_instance_ids(tx: &mut Transaction<'_, Postgres>) -> Result<Vec<Uuid>> {
    let rows = sqlx::query("select instance_id from wh_service_instance order by instance_id")
        .fetch_all(&mut **tx)
        .await
        .context("live_instance_ids failed")?;
    Ok(rows.into_iter().map(|r| r.get::<Uuid, _>("instance_id")).collect())
}

fn table_for(domain: WorkDomain) -> &'static str {
    match domain {
        WorkDomain::Outbox => "wh_outbox",
        WorkDomain::Inbox => "wh_inbox",
    }
}

async fn ingest_completion(
    tx: &mut Transaction<'_, Postgres>,
    domain: WorkDomain,
    c: &Completion,
    cfg: ProcedureConfig,
) -> Result<Option<Uuid>> {
    let table = table_for(domain);
    let sql = format!(
        r#"
        update {table}
        set status = status | $2,
            instance_id = null,
            lease_expiry = null,
            processed_at = now(),
            published_at = case when ($2 & {published}) <> 0 then now() else published_at end
        where message_id = $1
        returning stream_id, status
        "#,
        table = table,
        published = PUBLISHED,
    );
    let row = sqlx::query(&sql)
        .bind(c.message_id)
        .bind(c.status_flags)
        .fetch_optional(&mut **tx)
        .await
        .context("ingest_completion: update")?;

    let Some(row) = row else { return Ok(None) };
    let stream_id: Uuid = row.get("stream_id");
    let status: i32 = row.get("status");

    if !is_debug_mode(cfg.flags) && status & terminal_bit(domain) != 0 {
        let del_sql = format!("delete from {table} where message_id = $1", table = table);
        sqlx::query(&del_sql)
            .bind(c.message_id)
            .execute(&mut **tx)
            .await
            .context("ingest_completion: delete terminal row")?;
    }

    Ok(Some(stream_id))
}

async fn ingest_failure(
    tx: &mut Transaction<'_, Postgres>,
    domain: WorkDomain,
    f: &Failure,
) -> Result<Option<Uuid>> {
    let table = table_for(domain);
    let sql = format!(
        r#"
        update {table}
        set status = status | $2 | {failed},
            attempts = attempts + 1,
            scheduled_for = now() + make_interval(secs => 30 * power(2, attempts + 1)::int),
            instance_id = null,
            lease_expiry = null,
            error = $3
        where message_id = $1
        returning stream_id
        "#,
        table = table,
        failed = FAILED,
    );
    let row = sqlx::query(&sql)
        .bind(f.message_id)
        .bind(f.partial_status)
        .bind(&f.error)
        .fetch_optional(&mut **tx)
        .await
        .context("ingest_failure: update")?;
    Ok(row.map(|r| r.get::<Uuid, _>("stream_id")))
}

async fn ingest_receptor_completion(tx: &mut Transaction<'_, Postgres>, c: &ReceptorCompletion) -> Result<()> {
    sqlx::query(
        r#"
        update wh_receptor_processing
        set status = status | $3, error = null, lease_expiry = null
        where event_id = $1 and receptor_name = $2
        "#,
    )
    .bind(c.event_id)
    .bind(&c.receptor_name)
    .bind(c.status_flags)
    .execute(&mut **tx)
    .await
    .context("ingest_receptor_completion failed")?;
    Ok(())
}

async fn ingest_receptor_failure(tx: &mut Transaction<'_, Postgres>, f: &ReceptorFailure) -> Result<()> {
    sqlx::query(&format!(
        r#"
        update wh_receptor_processing
        set status = status | $3 | {failed}, attempts = attempts + 1, lease_expiry = null, error = $4
        where event_id = $1 and receptor_name = $2
        "#,
        failed = FAILED,
    ))
    .bind(f.event_id)
    .bind(&f.receptor_name)
    .bind(f.partial_status)
    .bind(&f.error)
    .execute(&mut **tx)
    .await
    .context("ingest_receptor_failure failed")?;
    Ok(())
}

async fn ingest_perspective_completion(tx: &mut Transaction<'_, Postgres>, c: &PerspectiveCompletion) -> Result<()> {
    sqlx::query(
        r#"
        update wh_perspective_checkpoint
        set status = status | $4, last_event_id = $3, error = null, lease_expiry = null
        where stream_id = $1 and perspective_name = $2
        "#,
    )
    .bind(c.stream_id)
    .bind(&c.perspective_name)
    .bind(c.last_event_id)
    .bind(c.status_flags)
    .execute(&mut **tx)
    .await
    .context("ingest_perspective_completion failed")?;
    Ok(())
}

async fn ingest_perspective_failure(tx: &mut Transaction<'_, Postgres>, f: &PerspectiveFailure) -> Result<()> {
    sqlx::query(&format!(
        r#"
        update wh_perspective_checkpoint
        set status = status | $3 | {failed}, attempts = attempts + 1, lease_expiry = null, error = $4
        where stream_id = $1 and perspective_name = $2
        "#,
        failed = FAILED,
    ))
    .bind(f.stream_id)
    .bind(&f.perspective_name)
    .bind(f.partial_status)
    .bind(&f.error)
    .execute(&mut **tx)
    .await
    .context("ingest_perspective_failure failed")?;
    Ok(())
}

async fn cleanup_stream_if_drained(tx: &mut Transaction<'_, Postgres>, stream_id: Uuid) -> Result<()> {
    let row = sqlx::query(
        r#"
        select
            exists (select 1 from wh_outbox where stream_id = $1 and (status & $2) = 0) as has_pending_outbox,
            exists (select 1 from wh_inbox  where stream_id = $1 and (status & $3) = 0) as has_pending_inbox
        "#,
    )
    .bind(stream_id)
    .bind(PUBLISHED)
    .bind(wh_envelope::status::EVENT_STORED)
    .fetch_one(&mut **tx)
    .await
    .context("cleanup_stream_if_drained: check")?;

    let has_pending_outbox: bool = row.get("has_pending_outbox");
    let has_pending_inbox: bool = row.get("has_pending_inbox");

    if !has_pending_outbox && !has_pending_inbox {
        sqlx::query("delete from wh_active_stream where stream_id = $1")
            .bind(stream_id)
            .execute(&mut **tx)
            .await
            .context("cleanup_stream_if_drained: delete")?;
    }
    Ok(())
}

async fn renew_lease(
    tx: &mut Transaction<'_, Postgres>,
    caller: Uuid,
    r: &LeaseRenewal,
    lease_seconds: i64,
) -> Result<()> {
    let table = table_for(r.domain);
    let sql = format!(
        r#"
        update {table}
        set lease_expiry = now() + make_interval(secs => $3)
        where message_id = $1 and instance_id = $2
        returning stream_id
        "#,
        table = table
    );
    let row = sqlx::query(&sql)
        .bind(r.message_id)
        .bind(caller)
        .bind(lease_seconds as f64)
        .fetch_optional(&mut **tx)
        .await
        .context("renew_lease: update row")?;

    if let Some(row) = row {
        let stream_id: Uuid = row.get("stream_id");
        sqlx::query(
            r#"
            update wh_active_stream
            set lease_expiry = now() + make_interval(secs => $3), updated_at = now()
            where stream_id = $1 and assigned_instance_id = $2
            "#,
        )
        .bind(stream_id)
        .bind(caller)
        .bind(lease_seconds as f64)
        .execute(&mut **tx)
        .await
        .context("renew_lease: renew stream lease")?;
    }

    Ok(())
}

async fn persist_new_outbox(
    tx: &mut Transaction<'_, Postgres>,
    identity: &InstanceIdentity,
    m: &NewOutboxMessage,
    cfg: ProcedureConfig,
) -> Result<bool> {
    let partition_number = wh_partition::partition(m.stream_id, cfg.partition_count as u32) as i32;

    upsert_active_stream(tx, m.stream_id, partition_number, identity.instance_id, cfg.lease_seconds).await?;

    let inserted = sqlx::query(
        r#"
        insert into wh_outbox (
            message_id, destination, envelope_type, envelope_data, metadata, stream_id,
            partition_number, is_event, status, attempts, scheduled_for, instance_id, lease_expiry, created_at
        ) values (
            $1, $2, $3, $4, $5, $6, $7, $8, 1, 0, now(), $9, now() + make_interval(secs => $10), now()
        )
        on conflict (message_id) do nothing
        returning message_id
        "#,
    )
    .bind(m.message_id)
    .bind(&m.destination)
    .bind(&m.envelope_type)
    .bind(&m.envelope_data)
    .bind(&m.metadata)
    .bind(m.stream_id)
    .bind(partition_number)
    .bind(m.event.is_some())
    .bind(identity.instance_id)
    .bind(cfg.lease_seconds as f64)
    .fetch_optional(&mut **tx)
    .await
    .context("persist_new_outbox failed")?;

    Ok(inserted.is_some())
}

async fn persist_new_inbox(
    tx: &mut Transaction<'_, Postgres>,
    identity: &InstanceIdentity,
    m: &NewInboxMessage,
    cfg: ProcedureConfig,
) -> Result<bool> {
    let deduped = sqlx::query(
        "insert into wh_message_dedupe (message_id) values ($1) on conflict (message_id) do nothing returning message_id",
    )
    .bind(m.message_id)
    .fetch_optional(&mut **tx)
    .await
    .context("persist_new_inbox: dedupe insert")?;

    if deduped.is_none() {
        // I4: already seen this message_id; silently drop from the inbox set.
        return Ok(false);
    }

    let partition_number = wh_partition::partition(m.stream_id, cfg.partition_count as u32) as i32;

    upsert_active_stream(tx, m.stream_id, partition_number, identity.instance_id, cfg.lease_seconds).await?;

    let inserted = sqlx::query(
        r#"
        insert into wh_inbox (
            message_id, handler_name, envelope_type, envelope_data, metadata, stream_id,
            partition_number, is_event, status, attempts, scheduled_for, instance_id, lease_expiry, received_at
        ) values (
            $1, $2, $3, $4, $5, $6, $7, $8, 1, 0, now(), $9, now() + make_interval(secs => $10), now()
        )
        on conflict (message_id) do nothing
        returning message_id
        "#,
    )
    .bind(m.message_id)
    .bind(&m.handler_name)
    .bind(&m.envelope_type)
    .bind(&m.envelope_data)
    .bind(&m.metadata)
    .bind(m.stream_id)
    .bind(partition_number)
    .bind(m.event.is_some())
    .bind(identity.instance_id)
    .bind(cfg.lease_seconds as f64)
    .fetch_optional(&mut **tx)
    .await
    .context("persist_new_inbox: row insert")?;

    Ok(inserted.is_some())
}

async fn upsert_active_stream(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: Uuid,
    partition_number: i32,
    owner: Uuid,
    lease_seconds: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into wh_active_stream (stream_id, partition_number, assigned_instance_id, lease_expiry, created_at, updated_at)
        values ($1, $2, $3, now() + make_interval(secs => $4), now(), now())
        on conflict (stream_id) do update
            set assigned_instance_id = excluded.assigned_instance_id,
                partition_number      = excluded.partition_number,
                lease_expiry          = excluded.lease_expiry,
                updated_at            = now()
        "#,
    )
    .bind(stream_id)
    .bind(partition_number)
    .bind(owner)
    .bind(lease_seconds as f64)
    .execute(&mut **tx)
    .await
    .context("upsert_active_stream failed")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn append_event(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    stream_id: Uuid,
    aggregate_id: Uuid,
    aggregate_type: &str,
    event_type: &str,
    event_data: &serde_json::Value,
    metadata: &serde_json::Value,
) -> Result<()> {
    // Recomputing max(version)+1 inside the same transaction sees every
    // earlier insert from this same batch (same connection, uncommitted
    // writes are still visible to the transaction that made them), so a
    // run of same-stream events in one call naturally gets contiguous
    // versions without a separate array/window-function pass (I1).
    let inserted = sqlx::query(
        r#"
        insert into wh_event_store (event_id, stream_id, aggregate_id, aggregate_type, event_type, event_data, metadata, version)
        select $1, $2, $3, $4, $5, $6, $7, coalesce((select max(version) from wh_event_store where stream_id = $2), 0) + 1
        on conflict do nothing
        returning event_id
        "#,
    )
    .bind(event_id)
    .bind(stream_id)
    .bind(aggregate_id)
    .bind(aggregate_type)
    .bind(event_type)
    .bind(event_data)
    .bind(metadata)
    .fetch_optional(&mut **tx)
    .await
    .context("append_event failed")?;

    if inserted.is_some() {
        auto_create_checkpoints(tx, event_id, stream_id, event_type).await?;
    }

    Ok(())
}

/// MessageAssociation-driven auto-creation (§3): the first time an event
/// type is seen, create the perspective checkpoint / receptor processing
/// rows its associations name, so the perspective/receptor workers have
/// something to claim without any out-of-band provisioning step.
async fn auto_create_checkpoints(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    stream_id: Uuid,
    message_type: &str,
) -> Result<()> {
    let associations = sqlx::query(
        "select association_type, target_name from wh_message_association where message_type = $1",
    )
    .bind(message_type)
    .fetch_all(&mut **tx)
    .await
    .context("auto_create_checkpoints: load associations")?;

    for row in associations {
        let association_type: String = row.get("association_type");
        let target_name: String = row.get("target_name");
        match association_type.as_str() {
            "perspective" => {
                sqlx::query(
                    r#"
                    insert into wh_perspective_checkpoint (stream_id, perspective_name)
                    values ($1, $2)
                    on conflict (stream_id, perspective_name) do nothing
                    "#,
                )
                .bind(stream_id)
                .bind(&target_name)
                .execute(&mut **tx)
                .await
                .context("auto_create_checkpoints: perspective checkpoint")?;
            }
            "receptor" => {
                sqlx::query(
                    r#"
                    insert into wh_receptor_processing (event_id, receptor_name)
                    values ($1, $2)
                    on conflict (event_id, receptor_name) do nothing
                    "#,
                )
                .bind(event_id)
                .bind(&target_name)
                .execute(&mut **tx)
                .await
                .context("auto_create_checkpoints: receptor processing")?;
            }
            other => {
                tracing::warn!(association_type = other, "unknown message association type, ignoring");
            }
        }
    }

    Ok(())
}

async fn reclaim_orphans(
    tx: &mut Transaction<'_, Postgres>,
    domain: WorkDomain,
    caller: Uuid,
    live_instance_count: usize,
    rank: usize,
    lease_seconds: i64,
    excluded_ids: &HashSet<Uuid>,
) -> Result<Vec<Uuid>> {
    if live_instance_count == 0 {
        return Ok(Vec::new());
    }

    let table = table_for(domain);
    let terminal = terminal_bit(domain);
    let excluded: Vec<Uuid> = excluded_ids.iter().copied().collect();

    let select_sql = format!(
        r#"
        select o.message_id, o.stream_id, o.partition_number
        from {table} o
        where (o.instance_id is null or o.lease_expiry < now())
          and (o.status & $1) = 0
          and o.partition_number % $2 = $3
          and o.scheduled_for <= now()
          and not (o.message_id = any($4))
          and not exists (
                select 1 from wh_active_stream a
                where a.stream_id = o.stream_id
                  and a.lease_expiry > now()
                  and a.assigned_instance_id <> $5
              )
          and not exists (
                select 1 from {table} earlier
                where earlier.stream_id = o.stream_id
                  and earlier.{order_col} < o.{order_col}
                  and (earlier.status & $1) = 0
                  and earlier.instance_id is not null
                  and earlier.lease_expiry > now()
                  and earlier.instance_id <> $5
              )
        order by o.stream_id, o.{order_col}
        for update of o skip locked
        "#,
        table = table,
        order_col = order_col(domain),
    );

    let candidates = sqlx::query(&select_sql)
        .bind(terminal)
        .bind(live_instance_count as i32)
        .bind(rank as i32)
        .bind(&excluded)
        .bind(caller)
        .fetch_all(&mut **tx)
        .await
        .context("reclaim_orphans: select candidates")?;

    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let message_ids: Vec<Uuid> = candidates.iter().map(|r| r.get::<Uuid, _>("message_id")).collect();

    let update_sql = format!(
        r#"
        update {table}
        set instance_id = $1, lease_expiry = now() + make_interval(secs => $2)
        where message_id = any($3)
        "#,
        table = table
    );
    sqlx::query(&update_sql)
        .bind(caller)
        .bind(lease_seconds as f64)
        .bind(&message_ids)
        .execute(&mut **tx)
        .await
        .context("reclaim_orphans: lease rows")?;

    let mut owners: HashMap<Uuid, i32> = HashMap::new();
    for row in &candidates {
        owners.entry(row.get::<Uuid, _>("stream_id")).or_insert_with(|| row.get::<i32, _>("partition_number"));
    }
    let stream_ids: Vec<Uuid> = owners.keys().copied().collect();
    let partitions: Vec<i32> = stream_ids.iter().map(|s| owners[s]).collect();

    sqlx::query(
        r#"
        insert into wh_active_stream (stream_id, partition_number, assigned_instance_id, lease_expiry, created_at, updated_at)
        select s, p, $3, now() + make_interval(secs => $4), now(), now()
        from unnest($1::uuid[], $2::int4[]) as t(s, p)
        on conflict (stream_id) do update
            set assigned_instance_id = excluded.assigned_instance_id,
                partition_number      = excluded.partition_number,
                lease_expiry          = excluded.lease_expiry,
                updated_at            = now()
        "#,
    )
    .bind(&stream_ids)
    .bind(&partitions)
    .bind(caller)
    .bind(lease_seconds as f64)
    .execute(&mut **tx)
    .await
    .context("reclaim_orphans: upsert active streams")?;

    Ok(message_ids)
}

fn order_col(domain: WorkDomain) -> &'static str {
    match domain {
        WorkDomain::Outbox => "created_at",
        WorkDomain::Inbox => "received_at",
    }
}

async fn fetch_claimed(
    tx: &mut Transaction<'_, Postgres>,
    domain: WorkDomain,
    caller: Uuid,
    _all_ids_hint: &[Uuid],
    newly_stored: &HashSet<Uuid>,
) -> Result<Vec<ClaimedWorkRow>> {
    let table = table_for(domain);
    let (dest_col, order_col) = match domain {
        WorkDomain::Outbox => ("destination", "created_at"),
        WorkDomain::Inbox => ("handler_name", "received_at"),
    };
    let terminal = terminal_bit(domain);

    let sql = format!(
        r#"
        select message_id, {dest_col} as dest, envelope_type, envelope_data, metadata,
               stream_id, partition_number, attempts, status, {order_col} as seq
        from {table}
        where instance_id = $1 and (status & $2) = 0
        order by stream_id, {order_col}
        "#,
        table = table,
        dest_col = dest_col,
        order_col = order_col,
    );

    let rows = sqlx::query(&sql)
        .bind(caller)
        .bind(terminal)
        .fetch_all(&mut **tx)
        .await
        .context("fetch_claimed failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let message_id: Uuid = row.get("message_id");
        out.push(ClaimedWorkRow {
            source: domain,
            message_id,
            destination_or_handler: row.get("dest"),
            envelope_type: row.get("envelope_type"),
            envelope_data: row.get("envelope_data"),
            metadata: row.get("metadata"),
            stream_id: row.get("stream_id"),
            partition_number: row.get("partition_number"),
            attempts: row.get("attempts"),
            status: row.get("status"),
            newly_stored: newly_stored.contains(&message_id),
            sequence_order: row.get("seq"),
        });
    }
    Ok(out)
}
