//! The work-coordinator strategy layer (§4.3): three ways of batching a
//! caller's queued outbox/inbox/receptor/perspective operations before
//! invoking [`wh_db::process_work_batch`].
//!
//! All three variants implement [`WorkCoordinatorStrategy`] and share the
//! same flush mechanics (`flush_once`); they differ only in *when* a flush
//! happens. None of them are internally thread-safe across owners — each
//! worker owns exactly one strategy instance (§5 scheduling model) — but
//! each uses a `std::sync::Mutex` around its pending batch so that the
//! trait methods can take `&self` rather than `&mut self`, which is what
//! lets a single worker share the strategy between its own async tasks
//! (e.g. a queueing producer and a timer-driven flusher) without a second
//! layer of locking above this crate.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

use wh_db::{
    process_work_batch, ClaimedWorkRow, Completion, Failure, InstanceIdentity, LeaseRenewal,
    NewInboxMessage, NewOutboxMessage, PerspectiveCompletion, PerspectiveFailure, ProcedureConfig,
    ProcessWorkBatchInput, ReceptorCompletion, ReceptorFailure,
};
use wh_envelope::WorkDomain;

/// Everything queued since the last flush. Mirrors `ProcessWorkBatchInput`
/// minus identity/config, which belong to the strategy, not the batch.
#[derive(Debug, Clone, Default)]
struct PendingBatch {
    outbox_completions: Vec<Completion>,
    inbox_completions: Vec<Completion>,
    outbox_failures: Vec<Failure>,
    inbox_failures: Vec<Failure>,
    receptor_completions: Vec<ReceptorCompletion>,
    receptor_failures: Vec<ReceptorFailure>,
    perspective_completions: Vec<PerspectiveCompletion>,
    perspective_failures: Vec<PerspectiveFailure>,
    new_outbox_messages: Vec<NewOutboxMessage>,
    new_inbox_messages: Vec<NewInboxMessage>,
    lease_renewals: Vec<LeaseRenewal>,
}

impl PendingBatch {
    fn into_input(self, identity: InstanceIdentity, config: ProcedureConfig, max_batch_size: Option<i64>) -> ProcessWorkBatchInput {
        ProcessWorkBatchInput {
            identity,
            config,
            outbox_completions: self.outbox_completions,
            inbox_completions: self.inbox_completions,
            outbox_failures: self.outbox_failures,
            inbox_failures: self.inbox_failures,
            receptor_completions: self.receptor_completions,
            receptor_failures: self.receptor_failures,
            perspective_completions: self.perspective_completions,
            perspective_failures: self.perspective_failures,
            new_outbox_messages: self.new_outbox_messages,
            new_inbox_messages: self.new_inbox_messages,
            lease_renewals: self.lease_renewals,
            max_batch_size,
        }
    }
}

async fn flush_once(
    pool: &PgPool,
    identity: &InstanceIdentity,
    config: ProcedureConfig,
    max_batch_size: Option<i64>,
    pending: PendingBatch,
) -> Result<Vec<ClaimedWorkRow>> {
    let input = pending.into_input(identity.clone(), config, max_batch_size);
    process_work_batch(pool, input).await
}

/// §4.3: the one interface all three strategies share. Every `queue_*`
/// method returns whatever the flush it triggered (if any) claimed — empty
/// for strategies that only buffer.
#[async_trait]
pub trait WorkCoordinatorStrategy: Send + Sync {
    async fn queue_outbox_message(&self, msg: NewOutboxMessage) -> Result<Vec<ClaimedWorkRow>>;
    async fn queue_inbox_message(&self, msg: NewInboxMessage) -> Result<Vec<ClaimedWorkRow>>;

    async fn queue_outbox_completion(&self, message_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>>;
    async fn queue_inbox_completion(&self, message_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>>;
    async fn queue_outbox_failure(&self, message_id: Uuid, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>>;
    async fn queue_inbox_failure(&self, message_id: Uuid, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>>;

    async fn queue_receptor_completion(&self, event_id: Uuid, receptor_name: String, status_flags: i32) -> Result<Vec<ClaimedWorkRow>>;
    async fn queue_receptor_failure(&self, event_id: Uuid, receptor_name: String, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>>;
    async fn queue_perspective_completion(&self, stream_id: Uuid, perspective_name: String, last_event_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>>;
    async fn queue_perspective_failure(&self, stream_id: Uuid, perspective_name: String, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>>;

    async fn queue_lease_renewal(&self, domain: WorkDomain, message_id: Uuid) -> Result<Vec<ClaimedWorkRow>>;

    /// Flush whatever is pending (or just a heartbeat, if nothing is).
    async fn flush(&self) -> Result<Vec<ClaimedWorkRow>>;

    /// Called when the owner is done with this strategy. Default: flush.
    /// §9 design note: no ambient container or `Drop`-based auto-flush —
    /// the owner is responsible for calling this explicitly at scope exit.
    async fn dispose(&self) -> Result<Vec<ClaimedWorkRow>> {
        self.flush().await
    }
}

/// Every queue call triggers an immediate flush: lowest latency, highest
/// DB round-trip cost (§4.3).
pub struct ImmediateStrategy {
    pool: PgPool,
    identity: InstanceIdentity,
    config: ProcedureConfig,
}

impl ImmediateStrategy {
    pub fn new(pool: PgPool, identity: InstanceIdentity, config: ProcedureConfig) -> Self {
        Self { pool, identity, config }
    }

    async fn flush_with(&self, mut pending: PendingBatch, f: impl FnOnce(&mut PendingBatch)) -> Result<Vec<ClaimedWorkRow>> {
        f(&mut pending);
        flush_once(&self.pool, &self.identity, self.config, None, pending).await
    }
}

#[async_trait]
impl WorkCoordinatorStrategy for ImmediateStrategy {
    async fn queue_outbox_message(&self, msg: NewOutboxMessage) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| p.new_outbox_messages.push(msg)).await
    }

    async fn queue_inbox_message(&self, msg: NewInboxMessage) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| p.new_inbox_messages.push(msg)).await
    }

    async fn queue_outbox_completion(&self, message_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| {
            p.outbox_completions.push(Completion { message_id, status_flags })
        })
        .await
    }

    async fn queue_inbox_completion(&self, message_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| {
            p.inbox_completions.push(Completion { message_id, status_flags })
        })
        .await
    }

    async fn queue_outbox_failure(&self, message_id: Uuid, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| {
            p.outbox_failures.push(Failure { message_id, partial_status, error })
        })
        .await
    }

    async fn queue_inbox_failure(&self, message_id: Uuid, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| {
            p.inbox_failures.push(Failure { message_id, partial_status, error })
        })
        .await
    }

    async fn queue_receptor_completion(&self, event_id: Uuid, receptor_name: String, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| {
            p.receptor_completions.push(ReceptorCompletion { event_id, receptor_name, status_flags })
        })
        .await
    }

    async fn queue_receptor_failure(&self, event_id: Uuid, receptor_name: String, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| {
            p.receptor_failures.push(ReceptorFailure { event_id, receptor_name, partial_status, error })
        })
        .await
    }

    async fn queue_perspective_completion(&self, stream_id: Uuid, perspective_name: String, last_event_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| {
            p.perspective_completions.push(PerspectiveCompletion { stream_id, perspective_name, last_event_id, status_flags })
        })
        .await
    }

    async fn queue_perspective_failure(&self, stream_id: Uuid, perspective_name: String, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| {
            p.perspective_failures.push(PerspectiveFailure { stream_id, perspective_name, partial_status, error })
        })
        .await
    }

    async fn queue_lease_renewal(&self, domain: WorkDomain, message_id: Uuid) -> Result<Vec<ClaimedWorkRow>> {
        self.flush_with(PendingBatch::default(), |p| p.lease_renewals.push(LeaseRenewal { domain, message_id })).await
    }

    async fn flush(&self) -> Result<Vec<ClaimedWorkRow>> {
        flush_once(&self.pool, &self.identity, self.config, None, PendingBatch::default()).await
    }
}

/// Accumulates within a unit of work; flushes only on explicit `flush`/
/// `dispose`. Intended for request-scoped API handlers: the handler owns
/// one instance for the lifetime of the request (§4.3, §9).
pub struct ScopedStrategy {
    pool: PgPool,
    identity: InstanceIdentity,
    config: ProcedureConfig,
    pending: Mutex<PendingBatch>,
}

impl ScopedStrategy {
    pub fn new(pool: PgPool, identity: InstanceIdentity, config: ProcedureConfig) -> Self {
        Self { pool, identity, config, pending: Mutex::new(PendingBatch::default()) }
    }

    fn buffer(&self, f: impl FnOnce(&mut PendingBatch)) {
        let mut pending = self.pending.lock().expect("pending batch mutex poisoned");
        f(&mut pending);
    }

    fn take(&self) -> PendingBatch {
        std::mem::take(&mut *self.pending.lock().expect("pending batch mutex poisoned"))
    }
}

#[async_trait]
impl WorkCoordinatorStrategy for ScopedStrategy {
    async fn queue_outbox_message(&self, msg: NewOutboxMessage) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.new_outbox_messages.push(msg));
        Ok(Vec::new())
    }

    async fn queue_inbox_message(&self, msg: NewInboxMessage) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.new_inbox_messages.push(msg));
        Ok(Vec::new())
    }

    async fn queue_outbox_completion(&self, message_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.outbox_completions.push(Completion { message_id, status_flags }));
        Ok(Vec::new())
    }

    async fn queue_inbox_completion(&self, message_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.inbox_completions.push(Completion { message_id, status_flags }));
        Ok(Vec::new())
    }

    async fn queue_outbox_failure(&self, message_id: Uuid, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.outbox_failures.push(Failure { message_id, partial_status, error }));
        Ok(Vec::new())
    }

    async fn queue_inbox_failure(&self, message_id: Uuid, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.inbox_failures.push(Failure { message_id, partial_status, error }));
        Ok(Vec::new())
    }

    async fn queue_receptor_completion(&self, event_id: Uuid, receptor_name: String, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.receptor_completions.push(ReceptorCompletion { event_id, receptor_name, status_flags }));
        Ok(Vec::new())
    }

    async fn queue_receptor_failure(&self, event_id: Uuid, receptor_name: String, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.receptor_failures.push(ReceptorFailure { event_id, receptor_name, partial_status, error }));
        Ok(Vec::new())
    }

    async fn queue_perspective_completion(&self, stream_id: Uuid, perspective_name: String, last_event_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.perspective_completions.push(PerspectiveCompletion { stream_id, perspective_name, last_event_id, status_flags }));
        Ok(Vec::new())
    }

    async fn queue_perspective_failure(&self, stream_id: Uuid, perspective_name: String, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.perspective_failures.push(PerspectiveFailure { stream_id, perspective_name, partial_status, error }));
        Ok(Vec::new())
    }

    async fn queue_lease_renewal(&self, domain: WorkDomain, message_id: Uuid) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.lease_renewals.push(LeaseRenewal { domain, message_id }));
        Ok(Vec::new())
    }

    async fn flush(&self) -> Result<Vec<ClaimedWorkRow>> {
        let pending = self.take();
        flush_once(&self.pool, &self.identity, self.config, None, pending).await
    }
}

/// Timer-triggered flush: highest throughput (§4.3). Queue calls only
/// buffer; a background task (started with [`IntervalStrategy::spawn`])
/// flushes on a fixed period, and `flush`/`dispose` flush on demand too.
pub struct IntervalStrategy {
    pool: PgPool,
    identity: InstanceIdentity,
    config: ProcedureConfig,
    pending: Mutex<PendingBatch>,
    max_batch_size: Option<i64>,
}

impl IntervalStrategy {
    pub fn new(pool: PgPool, identity: InstanceIdentity, config: ProcedureConfig, max_batch_size: Option<i64>) -> Self {
        Self { pool, identity, config, pending: Mutex::new(PendingBatch::default()), max_batch_size }
    }

    fn buffer(&self, f: impl FnOnce(&mut PendingBatch)) {
        let mut pending = self.pending.lock().expect("pending batch mutex poisoned");
        f(&mut pending);
    }

    fn take(&self) -> PendingBatch {
        std::mem::take(&mut *self.pending.lock().expect("pending batch mutex poisoned"))
    }

    /// Runs the timer loop until `shutdown` is signalled, then flushes once
    /// more before returning (dispose-on-stop). `on_batch` is invoked with
    /// every non-empty claimed batch, including the final one.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut on_batch: impl FnMut(Vec<ClaimedWorkRow>) + Send,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let batch = self.flush().await?;
                    if !batch.is_empty() {
                        on_batch(batch);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let batch = self.flush().await?;
                        if !batch.is_empty() {
                            on_batch(batch);
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl WorkCoordinatorStrategy for IntervalStrategy {
    async fn queue_outbox_message(&self, msg: NewOutboxMessage) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.new_outbox_messages.push(msg));
        Ok(Vec::new())
    }

    async fn queue_inbox_message(&self, msg: NewInboxMessage) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.new_inbox_messages.push(msg));
        Ok(Vec::new())
    }

    async fn queue_outbox_completion(&self, message_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.outbox_completions.push(Completion { message_id, status_flags }));
        Ok(Vec::new())
    }

    async fn queue_inbox_completion(&self, message_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.inbox_completions.push(Completion { message_id, status_flags }));
        Ok(Vec::new())
    }

    async fn queue_outbox_failure(&self, message_id: Uuid, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.outbox_failures.push(Failure { message_id, partial_status, error }));
        Ok(Vec::new())
    }

    async fn queue_inbox_failure(&self, message_id: Uuid, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.inbox_failures.push(Failure { message_id, partial_status, error }));
        Ok(Vec::new())
    }

    async fn queue_receptor_completion(&self, event_id: Uuid, receptor_name: String, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.receptor_completions.push(ReceptorCompletion { event_id, receptor_name, status_flags }));
        Ok(Vec::new())
    }

    async fn queue_receptor_failure(&self, event_id: Uuid, receptor_name: String, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.receptor_failures.push(ReceptorFailure { event_id, receptor_name, partial_status, error }));
        Ok(Vec::new())
    }

    async fn queue_perspective_completion(&self, stream_id: Uuid, perspective_name: String, last_event_id: Uuid, status_flags: i32) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.perspective_completions.push(PerspectiveCompletion { stream_id, perspective_name, last_event_id, status_flags }));
        Ok(Vec::new())
    }

    async fn queue_perspective_failure(&self, stream_id: Uuid, perspective_name: String, partial_status: i32, error: String) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.perspective_failures.push(PerspectiveFailure { stream_id, perspective_name, partial_status, error }));
        Ok(Vec::new())
    }

    async fn queue_lease_renewal(&self, domain: WorkDomain, message_id: Uuid) -> Result<Vec<ClaimedWorkRow>> {
        self.buffer(|p| p.lease_renewals.push(LeaseRenewal { domain, message_id }));
        Ok(Vec::new())
    }

    async fn flush(&self) -> Result<Vec<ClaimedWorkRow>> {
        let pending = self.take();
        flush_once(&self.pool, &self.identity, self.config, self.max_batch_size, pending).await
    }
}
