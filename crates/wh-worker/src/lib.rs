//! Long-running workers (§4.5 publisher, §4.6 perspective): they pump the
//! work-coordinator strategy, hand outbox rows to the ordered stream
//! processor or replay perspective checkpoints directly against the event
//! store, and report outcomes back through the same strategy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

use wh_coordinator::WorkCoordinatorStrategy;
use wh_db::{EventRow, PerspectiveCheckpointRow};
use wh_envelope::status::{PERSPECTIVE_PROCESSED, PUBLISHED, RECEPTOR_PROCESSED, STORED};
use wh_envelope::WorkDomain;
use wh_stream::{process_ordered, MessageOutcome, MessageProcessor};

/// Consecutive empty-poll idle tracking shared by both worker loops
/// (§4.5.2, §4.6 "identical idle detection"). Raises `on_idle` exactly once
/// per idle episode — transitioning from "had work" to "idle" — and resets
/// the moment work resumes.
struct IdleTracker {
    threshold: u32,
    consecutive_empty: AtomicU32,
    idle_signalled: std::sync::atomic::AtomicBool,
}

impl IdleTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_empty: AtomicU32::new(0),
            idle_signalled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Returns true exactly once per idle episode — the call where the
    /// empty-poll count first reaches the threshold.
    fn observe(&self, had_work: bool) -> bool {
        if had_work {
            self.consecutive_empty.store(0, Ordering::SeqCst);
            self.idle_signalled.store(false, Ordering::SeqCst);
            return false;
        }
        let count = self.consecutive_empty.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold && !self.idle_signalled.swap(true, Ordering::SeqCst) {
            return true;
        }
        false
    }
}

/// Transport collaborator consumed by the publisher worker (§6).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        destination: &str,
        envelope_type: &str,
        envelope_data: &Value,
        metadata: &Value,
    ) -> Result<(), String>;
}

struct TransportProcessor {
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl MessageProcessor for TransportProcessor {
    async fn process(&self, row: &wh_db::ClaimedWorkRow) -> MessageOutcome {
        match self
            .transport
            .publish(&row.destination_or_handler, &row.envelope_type, &row.envelope_data, &row.metadata)
            .await
        {
            Ok(()) => MessageOutcome::Ok { completed_status_bits: PUBLISHED },
            Err(message) => MessageOutcome::Err { error_message: message, partial_status_bits: STORED },
        }
    }
}

/// §4.5: pumps `strategy.flush()`, hands outbox rows to the ordered stream
/// processor, publishes each through `transport`, and reports completions
/// or failures back through the same strategy.
///
/// Inbox rows that come back in the same flush (e.g. from orphan
/// reclamation incidental to this instance's partition share) are left
/// alone here — inbound dispatch happens inline at delivery time through
/// the dispatch collaborator (§6), not through this loop.
pub struct PublisherWorker {
    strategy: Arc<dyn WorkCoordinatorStrategy>,
    transport: Arc<dyn Transport>,
    idle: IdleTracker,
    polling_interval: Duration,
    parallelize_streams: bool,
    concurrency_cap: usize,
}

impl PublisherWorker {
    pub fn new(
        strategy: Arc<dyn WorkCoordinatorStrategy>,
        transport: Arc<dyn Transport>,
        polling_interval: Duration,
        idle_threshold_polls: u32,
        parallelize_streams: bool,
        concurrency_cap: usize,
    ) -> Self {
        Self {
            strategy,
            transport,
            idle: IdleTracker::new(idle_threshold_polls),
            polling_interval,
            parallelize_streams,
            concurrency_cap,
        }
    }

    /// Runs one iteration: flush, publish, report. Returns true if an idle
    /// episode should be signalled to the caller.
    pub async fn tick(&self) -> anyhow::Result<bool> {
        let batch = self.strategy.flush().await?;
        let outbox_rows: Vec<_> = batch.into_iter().filter(|r| r.source == WorkDomain::Outbox).collect();

        let had_work = !outbox_rows.is_empty();
        let went_idle = self.idle.observe(had_work);

        if had_work {
            let processor: Arc<dyn MessageProcessor> = Arc::new(TransportProcessor { transport: self.transport.clone() });
            let results = process_ordered(outbox_rows, processor, self.parallelize_streams, self.concurrency_cap).await;

            for (row, outcome) in results {
                match outcome {
                    MessageOutcome::Ok { completed_status_bits } => {
                        self.strategy.queue_outbox_completion(row.message_id, completed_status_bits).await?;
                    }
                    MessageOutcome::Err { error_message, partial_status_bits } => {
                        self.strategy
                            .queue_outbox_failure(row.message_id, partial_status_bits, error_message)
                            .await?;
                    }
                }
            }
        }

        Ok(went_idle)
    }

    /// The worker's main loop. Runs until `shutdown` fires, then finishes
    /// the current iteration, flushes once more to report outcomes, and
    /// exits (§4.5 cancellation policy).
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut on_idle: impl FnMut() + Send,
    ) -> anyhow::Result<()> {
        loop {
            if self.tick().await? {
                on_idle();
            }

            tokio::select! {
                _ = tokio::time::sleep(self.polling_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.strategy.dispose().await?;
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Perspective projection collaborator consumed by the perspective worker
/// (§6 analogue: out of scope to specify the projection's own effects).
#[async_trait]
pub trait PerspectiveHandler: Send + Sync {
    fn perspective_name(&self) -> &str;
    async fn apply(&self, event: &EventRow) -> Result<(), String>;
}

/// §4.6: for each `(stream_id, perspective_name)` checkpoint this worker
/// owns, replays events after `last_event_id` through `handler.apply`, and
/// reports progress through the same strategy interface the publisher
/// uses. Work discovery is direct (`wh_db::list_streams_with_pending_events`)
/// rather than via the claimed-batch mechanism, since perspective checkpoints
/// aren't outbox/inbox rows — but discovery still claims each checkpoint it
/// returns (`lease_expiry` pushed out under `FOR UPDATE SKIP LOCKED`), so two
/// workers bound to the same `perspective_name` cannot both replay the same
/// stream concurrently.
pub struct PerspectiveWorker {
    pool: PgPool,
    strategy: Arc<dyn WorkCoordinatorStrategy>,
    handler: Arc<dyn PerspectiveHandler>,
    idle: IdleTracker,
    polling_interval: Duration,
    streams_per_round: i64,
    events_per_stream_per_round: i64,
    lease_seconds: i64,
}

impl PerspectiveWorker {
    pub fn new(
        pool: PgPool,
        strategy: Arc<dyn WorkCoordinatorStrategy>,
        handler: Arc<dyn PerspectiveHandler>,
        polling_interval: Duration,
        idle_threshold_polls: u32,
        streams_per_round: i64,
        events_per_stream_per_round: i64,
        lease_seconds: i64,
    ) -> Self {
        Self {
            pool,
            strategy,
            handler,
            idle: IdleTracker::new(idle_threshold_polls),
            polling_interval,
            streams_per_round,
            events_per_stream_per_round,
            lease_seconds,
        }
    }

    pub async fn tick(&self) -> anyhow::Result<bool> {
        let candidates: Vec<PerspectiveCheckpointRow> = wh_db::list_streams_with_pending_events(
            &self.pool,
            self.handler.perspective_name(),
            self.streams_per_round,
            self.lease_seconds,
        )
        .await?;

        let had_work = !candidates.is_empty();
        let went_idle = self.idle.observe(had_work);

        for checkpoint in candidates {
            self.advance_checkpoint(checkpoint).await?;
        }

        // Always flush: the strategy needs a round trip to persist any
        // queued completions/failures even if this round found no work.
        self.strategy.flush().await?;

        Ok(went_idle)
    }

    async fn advance_checkpoint(&self, checkpoint: PerspectiveCheckpointRow) -> anyhow::Result<()> {
        let events = wh_db::fetch_events_for_stream_since(
            &self.pool,
            checkpoint.stream_id,
            checkpoint.last_event_id,
            self.events_per_stream_per_round,
        )
        .await?;

        let mut last_applied: Option<Uuid> = checkpoint.last_event_id;

        for event in &events {
            match self.handler.apply(event).await {
                Ok(()) => {
                    last_applied = Some(event.event_id);
                }
                Err(error_message) => {
                    if let Some(last) = last_applied {
                        self.strategy
                            .queue_perspective_completion(checkpoint.stream_id, checkpoint.perspective_name.clone(), last, 0)
                            .await?;
                    }
                    self.strategy
                        .queue_perspective_failure(checkpoint.stream_id, checkpoint.perspective_name.clone(), 0, error_message)
                        .await?;
                    return Ok(());
                }
            }
        }

        if let Some(last) = last_applied {
            self.strategy
                .queue_perspective_completion(
                    checkpoint.stream_id,
                    checkpoint.perspective_name.clone(),
                    last,
                    PERSPECTIVE_PROCESSED,
                )
                .await?;
        }

        Ok(())
    }

    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut on_idle: impl FnMut() + Send,
    ) -> anyhow::Result<()> {
        loop {
            if self.tick().await? {
                on_idle();
            }

            tokio::select! {
                _ = tokio::time::sleep(self.polling_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.strategy.dispose().await?;
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Receptor collaborator consumed by the receptor worker: an independent
/// side-effect handler for one event type, tracked separately from any
/// perspective projection over the same event (§3 `ReceptorProcessing`).
#[async_trait]
pub trait ReceptorHandler: Send + Sync {
    fn receptor_name(&self) -> &str;
    async fn handle(&self, event: &EventRow) -> Result<(), String>;
}

/// Loops over `wh_receptor_processing` rows bound to one receptor name,
/// invoking the handler once per event and reporting outcomes through the
/// same strategy interface the publisher and perspective workers use.
/// Mirrors `PerspectiveWorker`'s shape: direct work discovery
/// (`wh_db::list_pending_receptor_work`) rather than the claimed-batch
/// mechanism, but the discovery query claims each row it returns the same
/// way, so two workers bound to the same `receptor_name` cannot both
/// dispatch the same `(event_id, receptor_name)` row concurrently.
pub struct ReceptorWorker {
    pool: PgPool,
    strategy: Arc<dyn WorkCoordinatorStrategy>,
    handler: Arc<dyn ReceptorHandler>,
    idle: IdleTracker,
    polling_interval: Duration,
    events_per_round: i64,
    lease_seconds: i64,
}

impl ReceptorWorker {
    pub fn new(
        pool: PgPool,
        strategy: Arc<dyn WorkCoordinatorStrategy>,
        handler: Arc<dyn ReceptorHandler>,
        polling_interval: Duration,
        idle_threshold_polls: u32,
        events_per_round: i64,
        lease_seconds: i64,
    ) -> Self {
        Self {
            pool,
            strategy,
            handler,
            idle: IdleTracker::new(idle_threshold_polls),
            polling_interval,
            events_per_round,
            lease_seconds,
        }
    }

    pub async fn tick(&self) -> anyhow::Result<bool> {
        let pending = wh_db::list_pending_receptor_work(
            &self.pool,
            self.handler.receptor_name(),
            self.events_per_round,
            self.lease_seconds,
        )
        .await?;

        let had_work = !pending.is_empty();
        let went_idle = self.idle.observe(had_work);

        for (processing, event) in pending {
            match self.handler.handle(&event).await {
                Ok(()) => {
                    self.strategy
                        .queue_receptor_completion(processing.event_id, processing.receptor_name, RECEPTOR_PROCESSED)
                        .await?;
                }
                Err(error_message) => {
                    self.strategy
                        .queue_receptor_failure(processing.event_id, processing.receptor_name, 0, error_message)
                        .await?;
                }
            }
        }

        self.strategy.flush().await?;
        Ok(went_idle)
    }

    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut on_idle: impl FnMut() + Send,
    ) -> anyhow::Result<()> {
        loop {
            if self.tick().await? {
                on_idle();
            }

            tokio::select! {
                _ = tokio::time::sleep(self.polling_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.strategy.dispose().await?;
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_tracker_signals_exactly_once_per_episode() {
        let tracker = IdleTracker::new(2);
        assert!(!tracker.observe(false)); // 1st empty poll: below threshold
        assert!(tracker.observe(false)); // 2nd empty poll: crosses threshold
        assert!(!tracker.observe(false)); // still idle, already signalled
        assert!(!tracker.observe(true)); // work resumes, resets
        assert!(!tracker.observe(false));
        assert!(tracker.observe(false)); // new episode signals again
    }
}
