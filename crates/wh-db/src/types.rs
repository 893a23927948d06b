use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;
use wh_envelope::WorkDomain;

/// Flags bitfield accepted alongside `ProcedureConfig` (§4.2 inputs,
/// §6 `debug_mode`).
///
/// Fixes an ambiguity the source left open (§9 Open Questions: "the exact
/// flags bit `DebugMode = 4`... varies between code and schema comments").
/// Here bit 2 (`0x4`) means debug mode — retain fully-completed rows for
/// inspection instead of deleting them in phase 4/8. No other bit is
/// currently defined; future flags should be documented here as they're
/// added, not inferred from call sites.
pub const FLAG_DEBUG_MODE: i32 = 1 << 2;

pub fn is_debug_mode(flags: i32) -> bool {
    flags & FLAG_DEBUG_MODE == FLAG_DEBUG_MODE
}

/// Per-call identity of the instance invoking the coordination procedure.
#[derive(Debug, Clone)]
pub struct InstanceIdentity {
    pub instance_id: Uuid,
    pub service_name: String,
    pub host_name: String,
    pub process_id: i32,
    pub metadata: Value,
}

/// Tunables accepted by `process_work_batch` (§6 configuration knobs).
#[derive(Debug, Clone, Copy)]
pub struct ProcedureConfig {
    pub lease_seconds: i64,
    pub stale_threshold_seconds: i64,
    pub flags: i32,
    pub partition_count: i32,
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 300,
            stale_threshold_seconds: 600,
            flags: 0,
            partition_count: wh_partition::DEFAULT_PARTITION_COUNT as i32,
        }
    }
}

/// A completion reported against an outbox or inbox row: `status | = flags`.
#[derive(Debug, Clone)]
pub struct Completion {
    pub message_id: Uuid,
    pub status_flags: i32,
}

/// A failure reported against an outbox or inbox row (§4.2 phase 5).
#[derive(Debug, Clone)]
pub struct Failure {
    pub message_id: Uuid,
    pub partial_status: i32,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ReceptorCompletion {
    pub event_id: Uuid,
    pub receptor_name: String,
    pub status_flags: i32,
}

#[derive(Debug, Clone)]
pub struct ReceptorFailure {
    pub event_id: Uuid,
    pub receptor_name: String,
    pub partial_status: i32,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct PerspectiveCompletion {
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub last_event_id: Uuid,
    pub status_flags: i32,
}

#[derive(Debug, Clone)]
pub struct PerspectiveFailure {
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub partial_status: i32,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct LeaseRenewal {
    pub domain: WorkDomain,
    pub message_id: Uuid,
}

/// Event-store fields attached to a new outbox/inbox message whose payload
/// is an event (§4.2 phase 9). `None` for messages that aren't events.
#[derive(Debug, Clone)]
pub struct NewEventFields {
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub event_type: String,
}

#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub message_id: Uuid,
    pub destination: String,
    pub envelope_type: String,
    pub envelope_data: Value,
    pub metadata: Value,
    pub stream_id: Uuid,
    pub event: Option<NewEventFields>,
}

#[derive(Debug, Clone)]
pub struct NewInboxMessage {
    pub message_id: Uuid,
    pub handler_name: String,
    pub envelope_type: String,
    pub envelope_data: Value,
    pub metadata: Value,
    pub stream_id: Uuid,
    pub event: Option<NewEventFields>,
}

/// Everything `process_work_batch` accepts in one call (§4.2 Inputs).
/// Every list is optional in spirit — empty `Vec`s are tolerated and simply
/// produce no-op phases.
#[derive(Debug, Clone)]
pub struct ProcessWorkBatchInput {
    pub identity: InstanceIdentity,
    pub config: ProcedureConfig,

    pub outbox_completions: Vec<Completion>,
    pub inbox_completions: Vec<Completion>,
    pub outbox_failures: Vec<Failure>,
    pub inbox_failures: Vec<Failure>,

    pub receptor_completions: Vec<ReceptorCompletion>,
    pub receptor_failures: Vec<ReceptorFailure>,
    pub perspective_completions: Vec<PerspectiveCompletion>,
    pub perspective_failures: Vec<PerspectiveFailure>,

    pub new_outbox_messages: Vec<NewOutboxMessage>,
    pub new_inbox_messages: Vec<NewInboxMessage>,

    pub lease_renewals: Vec<LeaseRenewal>,

    /// Upper bound on how many claimed rows phase 11 returns. `None` means
    /// unbounded (all eligible rows).
    pub max_batch_size: Option<i64>,
}

impl ProcessWorkBatchInput {
    /// A heartbeat-only call: no completions, failures, new messages, or
    /// renewals. Still evicts stale instances and reclaims orphaned work.
    pub fn heartbeat_only(identity: InstanceIdentity) -> Self {
        Self {
            identity,
            config: ProcedureConfig::default(),
            outbox_completions: Vec::new(),
            inbox_completions: Vec::new(),
            outbox_failures: Vec::new(),
            inbox_failures: Vec::new(),
            receptor_completions: Vec::new(),
            receptor_failures: Vec::new(),
            perspective_completions: Vec::new(),
            perspective_failures: Vec::new(),
            new_outbox_messages: Vec::new(),
            new_inbox_messages: Vec::new(),
            lease_renewals: Vec::new(),
            max_batch_size: None,
        }
    }
}

/// One row of claimed work returned by `process_work_batch` (§4.2 Output).
#[derive(Debug, Clone)]
pub struct ClaimedWorkRow {
    pub source: WorkDomain,
    pub message_id: Uuid,
    /// `destination` for outbox rows, `handler_name` for inbox rows.
    pub destination_or_handler: String,
    pub envelope_type: String,
    pub envelope_data: Value,
    pub metadata: Value,
    pub stream_id: Uuid,
    pub partition_number: i32,
    pub attempts: i32,
    pub status: i32,
    /// True if this row was inserted by phase 8 of the same call; false if
    /// it was reclaimed as orphaned work by phase 10.
    pub newly_stored: bool,
    /// Ordering key handed to the ordered stream processor: epoch-ms of
    /// `created_at` (outbox) / `received_at` (inbox). Rows are returned
    /// `ORDER BY stream_id, sequence_order` (§4.2 phase 11).
    pub sequence_order: DateTime<Utc>,
}
