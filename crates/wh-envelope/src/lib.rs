//! Wire-shape types shared between the coordination layer and its callers:
//! the envelope/hop carrier, the outbox/inbox status bitfield, and the
//! message-association rows that drive auto-creation of perspective and
//! receptor checkpoints.
//!
//! None of these types touch the database directly — `wh-db` owns that.
//! This crate only defines the shapes that cross the wire or get persisted
//! as JSON columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod status;

/// The envelope wire shape (§6). `Payload` is left as `serde_json::Value`
/// because the coordination core never interprets it — only source/handler
/// crates do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "MessageId")]
    pub message_id: Uuid,

    #[serde(rename = "Payload")]
    pub payload: Value,

    #[serde(rename = "Hops")]
    pub hops: Vec<Hop>,
}

impl Envelope {
    /// Derive `stream_id` from the first hop's `AggregateId` metadata,
    /// falling back to `message_id` when absent (§6).
    ///
    /// Returns `None` when `hops` is empty — callers must supply at least
    /// one hop (the first hop is required to exist per the wire contract).
    pub fn stream_id(&self) -> Option<Uuid> {
        let first = self.hops.first()?;
        Some(
            first
                .metadata
                .get("AggregateId")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or(self.message_id),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopType {
    Current,
    Causation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstanceRef {
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "ProcessId")]
    pub process_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
    #[serde(rename = "Type")]
    pub hop_type: HopType,
    #[serde(rename = "ServiceInstance")]
    pub service_instance: ServiceInstanceRef,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "CorrelationId")]
    pub correlation_id: Uuid,
    #[serde(rename = "CausationId")]
    pub causation_id: Option<Uuid>,
    #[serde(rename = "Topic")]
    pub topic: String,
    #[serde(rename = "Metadata", default)]
    pub metadata: Value,
    #[serde(rename = "CallerMemberName", default, skip_serializing_if = "Option::is_none")]
    pub caller_member_name: Option<String>,
    #[serde(rename = "CallerFilePath", default, skip_serializing_if = "Option::is_none")]
    pub caller_file_path: Option<String>,
    #[serde(rename = "CallerLineNumber", default, skip_serializing_if = "Option::is_none")]
    pub caller_line_number: Option<i32>,
}

/// Which of the two leased-row domains a completion/failure/renewal refers
/// to. Receptor and perspective tracking are independent log-style tables
/// and are addressed separately (see `wh_db::ReceptorDomain` /
/// `PerspectiveDomain` call sites in the coordination procedure binding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkDomain {
    Outbox,
    Inbox,
}

impl WorkDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkDomain::Outbox => "outbox",
            WorkDomain::Inbox => "inbox",
        }
    }
}

/// `MessageAssociation` (§3): drives auto-creation of checkpoint rows when
/// an event type is first seen by a perspective or receptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociationType {
    Perspective,
    Receptor,
}

impl AssociationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssociationType::Perspective => "perspective",
            AssociationType::Receptor => "receptor",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAssociation {
    pub message_type: String,
    pub association_type: AssociationType,
    pub target_name: String,
    pub service_name: String,
}
