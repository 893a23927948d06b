//! Shared runtime state for wh-daemon.
//!
//! All types here are `Clone`-able (via `Arc` or copy). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{broadcast, watch, RwLock};
use uuid::Uuid;

use wh_db::{DbStatus, InstanceIdentity};

// ---------------------------------------------------------------------------
// BusMsg — SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Status(StatusSnapshot),
    Idle { worker: String },
    LogLine { level: String, msg: String },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// StatusSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of daemon state, returned by GET /v1/status and
/// carried inside SSE `status` events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub daemon_uptime_secs: u64,
    pub instance_id: Uuid,
    pub live_instance_count: i64,
    pub active_stream_count: i64,
    pub db_reachable: bool,
    pub publisher_idle: bool,
    pub perspective_idle: bool,
    pub receptor_idle: bool,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers and both worker
/// loops.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub identity: InstanceIdentity,
    pub build: BuildInfo,
    pub bus: broadcast::Sender<BusMsg>,
    pub status: Arc<RwLock<StatusSnapshot>>,
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(pool: PgPool, identity: InstanceIdentity, shutdown: watch::Sender<bool>) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);

        let initial_status = StatusSnapshot {
            daemon_uptime_secs: uptime_secs(),
            instance_id: identity.instance_id,
            live_instance_count: 0,
            active_stream_count: 0,
            db_reachable: false,
            publisher_idle: false,
            perspective_idle: false,
            receptor_idle: false,
        };

        Self {
            pool,
            identity,
            build: BuildInfo {
                service: "wh-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            bus,
            status: Arc::new(RwLock::new(initial_status)),
            shutdown,
        }
    }

    /// Refreshes the status snapshot from the database and broadcasts it.
    pub async fn refresh_status(&self) -> anyhow::Result<StatusSnapshot> {
        let db = wh_db::status(&self.pool).await.unwrap_or(DbStatus {
            ok: false,
            has_core_schema: false,
            live_instance_count: 0,
            active_stream_count: 0,
        });

        let mut s = self.status.write().await;
        s.daemon_uptime_secs = uptime_secs();
        s.live_instance_count = db.live_instance_count;
        s.active_stream_count = db.active_stream_count;
        s.db_reachable = db.ok;
        let snap = s.clone();
        drop(s);

        let _ = self.bus.send(BusMsg::Status(snap.clone()));
        Ok(snap)
    }

    pub async fn mark_idle(&self, worker: &str, idle: bool) {
        let mut s = self.status.write().await;
        match worker {
            "publisher" => s.publisher_idle = idle,
            "perspective" => s.perspective_idle = idle,
            "receptor" => s.receptor_idle = idle,
            _ => {}
        }
        if idle {
            let _ = self.bus.send(BusMsg::Idle { worker: worker.to_string() });
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START.get_or_init(std::time::Instant::now).elapsed().as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
