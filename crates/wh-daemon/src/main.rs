//! wh-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads config,
//! connects the database, builds the shared state, spawns the publisher
//! and perspective workers as background tasks, wires middleware, and
//! starts the HTTP server. All route handlers live in `routes.rs`; all
//! shared state types live in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};
use uuid::Uuid;

use wh_coordinator::ImmediateStrategy;
use wh_daemon::{collaborators, routes, state};
use wh_db::types::ProcedureConfig;
use wh_db::InstanceIdentity;
use wh_worker::{PerspectiveWorker, PublisherWorker, ReceptorWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if absent —
    // production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let pool = wh_db::connect_from_env().await.context("connect to database")?;
    wh_db::migrate(&pool).await.context("run migrations")?;

    let scheduler_config = wh_config::SchedulerConfig::default().apply_env_overrides()?;
    scheduler_config.validate().context("invalid scheduler configuration")?;

    let identity = build_identity();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let shared = Arc::new(state::AppState::new(pool.clone(), identity.clone(), shutdown_tx.clone()));
    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));

    let procedure_config = ProcedureConfig {
        lease_seconds: scheduler_config.lease_seconds,
        stale_threshold_seconds: scheduler_config.stale_threshold_seconds,
        flags: if scheduler_config.debug_mode { wh_db::types::FLAG_DEBUG_MODE } else { 0 },
        partition_count: scheduler_config.partition_count,
    };

    let strategy = Arc::new(ImmediateStrategy::new(pool.clone(), identity.clone(), procedure_config));

    let publisher = PublisherWorker::new(
        strategy.clone(),
        Arc::new(collaborators::LoggingTransport),
        Duration::from_millis(scheduler_config.polling_interval_ms),
        scheduler_config.idle_threshold_polls,
        scheduler_config.parallelize_streams,
        8,
    );
    let perspective = PerspectiveWorker::new(
        pool.clone(),
        strategy.clone(),
        Arc::new(collaborators::LoggingPerspectiveHandler::new("default")),
        Duration::from_millis(scheduler_config.polling_interval_ms),
        scheduler_config.idle_threshold_polls,
        100,
        200,
        scheduler_config.lease_seconds,
    );
    let receptor = ReceptorWorker::new(
        pool.clone(),
        strategy.clone(),
        Arc::new(collaborators::LoggingReceptorHandler::new("default")),
        Duration::from_millis(scheduler_config.polling_interval_ms),
        scheduler_config.idle_threshold_polls,
        200,
        scheduler_config.lease_seconds,
    );

    let publisher_state = shared.clone();
    let publisher_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(err) = publisher
            .run(publisher_shutdown, {
                let st = publisher_state.clone();
                move || {
                    let st = st.clone();
                    tokio::spawn(async move { st.mark_idle("publisher", true).await });
                }
            })
            .await
        {
            tracing::error!(error = %err, "publisher worker exited");
        }
    });

    let perspective_state = shared.clone();
    let perspective_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(err) = perspective
            .run(perspective_shutdown, {
                let st = perspective_state.clone();
                move || {
                    let st = st.clone();
                    tokio::spawn(async move { st.mark_idle("perspective", true).await });
                }
            })
            .await
        {
            tracing::error!(error = %err, "perspective worker exited");
        }
    });

    let receptor_state = shared.clone();
    let receptor_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(err) = receptor
            .run(receptor_shutdown, {
                let st = receptor_state.clone();
                move || {
                    let st = st.clone();
                    tokio::spawn(async move { st.mark_idle("receptor", true).await });
                }
            })
            .await
        {
            tracing::error!(error = %err, "receptor worker exited");
        }
    });

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("wh-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("WH_DAEMON_ADDR").ok()?.parse().ok()
}

fn build_identity() -> InstanceIdentity {
    InstanceIdentity {
        instance_id: Uuid::new_v4(),
        service_name: "wh-daemon".to_string(),
        host_name: hostname(),
        process_id: std::process::id() as i32,
        metadata: serde_json::json!({}),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
    ];

    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    CorsLayer::new().allow_origin(origins).allow_methods([Method::GET, Method::POST]).allow_headers(tower_http::cors::Any)
}
