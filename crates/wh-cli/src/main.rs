use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use wh_coordinator::ImmediateStrategy;
use wh_db::types::ProcedureConfig;
use wh_db::InstanceIdentity;

#[derive(Parser)]
#[command(name = "wh")]
#[command(about = "wh scheduler operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> overlay -> ...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run a standalone worker loop (no HTTP surface — use wh-daemon for that).
    Run {
        #[command(subcommand)]
        cmd: RunCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum RunCmd {
    /// Run the publisher worker loop until Ctrl-C.
    Publisher,
    /// Run the perspective worker loop until Ctrl-C.
    Perspective {
        #[arg(long, default_value = "default")]
        perspective_name: String,
    },
    /// Run the receptor worker loop until Ctrl-C.
    Receptor {
        #[arg(long, default_value = "default")]
        receptor_name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = wh_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = wh_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_core_schema={} live_instance_count={} active_stream_count={}",
                        s.ok, s.has_core_schema, s.live_instance_count, s.active_stream_count
                    );
                }
                DbCmd::Migrate => {
                    wh_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = wh_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Run { cmd } => run_worker(cmd).await?,
    }

    Ok(())
}

async fn run_worker(cmd: RunCmd) -> Result<()> {
    let pool = wh_db::connect_from_env().await?;
    wh_db::migrate(&pool).await?;

    let scheduler_config = wh_config::SchedulerConfig::default().apply_env_overrides()?;
    scheduler_config.validate()?;

    let identity = InstanceIdentity {
        instance_id: Uuid::new_v4(),
        service_name: "wh-cli".to_string(),
        host_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        process_id: std::process::id() as i32,
        metadata: serde_json::json!({}),
    };

    let procedure_config = ProcedureConfig {
        lease_seconds: scheduler_config.lease_seconds,
        stale_threshold_seconds: scheduler_config.stale_threshold_seconds,
        flags: if scheduler_config.debug_mode { wh_db::types::FLAG_DEBUG_MODE } else { 0 },
        partition_count: scheduler_config.partition_count,
    };

    let strategy = Arc::new(ImmediateStrategy::new(pool.clone(), identity, procedure_config));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        }
    });

    match cmd {
        RunCmd::Publisher => {
            let worker = wh_worker::PublisherWorker::new(
                strategy,
                Arc::new(LoggingTransport),
                Duration::from_millis(scheduler_config.polling_interval_ms),
                scheduler_config.idle_threshold_polls,
                scheduler_config.parallelize_streams,
                8,
            );
            worker.run(shutdown_rx, || tracing::info!("publisher idle")).await?;
        }
        RunCmd::Perspective { perspective_name } => {
            let worker = wh_worker::PerspectiveWorker::new(
                pool,
                strategy,
                Arc::new(LoggingPerspectiveHandler { name: perspective_name }),
                Duration::from_millis(scheduler_config.polling_interval_ms),
                scheduler_config.idle_threshold_polls,
                100,
                200,
                scheduler_config.lease_seconds,
            );
            worker.run(shutdown_rx, || tracing::info!("perspective idle")).await?;
        }
        RunCmd::Receptor { receptor_name } => {
            let worker = wh_worker::ReceptorWorker::new(
                pool,
                strategy,
                Arc::new(LoggingReceptorHandler { name: receptor_name }),
                Duration::from_millis(scheduler_config.polling_interval_ms),
                scheduler_config.idle_threshold_polls,
                200,
                scheduler_config.lease_seconds,
            );
            worker.run(shutdown_rx, || tracing::info!("receptor idle")).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

struct LoggingTransport;

#[async_trait::async_trait]
impl wh_worker::Transport for LoggingTransport {
    async fn publish(
        &self,
        destination: &str,
        envelope_type: &str,
        envelope_data: &serde_json::Value,
        metadata: &serde_json::Value,
    ) -> Result<(), String> {
        tracing::info!(destination, envelope_type, %envelope_data, %metadata, "publish");
        Ok(())
    }
}

struct LoggingPerspectiveHandler {
    name: String,
}

#[async_trait::async_trait]
impl wh_worker::PerspectiveHandler for LoggingPerspectiveHandler {
    fn perspective_name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, event: &wh_db::EventRow) -> Result<(), String> {
        tracing::info!(perspective = %self.name, event_id = %event.event_id, "apply");
        Ok(())
    }
}

struct LoggingReceptorHandler {
    name: String,
}

#[async_trait::async_trait]
impl wh_worker::ReceptorHandler for LoggingReceptorHandler {
    fn receptor_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &wh_db::EventRow) -> Result<(), String> {
        tracing::info!(receptor = %self.name, event_id = %event.event_id, "handle");
        Ok(())
    }
}
