//! Postgres access for the work-coordination core: schema migrations, the
//! atomic coordination procedure (`procedure`, feature-gated), and the
//! read-mostly queries workers and the daemon use to drive publishing,
//! perspective projection, and receptor dispatch.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const ENV_DB_URL: &str = "WH_DATABASE_URL";

pub mod queries;
pub mod types;

#[cfg(feature = "procedure")]
pub mod procedure;

#[cfg(feature = "procedure")]
pub use procedure::process_work_batch;

pub use queries::*;
pub use types::*;

/// Connect to Postgres using `WH_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper: connect using `WH_DATABASE_URL` and ensure migrations are applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_core_schema: bool,
    pub live_instance_count: i64,
    pub active_stream_count: i64,
}

/// Connectivity + schema-presence + coarse liveness snapshot.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (has_core_schema,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'wh_service_instance'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    if !has_core_schema {
        return Ok(DbStatus {
            ok,
            has_core_schema,
            live_instance_count: 0,
            active_stream_count: 0,
        });
    }

    let (live_instance_count,): (i64,) = sqlx::query_as::<_, (i64,)>("select count(*) from wh_service_instance")
        .fetch_one(pool)
        .await
        .context("status live-instance-count query failed")?;

    let (active_stream_count,): (i64,) = sqlx::query_as::<_, (i64,)>("select count(*) from wh_active_stream")
        .fetch_one(pool)
        .await
        .context("status active-stream-count query failed")?;

    Ok(DbStatus {
        ok,
        has_core_schema,
        live_instance_count,
        active_stream_count,
    })
}
