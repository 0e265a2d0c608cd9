//! Database connection and pool management.
//!
//! Initializes a SeaORM connection pool to MySQL with retry and exponential
//! backoff. The per-resource listing tables are managed at runtime through
//! raw statements; only the tracking tables go through migrations.

use anyhow::{Context, Result};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Statement,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::AppConfig;

/// Errors that can occur during database setup.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("database unreachable after {attempts} attempts")]
    Unreachable { attempts: u32 },
}

/// Initializes the shared MySQL pool. Retries transient connection failures
/// with exponential backoff; startup aborts after the final attempt.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    let mut opt = ConnectOptions::new(cfg.mysql.url());
    opt.max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let max_retries = 5;
    let mut retry_delay = Duration::from_millis(100);

    for attempt in 1..=max_retries {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                info!(attempt, "connected to MySQL");
                return Ok(conn);
            }
            Err(e) => {
                if attempt == max_retries {
                    return Err(DatabaseError::ConnectionFailed { source: e }.into());
                }
                warn!(attempt, error = %e, delay = ?retry_delay, "MySQL connection failed, retrying");
                sleep(retry_delay).await;
                retry_delay *= 2;
            }
        }
    }

    Err(DatabaseError::Unreachable {
        attempts: max_retries,
    }
    .into())
}

/// Verifies the pool is alive with a trivial query.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());
    db.query_one(stmt)
        .await
        .context("database health check failed")?;
    Ok(())
}

/// Checks whether a table exists in the configured schema.
pub async fn table_exists(db: &DatabaseConnection, table: &str) -> Result<bool, sea_orm::DbErr> {
    let stmt = Statement::from_sql_and_values(
        DatabaseBackend::MySql,
        "SELECT 1 FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?",
        [table.into()],
    );
    Ok(db.query_one(stmt).await?.is_some())
}
