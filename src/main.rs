//! # RETS Sync Service Entry Point
//!
//! Starts the three long-running loops (sync engine, photo scheduler,
//! lifecycle reconciler) or runs one of the operator subcommands.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rets_sync::catalog::CatalogService;
use rets_sync::config::{AppConfig, ConfigLoader};
use rets_sync::photos::{ImagePipeline, ObjectStore, PhotoScheduler};
use rets_sync::rets::RetsClient;
use rets_sync::sync::lifecycle::LifecycleReconciler;
use rets_sync::sync::lookups::LookupSync;
use rets_sync::sync::{SyncEngine, SyncEngineConfig};
use rets_sync::{db, telemetry};

#[derive(Parser)]
#[command(name = "rets-sync")]
#[command(about = "RETS feed synchronization service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Regenerate the metadata catalog from the server
    RefreshMetadata,
    /// Run a single sync engine cycle and exit
    SyncOnce,
    /// Invalidate the cached RETS session
    Logout,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Missing required configuration is fatal at startup.
    let config = match ConfigLoader::new().load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = telemetry::init_tracing(&config) {
        eprintln!("telemetry init failed: {}", err);
    }

    let db = match db::init_pool(&config).await {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "database unreachable at startup");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Some(Commands::Migrate { action }) => handle_migrate(&db, action).await,
        Some(Commands::RefreshMetadata) => refresh_metadata(&config).await,
        Some(Commands::SyncOnce) => sync_once(&config, db.clone()).await,
        Some(Commands::Logout) => logout(&config).await,
        None => run_service(config, db.clone()).await,
    };

    if let Err(err) = result {
        error!(error = %err, "command failed");
        std::process::exit(1);
    }
}

async fn handle_migrate(
    db: &sea_orm::DatabaseConnection,
    action: MigrateAction,
) -> anyhow::Result<()> {
    match action {
        MigrateAction::Up => {
            Migrator::up(db, None).await?;
            info!("all migrations applied");
        }
        MigrateAction::Down => {
            Migrator::down(db, Some(1)).await?;
            info!("last migration rolled back");
        }
        MigrateAction::Status => {
            let applied = Migrator::get_applied_migrations(db).await?;
            let pending = Migrator::get_pending_migrations(db).await?;
            info!(
                applied = applied.len(),
                pending = pending.len(),
                "migration status"
            );
        }
    }
    Ok(())
}

async fn refresh_metadata(config: &AppConfig) -> anyhow::Result<()> {
    let client = Arc::new(RetsClient::new(config.rets.clone(), &config.cache_dir)?);
    let catalog = CatalogService::new(client.clone(), &config.cache_dir);
    catalog.invalidate();
    let session = client.login().await?;
    let refreshed = catalog.refresh(&session).await?;
    info!(resources = refreshed.resources.len(), "catalog regenerated");
    Ok(())
}

async fn sync_once(config: &AppConfig, db: sea_orm::DatabaseConnection) -> anyhow::Result<()> {
    Migrator::up(&db, None).await?;
    let client = Arc::new(RetsClient::new(config.rets.clone(), &config.cache_dir)?);
    let catalog = Arc::new(CatalogService::new(client.clone(), &config.cache_dir));
    let engine = SyncEngine::new(
        db,
        client,
        catalog,
        SyncEngineConfig::default(),
        &config.cache_dir,
    );
    let stats = engine.run_cycle().await?;
    info!(?stats, "single sync cycle complete");
    Ok(())
}

async fn logout(config: &AppConfig) -> anyhow::Result<()> {
    let client = Arc::new(RetsClient::new(config.rets.clone(), &config.cache_dir)?);
    let session = client.login().await?;
    client.logout(&session).await;
    Ok(())
}

async fn run_service(config: AppConfig, db: sea_orm::DatabaseConnection) -> anyhow::Result<()> {
    db::health_check(&db).await?;
    Migrator::up(&db, None).await?;
    info!("migrations up to date");

    let client = Arc::new(RetsClient::new(config.rets.clone(), &config.cache_dir)?);
    let catalog = Arc::new(CatalogService::new(client.clone(), &config.cache_dir));

    let engine = Arc::new(SyncEngine::new(
        db.clone(),
        client.clone(),
        catalog.clone(),
        SyncEngineConfig::default(),
        &config.cache_dir,
    ));

    let pipeline = ImagePipeline::new(&config.cache_dir);
    let store = ObjectStore::new(config.object_storage.clone())?;
    let photo_scheduler = Arc::new(PhotoScheduler::new(
        db.clone(),
        client.clone(),
        catalog.clone(),
        pipeline,
        store,
    ));

    let reconciler = LifecycleReconciler::new(db.clone(), client.clone(), catalog.clone());
    let lookups = LookupSync::new(db.clone(), catalog.clone(), &config.cache_dir);

    let shutdown = CancellationToken::new();

    let engine_task = {
        let shutdown = shutdown.clone();
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };
    let photos_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { photo_scheduler.run(shutdown).await })
    };
    let lifecycle_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };
    let lookups_task = {
        let shutdown = shutdown.clone();
        let client = client.clone();
        tokio::spawn(async move {
            // Harvest at startup, then daily; the cache snapshot is rebuilt
            // wholesale each time.
            loop {
                match client.login().await {
                    Ok(session) => match catalog.load(&session).await {
                        Ok(catalog_snapshot) => {
                            if let Err(err) = lookups.run(&session, &catalog_snapshot).await {
                                error!(error = %err, "lookup harvest failed");
                            }
                        }
                        Err(err) => error!(error = %err, "catalog load failed for lookups"),
                    },
                    Err(err) => error!(error = %err, "login failed for lookup harvest"),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(24 * 3600)) => {}
                }
            }
        })
    };

    info!("service started; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = engine_task.await;
    let _ = photos_task.await;
    let _ = lifecycle_task.await;
    let _ = lookups_task.await;
    info!("service stopped");
    Ok(())
}
