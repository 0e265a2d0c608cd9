//! Photo processing scheduler: selects listings needing photos, runs them
//! through fetch → derive → upload in parallel batches, and records per-
//! listing status. Switches between Normal and Aggressive pacing on backlog.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use sea_orm::DatabaseConnection;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::CatalogService;
use crate::photos::fetcher::PhotoFetcher;
use crate::photos::pipeline::{class_long_name, ImagePipeline, ProcessedPhoto};
use crate::photos::storage::{sync_listing_dir, CompletenessTracker, ObjectStore};
use crate::repositories::photo_job::{self, PhotoCandidate};
use crate::rets::{RetsClient, Session};
use crate::sync::engine::table_name;

/// Backlog size above which the scheduler shifts to Aggressive pacing.
pub const AGGRESSIVE_BACKLOG_THRESHOLD: u64 = 20;

/// Backoff after a fatal tick error before the loop resumes.
const FATAL_BACKOFF: Duration = Duration::from_secs(30);

/// Pacing mode, decided per scan from the backlog size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Normal,
    Aggressive,
}

impl SchedulerMode {
    pub fn for_backlog(backlog: u64) -> Self {
        if backlog > AGGRESSIVE_BACKLOG_THRESHOLD {
            SchedulerMode::Aggressive
        } else {
            SchedulerMode::Normal
        }
    }

    pub fn batch_size(&self) -> u32 {
        match self {
            SchedulerMode::Normal => 5,
            SchedulerMode::Aggressive => 10,
        }
    }

    pub fn inter_batch_wait(&self) -> Duration {
        match self {
            SchedulerMode::Normal => Duration::from_secs(5),
            SchedulerMode::Aggressive => Duration::from_secs(1),
        }
    }

    pub fn idle_wait(&self) -> Duration {
        match self {
            SchedulerMode::Normal => Duration::from_secs(60),
            SchedulerMode::Aggressive => Duration::from_secs(10),
        }
    }
}

/// Assemble the stored photo payload: every processed photo with its variant
/// URLs as served from the object store.
pub fn photo_data_json(
    store: &ObjectStore,
    property_class_long: &str,
    listing_id: &str,
    processed: &[ProcessedPhoto],
) -> JsonValue {
    let photos: Vec<JsonValue> = processed
        .iter()
        .map(|photo| {
            let variants: BTreeMap<&str, JsonValue> = photo
                .variants
                .iter()
                .map(|variant| {
                    let key = format!(
                        "Photos/{}/{}/{}",
                        property_class_long, listing_id, variant.file_name
                    );
                    (
                        variant.name.as_str(),
                        json!({
                            "url": store.public_url(&key),
                            "width": variant.width,
                            "height": variant.height,
                            "byte_size": variant.byte_size,
                            "format": variant.format,
                        }),
                    )
                })
                .collect();
            json!({
                "object_id": photo.object_id,
                "dominant_color": photo.dominant_color,
                "variants": variants,
                "source_headers": photo.source_headers,
            })
        })
        .collect();
    JsonValue::Array(photos)
}

/// The background photo loop.
pub struct PhotoScheduler {
    db: DatabaseConnection,
    client: Arc<RetsClient>,
    catalog: Arc<CatalogService>,
    fetcher: Arc<PhotoFetcher>,
    pipeline: Arc<ImagePipeline>,
    store: Arc<ObjectStore>,
    tracker: Arc<CompletenessTracker>,
}

impl PhotoScheduler {
    pub fn new(
        db: DatabaseConnection,
        client: Arc<RetsClient>,
        catalog: Arc<CatalogService>,
        pipeline: ImagePipeline,
        store: ObjectStore,
    ) -> Self {
        Self {
            db,
            fetcher: Arc::new(PhotoFetcher::new(client.clone())),
            client,
            catalog,
            pipeline: Arc::new(pipeline),
            store: Arc::new(store),
            tracker: Arc::new(CompletenessTracker::new()),
        }
    }

    /// Run until the shutdown token fires. Fatal tick errors back off and
    /// the loop resumes; it never exits on its own.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("starting photo scheduler");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("photo scheduler shutdown requested");
                    break;
                }
                result = self.tick() => {
                    match result {
                        Ok(wait) => sleep_or_cancel(&shutdown, wait).await,
                        Err(err) => {
                            error!(error = %err, "photo scheduler tick failed, backing off");
                            sleep_or_cancel(&shutdown, FATAL_BACKOFF).await;
                        }
                    }
                }
            }
        }
        info!("photo scheduler stopped");
    }

    /// One scan: returns how long to wait before the next one.
    async fn tick(&self) -> anyhow::Result<Duration> {
        let session = self.client.login().await?;
        let catalog = self.catalog.load(&session).await?;

        // (table, class) pairs for every Property class.
        let property_tables: Vec<(String, String)> = catalog
            .resources
            .iter()
            .filter(|r| r.resource_id == "Property")
            .flat_map(|r| {
                r.classes.iter().filter_map(|class| {
                    class
                        .as_deref()
                        .map(|c| (table_name(r, Some(c)), c.to_string()))
                })
            })
            .collect();
        if property_tables.is_empty() {
            debug!("no property tables yet, photo scheduler idle");
            return Ok(SchedulerMode::Normal.idle_wait());
        }

        let backlog = photo_job::backlog_count(&self.db, &property_tables).await?;
        let mode = SchedulerMode::for_backlog(backlog);
        gauge!("photo_backlog").set(backlog as f64);
        if let Ok(failed) = photo_job::failed_count(&self.db).await {
            gauge!("photo_jobs_failed").set(failed as f64);
        }

        let batch =
            photo_job::next_batch(&self.db, &property_tables, mode.batch_size()).await?;
        if batch.is_empty() {
            return Ok(mode.idle_wait());
        }

        info!(
            backlog,
            mode = ?mode,
            batch = batch.len(),
            "processing photo batch"
        );

        let semaphore = Arc::new(Semaphore::new(mode.batch_size() as usize));
        let mut handles = Vec::new();
        for candidate in batch {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let scheduler = self.clone_refs();
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                scheduler.process_candidate(&session, candidate).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        Ok(mode.inter_batch_wait())
    }

    fn clone_refs(&self) -> PhotoWorker {
        PhotoWorker {
            db: self.db.clone(),
            fetcher: self.fetcher.clone(),
            pipeline: self.pipeline.clone(),
            store: self.store.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

/// Per-task slice of the scheduler's shared services.
struct PhotoWorker {
    db: DatabaseConnection,
    fetcher: Arc<PhotoFetcher>,
    pipeline: Arc<ImagePipeline>,
    store: Arc<ObjectStore>,
    tracker: Arc<CompletenessTracker>,
}

impl PhotoWorker {
    #[instrument(skip(self, session), fields(listing_id = %candidate.listing_id, property_type = %candidate.property_type))]
    async fn process_candidate(&self, session: &Session, candidate: PhotoCandidate) {
        let PhotoCandidate {
            listing_id,
            property_type,
        } = &candidate;

        if let Err(err) = photo_job::mark_processing(&self.db, listing_id, property_type).await {
            error!(error = %err, "failed to claim photo job");
            return;
        }

        match self.run_pipeline(session, listing_id, property_type).await {
            Ok(photo_data) => {
                let count = photo_data.as_array().map(Vec::len).unwrap_or(0);
                if let Err(err) =
                    photo_job::mark_completed(&self.db, listing_id, property_type, photo_data)
                        .await
                {
                    error!(error = %err, "failed to record photo completion");
                    return;
                }
                counter!("photos_listings_completed_total").increment(1);
                info!(photos = count, "photo job completed");
            }
            Err(err) => {
                warn!(error = %err, "photo job failed");
                counter!("photos_listings_failed_total").increment(1);
                if let Err(db_err) =
                    photo_job::mark_failed(&self.db, listing_id, property_type, &err.to_string())
                        .await
                {
                    error!(error = %db_err, "failed to record photo failure");
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        session: &Session,
        listing_id: &str,
        property_type: &str,
    ) -> Result<JsonValue, crate::error::PhotoError> {
        let photos = self.fetcher.property_photos(session, listing_id).await?;
        if photos.is_empty() {
            debug!(listing_id, "listing has no photos");
            return Ok(JsonValue::Array(Vec::new()));
        }

        let (dir, processed) = self
            .pipeline
            .process_listing(property_type, listing_id, photos)
            .await?;
        let class_long = class_long_name(property_type);

        if processed.is_empty() {
            // Nothing decodable; clear the staging dir rather than leaving
            // an empty sidecar behind.
            tokio::fs::remove_dir_all(&dir).await.ok();
            return Ok(JsonValue::Array(Vec::new()));
        }

        sync_listing_dir(&self.store, &self.tracker, class_long, listing_id, &dir).await?;
        Ok(photo_data_json(
            &self.store,
            class_long,
            listing_id,
            &processed,
        ))
    }
}

async fn sleep_or_cancel(shutdown: &CancellationToken, wait: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = sleep(wait) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectStorageConfig;
    use crate::photos::pipeline::ProcessedVariant;

    #[test]
    fn mode_switches_on_backlog_threshold() {
        assert_eq!(SchedulerMode::for_backlog(0), SchedulerMode::Normal);
        assert_eq!(SchedulerMode::for_backlog(20), SchedulerMode::Normal);
        assert_eq!(SchedulerMode::for_backlog(21), SchedulerMode::Aggressive);
    }

    #[test]
    fn mode_pacing_parameters() {
        let normal = SchedulerMode::Normal;
        assert_eq!(normal.batch_size(), 5);
        assert_eq!(normal.inter_batch_wait(), Duration::from_secs(5));
        assert_eq!(normal.idle_wait(), Duration::from_secs(60));

        let aggressive = SchedulerMode::Aggressive;
        assert_eq!(aggressive.batch_size(), 10);
        assert_eq!(aggressive.inter_batch_wait(), Duration::from_secs(1));
        assert_eq!(aggressive.idle_wait(), Duration::from_secs(10));
    }

    #[test]
    fn photo_json_carries_urls_and_dimensions() {
        let store = ObjectStore::new(ObjectStorageConfig {
            access_key: "AK".into(),
            secret_key: "SK".into(),
            endpoint: "https://objects.example.com".into(),
            bucket: "photos".into(),
        })
        .unwrap();

        let processed = vec![ProcessedPhoto {
            object_id: "0".into(),
            dominant_color: [10, 20, 30],
            variants: vec![ProcessedVariant {
                name: "thumb".into(),
                file_name: "thumb-0.webp".into(),
                width: 400,
                height: 266,
                byte_size: 4200,
                format: "webp".into(),
            }],
            source_headers: BTreeMap::from([(
                "content-label".to_string(),
                "Front".to_string(),
            )]),
        }];

        let value = photo_data_json(&store, "Residential", "230475", &processed);
        let photo = &value.as_array().unwrap()[0];
        assert_eq!(photo["object_id"], "0");
        assert_eq!(photo["dominant_color"], json!([10, 20, 30]));
        assert_eq!(
            photo["variants"]["thumb"]["url"],
            "https://objects.example.com/photos/Photos/Residential/230475/thumb-0.webp"
        );
        assert_eq!(photo["variants"]["thumb"]["width"], 400);
        assert_eq!(photo["source_headers"]["content-label"], "Front");
    }
}
