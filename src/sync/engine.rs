//! The sync engine: one reconciliation cycle per tick over every
//! (resource, class) pair in the catalog.
//!
//! Partial-sync resources page forward from the table's high watermark;
//! full-sync resources are truncated and reloaded behind a three-hour gate.
//! Unauthorized-query replies move the pair into the lockout set and drop
//! its tables.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use metrics::{counter, gauge, histogram};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::catalog::schema::{create_table_sql, create_visible_table_sql, visible_name};
use crate::catalog::{CatalogService, FieldDef, ResourceEntry};
use crate::db::table_exists;
use crate::error::{offending_column, RetsError, SchemaError};
use crate::models::field_name_translation::{
    ActiveModel as TranslationActiveModel, Column as TranslationColumn,
    Entity as FieldNameTranslation,
};
use crate::rets::parser::{self, SearchResponse};
use crate::rets::{RetsClient, Session};
use crate::sync::lockout::LockoutSet;
use crate::sync::sanitize::{replace_into_sql, sanitize};

/// Watermark floor used when a table is empty.
pub const WATERMARK_FLOOR: &str = "1900-01-01T00:00:00";

/// Configuration for the sync engine loop.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Seconds between engine cycles.
    pub tick_seconds: u64,
    /// Search page size.
    pub page_limit: u64,
    /// Minimum gap between full-sync reloads of the same table.
    pub full_sync_gap: chrono::Duration,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 60,
            page_limit: 2500,
            full_sync_gap: chrono::Duration::hours(3),
        }
    }
}

/// Target table for a (resource, class) pair.
pub fn table_name(resource: &ResourceEntry, class: Option<&str>) -> String {
    if resource.resource_id == "Deleted" {
        return format!("Deleted_{}", class.unwrap_or(""));
    }
    let single_class = resource.classes.len() == 1;
    match class {
        None => resource.resource_id.clone(),
        Some(class) if single_class && class == resource.resource_id => {
            resource.resource_id.clone()
        }
        Some(class) => format!("{}_{}", resource.resource_id, class),
    }
}

/// Resolve the SearchType/Class parameters for a Search request.
///
/// A resource name containing `_` with no explicit class is split into
/// SearchType prefix and Class suffix. A resource whose single class repeats
/// the resource name searches with Class equal to SearchType.
pub fn search_identity(resource: &ResourceEntry, class: Option<&str>) -> (String, String) {
    let (search_type, derived_class) = match class {
        Some(class) => (resource.resource_id.clone(), class.to_string()),
        None => match resource.resource_id.split_once('_') {
            Some((prefix, suffix)) => (prefix.to_string(), suffix.to_string()),
            None => (resource.resource_id.clone(), resource.resource_id.clone()),
        },
    };

    let single_self_class = resource.classes.len() == 1
        && resource.classes[0].as_deref() == Some(resource.resource_id.as_str());
    if single_self_class {
        let class = search_type.clone();
        return (search_type, class);
    }
    (search_type, derived_class)
}

/// Normalize a MySQL datetime string to the ISO-8601 seconds form DMQL wants.
pub fn normalize_watermark(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return parsed.format("%Y-%m-%dT%H:%M:%S").to_string();
    }
    trimmed.replace(' ', "T")
}

/// DMQL2 "greater than or equal" condition.
pub fn dmql_gte(field: &str, value: &str) -> String {
    format!("({}={}+)", field, value)
}

/// In-memory gate tracking the last full reload per table.
#[derive(Debug, Default)]
pub struct FullSyncGate {
    last_run: HashMap<String, DateTime<Utc>>,
}

impl FullSyncGate {
    pub fn should_run(&self, table: &str, now: DateTime<Utc>, gap: chrono::Duration) -> bool {
        match self.last_run.get(table) {
            Some(last) => now - *last >= gap,
            None => true,
        }
    }

    pub fn record(&mut self, table: &str, now: DateTime<Utc>) {
        self.last_run.insert(table.to_string(), now);
    }
}

/// Counters reported at the end of each cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub pairs_synced: u64,
    pub pairs_skipped_lockout: u64,
    pub pairs_skipped_not_due: u64,
    pub pairs_failed: u64,
    pub rows_upserted: u64,
    pub rows_failed: u64,
    pub lockouts_added: u64,
}

struct EngineState {
    lockouts: LockoutSet,
    full_gate: FullSyncGate,
    last_synced: HashMap<String, DateTime<Utc>>,
    fields: HashMap<String, Arc<Vec<FieldDef>>>,
}

/// The long-running sync engine.
pub struct SyncEngine {
    db: DatabaseConnection,
    client: Arc<RetsClient>,
    catalog: Arc<CatalogService>,
    config: SyncEngineConfig,
    state: Mutex<EngineState>,
}

impl SyncEngine {
    pub fn new(
        db: DatabaseConnection,
        client: Arc<RetsClient>,
        catalog: Arc<CatalogService>,
        config: SyncEngineConfig,
        cache_dir: &std::path::Path,
    ) -> Self {
        Self {
            db,
            client,
            catalog,
            config,
            state: Mutex::new(EngineState {
                lockouts: LockoutSet::load(cache_dir),
                full_gate: FullSyncGate::default(),
                last_synced: HashMap::new(),
                fields: HashMap::new(),
            }),
        }
    }

    /// Run the engine loop until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(tick_seconds = self.config.tick_seconds, "starting sync engine");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("sync engine shutdown requested");
                    break;
                }
                _ = sleep(Duration::from_secs(self.config.tick_seconds)) => {
                    let started = std::time::Instant::now();
                    match self.run_cycle().await {
                        Ok(stats) => {
                            debug!(?stats, "sync cycle completed");
                        }
                        Err(err) => error!(error = %err, "sync cycle failed"),
                    }
                    histogram!("sync_cycle_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }
        info!("sync engine stopped");
    }

    /// One full pass over the catalog.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleStats> {
        let cycle_id = Uuid::new_v4();
        let session = self.client.login().await?;
        let catalog = self.catalog.load(&session).await?;
        let mut stats = CycleStats::default();
        let now = Utc::now();

        for (resource, class) in catalog.pairs() {
            {
                let state = self.state.lock().await;
                if state.lockouts.contains(&resource.resource_id, class) {
                    stats.pairs_skipped_lockout += 1;
                    continue;
                }
            }

            let table = table_name(resource, class);
            if !self.pair_due(&table, resource, now).await {
                stats.pairs_skipped_not_due += 1;
                continue;
            }

            match self.sync_pair(&session, resource, class, &table, &mut stats).await {
                Ok(()) => {
                    stats.pairs_synced += 1;
                    self.state.lock().await.last_synced.insert(table, now);
                }
                Err(err) => {
                    stats.pairs_failed += 1;
                    error!(
                        cycle_id = %cycle_id,
                        resource = %resource.resource_id,
                        class = class.unwrap_or(""),
                        error = %err,
                        "pair sync failed, moving on"
                    );
                }
            }
        }

        counter!("sync_rows_upserted_total").increment(stats.rows_upserted);
        gauge!("sync_lockout_entries").set(self.state.lock().await.lockouts.len() as f64);
        info!(
            cycle_id = %cycle_id,
            synced = stats.pairs_synced,
            skipped_lockout = stats.pairs_skipped_lockout,
            skipped_not_due = stats.pairs_skipped_not_due,
            failed = stats.pairs_failed,
            rows = stats.rows_upserted,
            "sync cycle finished"
        );
        Ok(stats)
    }

    async fn pair_due(&self, table: &str, resource: &ResourceEntry, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().await;
        match state.last_synced.get(table) {
            Some(last) => {
                now - *last >= chrono::Duration::minutes(resource.sync_interval_minutes as i64)
            }
            None => true,
        }
    }

    #[instrument(skip(self, session, resource, stats), fields(resource = %resource.resource_id, class = class.unwrap_or("")))]
    async fn sync_pair(
        &self,
        session: &Session,
        resource: &ResourceEntry,
        class: Option<&str>,
        table: &str,
        stats: &mut CycleStats,
    ) -> anyhow::Result<()> {
        let fields = self.ensure_table(session, resource, class, table).await?;

        match resource.update_field.as_deref() {
            Some(update_field) => {
                let watermark = self
                    .watermark(table, update_field)
                    .await?
                    .map(|raw| normalize_watermark(&raw))
                    .unwrap_or_else(|| WATERMARK_FLOOR.to_string());
                let query = dmql_gte(update_field, &watermark);
                debug!(table, %query, "partial sync");
                self.page_and_upsert(session, resource, class, table, &fields, Some(query), stats)
                    .await
            }
            None => {
                let now = Utc::now();
                {
                    let state = self.state.lock().await;
                    if !state
                        .full_gate
                        .should_run(table, now, self.config.full_sync_gap)
                    {
                        debug!(table, "full sync gate closed, skipping");
                        return Ok(());
                    }
                }
                self.truncate(table).await?;
                let result = self
                    .page_and_upsert(session, resource, class, table, &fields, None, stats)
                    .await;
                if result.is_ok() {
                    self.state.lock().await.full_gate.record(table, now);
                }
                result
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn page_and_upsert(
        &self,
        session: &Session,
        resource: &ResourceEntry,
        class: Option<&str>,
        table: &str,
        fields: &[FieldDef],
        query: Option<String>,
        stats: &mut CycleStats,
    ) -> anyhow::Result<()> {
        let mut offset: u64 = 0;
        loop {
            let response = self
                .search(session, resource, class, query.as_deref(), offset)
                .await?;

            if response.table.rows.is_empty() {
                match response.reply.as_error() {
                    Some(RetsError::UnauthorizedQuery { .. }) => {
                        self.handle_unauthorized(resource, class, table, stats).await?;
                    }
                    // 20201 is the server's "no records found"; anything else
                    // non-zero is worth surfacing before the pair is skipped.
                    Some(err) if response.reply.code != 20201 => {
                        warn!(table, error = %err, "search rejected, skipping pair this cycle");
                    }
                    _ => debug!(table, "search returned no rows"),
                }
                return Ok(());
            }

            let (upserted, failed) = self.upsert_rows(table, fields, &response).await;
            stats.rows_upserted += upserted;
            stats.rows_failed += failed;

            let batch = response.table.rows.len() as u64;
            if batch < self.config.page_limit {
                return Ok(());
            }
            offset += self.config.page_limit;
        }
    }

    async fn search(
        &self,
        session: &Session,
        resource: &ResourceEntry,
        class: Option<&str>,
        query: Option<&str>,
        offset: u64,
    ) -> Result<SearchResponse, RetsError> {
        let (search_type, search_class) = search_identity(resource, class);
        let capability = session.capability("Search")?;

        let mut params: Vec<(&str, String)> = vec![
            ("SearchType", search_type),
            ("Class", search_class),
            ("QueryType", "DMQL2".to_string()),
            ("Format", "COMPACT".to_string()),
            ("StandardNames", "0".to_string()),
            ("Count", "1".to_string()),
            ("Limit", self.config.page_limit.to_string()),
            ("Offset", offset.to_string()),
        ];
        if let Some(query) = query {
            params.push(("Query", query.to_string()));
        }

        let (body, _headers) = self.client.request(session, capability, &params).await?;
        parser::parse_search(&String::from_utf8_lossy(&body))
    }

    /// Create the listing table, its visible twin, and the name translations
    /// on first encounter; afterwards serve the cached field definitions.
    async fn ensure_table(
        &self,
        session: &Session,
        resource: &ResourceEntry,
        class: Option<&str>,
        table: &str,
    ) -> anyhow::Result<Arc<Vec<FieldDef>>> {
        if let Some(fields) = self.state.lock().await.fields.get(table).cloned() {
            return Ok(fields);
        }

        let fields = Arc::new(
            self.catalog
                .table_fields(session, &resource.resource_id, class)
                .await?,
        );

        if !table_exists(&self.db, table).await? {
            let key_field = resource.key_field.as_deref();
            for sql in [
                create_table_sql(table, &fields, key_field),
                create_visible_table_sql(table, &fields, key_field),
            ] {
                self.db
                    .execute(Statement::from_string(DatabaseBackend::MySql, sql))
                    .await
                    .map_err(|source| SchemaError::Ddl {
                        table: table.to_string(),
                        source,
                    })?;
            }
            self.store_translations(resource, class, &fields).await?;
            info!(table, columns = fields.len(), "created listing tables");
        }

        self.state
            .lock()
            .await
            .fields
            .insert(table.to_string(), fields.clone());
        Ok(fields)
    }

    async fn store_translations(
        &self,
        resource: &ResourceEntry,
        class: Option<&str>,
        fields: &[FieldDef],
    ) -> Result<(), sea_orm::DbErr> {
        use sea_orm::sea_query::OnConflict;
        use sea_orm::{ActiveValue::Set, EntityTrait};

        let rows: Vec<TranslationActiveModel> = fields
            .iter()
            .map(|field| TranslationActiveModel {
                resource_id: Set(resource.resource_id.clone()),
                class_id: Set(class.unwrap_or("").to_string()),
                system_name: Set(field.system_name.clone()),
                visible_name: Set(visible_name(&field.long_name)),
                long_name: Set(field.long_name.clone()),
            })
            .collect();
        if rows.is_empty() {
            return Ok(());
        }
        FieldNameTranslation::insert_many(rows)
            .on_conflict(
                OnConflict::columns([
                    TranslationColumn::ResourceId,
                    TranslationColumn::ClassId,
                    TranslationColumn::SystemName,
                ])
                .update_columns([TranslationColumn::VisibleName, TranslationColumn::LongName])
                .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn watermark(&self, table: &str, field: &str) -> Result<Option<String>, sea_orm::DbErr> {
        let stmt = Statement::from_string(
            DatabaseBackend::MySql,
            format!(
                "SELECT CAST(MAX(`{}`) AS CHAR) AS watermark FROM `{}`",
                field, table
            ),
        );
        match self.db.query_one(stmt).await? {
            Some(row) => row.try_get::<Option<String>>("", "watermark"),
            None => Ok(None),
        }
    }

    async fn truncate(&self, table: &str) -> Result<(), sea_orm::DbErr> {
        info!(table, "truncating before full reload");
        self.db
            .execute(Statement::from_string(
                DatabaseBackend::MySql,
                format!("TRUNCATE TABLE `{}`", table),
            ))
            .await?;
        Ok(())
    }

    /// Upsert every row of a batch; row-level failures are logged with the
    /// offending column and never abort the batch.
    async fn upsert_rows(
        &self,
        table: &str,
        fields: &[FieldDef],
        response: &SearchResponse,
    ) -> (u64, u64) {
        let index = crate::catalog::field_index(fields);
        let sql = replace_into_sql(table, &response.table.columns);
        let mut upserted = 0;
        let mut failed = 0;

        for row in &response.table.rows {
            let values: Vec<sea_orm::Value> = response
                .table
                .columns
                .iter()
                .zip(row.iter())
                .map(|(column, raw)| sanitize(index.get(column.as_str()).copied(), raw))
                .collect();

            let stmt =
                Statement::from_sql_and_values(DatabaseBackend::MySql, sql.clone(), values);
            match self.db.execute(stmt).await {
                Ok(_) => upserted += 1,
                Err(err) => {
                    failed += 1;
                    let message = err.to_string();
                    match offending_column(&message) {
                        Some((column, value)) => warn!(
                            table,
                            column,
                            value = value.as_deref().unwrap_or(""),
                            "row rejected by schema, continuing"
                        ),
                        None => warn!(table, error = %message, "row upsert failed, continuing"),
                    }
                }
            }
        }
        (upserted, failed)
    }

    /// Lockout path: persist the pair, drop its tables, stop syncing it.
    async fn handle_unauthorized(
        &self,
        resource: &ResourceEntry,
        class: Option<&str>,
        table: &str,
        stats: &mut CycleStats,
    ) -> anyhow::Result<()> {
        warn!(
            resource = %resource.resource_id,
            class = class.unwrap_or(""),
            table,
            "unauthorized query, locking out pair"
        );
        {
            let mut state = self.state.lock().await;
            if state.lockouts.insert(&resource.resource_id, class)? {
                stats.lockouts_added += 1;
            }
            state.fields.remove(table);
        }
        for drop_sql in [
            format!("DROP TABLE IF EXISTS `{}`", table),
            format!("DROP TABLE IF EXISTS `{}_visible`", table),
        ] {
            self.db
                .execute(Statement::from_string(DatabaseBackend::MySql, drop_sql))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SyncType;

    fn resource(id: &str, classes: Vec<Option<&str>>) -> ResourceEntry {
        ResourceEntry {
            resource_id: id.to_string(),
            key_field: Some("L_ListingID".into()),
            description: String::new(),
            sync_interval_minutes: 1,
            update_field: Some("L_UpdateDate".into()),
            sync_type: SyncType::Partial,
            classes: classes.into_iter().map(|c| c.map(String::from)).collect(),
        }
    }

    #[test]
    fn table_name_rules() {
        let property = resource("Property", vec![Some("RE_1"), Some("MF_4")]);
        assert_eq!(table_name(&property, Some("RE_1")), "Property_RE_1");

        let deleted = resource("Deleted", vec![Some("RE_1")]);
        assert_eq!(table_name(&deleted, Some("RE_1")), "Deleted_RE_1");

        let classless = resource("OpenHouse", vec![None]);
        assert_eq!(table_name(&classless, None), "OpenHouse");

        let self_class = resource("Agent", vec![Some("Agent")]);
        assert_eq!(table_name(&self_class, Some("Agent")), "Agent");

        // A single class that differs from the resource keeps the suffix.
        let other = resource("Office", vec![Some("OFF_1")]);
        assert_eq!(table_name(&other, Some("OFF_1")), "Office_OFF_1");
    }

    #[test]
    fn search_identity_splits_underscored_resource() {
        let combined = resource("Property_RE_1", vec![None]);
        let (search_type, class) = search_identity(&combined, None);
        assert_eq!(search_type, "Property");
        assert_eq!(class, "RE_1");
    }

    #[test]
    fn search_identity_passes_explicit_class() {
        let property = resource("Property", vec![Some("RE_1"), Some("MF_4")]);
        let (search_type, class) = search_identity(&property, Some("MF_4"));
        assert_eq!(search_type, "Property");
        assert_eq!(class, "MF_4");
    }

    #[test]
    fn search_identity_self_class_uses_search_type() {
        let agent = resource("Agent", vec![Some("Agent")]);
        let (search_type, class) = search_identity(&agent, Some("Agent"));
        assert_eq!(search_type, "Agent");
        assert_eq!(class, "Agent");

        let classless = resource("OpenHouse", vec![None]);
        let (search_type, class) = search_identity(&classless, None);
        assert_eq!(search_type, "OpenHouse");
        assert_eq!(class, "OpenHouse");
    }

    #[test]
    fn watermark_normalization() {
        assert_eq!(
            normalize_watermark("2024-05-01 12:30:45"),
            "2024-05-01T12:30:45"
        );
        assert_eq!(
            normalize_watermark("2024-05-01T12:30:45"),
            "2024-05-01T12:30:45"
        );
    }

    #[test]
    fn dmql_condition_shapes() {
        assert_eq!(
            dmql_gte("L_UpdateDate", "1900-01-01T00:00:00"),
            "(L_UpdateDate=1900-01-01T00:00:00+)"
        );
    }

    #[test]
    fn full_sync_gate_honors_gap() {
        let mut gate = FullSyncGate::default();
        let gap = chrono::Duration::hours(3);
        let t0 = Utc::now();

        assert!(gate.should_run("OpenHouse", t0, gap));
        gate.record("OpenHouse", t0);

        // Thirty minutes later the gate is still closed.
        assert!(!gate.should_run("OpenHouse", t0 + chrono::Duration::minutes(30), gap));
        // Three hours later it reopens.
        assert!(gate.should_run("OpenHouse", t0 + chrono::Duration::hours(3), gap));
        // Other tables are unaffected.
        assert!(gate.should_run("Deleted_RE_1", t0, gap));
    }

}
