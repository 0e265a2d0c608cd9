//! Lifecycle reconciler: aligns local listing status with the remote
//! hotsheet at fixed wall-clock hours.
//!
//! SOLD listings are promoted in place; WITHDRAWN and EXPIRED listings are
//! deleted from the property tables. Runs never abort on a single class
//! failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::catalog::CatalogService;
use crate::rets::parser;
use crate::rets::{RetsClient, Session};
use crate::sync::engine::table_name;

/// Wall-clock hours (local time) at which reconciliation runs.
pub const RUN_HOURS: [u32; 5] = [0, 12, 15, 18, 21];

/// One deduplicated hotsheet event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotsheetRow {
    pub listing_id: String,
    pub status_date: String,
    pub address: String,
    pub status: String,
    pub status_cat: String,
}

/// Local listing row considered for promotion or deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalListing {
    pub listing_id: String,
    pub status_cat: String,
    pub address: String,
}

/// Planned mutations for one property table.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub promote_to_sold: Vec<LocalListing>,
    pub delete: Vec<LocalListing>,
}

/// Seconds until the next configured run hour.
pub fn delay_until_next_run(now: DateTime<Local>) -> Duration {
    let mut best: Option<ChronoDuration> = None;
    for offset_days in 0..2 {
        for hour in RUN_HOURS {
            let candidate = (now.date_naive() + ChronoDuration::days(offset_days))
                .and_time(NaiveTime::from_hms_opt(hour, 0, 0).expect("valid hour"));
            if let Some(candidate) = candidate.and_local_timezone(Local).single() {
                let wait = candidate - now;
                if wait > ChronoDuration::zero()
                    && best.map(|b| wait < b).unwrap_or(true)
                {
                    best = Some(wait);
                }
            }
        }
    }
    let seconds = best
        .map(|d| d.num_seconds().max(1) as u64)
        .unwrap_or(12 * 3600);
    Duration::from_secs(seconds)
}

/// Keep one row per listing id, preferring the latest status date.
pub fn dedupe_latest(rows: Vec<HotsheetRow>) -> HashMap<String, HotsheetRow> {
    let mut latest: HashMap<String, HotsheetRow> = HashMap::new();
    for row in rows {
        match latest.get(&row.listing_id) {
            Some(existing) if existing.status_date >= row.status_date => {}
            _ => {
                latest.insert(row.listing_id.clone(), row);
            }
        }
    }
    latest
}

/// Split deduplicated events into the SOLD set and the WITHDRAWN/EXPIRED set.
pub fn partition_events(
    events: &HashMap<String, HotsheetRow>,
) -> (HashSet<String>, HashSet<String>) {
    let mut sold = HashSet::new();
    let mut gone = HashSet::new();
    for (id, row) in events {
        match row.status_cat.as_str() {
            "2" => {
                sold.insert(id.clone());
            }
            "4" | "5" => {
                gone.insert(id.clone());
            }
            _ => {}
        }
    }
    (sold, gone)
}

/// Decide per local row whether it is promoted, deleted, or untouched.
///
/// Promotion requires the listing to not already be SOLD; deletion only
/// touches rows currently Active or Sold, leaving Pending and the rest alone.
pub fn plan_changes(
    local: Vec<LocalListing>,
    sold: &HashSet<String>,
    gone: &HashSet<String>,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for row in local {
        if gone.contains(&row.listing_id) {
            if row.status_cat == "1" || row.status_cat == "2" {
                plan.delete.push(row);
            }
        } else if sold.contains(&row.listing_id) && row.status_cat != "2" {
            plan.promote_to_sold.push(row);
        }
    }
    plan
}

/// The cron-driven reconciler.
pub struct LifecycleReconciler {
    db: DatabaseConnection,
    client: Arc<RetsClient>,
    catalog: Arc<CatalogService>,
}

impl LifecycleReconciler {
    pub fn new(
        db: DatabaseConnection,
        client: Arc<RetsClient>,
        catalog: Arc<CatalogService>,
    ) -> Self {
        Self {
            db,
            client,
            catalog,
        }
    }

    /// Sleep-until-slot loop; runs until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(hours = ?RUN_HOURS, "starting lifecycle reconciler");
        loop {
            let wait = delay_until_next_run(Local::now());
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("lifecycle reconciler shutdown requested");
                    break;
                }
                _ = sleep(wait) => {
                    if let Err(err) = self.run_once().await {
                        error!(error = %err, "lifecycle reconciliation failed");
                    }
                }
            }
        }
        info!("lifecycle reconciler stopped");
    }

    /// One reconciliation pass.
    pub async fn run_once(&self) -> anyhow::Result<()> {
        let session = self.client.login().await?;
        let catalog = self.catalog.load(&session).await?;

        let hotsheet = catalog
            .resources
            .iter()
            .find(|r| r.resource_id == "Hotsheet");
        let Some(hotsheet) = hotsheet else {
            warn!("catalog has no Hotsheet resource, skipping reconciliation");
            return Ok(());
        };

        let mut events = Vec::new();
        for class in &hotsheet.classes {
            match self
                .fetch_hotsheet_class(&session, class.as_deref())
                .await
            {
                Ok(mut rows) => events.append(&mut rows),
                Err(err) => {
                    // Class failures are isolated; the rest of the run
                    // continues.
                    error!(
                        class = class.as_deref().unwrap_or(""),
                        error = %err,
                        "hotsheet class query failed"
                    );
                }
            }
        }

        let deduped = dedupe_latest(events);
        let (sold, gone) = partition_events(&deduped);
        info!(
            events = deduped.len(),
            sold = sold.len(),
            withdrawn_or_expired = gone.len(),
            "hotsheet snapshot loaded"
        );
        if sold.is_empty() && gone.is_empty() {
            return Ok(());
        }

        let property_tables: Vec<String> = catalog
            .resources
            .iter()
            .filter(|r| r.resource_id == "Property")
            .flat_map(|r| {
                r.classes
                    .iter()
                    .map(|class| table_name(r, class.as_deref()))
            })
            .collect();

        for table in property_tables {
            if let Err(err) = self.reconcile_table(&table, &sold, &gone).await {
                error!(table = %table, error = %err, "table reconciliation failed");
            }
        }
        Ok(())
    }

    async fn fetch_hotsheet_class(
        &self,
        session: &Session,
        class: Option<&str>,
    ) -> anyhow::Result<Vec<HotsheetRow>> {
        let since = (Utc::now() - ChronoDuration::days(1))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        let query = format!("(L_StatusCatID=2,3,4,5),(L_StatusDate={}+)", since);
        let capability = session.capability("Search")?;
        let params: Vec<(&str, String)> = vec![
            ("SearchType", "Hotsheet".to_string()),
            ("Class", class.unwrap_or("Hotsheet").to_string()),
            ("QueryType", "DMQL2".to_string()),
            ("Format", "COMPACT-DECODED".to_string()),
            ("StandardNames", "0".to_string()),
            (
                "Select",
                "L_ListingID,L_StatusDate,L_Address,L_Status,L_StatusCatID".to_string(),
            ),
            ("Query", query),
            ("Count", "1".to_string()),
        ];

        let (body, _headers) = self.client.request(session, capability, &params).await?;
        let search = parser::parse_search(&String::from_utf8_lossy(&body))?;
        if search.table.rows.is_empty() {
            // A quiet hotsheet replies 20201; that is an empty day, not a
            // class failure.
            match search.reply.as_error() {
                Some(err) if search.reply.code != 20201 => return Err(err.into()),
                _ => return Ok(Vec::new()),
            }
        }

        Ok((0..search.table.rows.len())
            .map(|i| HotsheetRow {
                listing_id: search.table.get(i, "L_ListingID").to_string(),
                status_date: search.table.get(i, "L_StatusDate").to_string(),
                address: search.table.get(i, "L_Address").to_string(),
                status: search.table.get(i, "L_Status").to_string(),
                status_cat: search.table.get(i, "L_StatusCatID").to_string(),
            })
            .filter(|row| !row.listing_id.is_empty())
            .collect())
    }

    async fn reconcile_table(
        &self,
        table: &str,
        sold: &HashSet<String>,
        gone: &HashSet<String>,
    ) -> anyhow::Result<()> {
        let union: Vec<&String> = sold.union(gone).collect();
        if union.is_empty() {
            return Ok(());
        }

        let id_list = quoted_list(union.iter().map(|s| s.as_str()));
        let stmt = Statement::from_string(
            DatabaseBackend::MySql,
            format!(
                "SELECT `L_ListingID`, `L_StatusCatID`, `L_Address` FROM `{}` WHERE `L_ListingID` IN ({})",
                table, id_list
            ),
        );
        let rows = self.db.query_all(stmt).await?;
        let local: Vec<LocalListing> = rows
            .iter()
            .filter_map(|row| {
                Some(LocalListing {
                    listing_id: row.try_get("", "L_ListingID").ok()?,
                    status_cat: row.try_get("", "L_StatusCatID").ok()?,
                    address: row.try_get("", "L_Address").unwrap_or_default(),
                })
            })
            .collect();

        let plan = plan_changes(local, sold, gone);

        if !plan.promote_to_sold.is_empty() {
            let ids = quoted_list(plan.promote_to_sold.iter().map(|r| r.listing_id.as_str()));
            self.db
                .execute(Statement::from_string(
                    DatabaseBackend::MySql,
                    format!(
                        "UPDATE `{}` SET `L_StatusCatID` = '2' WHERE `L_ListingID` IN ({})",
                        table, ids
                    ),
                ))
                .await?;
            for row in &plan.promote_to_sold {
                info!(
                    table,
                    listing_id = %row.listing_id,
                    prior_status = %row.status_cat,
                    address = %row.address,
                    "promoted listing to SOLD"
                );
            }
        }

        if !plan.delete.is_empty() {
            let ids = quoted_list(plan.delete.iter().map(|r| r.listing_id.as_str()));
            self.db
                .execute(Statement::from_string(
                    DatabaseBackend::MySql,
                    format!(
                        "DELETE FROM `{}` WHERE `L_ListingID` IN ({})",
                        table, ids
                    ),
                ))
                .await?;
            for row in &plan.delete {
                info!(
                    table,
                    listing_id = %row.listing_id,
                    prior_status = %row.status_cat,
                    address = %row.address,
                    "deleted withdrawn/expired listing"
                );
            }
        }

        Ok(())
    }
}

fn quoted_list<'a>(ids: impl Iterator<Item = &'a str>) -> String {
    ids.map(|id| format!("'{}'", id.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(id: &str, date: &str, cat: &str) -> HotsheetRow {
        HotsheetRow {
            listing_id: id.to_string(),
            status_date: date.to_string(),
            address: format!("{} Main St", id),
            status: String::new(),
            status_cat: cat.to_string(),
        }
    }

    fn local(id: &str, cat: &str) -> LocalListing {
        LocalListing {
            listing_id: id.to_string(),
            status_cat: cat.to_string(),
            address: format!("{} Main St", id),
        }
    }

    #[test]
    fn dedupe_keeps_latest_status_date() {
        let rows = vec![
            event("A", "2024-05-01T08:00:00", "3"),
            event("A", "2024-05-02T08:00:00", "2"),
            event("B", "2024-05-01T10:00:00", "4"),
        ];
        let deduped = dedupe_latest(rows);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped["A"].status_cat, "2");
        assert_eq!(deduped["B"].status_cat, "4");
    }

    #[test]
    fn partition_by_status_category() {
        let deduped = dedupe_latest(vec![
            event("A", "2024-05-01T08:00:00", "2"),
            event("B", "2024-05-01T08:00:00", "4"),
            event("C", "2024-05-01T08:00:00", "5"),
            event("D", "2024-05-01T08:00:00", "3"),
        ]);
        let (sold, gone) = partition_events(&deduped);
        assert!(sold.contains("A"));
        assert!(gone.contains("B"));
        assert!(gone.contains("C"));
        // Pending stays out of both sets.
        assert!(!sold.contains("D") && !gone.contains("D"));
    }

    #[test]
    fn plan_promotes_and_deletes_per_contract() {
        // Mirrors the reconcile scenario: A sold while locally active,
        // B withdrawn while active, C expired but locally pending.
        let sold: HashSet<String> = ["A".to_string()].into();
        let gone: HashSet<String> = ["B".to_string(), "C".to_string()].into();
        let local_rows = vec![local("A", "1"), local("B", "1"), local("C", "3")];

        let plan = plan_changes(local_rows, &sold, &gone);
        assert_eq!(plan.promote_to_sold, vec![local("A", "1")]);
        assert_eq!(plan.delete, vec![local("B", "1")]);
    }

    #[test]
    fn plan_skips_already_sold_promotion() {
        let sold: HashSet<String> = ["A".to_string()].into();
        let gone = HashSet::new();
        let plan = plan_changes(vec![local("A", "2")], &sold, &gone);
        assert!(plan.promote_to_sold.is_empty());
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn plan_deletes_sold_rows_marked_gone() {
        let sold = HashSet::new();
        let gone: HashSet<String> = ["X".to_string()].into();
        let plan = plan_changes(vec![local("X", "2")], &sold, &gone);
        assert_eq!(plan.delete.len(), 1);
    }

    #[test]
    fn rerun_with_applied_snapshot_is_noop() {
        // After the first pass A is SOLD locally and B is deleted; a second
        // pass over the same snapshot must plan nothing.
        let sold: HashSet<String> = ["A".to_string()].into();
        let gone: HashSet<String> = ["B".to_string()].into();
        let plan = plan_changes(vec![local("A", "2")], &sold, &gone);
        assert_eq!(plan, ReconcilePlan::default());
    }

    #[test]
    fn next_run_delay_targets_configured_hours() {
        let now = Local.with_ymd_and_hms(2026, 3, 10, 13, 30, 0).unwrap();
        let wait = delay_until_next_run(now);
        // Next slot is 15:00, ninety minutes away.
        assert_eq!(wait.as_secs(), 90 * 60);

        let late = Local.with_ymd_and_hms(2026, 3, 10, 22, 0, 0).unwrap();
        let wait = delay_until_next_run(late);
        // Wraps to midnight.
        assert_eq!(wait.as_secs(), 2 * 3600);
    }

    #[test]
    fn quoted_list_escapes() {
        let ids = ["A1", "B'2"];
        assert_eq!(quoted_list(ids.into_iter()), "'A1', 'B''2'");
    }
}
