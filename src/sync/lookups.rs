//! Lookup harvesting: pulls every lookup domain referenced by the catalog
//! into `lookup_values`, snapshots the harvest for audit, and rebuilds the
//! in-memory cache consumed by decoders.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sea_orm::{ActiveValue::Set, DatabaseConnection};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{Catalog, CatalogService};
use crate::models::lookup_value::{ActiveModel, Model};
use crate::repositories::lookup_value as lookup_repo;
use crate::rets::Session;

/// File name of the audit snapshot inside the cache directory.
pub const LOOKUP_SNAPSHOT_FILE: &str = "lookup_values.json";

/// Synthetic class for Property-wide lookups in the in-memory cache.
pub const COMMON_CLASS: &str = "COMMON";

/// One decoded lookup value as cached in memory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedLookup {
    pub long_value: String,
    pub sort: i64,
    pub active: Option<bool>,
}

/// `resource → class → field → short_value` index, rebuilt wholesale so
/// readers only ever observe a complete snapshot.
#[derive(Debug, Default)]
pub struct LookupCache {
    map: HashMap<String, HashMap<String, HashMap<String, HashMap<String, CachedLookup>>>>,
}

impl LookupCache {
    /// Build the cache from the persisted rows, deriving the `COMMON` class
    /// for tuples present under every class of the Property resource.
    pub fn build(rows: &[Model], property_class_count: usize) -> Self {
        let mut map: HashMap<String, HashMap<String, HashMap<String, HashMap<String, CachedLookup>>>> =
            HashMap::new();
        // (field, short) → set of Property classes carrying it.
        let mut property_coverage: HashMap<(String, String), HashSet<String>> = HashMap::new();

        for row in rows {
            let cached = CachedLookup {
                long_value: row.long_value.clone(),
                sort: row
                    .metadata
                    .get("sort")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                active: row.metadata.get("active").and_then(|v| v.as_bool()),
            };
            if row.resource_id == "Property" {
                property_coverage
                    .entry((row.field_name.clone(), row.short_value.clone()))
                    .or_default()
                    .insert(row.class_id.clone());
            }
            map.entry(row.resource_id.clone())
                .or_default()
                .entry(row.class_id.clone())
                .or_default()
                .entry(row.field_name.clone())
                .or_default()
                .insert(row.short_value.clone(), cached);
        }

        if property_class_count > 0 {
            let mut common: HashMap<String, HashMap<String, CachedLookup>> = HashMap::new();
            for ((field, short), classes) in &property_coverage {
                if classes.len() != property_class_count {
                    continue;
                }
                // Any covering class supplies the value; they are identical
                // by harvest construction.
                if let Some(class) = classes.iter().next() {
                    if let Some(cached) = map
                        .get("Property")
                        .and_then(|c| c.get(class))
                        .and_then(|f| f.get(field))
                        .and_then(|s| s.get(short))
                    {
                        common
                            .entry(field.clone())
                            .or_default()
                            .insert(short.clone(), cached.clone());
                    }
                }
            }
            map.entry("Property".to_string())
                .or_default()
                .insert(COMMON_CLASS.to_string(), common);
        }

        Self { map }
    }

    pub fn get(
        &self,
        resource: &str,
        class: &str,
        field: &str,
        short_value: &str,
    ) -> Option<&CachedLookup> {
        self.map
            .get(resource)?
            .get(class)?
            .get(field)?
            .get(short_value)
    }

    pub fn len(&self) -> usize {
        self.map
            .values()
            .flat_map(|c| c.values())
            .flat_map(|f| f.values())
            .map(|s| s.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default sort order: the numeric short value, 0 when non-numeric.
pub fn default_sort(short_value: &str) -> i64 {
    short_value.trim().parse().unwrap_or(0)
}

/// Lookup harvester.
pub struct LookupSync {
    db: DatabaseConnection,
    catalog: Arc<CatalogService>,
    snapshot_path: PathBuf,
}

impl LookupSync {
    pub fn new(db: DatabaseConnection, catalog: Arc<CatalogService>, cache_dir: &Path) -> Self {
        Self {
            db,
            catalog,
            snapshot_path: cache_dir.join(LOOKUP_SNAPSHOT_FILE),
        }
    }

    /// Harvest every lookup domain in the catalog, upsert the values, write
    /// the audit snapshot, and return the rebuilt cache.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        session: &Session,
        catalog: &Catalog,
    ) -> anyhow::Result<LookupCache> {
        let mut harvested: u64 = 0;

        for resource in &catalog.resources {
            for class in &resource.classes {
                let class_id = class.as_deref().unwrap_or("");
                let fields = match self
                    .catalog
                    .table_fields(session, &resource.resource_id, class.as_deref())
                    .await
                {
                    Ok(fields) => fields,
                    Err(err) => {
                        warn!(
                            resource = %resource.resource_id,
                            class = class_id,
                            error = %err,
                            "skipping class during lookup harvest"
                        );
                        continue;
                    }
                };

                // field name → lookup name; fetch each unique lookup once.
                let mut by_lookup: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for field in &fields {
                    if let Some(lookup) = field.lookup_name() {
                        by_lookup
                            .entry(lookup.to_string())
                            .or_default()
                            .push(field.system_name.clone());
                    }
                }

                for (lookup_name, field_names) in by_lookup {
                    let meta = match self
                        .catalog
                        .lookup_values(session, &resource.resource_id, &lookup_name)
                        .await
                    {
                        Ok(meta) => meta,
                        Err(err) => {
                            warn!(
                                resource = %resource.resource_id,
                                lookup = %lookup_name,
                                error = %err,
                                "lookup fetch failed"
                            );
                            continue;
                        }
                    };

                    let mut batch = Vec::new();
                    for i in 0..meta.table.rows.len() {
                        let short = {
                            let value = meta.table.get(i, "Value");
                            if value.is_empty() {
                                meta.table.get(i, "ShortValue")
                            } else {
                                value
                            }
                        };
                        if short.is_empty() {
                            continue;
                        }
                        let long = meta.table.get(i, "LongValue");
                        let mut metadata = json!({ "sort": default_sort(short) });
                        let active = meta.table.get(i, "Active");
                        if !active.is_empty() {
                            metadata["active"] = json!(active == "1");
                        }

                        for field_name in &field_names {
                            batch.push(ActiveModel {
                                resource_id: Set(resource.resource_id.clone()),
                                class_id: Set(class_id.to_string()),
                                field_name: Set(field_name.clone()),
                                short_value: Set(short.to_string()),
                                long_value: Set(long.to_string()),
                                metadata: Set(metadata.clone()),
                            });
                        }
                    }

                    harvested += batch.len() as u64;
                    lookup_repo::upsert_batch(&self.db, batch).await?;
                }
            }
        }

        let rows = lookup_repo::load_all(&self.db).await?;
        self.write_snapshot(&rows);

        let property_class_count = catalog
            .resources
            .iter()
            .find(|r| r.resource_id == "Property")
            .map(|r| r.classes.iter().filter(|c| c.is_some()).count())
            .unwrap_or(0);
        let cache = LookupCache::build(&rows, property_class_count);
        info!(
            harvested,
            cached = cache.len(),
            "lookup harvest complete"
        );
        Ok(cache)
    }

    fn write_snapshot(&self, rows: &[Model]) {
        #[derive(Serialize)]
        struct SnapshotRow<'a> {
            resource_id: &'a str,
            class_id: &'a str,
            field_name: &'a str,
            short_value: &'a str,
            long_value: &'a str,
            metadata: &'a serde_json::Value,
        }

        let snapshot: Vec<SnapshotRow> = rows
            .iter()
            .map(|r| SnapshotRow {
                resource_id: &r.resource_id,
                class_id: &r.class_id,
                field_name: &r.field_name,
                short_value: &r.short_value,
                long_value: &r.long_value,
                metadata: &r.metadata,
            })
            .collect();

        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.snapshot_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(
                &self.snapshot_path,
                serde_json::to_string_pretty(&snapshot).unwrap_or_default(),
            )
        };
        if let Err(err) = write() {
            warn!(error = %err, "failed to write lookup snapshot");
        } else {
            debug!(path = %self.snapshot_path.display(), rows = rows.len(), "lookup snapshot written");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(class: &str, field: &str, short: &str, long: &str, sort: i64) -> Model {
        Model {
            resource_id: "Property".into(),
            class_id: class.into(),
            field_name: field.into(),
            short_value: short.into(),
            long_value: long.into(),
            metadata: json!({ "sort": sort }),
        }
    }

    #[test]
    fn default_sort_parses_numeric_short_values() {
        assert_eq!(default_sort("12"), 12);
        assert_eq!(default_sort(" 7 "), 7);
        assert_eq!(default_sort("RES"), 0);
        assert_eq!(default_sort(""), 0);
    }

    #[test]
    fn cache_indexes_by_resource_class_field_short() {
        let rows = vec![row("RE_1", "L_Status", "1", "Active", 1)];
        let cache = LookupCache::build(&rows, 4);
        let hit = cache.get("Property", "RE_1", "L_Status", "1").unwrap();
        assert_eq!(hit.long_value, "Active");
        assert_eq!(hit.sort, 1);
        assert!(cache.get("Property", "RE_1", "L_Status", "9").is_none());
        assert!(cache.get("Agent", "RE_1", "L_Status", "1").is_none());
    }

    #[test]
    fn common_class_requires_full_coverage() {
        let rows = vec![
            row("RE_1", "L_Status", "1", "Active", 1),
            row("MF_4", "L_Status", "1", "Active", 1),
            // Only two of three classes carry short value "2".
            row("CI_3", "L_Status", "1", "Active", 1),
            row("RE_1", "L_Status", "2", "Sold", 2),
            row("MF_4", "L_Status", "2", "Sold", 2),
        ];
        let cache = LookupCache::build(&rows, 3);

        assert!(cache.get("Property", COMMON_CLASS, "L_Status", "1").is_some());
        assert!(cache.get("Property", COMMON_CLASS, "L_Status", "2").is_none());
    }

    #[test]
    fn common_class_absent_without_property_classes() {
        let rows = vec![row("RE_1", "L_Status", "1", "Active", 1)];
        let cache = LookupCache::build(&rows, 0);
        assert!(cache.get("Property", COMMON_CLASS, "L_Status", "1").is_none());
    }

    #[test]
    fn cache_len_counts_values_including_common() {
        let rows = vec![
            row("RE_1", "L_Status", "1", "Active", 1),
            row("MF_4", "L_Status", "1", "Active", 1),
        ];
        let cache = LookupCache::build(&rows, 2);
        // Two class entries plus one derived COMMON entry.
        assert_eq!(cache.len(), 3);
        assert!(!cache.is_empty());
    }
}
