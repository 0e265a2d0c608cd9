//! Metadata catalog: resources, classes, and field definitions discovered
//! from the remote server, composed into the derived sync catalog and cached
//! on disk.

pub mod schema;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::RetsError;
use crate::rets::parser::{self, CompactTable, MetadataResponse};
use crate::rets::{RetsClient, Session};

/// File name of the derived catalog cache inside the cache directory.
pub const CATALOG_CACHE_FILE: &str = "update_fields.json";

/// RETS field types, tagged with the attributes the SQL mapping needs.
/// Lookup interpretations override the declared data type wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetsDataType {
    Int,
    Small,
    Tiny,
    Long,
    Decimal {
        max_length: Option<u32>,
        precision: Option<u32>,
    },
    Character {
        max_length: Option<u32>,
    },
    Date,
    DateTime,
    Time,
    Boolean,
    LookupRef {
        lookup_name: String,
    },
    LookupMultiRef {
        lookup_name: String,
    },
}

impl RetsDataType {
    /// True for the three temporal types whose empty values are substituted
    /// with SQL zero values instead of NULL during sanitize.
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            RetsDataType::Date | RetsDataType::DateTime | RetsDataType::Time
        )
    }
}

/// One column of a remote class table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub system_name: String,
    pub long_name: String,
    pub standard_name: String,
    pub data_type: RetsDataType,
    pub required: bool,
}

impl FieldDef {
    /// Build a field from one METADATA-TABLE row.
    pub fn from_record(table: &CompactTable, index: usize) -> Self {
        let system_name = table.get(index, "SystemName").to_string();
        let long_name = table.get(index, "LongName").to_string();
        let standard_name = table.get(index, "StandardName").to_string();
        let max_length = table.get(index, "MaximumLength").parse().ok();
        let precision = table.get(index, "Precision").parse().ok();
        let lookup_name = table.get(index, "LookupName").to_string();
        let interpretation = table.get(index, "Interpretation");

        let data_type = match interpretation {
            "Lookup" => RetsDataType::LookupRef {
                lookup_name: lookup_name.clone(),
            },
            "LookupMulti" => RetsDataType::LookupMultiRef {
                lookup_name: lookup_name.clone(),
            },
            _ => match table.get(index, "DataType") {
                "Int" => RetsDataType::Int,
                "Small" => RetsDataType::Small,
                "Tiny" => RetsDataType::Tiny,
                "Long" => RetsDataType::Long,
                "Decimal" => RetsDataType::Decimal {
                    max_length,
                    precision,
                },
                "Character" => RetsDataType::Character { max_length },
                "Date" => RetsDataType::Date,
                "DateTime" => RetsDataType::DateTime,
                "Time" => RetsDataType::Time,
                "Boolean" => RetsDataType::Boolean,
                other => {
                    if !other.is_empty() {
                        debug!(system_name = %system_name, data_type = other, "unrecognized RETS data type, storing as TEXT");
                    }
                    RetsDataType::Character { max_length: None }
                }
            },
        };

        Self {
            system_name,
            long_name,
            standard_name,
            data_type,
            required: table.get(index, "Required") == "1",
        }
    }

    /// The lookup domain this field draws from, when it has one.
    pub fn lookup_name(&self) -> Option<&str> {
        match &self.data_type {
            RetsDataType::LookupRef { lookup_name }
            | RetsDataType::LookupMultiRef { lookup_name }
                if !lookup_name.is_empty() =>
            {
                Some(lookup_name)
            }
            _ => None,
        }
    }
}

/// Whether a resource syncs incrementally from a watermark or by full reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Full,
    Partial,
}

/// Derived per-resource sync parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub resource_id: String,
    pub key_field: Option<String>,
    pub description: String,
    pub sync_interval_minutes: u32,
    /// High-watermark column, absent when the resource only supports full sync.
    pub update_field: Option<String>,
    pub sync_type: SyncType,
    /// Class names; a single `None` models a resource without classes.
    pub classes: Vec<Option<String>>,
}

/// The derived catalog, persisted as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub resources: Vec<ResourceEntry>,
}

impl Catalog {
    /// Iterate every (resource, class) pair the engine syncs.
    pub fn pairs(&self) -> impl Iterator<Item = (&ResourceEntry, Option<&str>)> {
        self.resources.iter().flat_map(|resource| {
            resource
                .classes
                .iter()
                .map(move |class| (resource, class.as_deref()))
        })
    }
}

/// Pick the update field from a class's field list: the first SystemName
/// matching `[A-Z]_UpdateDate$` that is not a user or office timestamp.
pub fn derive_update_field(fields: &[FieldDef]) -> Option<String> {
    fields
        .iter()
        .map(|f| f.system_name.as_str())
        .find(|name| {
            if name.starts_with("U_") || name.starts_with("O_") {
                return false;
            }
            match name.strip_suffix("_UpdateDate") {
                Some(prefix) => prefix.chars().last().is_some_and(|c| c.is_ascii_uppercase()),
                None => false,
            }
        })
        .map(String::from)
}

/// Sync cadence per resource family. Resources without an update field are
/// forced to the daily tier since every pass is a full reload.
pub fn derive_interval(resource_id: &str, has_update_field: bool) -> u32 {
    if !has_update_field {
        return 1440;
    }
    if resource_id.starts_with("Property") {
        1
    } else if matches!(resource_id, "Office" | "ActiveOffice" | "Agent" | "ActiveAgent") {
        60
    } else {
        1440
    }
}

/// Catalog service: fetches and composes RETS metadata, caching the result
/// in process and at `<cache_dir>/update_fields.json`.
pub struct CatalogService {
    client: Arc<RetsClient>,
    cache_path: PathBuf,
    cached: RwLock<Option<Arc<Catalog>>>,
}

impl CatalogService {
    pub fn new(client: Arc<RetsClient>, cache_dir: &Path) -> Self {
        Self {
            client,
            cache_path: cache_dir.join(CATALOG_CACHE_FILE),
            cached: RwLock::new(None),
        }
    }

    /// Returns the catalog: process cache, then disk cache, then a full
    /// remote regeneration.
    pub async fn load(&self, session: &Session) -> Result<Arc<Catalog>, RetsError> {
        if let Some(catalog) = self.cached.read().expect("catalog lock").clone() {
            return Ok(catalog);
        }
        if let Some(catalog) = self.load_disk() {
            let catalog = Arc::new(catalog);
            *self.cached.write().expect("catalog lock") = Some(catalog.clone());
            return Ok(catalog);
        }
        self.refresh(session).await
    }

    /// Regenerates the catalog from the remote server and rewrites the disk
    /// cache.
    #[instrument(skip_all)]
    pub async fn refresh(&self, session: &Session) -> Result<Arc<Catalog>, RetsError> {
        let resources = self.fetch(session, "METADATA-RESOURCE", "0").await?;
        let mut entries = Vec::new();

        for i in 0..resources.table.rows.len() {
            let resource_id = resources.table.get(i, "ResourceID").to_string();
            if resource_id.is_empty() {
                continue;
            }
            let key_field = non_empty(resources.table.get(i, "KeyField"));
            let description = resources.table.get(i, "Description").to_string();

            let classes = self.fetch_classes(session, &resource_id).await?;
            let update_field = self
                .derive_resource_update_field(session, &resource_id, &classes)
                .await?;

            let sync_type = if update_field.is_some() {
                SyncType::Partial
            } else {
                SyncType::Full
            };
            entries.push(ResourceEntry {
                sync_interval_minutes: derive_interval(&resource_id, update_field.is_some()),
                resource_id,
                key_field,
                description,
                update_field,
                sync_type,
                classes,
            });
        }

        let catalog = Arc::new(Catalog { resources: entries });
        self.store_disk(&catalog);
        *self.cached.write().expect("catalog lock") = Some(catalog.clone());
        info!(resources = catalog.resources.len(), "metadata catalog refreshed");
        Ok(catalog)
    }

    /// Drops both cache layers; the next `load` regenerates from the server.
    pub fn invalidate(&self) {
        *self.cached.write().expect("catalog lock") = None;
        if let Err(err) = fs::remove_file(&self.cache_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, "failed to remove catalog cache file");
            }
        }
    }

    /// Fetch the field definitions for one (resource, class).
    pub async fn table_fields(
        &self,
        session: &Session,
        resource: &str,
        class: Option<&str>,
    ) -> Result<Vec<FieldDef>, RetsError> {
        let id = format!("{}:{}", resource, class.unwrap_or("0"));
        let meta = self.fetch(session, "METADATA-TABLE", &id).await?;
        Ok((0..meta.table.rows.len())
            .map(|i| FieldDef::from_record(&meta.table, i))
            .collect())
    }

    /// Fetch the lookup value domain for one lookup name within a resource.
    pub async fn lookup_values(
        &self,
        session: &Session,
        resource: &str,
        lookup_name: &str,
    ) -> Result<MetadataResponse, RetsError> {
        let id = format!("{}:{}", resource, lookup_name);
        self.fetch(session, "METADATA-LOOKUP_TYPE", &id).await
    }

    async fn fetch_classes(
        &self,
        session: &Session,
        resource_id: &str,
    ) -> Result<Vec<Option<String>>, RetsError> {
        let id = format!("{}:0", resource_id);
        let meta = self.fetch(session, "METADATA-CLASS", &id).await?;
        let mut classes: Vec<Option<String>> = (0..meta.table.rows.len())
            .filter_map(|i| non_empty(meta.table.get(i, "ClassName")))
            .map(Some)
            .collect();
        if classes.is_empty() {
            // Classless resources are modeled as a single synthetic default.
            classes.push(None);
        }
        Ok(classes)
    }

    /// The update field must hold for every class of the resource; classes
    /// are probed in order and the first derivable field wins.
    async fn derive_resource_update_field(
        &self,
        session: &Session,
        resource_id: &str,
        classes: &[Option<String>],
    ) -> Result<Option<String>, RetsError> {
        for class in classes {
            let fields = self
                .table_fields(session, resource_id, class.as_deref())
                .await?;
            if let Some(field) = derive_update_field(&fields) {
                return Ok(Some(field));
            }
        }
        Ok(None)
    }

    async fn fetch(
        &self,
        session: &Session,
        metadata_type: &str,
        id: &str,
    ) -> Result<MetadataResponse, RetsError> {
        let capability = session.capability("GetMetadata")?;
        let query = [
            ("Type", metadata_type.to_string()),
            ("Format", "COMPACT".to_string()),
            ("ID", id.to_string()),
        ];
        let (body, _headers) = self.client.request(session, capability, &query).await?;
        let text = String::from_utf8_lossy(&body);
        let meta = parser::parse_metadata(&text)?;
        if let Some(err) = meta.reply.as_error() {
            return Err(err);
        }
        Ok(meta)
    }

    fn load_disk(&self) -> Option<Catalog> {
        let raw = fs::read_to_string(&self.cache_path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(catalog) => {
                debug!(path = %self.cache_path.display(), "loaded catalog from disk cache");
                Some(catalog)
            }
            Err(err) => {
                warn!(error = %err, "ignoring unreadable catalog cache");
                None
            }
        }
    }

    fn store_disk(&self, catalog: &Catalog) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.cache_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(
                &self.cache_path,
                serde_json::to_string_pretty(catalog).unwrap_or_default(),
            )
        };
        if let Err(err) = write() {
            warn!(error = %err, "failed to persist catalog cache");
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Lookup: `HashMap<resource, HashMap<system_name, FieldDef>>` built per
/// class on demand by the sync engine for sanitize decisions.
pub fn field_index(fields: &[FieldDef]) -> HashMap<&str, &FieldDef> {
    fields.iter().map(|f| (f.system_name.as_str(), f)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(system_name: &str) -> FieldDef {
        FieldDef {
            system_name: system_name.to_string(),
            long_name: String::new(),
            standard_name: String::new(),
            data_type: RetsDataType::DateTime,
            required: false,
        }
    }

    #[test]
    fn update_field_prefers_first_match() {
        let fields = vec![field("L_ListingID"), field("L_UpdateDate"), field("P_UpdateDate")];
        assert_eq!(derive_update_field(&fields).as_deref(), Some("L_UpdateDate"));
    }

    #[test]
    fn update_field_skips_user_and_office_prefixes() {
        let fields = vec![field("U_UpdateDate"), field("O_UpdateDate")];
        assert_eq!(derive_update_field(&fields), None);

        let fields = vec![field("U_UpdateDate"), field("A_UpdateDate")];
        assert_eq!(derive_update_field(&fields).as_deref(), Some("A_UpdateDate"));
    }

    #[test]
    fn update_field_requires_uppercase_letter_before_suffix() {
        // A bare "UpdateDate" or a lowercase prefix must not match; any name
        // ending in an uppercase letter plus "_UpdateDate" does.
        let fields = vec![field("UpdateDate"), field("x_UpdateDate")];
        assert_eq!(derive_update_field(&fields), None);

        let fields = vec![field("LO_UpdateDate")];
        assert_eq!(derive_update_field(&fields).as_deref(), Some("LO_UpdateDate"));
    }

    #[test]
    fn interval_tiers() {
        assert_eq!(derive_interval("Property_RE_1", true), 1);
        assert_eq!(derive_interval("PropertyWithheld", true), 1);
        assert_eq!(derive_interval("Agent", true), 60);
        assert_eq!(derive_interval("ActiveOffice", true), 60);
        assert_eq!(derive_interval("OpenHouse", true), 1440);
        // No update field forces the daily tier even for Property.
        assert_eq!(derive_interval("Property", false), 1440);
    }

    #[test]
    fn field_def_lookup_interpretation_overrides_type() {
        let mut table = CompactTable::default();
        table.columns = vec![
            "SystemName".into(),
            "LongName".into(),
            "DataType".into(),
            "MaximumLength".into(),
            "Interpretation".into(),
            "LookupName".into(),
        ];
        table.rows = vec![
            vec!["L_Status".into(), "Status".into(), "Character".into(), "20".into(), "Lookup".into(), "STATUS".into()],
            vec!["L_Features".into(), "Features".into(), "Character".into(), "".into(), "LookupMulti".into(), "FEATURES".into()],
            vec!["L_Price".into(), "Price".into(), "Decimal".into(), "12".into(), "".into(), "".into()],
        ];

        let status = FieldDef::from_record(&table, 0);
        assert_eq!(
            status.data_type,
            RetsDataType::LookupRef { lookup_name: "STATUS".into() }
        );
        assert_eq!(status.lookup_name(), Some("STATUS"));

        let features = FieldDef::from_record(&table, 1);
        assert_eq!(
            features.data_type,
            RetsDataType::LookupMultiRef { lookup_name: "FEATURES".into() }
        );

        let price = FieldDef::from_record(&table, 2);
        assert_eq!(
            price.data_type,
            RetsDataType::Decimal { max_length: Some(12), precision: None }
        );
        assert_eq!(price.lookup_name(), None);
    }

    #[test]
    fn catalog_pairs_expands_classes() {
        let catalog = Catalog {
            resources: vec![
                ResourceEntry {
                    resource_id: "Property".into(),
                    key_field: Some("L_ListingID".into()),
                    description: String::new(),
                    sync_interval_minutes: 1,
                    update_field: Some("L_UpdateDate".into()),
                    sync_type: SyncType::Partial,
                    classes: vec![Some("RE_1".into()), Some("MF_4".into())],
                },
                ResourceEntry {
                    resource_id: "Agent".into(),
                    key_field: None,
                    description: String::new(),
                    sync_interval_minutes: 60,
                    update_field: None,
                    sync_type: SyncType::Full,
                    classes: vec![None],
                },
            ],
        };

        let pairs: Vec<(String, Option<String>)> = catalog
            .pairs()
            .map(|(r, c)| (r.resource_id.clone(), c.map(String::from)))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("Property".to_string(), Some("RE_1".to_string())),
                ("Property".to_string(), Some("MF_4".to_string())),
                ("Agent".to_string(), None),
            ]
        );
    }
}
