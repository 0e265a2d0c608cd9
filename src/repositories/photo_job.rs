//! Photo job tracking: status transitions and batch candidate selection.

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseBackend,
    DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, Statement,
};
use serde_json::Value as JsonValue;

use crate::models::photo_job::{
    ActiveModel, Column, Entity as PhotoJob, Model, STATUS_COMPLETED, STATUS_FAILED,
    STATUS_PROCESSING,
};

/// A listing eligible for photo processing, pulled from the union of the
/// property tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoCandidate {
    pub listing_id: String,
    pub property_type: String,
}

/// Union body over the property tables: every active/sold listing that has
/// no job yet or is flagged for reprocessing.
fn union_sql(property_tables: &[(String, String)]) -> String {
    let arms: Vec<String> = property_tables
        .iter()
        .map(|(table, class)| {
            format!(
                "SELECT p.`L_ListingID` AS listing_id, '{class}' AS property_type, \
                 p.`L_StatusCatID` AS status_cat, p.`L_Last_Photo_updt` AS last_photo_update, \
                 COALESCE(pp.`needs_reprocessing`, 0) AS needs_reprocessing \
                 FROM `{table}` p \
                 LEFT JOIN `photo_processing` pp \
                   ON pp.`listing_id` = p.`L_ListingID` AND pp.`property_type` = '{class}' \
                 WHERE p.`L_StatusCatID` IN ('1','2') \
                   AND (pp.`listing_id` IS NULL OR pp.`needs_reprocessing` = 1)",
                table = table,
                class = class,
            )
        })
        .collect();
    arms.join(" UNION ALL ")
}

/// Batch selection: reprocess requests first, then active before sold,
/// newest photo activity first.
fn candidate_sql(property_tables: &[(String, String)], limit: Option<u32>) -> String {
    let mut sql = format!(
        "SELECT listing_id, property_type FROM ({}) AS candidates \
         ORDER BY needs_reprocessing DESC, status_cat ASC, last_photo_update DESC",
        union_sql(property_tables)
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    sql
}

/// Select the next processing batch.
pub async fn next_batch(
    db: &DatabaseConnection,
    property_tables: &[(String, String)],
    limit: u32,
) -> Result<Vec<PhotoCandidate>, sea_orm::DbErr> {
    if property_tables.is_empty() {
        return Ok(Vec::new());
    }
    let stmt = Statement::from_string(
        DatabaseBackend::MySql,
        candidate_sql(property_tables, Some(limit)),
    );
    let rows = db.query_all(stmt).await?;
    rows.iter()
        .map(|row| {
            Ok(PhotoCandidate {
                listing_id: row.try_get("", "listing_id")?,
                property_type: row.try_get("", "property_type")?,
            })
        })
        .collect()
}

/// Count all listings still waiting for processing; drives the scheduler's
/// Normal/Aggressive mode decision.
pub async fn backlog_count(
    db: &DatabaseConnection,
    property_tables: &[(String, String)],
) -> Result<u64, sea_orm::DbErr> {
    if property_tables.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "SELECT COUNT(*) AS backlog FROM ({}) AS candidates",
        union_sql(property_tables)
    );
    let stmt = Statement::from_string(DatabaseBackend::MySql, sql);
    let row = db.query_one(stmt).await?;
    match row {
        Some(row) => row.try_get::<i64>("", "backlog").map(|n| n.max(0) as u64),
        None => Ok(0),
    }
}

/// Claim a candidate: upsert its job row to `processing` and drop the
/// reprocess flag.
pub async fn mark_processing(
    db: &DatabaseConnection,
    listing_id: &str,
    property_type: &str,
) -> Result<(), sea_orm::DbErr> {
    let job = ActiveModel {
        listing_id: Set(listing_id.to_string()),
        property_type: Set(property_type.to_string()),
        status: Set(STATUS_PROCESSING.to_string()),
        last_processed_at: Set(Some(Utc::now())),
        needs_reprocessing: Set(false),
        retry_count: Set(0),
        error_message: Set(None),
        photo_data: Set(None),
    };
    PhotoJob::insert(job)
        .on_conflict(
            OnConflict::columns([Column::ListingId, Column::PropertyType])
                .update_columns([
                    Column::Status,
                    Column::LastProcessedAt,
                    Column::NeedsReprocessing,
                ])
                .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

/// Record success with the processed-photo payload.
pub async fn mark_completed(
    db: &DatabaseConnection,
    listing_id: &str,
    property_type: &str,
    photo_data: JsonValue,
) -> Result<(), sea_orm::DbErr> {
    if let Some(existing) = find(db, listing_id, property_type).await? {
        let mut job: ActiveModel = existing.into();
        job.status = Set(STATUS_COMPLETED.to_string());
        job.last_processed_at = Set(Some(Utc::now()));
        job.error_message = Set(None);
        job.photo_data = Set(Some(photo_data));
        job.update(db).await?;
    }
    Ok(())
}

/// Record failure, bumping the retry counter.
pub async fn mark_failed(
    db: &DatabaseConnection,
    listing_id: &str,
    property_type: &str,
    error_message: &str,
) -> Result<(), sea_orm::DbErr> {
    if let Some(existing) = find(db, listing_id, property_type).await? {
        let retry_count = existing.retry_count + 1;
        let mut job: ActiveModel = existing.into();
        job.status = Set(STATUS_FAILED.to_string());
        job.last_processed_at = Set(Some(Utc::now()));
        job.retry_count = Set(retry_count);
        job.error_message = Set(Some(error_message.to_string()));
        job.update(db).await?;
    }
    Ok(())
}

pub async fn find(
    db: &DatabaseConnection,
    listing_id: &str,
    property_type: &str,
) -> Result<Option<Model>, sea_orm::DbErr> {
    PhotoJob::find_by_id((listing_id.to_string(), property_type.to_string()))
        .one(db)
        .await
}

/// Number of jobs currently in `failed` state.
pub async fn failed_count(db: &DatabaseConnection) -> Result<u64, sea_orm::DbErr> {
    PhotoJob::find()
        .filter(Column::Status.eq(STATUS_FAILED))
        .count(db)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Vec<(String, String)> {
        vec![
            ("Property_RE_1".to_string(), "RE_1".to_string()),
            ("Property_MF_4".to_string(), "MF_4".to_string()),
        ]
    }

    #[test]
    fn candidate_sql_unions_each_property_table() {
        let sql = candidate_sql(&tables(), Some(5));
        assert!(sql.contains("FROM `Property_RE_1` p"));
        assert!(sql.contains("FROM `Property_MF_4` p"));
        assert!(sql.contains("'RE_1' AS property_type"));
        assert!(sql.contains("'MF_4' AS property_type"));
        assert_eq!(sql.matches("UNION ALL").count(), 1);
        assert!(sql.ends_with("LIMIT 5"));
    }

    #[test]
    fn candidate_sql_filters_and_orders_per_contract() {
        let sql = candidate_sql(&tables(), None);
        assert!(sql.contains("`L_StatusCatID` IN ('1','2')"));
        assert!(sql.contains("pp.`listing_id` IS NULL OR pp.`needs_reprocessing` = 1"));
        assert!(sql.contains(
            "ORDER BY needs_reprocessing DESC, status_cat ASC, last_photo_update DESC"
        ));
        assert!(!sql.contains("LIMIT"));
    }
}
