//! PhotoJob entity: per-listing photo processing state.

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

/// Row in `photo_processing`, keyed by listing and property class.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "photo_processing")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub listing_id: String,

    /// Property class the listing belongs to (`RE_1`, `MF_4`, `CI_3`, `LD_2`).
    #[sea_orm(primary_key, auto_increment = false)]
    pub property_type: String,

    /// `processing`, `completed`, or `failed`.
    pub status: String,

    pub last_processed_at: Option<DateTimeUtc>,

    /// Forces the next scheduler pass to pick the listing up again,
    /// irrespective of status.
    pub needs_reprocessing: bool,

    pub retry_count: i32,

    pub error_message: Option<String>,

    /// Processed-photo array (variants, dimensions, dominant color) recorded
    /// on completion.
    #[sea_orm(column_type = "Json", nullable)]
    pub photo_data: Option<JsonValue>,
}

/// Job status values.
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
