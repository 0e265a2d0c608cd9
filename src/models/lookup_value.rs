//! LookupValue entity: one decoded value of a RETS lookup domain.

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

/// Row in `lookup_values`. The four-part key is globally unique.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "lookup_values")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub resource_id: String,

    /// Class the value was harvested under; `COMMON` is reserved for the
    /// synthetic Property-wide class in the in-memory cache.
    #[sea_orm(primary_key, auto_increment = false)]
    pub class_id: String,

    #[sea_orm(primary_key, auto_increment = false)]
    pub field_name: String,

    #[sea_orm(primary_key, auto_increment = false)]
    pub short_value: String,

    pub long_value: String,

    /// `{"sort": <i64>, "active": <bool>, ...}`; sort defaults to the numeric
    /// short value, 0 when non-numeric.
    #[sea_orm(column_type = "Json")]
    pub metadata: JsonValue,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
