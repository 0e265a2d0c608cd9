//! FieldNameTranslation entity: SystemName to visible-name mapping emitted
//! alongside the `_visible` table family.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "field_name_translations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub resource_id: String,

    /// Empty string for classless resources (MySQL disallows NULL in a
    /// composite primary key).
    #[sea_orm(primary_key, auto_increment = false)]
    pub class_id: String,

    #[sea_orm(primary_key, auto_increment = false)]
    pub system_name: String,

    pub visible_name: String,

    pub long_name: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
