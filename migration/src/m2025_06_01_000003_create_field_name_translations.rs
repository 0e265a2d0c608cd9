//! Migration to create the field_name_translations table.
//!
//! Maps RETS SystemNames to the human-readable names used by the `_visible`
//! table family.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FieldNameTranslations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FieldNameTranslations::ResourceId)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FieldNameTranslations::ClassId)
                            .string_len(64)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(FieldNameTranslations::SystemName)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FieldNameTranslations::VisibleName)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FieldNameTranslations::LongName)
                            .string_len(255)
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(FieldNameTranslations::ResourceId)
                            .col(FieldNameTranslations::ClassId)
                            .col(FieldNameTranslations::SystemName),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(FieldNameTranslations::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum FieldNameTranslations {
    Table,
    ResourceId,
    ClassId,
    SystemName,
    VisibleName,
    LongName,
}
