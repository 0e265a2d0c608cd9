//! Migration to create the lookup_values table.
//!
//! Holds every harvested lookup domain value, unique on the four-part key.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LookupValues::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LookupValues::ResourceId)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LookupValues::ClassId)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LookupValues::FieldName)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LookupValues::ShortValue)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(LookupValues::LongValue).text().not_null())
                    .col(ColumnDef::new(LookupValues::Metadata).json().not_null())
                    .primary_key(
                        Index::create()
                            .col(LookupValues::ResourceId)
                            .col(LookupValues::ClassId)
                            .col(LookupValues::FieldName)
                            .col(LookupValues::ShortValue),
                    )
                    .to_owned(),
            )
            .await?;

        // The common-lookup view groups by field within a resource.
        manager
            .create_index(
                Index::create()
                    .name("idx_lookup_values_resource_field")
                    .table(LookupValues::Table)
                    .col(LookupValues::ResourceId)
                    .col(LookupValues::FieldName)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_lookup_values_resource_field")
                    .table(LookupValues::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(LookupValues::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum LookupValues {
    Table,
    ResourceId,
    ClassId,
    FieldName,
    ShortValue,
    LongValue,
    Metadata,
}
