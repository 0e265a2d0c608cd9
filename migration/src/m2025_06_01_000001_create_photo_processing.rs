//! Migration to create the photo_processing tracking table.
//!
//! One row per (listing, property class) recording pipeline status, retry
//! accounting, and the processed-photo payload.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PhotoProcessing::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PhotoProcessing::ListingId)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PhotoProcessing::PropertyType)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PhotoProcessing::Status)
                            .string_len(16)
                            .not_null()
                            .default("processing"),
                    )
                    .col(
                        ColumnDef::new(PhotoProcessing::LastProcessedAt)
                            .timestamp()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PhotoProcessing::NeedsReprocessing)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(PhotoProcessing::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(PhotoProcessing::ErrorMessage).text().null())
                    .col(ColumnDef::new(PhotoProcessing::PhotoData).json().null())
                    .primary_key(
                        Index::create()
                            .col(PhotoProcessing::ListingId)
                            .col(PhotoProcessing::PropertyType),
                    )
                    .to_owned(),
            )
            .await?;

        // The scheduler scans by eligibility; cover the two filter columns.
        manager
            .create_index(
                Index::create()
                    .name("idx_photo_processing_status_reprocess")
                    .table(PhotoProcessing::Table)
                    .col(PhotoProcessing::Status)
                    .col(PhotoProcessing::NeedsReprocessing)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_photo_processing_status_reprocess")
                    .table(PhotoProcessing::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(PhotoProcessing::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PhotoProcessing {
    Table,
    ListingId,
    PropertyType,
    Status,
    LastProcessedAt,
    NeedsReprocessing,
    RetryCount,
    ErrorMessage,
    PhotoData,
}
