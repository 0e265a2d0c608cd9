//! Migrations for the fixed tracking tables. Per-resource listing tables are
//! created at runtime by the schema generator, not here.

pub use sea_orm_migration::prelude::*;

mod m2025_06_01_000001_create_photo_processing;
mod m2025_06_01_000002_create_lookup_values;
mod m2025_06_01_000003_create_field_name_translations;
mod m2025_06_01_000004_create_property_common_lookups_view;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_06_01_000001_create_photo_processing::Migration),
            Box::new(m2025_06_01_000002_create_lookup_values::Migration),
            Box::new(m2025_06_01_000003_create_field_name_translations::Migration),
            Box::new(m2025_06_01_000004_create_property_common_lookups_view::Migration),
        ]
    }
}
