//! Migration to create the property_common_lookups view.
//!
//! Exposes only the lookup tuples that appear under every class of the
//! Property resource. The class count is computed from the data, so the view
//! tracks catalog changes without redefinition.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

const CREATE_VIEW: &str = r#"
CREATE OR REPLACE VIEW property_common_lookups AS
SELECT
    field_name,
    short_value,
    ANY_VALUE(long_value) AS long_value,
    ANY_VALUE(metadata) AS metadata
FROM lookup_values
WHERE resource_id = 'Property'
GROUP BY field_name, short_value
HAVING COUNT(DISTINCT class_id) = (
    SELECT COUNT(DISTINCT class_id)
    FROM lookup_values
    WHERE resource_id = 'Property'
)
"#;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                CREATE_VIEW.to_string(),
            ))
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP VIEW IF EXISTS property_common_lookups".to_string(),
            ))
            .await?;
        Ok(())
    }
}
