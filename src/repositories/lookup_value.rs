//! Lookup value persistence: bulk upsert of harvested domains and full loads
//! for the in-memory cache rebuild.

use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait};

use crate::models::lookup_value::{ActiveModel, Column, Entity as LookupValue, Model};

/// Upsert a harvested batch. Existing tuples get their long value and
/// metadata refreshed; the four-part key never changes.
pub async fn upsert_batch(
    db: &DatabaseConnection,
    values: Vec<ActiveModel>,
) -> Result<(), sea_orm::DbErr> {
    if values.is_empty() {
        return Ok(());
    }
    LookupValue::insert_many(values)
        .on_conflict(
            OnConflict::columns([
                Column::ResourceId,
                Column::ClassId,
                Column::FieldName,
                Column::ShortValue,
            ])
            .update_columns([Column::LongValue, Column::Metadata])
            .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

/// Load every stored lookup value; the lookup cache is rebuilt wholesale
/// from this snapshot.
pub async fn load_all(db: &DatabaseConnection) -> Result<Vec<Model>, sea_orm::DbErr> {
    LookupValue::find().all(db).await
}
