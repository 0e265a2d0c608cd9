//! SeaORM entities for the fixed tracking tables. The per-resource listing
//! tables are created at runtime from RETS metadata and accessed through raw
//! statements instead.

pub mod field_name_translation;
pub mod lookup_value;
pub mod photo_job;
