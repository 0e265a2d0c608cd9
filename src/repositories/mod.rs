//! Data access for the tracking tables. Raw-statement access to the dynamic
//! listing tables lives with the sync engine and photo scheduler instead.

pub mod lookup_value;
pub mod photo_job;
