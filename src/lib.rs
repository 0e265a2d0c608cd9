//! # RETS Sync Service Library
//!
//! Core functionality for the RETS synchronization service: the protocol
//! client and parsers, the metadata catalog and schema generator, the sync
//! engine, lookup harvesting, the photo pipeline, and the lifecycle
//! reconciler.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod photos;
pub mod repositories;
pub mod rets;
pub mod sync;
pub mod telemetry;
pub use migration;
