//! Reconciliation subsystems: the incremental/full sync engine, lookup
//! harvesting, the lifecycle reconciler, and their shared helpers.

pub mod engine;
pub mod lifecycle;
pub mod lockout;
pub mod lookups;
pub mod sanitize;

pub use engine::{SyncEngine, SyncEngineConfig};
pub use lockout::LockoutSet;
