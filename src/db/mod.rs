//! Database module: models and schema for persistent storage.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows
//! - `schema.rs`: SQL DDL for initializing the database (SQLite-first)
//!
//! The store is the sole shared mutable state of the engine; every mutation
//! goes through the actor, which also generates the monotone `job_id` /
//! `event_id` counters and enforces the store-boundary invariants (phase
//! graph, progress monotonicity, publish-url write-once, one retry child).

pub mod actor;
pub mod models;
pub mod patch;
pub mod schema;
pub mod traits;

mod patch_impl;

pub use models::{
    FailEventRow, JobEventRecord, JobFilter, JobPhase, JobRecord, JobStatus, ScanResultRecord,
    ScanRunRecord,
};
pub use patch::{JobCreate, JobPatch, ScanResultCreate, ScanRunCreate};
pub use schema::SQLITE_INIT;

pub use actor::{DbActorHandle, spawn};
