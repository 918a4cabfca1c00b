//! Tyk gateway data migration.
//!
//! Copies API definitions, certificates, portal developers and dashboard admin
//! keys out of the Redis keyspace a Tyk deployment writes, and upserts them
//! into PostgreSQL tables. Each record is handled in isolation: a key that
//! cannot be read, decoded or written is reported and the run moves on.
//!
//! The [`MigrationRunner`] drives the work over any [`SourceStore`] and
//! [`TargetStore`]. [`RedisSource`] and [`PostgresTarget`] are the production
//! stores; [`memory`] holds in-process doubles.

pub mod cancel;
pub mod config;
pub mod errors;
pub mod keys;
pub mod memory;
pub mod records;
pub mod rows;
pub mod runner;
pub mod source;
pub mod target;

pub use cancel::{CancelHandle, RunGuard};
pub use config::MigrateConfig;
pub use errors::*;
pub use keys::Category;
pub use records::{RawValue, SourceRecord};
pub use rows::{ColumnValue, DefaultedField, TargetRow, UpsertStatement, map_record};
pub use runner::{
    CategoryOutcome, CommitStrategy, MigrationObserver, MigrationReport, MigrationRunner, MigrationStats,
    NoopObserver, RecordFailure, RecordOutcome, RunOptions, RunState, RunStatus,
};
pub use source::{RedisSource, SourceStore};
pub use target::{PostgresTarget, TargetStore};

pub use redis;
pub use sqlx;
