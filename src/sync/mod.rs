// ABOUTME: Incremental sync core - window resolution, strategies, diffing, writes
// ABOUTME: The runner ties these together into dependency-ordered entity migrations

pub mod diff;
pub mod runner;
pub mod strategy;
pub mod window;
pub mod writer;

pub use diff::{diff, DiffResult, RelationshipItem};
pub use runner::{EntityReport, EntityStatus, MigrationRunner, RunOptions, RunSummary};
pub use strategy::transform;
pub use window::{resolve_window, ChangeWindow};
pub use writer::{
    fetch_persisted_sets, ApplyCounts, BatchWriter, PersistedSets, SqlValue, WriteBatch, WriteOp,
};
