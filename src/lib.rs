// ABOUTME: Library crate for mongo-pg-sync
// ABOUTME: Incremental, idempotent MongoDB to PostgreSQL migration core

pub mod config;
pub mod mongo;
pub mod postgres;
pub mod report;
pub mod schema;
pub mod sync;
