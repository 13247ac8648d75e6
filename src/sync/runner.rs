// ABOUTME: Migration orchestrator - runs entities in dependency order
// ABOUTME: One entity failing is recorded and skipped; the run continues

use anyhow::{Context, Result};
use bson::Document;
use chrono::{DateTime, Utc};
use std::time::Instant;
use tokio_postgres::Client;

use crate::mongo::{self, DocumentCursor};
use crate::postgres;
use crate::schema::{validate_registry, EntitySchema, StrategyKind};
use crate::sync::strategy::{self, document_id};
use crate::sync::window::resolve_window;
use crate::sync::writer::{
    fetch_persisted_sets, ApplyCounts, BatchWriter, PersistedSets, WriteBatch,
};

/// Run-level tuning knobs; entity schemas may override the threshold.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: u64,
    pub diff_threshold: f64,
    /// Optional earlier boundary; can only widen each entity's window.
    pub override_boundary: Option<DateTime<Utc>>,
    /// Restrict the run to a named subset of entities.
    pub entities: Option<Vec<String>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            batch_size: mongo::DEFAULT_PAGE_SIZE,
            diff_threshold: 0.3,
            override_boundary: None,
            entities: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityStatus {
    /// Migrated to completion.
    Done,
    /// Nothing to do inside the change window.
    Skipped,
    /// Aborted partway; the message carries the first batch error.
    Failed(String),
}

/// Per-entity outcome for the run summary. Counts accumulate as batches
/// commit, so a Failed entity still reports what landed before the error.
#[derive(Debug, Clone)]
pub struct EntityReport {
    pub entity: String,
    pub table: String,
    pub records_read: u64,
    pub rows_written: u64,
    pub rows_deleted: u64,
    pub status: EntityStatus,
}

impl EntityReport {
    fn new(schema: &EntitySchema) -> Self {
        EntityReport {
            entity: schema.entity.clone(),
            table: schema.table.clone(),
            records_read: 0,
            rows_written: 0,
            rows_deleted: 0,
            status: EntityStatus::Done,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub entities: Vec<EntityReport>,
    pub duration_ms: u128,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        !self
            .entities
            .iter()
            .any(|e| matches!(e.status, EntityStatus::Failed(_)))
    }

    pub fn total_written(&self) -> u64 {
        self.entities.iter().map(|e| e.rows_written).sum()
    }

    pub fn total_deleted(&self) -> u64 {
        self.entities.iter().map(|e| e.rows_deleted).sum()
    }
}

/// Per-entity I/O surface the orchestrator drives: window resolution and
/// paging on one side, persisted-set reads and batch writes on the other.
pub(crate) trait EntityIo {
    /// Resolve the change window, perform any forced truncate, and prepare
    /// the page stream. Returns the number of matching source documents.
    async fn open(
        &mut self,
        schema: &EntitySchema,
        override_boundary: Option<DateTime<Utc>>,
        page_size: u64,
    ) -> Result<u64>;

    async fn next_page(&mut self) -> Result<Option<Vec<Document>>>;

    async fn persisted_sets(
        &mut self,
        schema: &EntitySchema,
        parents: &[String],
    ) -> Result<PersistedSets>;

    async fn apply(&mut self, batch: &WriteBatch) -> Result<ApplyCounts>;
}

/// Production wiring: MongoDB pages in, PostgreSQL batches out.
struct StoreIo<'a> {
    source: &'a mongodb::Database,
    target: &'a mut Client,
    cursor: Option<DocumentCursor>,
}

impl EntityIo for StoreIo<'_> {
    async fn open(
        &mut self,
        schema: &EntitySchema,
        override_boundary: Option<DateTime<Utc>>,
        page_size: u64,
    ) -> Result<u64> {
        let window = resolve_window(self.target, schema, override_boundary)
            .await
            .context("Failed to resolve change window")?;

        if window.resync && schema.truncate {
            postgres::truncate_table(self.target, &schema.table).await?;
        }

        let filter = mongo::build_filter(schema, &window);
        let cursor = DocumentCursor::new(self.source, schema, filter, page_size);
        let total = cursor.count().await?;
        self.cursor = Some(cursor);
        Ok(total)
    }

    async fn next_page(&mut self) -> Result<Option<Vec<Document>>> {
        match self.cursor.as_mut() {
            Some(cursor) => cursor.next_page().await,
            None => Ok(None),
        }
    }

    async fn persisted_sets(
        &mut self,
        schema: &EntitySchema,
        parents: &[String],
    ) -> Result<PersistedSets> {
        fetch_persisted_sets(self.target, &schema.table, schema.relation()?, parents).await
    }

    async fn apply(&mut self, batch: &WriteBatch) -> Result<ApplyCounts> {
        BatchWriter::new(self.target).apply(batch).await
    }
}

/// Drives a full migration run across the configured entities.
pub struct MigrationRunner {
    schemas: Vec<EntitySchema>,
    options: RunOptions,
}

impl MigrationRunner {
    /// Validate the registry, apply any entity subset, and fix the
    /// execution order. Selecting an unknown entity is an error so a
    /// typo cannot silently run nothing.
    pub fn new(registry: Vec<EntitySchema>, options: RunOptions) -> Result<Self> {
        validate_registry(&registry)?;

        let mut schemas = match &options.entities {
            Some(wanted) => {
                for name in wanted {
                    if !registry.iter().any(|s| &s.entity == name) {
                        anyhow::bail!("Unknown entity '{}' in selection", name);
                    }
                }
                registry
                    .into_iter()
                    .filter(|s| wanted.contains(&s.entity))
                    .collect()
            }
            None => registry,
        };
        schemas.sort_by_key(|s| s.order);

        Ok(MigrationRunner { schemas, options })
    }

    /// Run every selected entity in order against the live stores.
    pub async fn run(
        &self,
        source: &mongodb::Database,
        target: &mut Client,
    ) -> Result<RunSummary> {
        let mut io = StoreIo {
            source,
            target,
            cursor: None,
        };
        Ok(self.run_with(&mut io).await)
    }

    /// Entity loop: failures are recorded on the report, with the counts
    /// of already-committed batches intact, and the run continues with
    /// the next entity.
    pub(crate) async fn run_with(&self, io: &mut impl EntityIo) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        for schema in &self.schemas {
            tracing::info!(
                "Migrating entity '{}' -> table '{}' ({:?})",
                schema.entity,
                schema.table,
                schema.strategy
            );
            let mut report = EntityReport::new(schema);
            if let Err(e) = self.migrate_entity(schema, io, &mut report).await {
                tracing::error!("Entity '{}' failed: {:#}", schema.entity, e);
                report.status = EntityStatus::Failed(format!("{:#}", e));
            }
            summary.entities.push(report);
        }

        summary.duration_ms = started.elapsed().as_millis();
        summary
    }

    async fn migrate_entity(
        &self,
        schema: &EntitySchema,
        io: &mut impl EntityIo,
        report: &mut EntityReport,
    ) -> Result<()> {
        let total = io
            .open(schema, self.options.override_boundary, self.options.batch_size)
            .await?;

        if total == 0 {
            tracing::info!("Entity '{}': nothing to migrate", schema.entity);
            report.status = EntityStatus::Skipped;
            return Ok(());
        }
        tracing::info!("Entity '{}': {} documents in window", schema.entity, total);

        let mut batch_no = 0u64;

        // A failed batch aborts this entity. Pages are ordered by
        // creation_date, so writing later pages after a gap would let
        // the next run's high-water mark skip the unwritten records.
        while let Some(page) = io.next_page().await? {
            batch_no += 1;
            report.records_read += page.len() as u64;

            let persisted = if schema.strategy == StrategyKind::SmartDiff {
                let parents: Vec<String> = page.iter().filter_map(document_id).collect();
                io.persisted_sets(schema, &parents)
                    .await
                    .with_context(|| format!("Batch {} persisted-state read failed", batch_no))?
            } else {
                PersistedSets::default()
            };

            let batch = strategy::transform(schema, &page, &persisted, self.options.diff_threshold)
                .with_context(|| format!("Batch {} transform failed", batch_no))?;

            let applied = io
                .apply(&batch)
                .await
                .with_context(|| format!("Batch {} write failed", batch_no))?;
            report.rows_written += applied.written;
            report.rows_deleted += applied.deleted;

            tracing::debug!(
                "Entity '{}' batch {}: {} read, {} written, {} deleted",
                schema.entity,
                batch_no,
                page.len(),
                applied.written,
                applied.deleted
            );
        }

        tracing::info!(
            "Entity '{}' done: {} records, {} rows written, {} deleted",
            schema.entity,
            report.records_read,
            report.rows_written,
            report.rows_deleted
        );
        Ok(())
    }
}
