// ABOUTME: Change-window resolution against destination high-water marks
// ABOUTME: Decides incremental boundary vs full resync per entity

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio_postgres::Client;

use crate::postgres::{quote_ident, validate_table_name};
use crate::schema::EntitySchema;

/// The resolved change window for one entity run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeWindow {
    /// Inclusive lower bound for source documents; `None` selects all.
    pub boundary: Option<DateTime<Utc>>,
    /// True when this run rereads the entire collection.
    pub resync: bool,
}

impl ChangeWindow {
    pub fn full_resync() -> Self {
        ChangeWindow {
            boundary: None,
            resync: true,
        }
    }
}

/// Resolve the change window for an entity.
///
/// Reads the destination high-water mark (the greatest created_at or
/// updated_at in the target table) and widens it with the caller's
/// override if that is earlier. An empty table, a missing high-water
/// mark, or `force_resync` on the schema all produce a full resync.
pub async fn resolve_window(
    client: &Client,
    schema: &EntitySchema,
    override_boundary: Option<DateTime<Utc>>,
) -> Result<ChangeWindow> {
    if schema.force_resync {
        return Ok(ChangeWindow::full_resync());
    }

    let mark = high_water_mark(client, &schema.table).await?;
    match mark {
        Some(current) => Ok(ChangeWindow {
            boundary: Some(apply_override(current, override_boundary)),
            resync: false,
        }),
        None => Ok(ChangeWindow::full_resync()),
    }
}

/// Greatest timestamp present in the destination table.
///
/// GREATEST ignores NULL arguments, so a table with only created_at
/// populated still yields a boundary; the result is NULL only when the
/// table is empty or both columns are entirely NULL.
async fn high_water_mark(client: &Client, table: &str) -> Result<Option<DateTime<Utc>>> {
    validate_table_name(table)?;
    let query = format!(
        "SELECT GREATEST(MAX(created_at), MAX(updated_at)) FROM {}",
        quote_ident(table)
    );
    let row = client
        .query_one(&query, &[])
        .await
        .with_context(|| format!("Failed to read high-water mark from '{}'", table))?;
    row.try_get(0).with_context(|| {
        format!(
            "High-water mark in '{}' is not a timestamptz; check the \
             created_at/updated_at column types",
            table
        )
    })
}

/// An override may only widen the window (move the boundary backward).
/// A later override is ignored so records between the destination mark
/// and the override can never be skipped.
fn apply_override(current: DateTime<Utc>, override_boundary: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match override_boundary {
        Some(o) if o < current => o,
        _ => current,
    }
}
