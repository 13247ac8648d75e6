// ABOUTME: Batch writer applying generated write operations to PostgreSQL
// ABOUTME: One transaction per batch; builds parameterized upsert/insert/delete SQL

use anyhow::{Context, Result};
use bytes::BytesMut;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Client;

use super::diff::RelationshipItem;
use crate::postgres::quote_ident;
use crate::schema::RelationSpec;

/// PostgreSQL allows ~65535 parameters per statement; stay under it.
const MAX_PARAMS: usize = 65_000;

/// Rows per delete statement when deleting by composite key.
const DELETE_CHUNK: usize = 1_000;

/// An owned SQL parameter value. Owning the values (instead of boxed
/// `ToSql` trait objects) keeps `WriteBatch` comparable and testable.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(chrono::DateTime<chrono::Utc>),
    Json(serde_json::Value),
    Null,
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Integer(v) => v.to_sql(ty, out),
            SqlValue::Float(v) => v.to_sql(ty, out),
            SqlValue::Boolean(v) => v.to_sql(ty, out),
            SqlValue::Timestamp(v) => v.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
            SqlValue::Null => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Type agreement is the schema registry's job; NULL fits anything
        true
    }

    to_sql_checked!();
}

/// One write operation against the destination.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// INSERT ... ON CONFLICT (key) DO UPDATE; non-key columns overwritten
    Upsert {
        table: String,
        key_columns: Vec<String>,
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
    },
    /// Plain INSERT, used after a preceding delete cleared the way
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
    },
    /// DELETE of every row belonging to the given parents
    DeleteByParent {
        table: String,
        parent_column: String,
        parent_ids: Vec<String>,
    },
    /// Targeted DELETE of specific relationship tuples
    DeleteItems {
        table: String,
        parent_column: String,
        child_column: String,
        discriminant_column: Option<String>,
        items: Vec<RelationshipItem>,
    },
}

impl WriteOp {
    /// Whether executing this op would touch any rows at all.
    pub fn is_empty(&self) -> bool {
        match self {
            WriteOp::Upsert { rows, .. } | WriteOp::Insert { rows, .. } => rows.is_empty(),
            WriteOp::DeleteByParent { parent_ids, .. } => parent_ids.is_empty(),
            WriteOp::DeleteItems { items, .. } => items.is_empty(),
        }
    }
}

/// An ordered list of write operations derived from one page of source
/// records. The unit of transactional atomicity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Append an op, dropping no-ops so empty pages stay empty batches.
    pub fn push(&mut self, op: WriteOp) {
        if !op.is_empty() {
            self.ops.push(op);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Counts returned by a committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyCounts {
    pub written: u64,
    pub deleted: u64,
}

/// Applies write batches to the destination, one transaction per batch.
///
/// Any failure inside a batch rolls the whole batch back (the transaction
/// is dropped uncommitted) and surfaces a single error; retry policy
/// belongs to the orchestrator.
pub struct BatchWriter<'a> {
    client: &'a mut Client,
}

impl<'a> BatchWriter<'a> {
    pub fn new(client: &'a mut Client) -> Self {
        Self { client }
    }

    /// Execute every op in the batch inside one transaction.
    pub async fn apply(&mut self, batch: &WriteBatch) -> Result<ApplyCounts> {
        let mut counts = ApplyCounts::default();
        if batch.is_empty() {
            return Ok(counts);
        }

        let tx = self
            .client
            .transaction()
            .await
            .context("Failed to open write transaction")?;

        for op in &batch.ops {
            match op {
                WriteOp::Upsert {
                    table,
                    key_columns,
                    columns,
                    rows,
                } => {
                    let chunk_size = std::cmp::max(1, MAX_PARAMS / columns.len().max(1));
                    for chunk in rows.chunks(chunk_size) {
                        let query = build_upsert_query(table, key_columns, columns, chunk.len());
                        let params = flatten_params(chunk);
                        let affected = tx
                            .execute(&query, &params)
                            .await
                            .with_context(|| format!("Failed to upsert batch into '{}'", table))?;
                        counts.written += affected;
                    }
                }
                WriteOp::Insert {
                    table,
                    columns,
                    rows,
                } => {
                    let chunk_size = std::cmp::max(1, MAX_PARAMS / columns.len().max(1));
                    for chunk in rows.chunks(chunk_size) {
                        let query = build_insert_query(table, columns, chunk.len());
                        let params = flatten_params(chunk);
                        let affected = tx
                            .execute(&query, &params)
                            .await
                            .with_context(|| format!("Failed to insert batch into '{}'", table))?;
                        counts.written += affected;
                    }
                }
                WriteOp::DeleteByParent {
                    table,
                    parent_column,
                    parent_ids,
                } => {
                    let query = build_delete_by_parent_query(table, parent_column);
                    let affected = tx
                        .execute(&query, &[parent_ids])
                        .await
                        .with_context(|| {
                            format!("Failed to delete rows by parent from '{}'", table)
                        })?;
                    counts.deleted += affected;
                }
                WriteOp::DeleteItems {
                    table,
                    parent_column,
                    child_column,
                    discriminant_column,
                    items,
                } => {
                    let mut key_columns = vec![parent_column.clone(), child_column.clone()];
                    if let Some(disc) = discriminant_column {
                        key_columns.push(disc.clone());
                    }
                    for chunk in items.chunks(DELETE_CHUNK) {
                        let query = build_delete_items_query(table, &key_columns, chunk.len());
                        let values = item_key_params(chunk, discriminant_column.is_some());
                        let params: Vec<&(dyn ToSql + Sync)> = values
                            .iter()
                            .map(|v| v as &(dyn ToSql + Sync))
                            .collect();
                        let affected = tx
                            .execute(&query, &params)
                            .await
                            .with_context(|| {
                                format!("Failed to delete relationship rows from '{}'", table)
                            })?;
                        counts.deleted += affected;
                    }
                }
            }
        }

        tx.commit()
            .await
            .context("Failed to commit write transaction")?;

        Ok(counts)
    }
}

fn flatten_params(rows: &[Vec<SqlValue>]) -> Vec<&(dyn ToSql + Sync)> {
    rows.iter()
        .flat_map(|row| row.iter().map(|v| v as &(dyn ToSql + Sync)))
        .collect()
}

/// Flatten relationship items into the parameter order the delete query
/// expects: parent, child, then the discriminant when configured. Items
/// without a label in a discriminated table delete rows with a NULL label
/// via `IS NOT DISTINCT FROM` semantics baked into the query builder.
fn item_key_params(items: &[RelationshipItem], with_discriminant: bool) -> Vec<SqlValue> {
    let mut values = Vec::with_capacity(items.len() * if with_discriminant { 3 } else { 2 });
    for item in items {
        values.push(SqlValue::Text(item.parent.clone()));
        values.push(SqlValue::Text(item.child.clone()));
        if with_discriminant {
            values.push(match &item.label {
                Some(label) => SqlValue::Text(label.clone()),
                None => SqlValue::Null,
            });
        }
    }
    values
}

/// Build an upsert query:
///
/// ```sql
/// INSERT INTO "table" ("id", "name") VALUES ($1, $2), ($3, $4)
/// ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name"
/// ```
///
/// Every non-key column is overwritten on conflict (last-writer-wins).
pub fn build_upsert_query(
    table: &str,
    key_columns: &[String],
    columns: &[String],
    num_rows: usize,
) -> String {
    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let quoted_keys: Vec<String> = key_columns.iter().map(|c| quote_ident(c)).collect();

    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let update_columns: Vec<String> = columns
        .iter()
        .filter(|c| !key_columns.contains(c))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let conflict_action = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
        quote_ident(table),
        quoted_columns.join(", "),
        value_rows.join(", "),
        quoted_keys.join(", "),
        conflict_action
    )
}

/// Build a plain multi-row insert (no conflict handling; callers delete
/// first).
pub fn build_insert_query(table: &str, columns: &[String], num_rows: usize) -> String {
    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();

    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        quoted_columns.join(", "),
        value_rows.join(", ")
    )
}

/// Build a delete of every row belonging to a set of parents.
pub fn build_delete_by_parent_query(table: &str, parent_column: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {} = ANY($1)",
        quote_ident(table),
        quote_ident(parent_column)
    )
}

/// Build a composite-key delete:
///
/// ```sql
/// DELETE FROM "t" WHERE ("parent", "child") IN (($1, $2), ($3, $4))
/// ```
///
/// With a discriminant column the tuples are three-wide and NULL labels
/// are matched with IS NOT DISTINCT FROM.
pub fn build_delete_items_query(table: &str, key_columns: &[String], num_rows: usize) -> String {
    let num_key_cols = key_columns.len();
    let quoted: Vec<String> = key_columns.iter().map(|c| quote_ident(c)).collect();

    let value_tuples: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let conditions: Vec<String> = (0..num_key_cols)
                .map(|col_idx| {
                    format!(
                        "{} IS NOT DISTINCT FROM ${}",
                        quoted[col_idx],
                        row_idx * num_key_cols + col_idx + 1
                    )
                })
                .collect();
            format!("({})", conditions.join(" AND "))
        })
        .collect();

    format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(table),
        value_tuples.join(" OR ")
    )
}

/// Persisted relationship sets for the parents of one page, plus the
/// parents whose persisted rows could not be read coherently.
#[derive(Debug, Default)]
pub struct PersistedSets {
    sets: HashMap<String, BTreeSet<RelationshipItem>>,
    inconsistent: HashSet<String>,
}

impl PersistedSets {
    pub fn get(&self, parent: &str) -> Option<&BTreeSet<RelationshipItem>> {
        self.sets.get(parent)
    }

    /// True when the persisted rows for this parent were malformed and the
    /// strategy must fall back to a full delete-and-insert for it.
    pub fn is_inconsistent(&self, parent: &str) -> bool {
        self.inconsistent.contains(parent)
    }

    pub fn insert(&mut self, item: RelationshipItem) {
        self.sets.entry(item.parent.clone()).or_default().insert(item);
    }

    pub fn mark_inconsistent(&mut self, parent: impl Into<String>) {
        self.inconsistent.insert(parent.into());
    }
}

/// Fetch the currently persisted relationship sets for a page of parents.
///
/// A row with a NULL child (or NULL parent) violates the relationship
/// shape; the affected parent is marked inconsistent rather than failing
/// the whole page.
pub async fn fetch_persisted_sets(
    client: &Client,
    table: &str,
    relation: &RelationSpec,
    parent_ids: &[String],
) -> Result<PersistedSets> {
    let mut persisted = PersistedSets::default();
    if parent_ids.is_empty() {
        return Ok(persisted);
    }

    let mut select_columns = vec![
        format!("{}::text", quote_ident(&relation.parent_column)),
        format!("{}::text", quote_ident(&relation.child_column)),
    ];
    if let Some(ref disc) = relation.discriminant_column {
        select_columns.push(format!("{}::text", quote_ident(disc)));
    }

    let query = format!(
        "SELECT {} FROM {} WHERE {} = ANY($1)",
        select_columns.join(", "),
        quote_ident(table),
        quote_ident(&relation.parent_column)
    );

    let ids: Vec<&str> = parent_ids.iter().map(String::as_str).collect();
    let rows = client
        .query(&query, &[&ids])
        .await
        .with_context(|| format!("Failed to fetch persisted relationship rows from '{}'", table))?;

    for row in rows {
        let parent: Option<String> = row.try_get(0)?;
        let child: Option<String> = row.try_get(1)?;
        let label: Option<String> = if relation.discriminant_column.is_some() {
            row.try_get(2)?
        } else {
            None
        };

        match (parent, child) {
            (Some(parent), Some(child)) => persisted.insert(RelationshipItem {
                parent,
                child,
                label,
            }),
            (Some(parent), None) => {
                tracing::warn!(
                    "Persisted row in '{}' for parent '{}' has NULL child key; \
                     falling back to full rewrite for that parent",
                    table,
                    parent
                );
                persisted.mark_inconsistent(parent);
            }
            (None, _) => {
                tracing::warn!(
                    "Persisted row in '{}' has NULL parent key; row ignored",
                    table
                );
            }
        }
    }

    Ok(persisted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_upsert_query_single_row() {
        let query = build_upsert_query(
            "users",
            &cols(&["id"]),
            &cols(&["id", "email", "updated_at"]),
            1,
        );

        assert!(query.contains("INSERT INTO \"users\""));
        assert!(query.contains("(\"id\", \"email\", \"updated_at\")"));
        assert!(query.contains("VALUES ($1, $2, $3)"));
        assert!(query.contains("ON CONFLICT (\"id\")"));
        assert!(query.contains("\"email\" = EXCLUDED.\"email\""));
        assert!(query.contains("\"updated_at\" = EXCLUDED.\"updated_at\""));
    }

    #[test]
    fn test_build_upsert_query_multiple_rows() {
        let query = build_upsert_query("users", &cols(&["id"]), &cols(&["id", "email"]), 3);
        assert!(query.contains("($1, $2), ($3, $4), ($5, $6)"));
    }

    #[test]
    fn test_build_upsert_query_composite_key() {
        let query = build_upsert_query(
            "users_targets",
            &cols(&["user_id", "target_id", "type"]),
            &cols(&["user_id", "target_id", "type", "created_at"]),
            1,
        );
        assert!(query.contains("ON CONFLICT (\"user_id\", \"target_id\", \"type\")"));
        assert!(query.contains("\"created_at\" = EXCLUDED.\"created_at\""));
    }

    #[test]
    fn test_build_upsert_query_all_key_columns() {
        let query = build_upsert_query("tags", &cols(&["id"]), &cols(&["id"]), 1);
        assert!(query.contains("DO NOTHING"));
        assert!(!query.contains("DO UPDATE SET"));
    }

    #[test]
    fn test_build_insert_query() {
        let query = build_insert_query("user_events", &cols(&["user_id", "event_id"]), 2);
        assert_eq!(
            query,
            "INSERT INTO \"user_events\" (\"user_id\", \"event_id\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn test_build_delete_by_parent_query() {
        let query = build_delete_by_parent_query("user_events", "user_id");
        assert_eq!(
            query,
            "DELETE FROM \"user_events\" WHERE \"user_id\" = ANY($1)"
        );
    }

    #[test]
    fn test_build_delete_items_query_two_columns() {
        let query = build_delete_items_query("user_events", &cols(&["user_id", "event_id"]), 2);
        assert!(query.starts_with("DELETE FROM \"user_events\" WHERE"));
        assert!(query.contains("\"user_id\" IS NOT DISTINCT FROM $1"));
        assert!(query.contains("\"event_id\" IS NOT DISTINCT FROM $2"));
        assert!(query.contains("\"user_id\" IS NOT DISTINCT FROM $3"));
        assert!(query.contains(" OR "));
    }

    #[test]
    fn test_build_delete_items_query_with_discriminant() {
        let query = build_delete_items_query(
            "users_targets",
            &cols(&["user_id", "target_id", "type"]),
            1,
        );
        assert!(query.contains("\"type\" IS NOT DISTINCT FROM $3"));
    }

    #[test]
    fn test_item_key_params_null_label() {
        let items = vec![RelationshipItem::new("p", "c")];
        let params = item_key_params(&items, true);
        assert_eq!(params.len(), 3);
        assert_eq!(params[2], SqlValue::Null);
    }

    #[test]
    fn test_write_batch_drops_empty_ops() {
        let mut batch = WriteBatch::default();
        batch.push(WriteOp::Insert {
            table: "t".to_string(),
            columns: cols(&["a"]),
            rows: vec![],
        });
        assert!(batch.is_empty());

        batch.push(WriteOp::DeleteByParent {
            table: "t".to_string(),
            parent_column: "p".to_string(),
            parent_ids: vec!["x".to_string()],
        });
        assert_eq!(batch.ops.len(), 1);
    }

    #[test]
    fn test_persisted_sets_inconsistent_tracking() {
        let mut sets = PersistedSets::default();
        sets.insert(RelationshipItem::new("p1", "c1"));
        sets.mark_inconsistent("p2");

        assert_eq!(sets.get("p1").unwrap().len(), 1);
        assert!(sets.get("p2").is_none());
        assert!(sets.is_inconsistent("p2"));
        assert!(!sets.is_inconsistent("p1"));
    }
}
