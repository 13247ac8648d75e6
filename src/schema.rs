// ABOUTME: Entity schema descriptors loaded from the registry file
// ABOUTME: Validates strategy/flag combinations before any write happens

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::HashSet;

/// Semantic type of a destination column, used to convert BSON field
/// values into SQL parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// Document identifier (ObjectId rendered as text)
    Id,
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
}

/// One destination column and the source field it is populated from.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Source document field; defaults to the column name when omitted
    #[serde(default)]
    pub source_field: Option<String>,
    pub kind: ColumnKind,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Destination table this column references (foreign key), if any
    #[serde(default)]
    pub references: Option<String>,
}

impl ColumnDef {
    /// The document field this column reads from.
    pub fn source_field(&self) -> &str {
        self.source_field.as_deref().unwrap_or(&self.name)
    }
}

fn default_true() -> bool {
    true
}

/// One embedded array in the source document contributing relationship rows.
#[derive(Debug, Clone, Deserialize)]
pub struct ArraySource {
    /// Array-valued field on the parent document
    pub field: String,
    /// Discriminant label written for rows originating from this array
    #[serde(default)]
    pub label: Option<String>,
}

/// Describes how relationship rows are derived from parent documents.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationSpec {
    /// Destination column holding the parent document id
    pub parent_column: String,
    /// Destination column holding the child id extracted from the array
    pub child_column: String,
    /// Column distinguishing which source array a row came from
    #[serde(default)]
    pub discriminant_column: Option<String>,
    /// Field to read the child id from when array elements are embedded
    /// documents rather than bare ObjectIds
    #[serde(default)]
    pub child_id_field: Option<String>,
    /// Source arrays consolidated into the destination table
    pub sources: Vec<ArraySource>,
}

impl RelationSpec {
    /// Destination columns for relationship rows, in write order.
    pub fn columns(&self) -> Vec<String> {
        let mut cols = vec![self.parent_column.clone(), self.child_column.clone()];
        if let Some(ref disc) = self.discriminant_column {
            cols.push(disc.clone());
        }
        cols.push("created_at".to_string());
        cols.push("updated_at".to_string());
        cols
    }

    /// Columns forming the unique constraint relationship rows upsert on.
    pub fn key_columns(&self) -> Vec<String> {
        let mut cols = vec![self.parent_column.clone(), self.child_column.clone()];
        if let Some(ref disc) = self.discriminant_column {
            cols.push(disc.clone());
        }
        cols
    }
}

/// How a page of source documents is turned into destination writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// One document, one row, upsert by primary key
    DirectTranslation,
    /// One row per array element, upsert on the relation key; removed
    /// elements leave orphaned rows behind
    ArrayExtraction,
    /// Delete all rows for each parent, then insert the current set
    DeleteAndInsert,
    /// DeleteAndInsert optimized with set-diff reconciliation when the
    /// change fraction is small
    SmartDiff,
}

impl StrategyKind {
    /// Whether this strategy derives rows from embedded arrays.
    pub fn is_relationship(&self) -> bool {
        !matches!(self, StrategyKind::DirectTranslation)
    }
}

/// Immutable descriptor for one entity type: where it comes from, where it
/// goes, and which strategy moves it.
#[derive(Debug, Clone, Deserialize)]
pub struct EntitySchema {
    /// Entity-type name (registry key, used for selection and reporting)
    pub entity: String,
    /// Destination table
    pub table: String,
    /// Source collection
    pub collection: String,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    /// Primary/unique key columns for DirectTranslation upserts
    #[serde(default)]
    pub key_columns: Vec<String>,
    pub strategy: StrategyKind,
    /// Ascending dependency order; FK targets carry lower numbers
    pub order: u32,
    /// Ignore destination state and re-import everything
    #[serde(default)]
    pub force_resync: bool,
    /// Clear the destination table before importing (requires force_resync)
    #[serde(default)]
    pub truncate: bool,
    /// Per-entity SmartDiff threshold override
    #[serde(default)]
    pub diff_threshold: Option<f64>,
    #[serde(default)]
    pub relation: Option<RelationSpec>,
}

impl EntitySchema {
    /// Validate internal consistency. Called for every schema before the
    /// run starts so misconfiguration never reaches the writer.
    pub fn validate(&self) -> Result<()> {
        if self.truncate && !self.force_resync {
            bail!(
                "entity '{}': truncate requires force_resync (truncating without a full \
                 re-import would lose rows)",
                self.entity
            );
        }

        match self.strategy {
            StrategyKind::DirectTranslation => {
                if self.columns.is_empty() {
                    bail!("entity '{}': direct_translation requires columns", self.entity);
                }
                if self.key_columns.is_empty() {
                    bail!("entity '{}': direct_translation requires key_columns", self.entity);
                }
                for key in &self.key_columns {
                    if !self.columns.iter().any(|c| &c.name == key) {
                        bail!(
                            "entity '{}': key column '{}' is not in the column list",
                            self.entity,
                            key
                        );
                    }
                }
            }
            StrategyKind::ArrayExtraction
            | StrategyKind::DeleteAndInsert
            | StrategyKind::SmartDiff => {
                let relation = match self.relation {
                    Some(ref r) => r,
                    None => bail!(
                        "entity '{}': strategy {:?} requires a [entity.relation] block",
                        self.entity,
                        self.strategy
                    ),
                };
                if relation.sources.is_empty() {
                    bail!("entity '{}': relation has no source arrays", self.entity);
                }
                let labeled = relation.sources.iter().filter(|s| s.label.is_some()).count();
                if labeled > 0 && relation.discriminant_column.is_none() {
                    bail!(
                        "entity '{}': source arrays carry labels but no discriminant_column \
                         is configured",
                        self.entity
                    );
                }
                if relation.sources.len() > 1 && relation.discriminant_column.is_some() {
                    // Consolidated arrays must be distinguishable or rows collide
                    if labeled != relation.sources.len() {
                        bail!(
                            "entity '{}': every consolidated source array needs a label",
                            self.entity
                        );
                    }
                }
            }
        }

        if let Some(threshold) = self.diff_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                bail!(
                    "entity '{}': diff_threshold {} is outside [0.0, 1.0]",
                    self.entity,
                    threshold
                );
            }
        }

        Ok(())
    }

    /// The relation spec, for strategies that require one. Callers run
    /// after validation so this only fails on programmer error paths.
    pub fn relation(&self) -> Result<&RelationSpec> {
        self.relation.as_ref().ok_or_else(|| {
            anyhow::anyhow!("entity '{}' has no relation spec", self.entity)
        })
    }
}

/// Validate a whole registry: every schema, plus cross-schema rules.
pub fn validate_registry(schemas: &[EntitySchema]) -> Result<()> {
    let mut seen = HashSet::new();
    for schema in schemas {
        schema.validate()?;
        if !seen.insert(schema.entity.as_str()) {
            bail!("duplicate entity '{}' in schema registry", schema.entity);
        }
    }
    Ok(())
}
