// ABOUTME: The four import strategies turning source document pages into write batches
// ABOUTME: Pure transforms - destination reads happen upstream via PersistedSets

use anyhow::Result;
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use super::diff::{diff, RelationshipItem};
use super::writer::{PersistedSets, SqlValue, WriteBatch, WriteOp};
use crate::schema::{ColumnKind, EntitySchema, RelationSpec, StrategyKind};

/// Turn one page of source documents into a write batch.
///
/// `persisted` is only consulted by SmartDiff; the other strategies accept
/// an empty default. The transform itself performs no I/O, so the same
/// page and persisted state always produce the same batch.
pub fn transform(
    schema: &EntitySchema,
    page: &[Document],
    persisted: &PersistedSets,
    diff_threshold: f64,
) -> Result<WriteBatch> {
    match schema.strategy {
        StrategyKind::DirectTranslation => direct_translation(schema, page),
        StrategyKind::ArrayExtraction => array_extraction(schema, schema.relation()?, page),
        StrategyKind::DeleteAndInsert => delete_and_insert(schema, schema.relation()?, page),
        StrategyKind::SmartDiff => smart_diff(
            schema,
            schema.relation()?,
            page,
            persisted,
            schema.diff_threshold.unwrap_or(diff_threshold),
        ),
    }
}

/// One document, one row. Missing fields become NULL; on conflict every
/// non-key column is overwritten with the incoming value.
fn direct_translation(schema: &EntitySchema, page: &[Document]) -> Result<WriteBatch> {
    let columns: Vec<String> = schema.columns.iter().map(|c| c.name.clone()).collect();
    let mut rows = Vec::with_capacity(page.len());

    for doc in page {
        let row: Vec<SqlValue> = schema
            .columns
            .iter()
            .map(|col| field_to_sql(doc, col.source_field(), col.kind))
            .collect();

        // A row without its key can never be upserted; skip it rather than
        // aborting the page.
        let missing_key = schema.key_columns.iter().any(|key| {
            schema
                .columns
                .iter()
                .position(|c| &c.name == key)
                .map(|idx| row[idx] == SqlValue::Null)
                .unwrap_or(true)
        });
        if missing_key {
            tracing::warn!(
                "Skipping document without key fields for entity '{}'",
                schema.entity
            );
            continue;
        }

        rows.push(row);
    }

    let mut batch = WriteBatch::default();
    batch.push(WriteOp::Upsert {
        table: schema.table.clone(),
        key_columns: schema.key_columns.clone(),
        columns,
        rows,
    });
    Ok(batch)
}

/// One row per array element, upserted on the relation key. Elements
/// removed from the source array leave their destination rows behind;
/// that orphaning is the documented trade-off of this strategy.
fn array_extraction(
    schema: &EntitySchema,
    relation: &RelationSpec,
    page: &[Document],
) -> Result<WriteBatch> {
    let mut rows = Vec::new();
    for doc in page {
        let Some(parent) = document_id(doc) else {
            continue;
        };
        let (created, updated) = parent_timestamps(doc);
        for item in extract_items(relation, &parent, doc) {
            rows.push(item_row(&item, relation, created, updated));
        }
    }

    let mut batch = WriteBatch::default();
    batch.push(WriteOp::Upsert {
        table: schema.table.clone(),
        key_columns: relation.key_columns(),
        columns: relation.columns(),
        rows,
    });
    Ok(batch)
}

/// Delete every row belonging to the page's parents, then insert the
/// current relationship set. Stale rows cannot survive; cost is the full
/// relationship size per parent regardless of how much changed.
fn delete_and_insert(
    schema: &EntitySchema,
    relation: &RelationSpec,
    page: &[Document],
) -> Result<WriteBatch> {
    let mut parent_ids = Vec::with_capacity(page.len());
    let mut rows = Vec::new();

    for doc in page {
        let Some(parent) = document_id(doc) else {
            continue;
        };
        let (created, updated) = parent_timestamps(doc);
        for item in extract_items(relation, &parent, doc) {
            rows.push(item_row(&item, relation, created, updated));
        }
        parent_ids.push(parent);
    }

    let mut batch = WriteBatch::default();
    batch.push(WriteOp::DeleteByParent {
        table: schema.table.clone(),
        parent_column: relation.parent_column.clone(),
        parent_ids,
    });
    batch.push(WriteOp::Insert {
        table: schema.table.clone(),
        columns: relation.columns(),
        rows,
    });
    Ok(batch)
}

/// DeleteAndInsert with diff reconciliation. For each parent, compare the
/// source-derived set against the persisted set: apply only the diff when
/// the change fraction stays at or below the threshold, otherwise rewrite
/// the parent's rows wholesale. End state is identical to DeleteAndInsert
/// either way; only the operation count differs.
fn smart_diff(
    schema: &EntitySchema,
    relation: &RelationSpec,
    page: &[Document],
    persisted: &PersistedSets,
    threshold: f64,
) -> Result<WriteBatch> {
    let mut fallback_parents = Vec::new();
    let mut removals = Vec::new();
    let mut insert_rows = Vec::new();

    for doc in page {
        let Some(parent) = document_id(doc) else {
            continue;
        };
        let (created, updated) = parent_timestamps(doc);
        let current = extract_items(relation, &parent, doc);

        // Malformed persisted rows make the diff untrustworthy for this
        // parent; rewrite it instead of aborting the page.
        if persisted.is_inconsistent(&parent) {
            for item in &current {
                insert_rows.push(item_row(item, relation, created, updated));
            }
            fallback_parents.push(parent);
            continue;
        }

        let empty = BTreeSet::new();
        let persisted_set = persisted.get(&parent).unwrap_or(&empty);
        let result = diff(&current, persisted_set);
        if result.is_empty() {
            continue;
        }

        if result.change_fraction(persisted_set.len()) <= threshold {
            removals.extend(result.removals.iter().cloned());
            for item in &result.additions {
                insert_rows.push(item_row(item, relation, created, updated));
            }
        } else {
            for item in &current {
                insert_rows.push(item_row(item, relation, created, updated));
            }
            fallback_parents.push(parent);
        }
    }

    // All deletes precede all inserts; fallback and diff touch disjoint
    // parents so the ordering within each group is irrelevant.
    let mut batch = WriteBatch::default();
    batch.push(WriteOp::DeleteByParent {
        table: schema.table.clone(),
        parent_column: relation.parent_column.clone(),
        parent_ids: fallback_parents,
    });
    batch.push(WriteOp::DeleteItems {
        table: schema.table.clone(),
        parent_column: relation.parent_column.clone(),
        child_column: relation.child_column.clone(),
        discriminant_column: relation.discriminant_column.clone(),
        items: removals,
    });
    batch.push(WriteOp::Insert {
        table: schema.table.clone(),
        columns: relation.columns(),
        rows: insert_rows,
    });
    Ok(batch)
}

/// Extract the current relationship set from a parent document, reading
/// every configured source array and tagging items with that array's label.
pub fn extract_items(
    relation: &RelationSpec,
    parent: &str,
    doc: &Document,
) -> BTreeSet<RelationshipItem> {
    let mut items = BTreeSet::new();
    for source in &relation.sources {
        let Some(Bson::Array(elements)) = doc.get(&source.field) else {
            continue;
        };
        for element in elements {
            let Some(child) = element_child_id(element, relation.child_id_field.as_deref())
            else {
                tracing::warn!(
                    "Unreadable element in array '{}' of document '{}'",
                    source.field,
                    parent
                );
                continue;
            };
            items.insert(RelationshipItem {
                parent: parent.to_string(),
                child,
                label: source.label.clone(),
            });
        }
    }
    items
}

/// Child id from an array element. Arrays hold either bare ids or embedded
/// documents carrying the id under a configured field (or `_id`).
fn element_child_id(element: &Bson, child_id_field: Option<&str>) -> Option<String> {
    match element {
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        Bson::String(s) => Some(s.clone()),
        Bson::Document(doc) => {
            let inner = child_id_field
                .and_then(|field| doc.get(field))
                .or_else(|| doc.get("_id"))?;
            match inner {
                Bson::ObjectId(oid) => Some(oid.to_hex()),
                Bson::String(s) => Some(s.clone()),
                _ => None,
            }
        }
        _ => None,
    }
}

/// The document's `_id` rendered as text.
pub fn document_id(doc: &Document) -> Option<String> {
    match doc.get("_id") {
        Some(Bson::ObjectId(oid)) => Some(oid.to_hex()),
        Some(Bson::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Parent-document timestamps propagated onto relationship rows; a missing
/// update date falls back to the creation date.
fn parent_timestamps(doc: &Document) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let created = match doc.get("creation_date") {
        Some(Bson::DateTime(dt)) => Some(dt.to_chrono()),
        _ => None,
    };
    let updated = match doc.get("update_date") {
        Some(Bson::DateTime(dt)) => Some(dt.to_chrono()),
        _ => created,
    };
    (created, updated)
}

fn item_row(
    item: &RelationshipItem,
    relation: &RelationSpec,
    created: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
) -> Vec<SqlValue> {
    let mut row = vec![
        SqlValue::Text(item.parent.clone()),
        SqlValue::Text(item.child.clone()),
    ];
    if relation.discriminant_column.is_some() {
        row.push(match &item.label {
            Some(label) => SqlValue::Text(label.clone()),
            None => SqlValue::Null,
        });
    }
    row.push(optional_timestamp(created));
    row.push(optional_timestamp(updated));
    row
}

fn optional_timestamp(value: Option<DateTime<Utc>>) -> SqlValue {
    match value {
        Some(ts) => SqlValue::Timestamp(ts),
        None => SqlValue::Null,
    }
}

/// Convert one document field into a SQL parameter according to the
/// column's semantic kind. Missing fields and BSON nulls map to NULL.
fn field_to_sql(doc: &Document, field: &str, kind: ColumnKind) -> SqlValue {
    let Some(value) = doc.get(field) else {
        return SqlValue::Null;
    };
    match (kind, value) {
        (_, Bson::Null) => SqlValue::Null,
        (ColumnKind::Id, Bson::ObjectId(oid)) => SqlValue::Text(oid.to_hex()),
        (ColumnKind::Id, Bson::String(s)) => SqlValue::Text(s.clone()),
        (ColumnKind::Text, Bson::String(s)) => SqlValue::Text(s.clone()),
        (ColumnKind::Text, Bson::ObjectId(oid)) => SqlValue::Text(oid.to_hex()),
        (ColumnKind::Integer, Bson::Int32(v)) => SqlValue::Integer(*v as i64),
        (ColumnKind::Integer, Bson::Int64(v)) => SqlValue::Integer(*v),
        (ColumnKind::Float, Bson::Double(v)) => SqlValue::Float(*v),
        (ColumnKind::Float, Bson::Int32(v)) => SqlValue::Float(*v as f64),
        (ColumnKind::Float, Bson::Int64(v)) => SqlValue::Float(*v as f64),
        (ColumnKind::Boolean, Bson::Boolean(v)) => SqlValue::Boolean(*v),
        (ColumnKind::Timestamp, Bson::DateTime(dt)) => SqlValue::Timestamp(dt.to_chrono()),
        (ColumnKind::Json, v) => SqlValue::Json(serde_json::Value::from(v.clone())),
        (kind, value) => {
            tracing::warn!(
                "Field '{}' has BSON type {:?} incompatible with column kind {:?}; writing NULL",
                field,
                value.element_type(),
                kind
            );
            SqlValue::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ArraySource, ColumnDef};
    use bson::doc;
    use chrono::TimeZone;

    fn direct_schema() -> EntitySchema {
        EntitySchema {
            entity: "users".to_string(),
            table: "users".to_string(),
            collection: "users".to_string(),
            columns: vec![
                ColumnDef {
                    name: "id".to_string(),
                    source_field: Some("_id".to_string()),
                    kind: ColumnKind::Id,
                    nullable: false,
                    references: None,
                },
                ColumnDef {
                    name: "email".to_string(),
                    source_field: None,
                    kind: ColumnKind::Text,
                    nullable: true,
                    references: None,
                },
                ColumnDef {
                    name: "age".to_string(),
                    source_field: None,
                    kind: ColumnKind::Integer,
                    nullable: true,
                    references: None,
                },
            ],
            key_columns: vec!["id".to_string()],
            strategy: StrategyKind::DirectTranslation,
            order: 1,
            force_resync: false,
            truncate: false,
            diff_threshold: None,
            relation: None,
        }
    }

    fn relation_schema(strategy: StrategyKind) -> EntitySchema {
        EntitySchema {
            entity: "user_events".to_string(),
            table: "user_events".to_string(),
            collection: "users".to_string(),
            columns: vec![],
            key_columns: vec![],
            strategy,
            order: 5,
            force_resync: false,
            truncate: false,
            diff_threshold: None,
            relation: Some(RelationSpec {
                parent_column: "user_id".to_string(),
                child_column: "event_id".to_string(),
                discriminant_column: None,
                child_id_field: Some("event".to_string()),
                sources: vec![ArraySource {
                    field: "registered_events".to_string(),
                    label: None,
                }],
            }),
        }
    }

    fn persisted_for(parent: &str, children: &[&str]) -> PersistedSets {
        let mut sets = PersistedSets::default();
        for child in children {
            sets.insert(RelationshipItem::new(parent, *child));
        }
        sets
    }

    fn ts(secs: i64) -> bson::DateTime {
        bson::DateTime::from_chrono(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn test_direct_translation_missing_fields_become_null() {
        let schema = direct_schema();
        let page = vec![doc! { "_id": "u1", "email": "a@b.c" }];
        let batch = transform(&schema, &page, &PersistedSets::default(), 0.3).unwrap();

        assert_eq!(batch.ops.len(), 1);
        let WriteOp::Upsert {
            key_columns,
            columns,
            rows,
            ..
        } = &batch.ops[0]
        else {
            panic!("expected upsert");
        };
        assert_eq!(key_columns, &vec!["id".to_string()]);
        assert_eq!(columns.len(), 3);
        assert_eq!(rows[0][0], SqlValue::Text("u1".to_string()));
        assert_eq!(rows[0][1], SqlValue::Text("a@b.c".to_string()));
        assert_eq!(rows[0][2], SqlValue::Null);
    }

    #[test]
    fn test_direct_translation_object_id_rendered_as_hex() {
        let schema = direct_schema();
        let oid = bson::oid::ObjectId::new();
        let page = vec![doc! { "_id": oid, "age": 31_i32 }];
        let batch = transform(&schema, &page, &PersistedSets::default(), 0.3).unwrap();

        let WriteOp::Upsert { rows, .. } = &batch.ops[0] else {
            panic!("expected upsert");
        };
        assert_eq!(rows[0][0], SqlValue::Text(oid.to_hex()));
        assert_eq!(rows[0][2], SqlValue::Integer(31));
    }

    #[test]
    fn test_direct_translation_skips_keyless_documents() {
        let schema = direct_schema();
        let page = vec![doc! { "email": "nobody@b.c" }];
        let batch = transform(&schema, &page, &PersistedSets::default(), 0.3).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_array_extraction_emits_no_deletes() {
        // Orphan behavior: removed array elements are never deleted
        let schema = relation_schema(StrategyKind::ArrayExtraction);
        let page = vec![doc! {
            "_id": "u1",
            "registered_events": ["e1", "e2"],
            "creation_date": ts(1000),
        }];
        let batch = transform(&schema, &page, &PersistedSets::default(), 0.3).unwrap();

        assert_eq!(batch.ops.len(), 1);
        assert!(matches!(batch.ops[0], WriteOp::Upsert { .. }));
        let WriteOp::Upsert { rows, key_columns, .. } = &batch.ops[0] else {
            unreachable!()
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(key_columns, &vec!["user_id".to_string(), "event_id".to_string()]);
    }

    #[test]
    fn test_array_extraction_reads_embedded_document_elements() {
        let schema = relation_schema(StrategyKind::ArrayExtraction);
        let oid = bson::oid::ObjectId::new();
        let page = vec![doc! {
            "_id": "u1",
            "registered_events": [ { "event": oid, "date": ts(500) } ],
        }];
        let batch = transform(&schema, &page, &PersistedSets::default(), 0.3).unwrap();

        let WriteOp::Upsert { rows, .. } = &batch.ops[0] else {
            unreachable!()
        };
        assert_eq!(rows[0][1], SqlValue::Text(oid.to_hex()));
    }

    #[test]
    fn test_delete_and_insert_consolidates_labeled_arrays() {
        let mut schema = relation_schema(StrategyKind::DeleteAndInsert);
        schema.relation = Some(RelationSpec {
            parent_column: "user_id".to_string(),
            child_column: "target_id".to_string(),
            discriminant_column: Some("type".to_string()),
            child_id_field: None,
            sources: vec![
                ArraySource {
                    field: "targets".to_string(),
                    label: Some("basic".to_string()),
                },
                ArraySource {
                    field: "health_targets".to_string(),
                    label: Some("health".to_string()),
                },
            ],
        });

        let page = vec![doc! {
            "_id": "u1",
            "targets": ["t1"],
            "health_targets": ["t1", "t2"],
            "creation_date": ts(1000),
            "update_date": ts(2000),
        }];
        let batch = transform(&schema, &page, &PersistedSets::default(), 0.3).unwrap();

        assert_eq!(batch.ops.len(), 2);
        let WriteOp::DeleteByParent { parent_ids, .. } = &batch.ops[0] else {
            panic!("expected delete first");
        };
        assert_eq!(parent_ids, &vec!["u1".to_string()]);

        let WriteOp::Insert { rows, columns, .. } = &batch.ops[1] else {
            panic!("expected insert second");
        };
        // Same child under two labels is two distinct rows
        assert_eq!(rows.len(), 3);
        assert_eq!(
            columns,
            &vec![
                "user_id".to_string(),
                "target_id".to_string(),
                "type".to_string(),
                "created_at".to_string(),
                "updated_at".to_string()
            ]
        );
        let labels: Vec<&SqlValue> = rows.iter().map(|r| &r[2]).collect();
        assert!(labels.contains(&&SqlValue::Text("basic".to_string())));
        assert!(labels.contains(&&SqlValue::Text("health".to_string())));
    }

    #[test]
    fn test_smart_diff_falls_back_above_threshold() {
        // Persisted {1,2,3}, source {2,3,4}: fraction 2/3 > 0.3
        let schema = relation_schema(StrategyKind::SmartDiff);
        let page = vec![doc! { "_id": "u1", "registered_events": ["2", "3", "4"] }];
        let persisted = persisted_for("u1", &["1", "2", "3"]);

        let batch = transform(&schema, &page, &persisted, 0.3).unwrap();

        assert_eq!(batch.ops.len(), 2);
        let WriteOp::DeleteByParent { parent_ids, .. } = &batch.ops[0] else {
            panic!("expected full-rewrite delete");
        };
        assert_eq!(parent_ids, &vec!["u1".to_string()]);
        let WriteOp::Insert { rows, .. } = &batch.ops[1] else {
            panic!("expected insert");
        };
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_smart_diff_applies_diff_below_threshold() {
        // Persisted {1..5}, source swaps 5 for 6: fraction 2/5 <= 0.5
        let schema = relation_schema(StrategyKind::SmartDiff);
        let page = vec![doc! { "_id": "u1", "registered_events": ["1", "2", "3", "4", "6"] }];
        let persisted = persisted_for("u1", &["1", "2", "3", "4", "5"]);

        let batch = transform(&schema, &page, &persisted, 0.5).unwrap();

        assert_eq!(batch.ops.len(), 2);
        let WriteOp::DeleteItems { items, .. } = &batch.ops[0] else {
            panic!("expected targeted delete");
        };
        assert_eq!(items, &vec![RelationshipItem::new("u1", "5")]);
        let WriteOp::Insert { rows, .. } = &batch.ops[1] else {
            panic!("expected insert");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], SqlValue::Text("6".to_string()));
    }

    #[test]
    fn test_smart_diff_unchanged_set_emits_nothing() {
        let schema = relation_schema(StrategyKind::SmartDiff);
        let page = vec![doc! { "_id": "u1", "registered_events": ["1", "2"] }];
        let persisted = persisted_for("u1", &["1", "2"]);

        let batch = transform(&schema, &page, &persisted, 0.3).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_smart_diff_per_entity_threshold_override() {
        let mut schema = relation_schema(StrategyKind::SmartDiff);
        schema.diff_threshold = Some(0.5);
        let page = vec![doc! { "_id": "u1", "registered_events": ["1", "2", "3", "4", "6"] }];
        let persisted = persisted_for("u1", &["1", "2", "3", "4", "5"]);

        // Run-level threshold of 0.3 would fall back; the schema's 0.5 wins
        let batch = transform(&schema, &page, &persisted, 0.3).unwrap();
        assert!(matches!(batch.ops[0], WriteOp::DeleteItems { .. }));
    }

    #[test]
    fn test_smart_diff_inconsistent_parent_rewrites() {
        let schema = relation_schema(StrategyKind::SmartDiff);
        let page = vec![doc! { "_id": "u1", "registered_events": ["1"] }];
        let mut persisted = persisted_for("u1", &["1"]);
        persisted.mark_inconsistent("u1");

        let batch = transform(&schema, &page, &persisted, 0.3).unwrap();
        assert!(matches!(batch.ops[0], WriteOp::DeleteByParent { .. }));
    }

    #[test]
    fn test_smart_diff_first_import_falls_back() {
        // Nothing persisted: fraction is change_count / 1, always > threshold
        let schema = relation_schema(StrategyKind::SmartDiff);
        let page = vec![doc! { "_id": "u1", "registered_events": ["1", "2"] }];

        let batch = transform(&schema, &page, &PersistedSets::default(), 0.3).unwrap();
        assert!(matches!(batch.ops[0], WriteOp::DeleteByParent { .. }));
    }

    #[test]
    fn test_relationship_rows_carry_parent_timestamps() {
        let schema = relation_schema(StrategyKind::ArrayExtraction);
        let created = Utc.timestamp_opt(1000, 0).unwrap();
        let page = vec![doc! {
            "_id": "u1",
            "registered_events": ["e1"],
            "creation_date": bson::DateTime::from_chrono(created),
        }];
        let batch = transform(&schema, &page, &PersistedSets::default(), 0.3).unwrap();

        let WriteOp::Upsert { rows, .. } = &batch.ops[0] else {
            unreachable!()
        };
        // update_date missing: falls back to creation_date
        assert_eq!(rows[0][2], SqlValue::Timestamp(created));
        assert_eq!(rows[0][3], SqlValue::Timestamp(created));
    }
}
