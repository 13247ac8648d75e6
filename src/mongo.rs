// ABOUTME: Source MongoDB access - connection, window filters, and paging cursors
// ABOUTME: Pages are sorted by creation_date so every run sees a stable order

use anyhow::{Context, Result};
use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};

use crate::schema::EntitySchema;
use crate::sync::window::ChangeWindow;

/// Default number of documents fetched per page.
pub const DEFAULT_PAGE_SIZE: u64 = 5000;

/// Connect to the source MongoDB deployment.
///
/// The database name is taken from the connection string path; a URL
/// without one is rejected early rather than failing on the first read.
pub async fn connect(url: &str) -> Result<Database> {
    let options = ClientOptions::parse(url)
        .await
        .context("Failed to parse MongoDB connection string")?;
    let client = Client::with_options(options).context("Failed to create MongoDB client")?;
    client
        .default_database()
        .ok_or_else(|| anyhow::anyhow!("MongoDB connection string does not name a database"))
}

/// Build the window clause: a document changed if either its creation
/// or its update timestamp falls on or after the boundary. Inclusive so
/// a record stamped exactly at the high-water mark is reread rather
/// than skipped.
pub fn window_filter(window: &ChangeWindow) -> Option<Document> {
    let boundary = window.boundary?;
    let ts = bson::DateTime::from_chrono(boundary);
    Some(doc! {
        "$or": [
            { "creation_date": { "$gte": ts } },
            { "update_date": { "$gte": ts } },
        ]
    })
}

/// Relationship strategies only care about documents whose source
/// arrays exist and are non-empty; everything else cannot produce rows.
fn array_presence_filter(schema: &EntitySchema) -> Option<Document> {
    let relation = schema.relation.as_ref()?;
    if !schema.strategy.is_relationship() {
        return None;
    }
    let mut clauses: Vec<Document> = relation
        .sources
        .iter()
        .map(|source| {
            doc! { source.field.clone(): { "$exists": true, "$ne": [] } }
        })
        .collect();
    if clauses.len() == 1 {
        clauses.pop()
    } else {
        Some(doc! { "$or": clauses })
    }
}

/// Combined query filter for an entity and window.
pub fn build_filter(schema: &EntitySchema, window: &ChangeWindow) -> Document {
    let mut clauses = Vec::new();
    if let Some(w) = window_filter(window) {
        clauses.push(w);
    }
    if let Some(a) = array_presence_filter(schema) {
        clauses.push(a);
    }
    match clauses.len() {
        0 => doc! {},
        1 => clauses.pop().unwrap_or_default(),
        _ => doc! { "$and": clauses },
    }
}

/// Projection limiting each document to the fields the strategy reads.
///
/// Direct translation needs the mapped source fields; relationship
/// strategies need the arrays plus the parent timestamps.
pub fn projection_for(schema: &EntitySchema) -> Document {
    let mut projection = doc! { "_id": 1 };
    if schema.strategy.is_relationship() {
        if let Some(relation) = schema.relation.as_ref() {
            for source in &relation.sources {
                projection.insert(source.field.clone(), 1);
            }
        }
        projection.insert("creation_date", 1);
        projection.insert("update_date", 1);
    } else {
        for column in &schema.columns {
            projection.insert(column.source_field().to_string(), 1);
        }
    }
    projection
}

/// A skip/limit paging cursor over one collection.
///
/// Sorted by creation_date so page boundaries are stable while the run
/// progresses. Documents inserted mid-run may be missed by the paging
/// arithmetic; they fall inside the next run's window because the next
/// boundary is computed from what was actually written.
pub struct DocumentCursor {
    collection: mongodb::Collection<Document>,
    filter: Document,
    projection: Document,
    page_size: u64,
    offset: u64,
    done: bool,
}

impl DocumentCursor {
    pub fn new(
        db: &Database,
        schema: &EntitySchema,
        filter: Document,
        page_size: u64,
    ) -> Self {
        DocumentCursor {
            collection: db.collection::<Document>(&schema.collection),
            filter,
            projection: projection_for(schema),
            page_size: page_size.max(1),
            offset: 0,
            done: false,
        }
    }

    /// Number of documents the filter matches, read once before paging.
    pub async fn count(&self) -> Result<u64> {
        self.collection
            .count_documents(self.filter.clone())
            .await
            .context("Failed to count source documents")
    }

    /// Fetch the next page. Returns `None` once a short or empty page
    /// has been seen.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Document>>> {
        if self.done {
            return Ok(None);
        }

        let cursor = self
            .collection
            .find(self.filter.clone())
            .projection(self.projection.clone())
            .sort(doc! { "creation_date": 1 })
            .skip(self.offset)
            .limit(self.page_size as i64)
            .await
            .context("Failed to query source collection")?;

        let page: Vec<Document> = cursor
            .try_collect()
            .await
            .context("Failed to read source documents")?;

        if (page.len() as u64) < self.page_size {
            self.done = true;
        }
        self.offset += page.len() as u64;

        if page.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }
}
