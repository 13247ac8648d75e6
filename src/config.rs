// ABOUTME: Entity registry loading from TOML and CLI boundary parsing
// ABOUTME: Registry errors fail the run before any connection is opened

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::path::Path;

use crate::schema::{validate_registry, EntitySchema};

/// On-disk registry format: a list of `[[entity]]` tables.
#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    entity: Vec<EntitySchema>,
}

/// Load and validate the entity registry.
///
/// Every schema is validated up front; a malformed entity aborts the
/// load rather than surfacing mid-run.
pub fn load_registry(path: &Path) -> Result<Vec<EntitySchema>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read registry file {:?}", path))?;
    let file: RegistryFile = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse registry file {:?}", path))?;
    if file.entity.is_empty() {
        anyhow::bail!("Registry file {:?} defines no entities", path);
    }
    validate_registry(&file.entity)?;
    Ok(file.entity)
}

/// Parse a `--since` value: either an RFC 3339 timestamp or a plain
/// date, which is taken as midnight UTC.
pub fn parse_boundary(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid date '{}'", value))?;
        return Ok(DateTime::from_naive_utc_and_offset(midnight, Utc));
    }
    anyhow::bail!(
        "Cannot parse '{}' as a boundary (expected YYYY-MM-DD or RFC 3339 timestamp)",
        value
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StrategyKind;
    use std::io::Write;

    const REGISTRY: &str = r#"
[[entity]]
entity = "users"
table = "users"
collection = "users"
strategy = "direct_translation"
order = 1
key_columns = ["id"]

[[entity.columns]]
name = "id"
source_field = "_id"
kind = "id"
nullable = false

[[entity.columns]]
name = "email"
kind = "text"

[[entity]]
entity = "user_events"
table = "user_events"
collection = "users"
strategy = "smart_diff"
order = 2
diff_threshold = 0.4

[entity.relation]
parent_column = "user_id"
child_column = "event_id"
child_id_field = "event"

[[entity.relation.sources]]
field = "registered_events"
"#;

    fn write_registry(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_registry_parses_both_strategy_shapes() {
        let file = write_registry(REGISTRY);
        let registry = load_registry(file.path()).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry[0].strategy, StrategyKind::DirectTranslation);
        assert_eq!(registry[0].columns[1].source_field(), "email");
        assert_eq!(registry[1].strategy, StrategyKind::SmartDiff);
        assert_eq!(registry[1].diff_threshold, Some(0.4));
        let relation = registry[1].relation.as_ref().unwrap();
        assert_eq!(relation.child_id_field.as_deref(), Some("event"));
    }

    #[test]
    fn test_load_registry_rejects_invalid_entity() {
        // direct_translation without columns is malformed
        let file = write_registry(
            r#"
[[entity]]
entity = "users"
table = "users"
collection = "users"
strategy = "direct_translation"
order = 1
key_columns = ["id"]
"#,
        );
        assert!(load_registry(file.path()).is_err());
    }

    #[test]
    fn test_load_registry_rejects_empty_file() {
        let file = write_registry("");
        assert!(load_registry(file.path()).is_err());
    }

    #[test]
    fn test_parse_boundary_accepts_date_and_timestamp() {
        let date = parse_boundary("2024-03-01").unwrap();
        assert_eq!(date.to_rfc3339(), "2024-03-01T00:00:00+00:00");

        let ts = parse_boundary("2024-03-01T12:30:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T12:30:00+00:00");
    }

    #[test]
    fn test_parse_boundary_rejects_garbage() {
        assert!(parse_boundary("yesterday").is_err());
    }
}
