//! Index path compiler
//!
//! Turns a dotted index path (`address.city`) into a column definition and knows how to
//! project that path out of a JSON document. Projection walks object keys; when it meets an
//! array it maps the rest of the path over every element.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SoupStoreError};
use crate::spec::{IndexSpec, IndexType, SoupSpec, RESERVED_PATHS};
use crate::sql_builder::quote_ident;
use crate::value::SqliteValue;

/// A compiled index: its path, type and the column the store assigned to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub path: String,
    pub index_type: IndexType,
    pub column_name: String,
}

impl ColumnDef {
    pub fn new(spec: &IndexSpec, column_name: impl Into<String>) -> Self {
        Self { path: spec.path.clone(), index_type: spec.index_type, column_name: column_name.into() }
    }

    /// Whether this index occupies a real column in the soup table
    pub fn is_physical(&self) -> bool { self.index_type.sql_type().is_some() }

    pub fn is_full_text(&self) -> bool { self.index_type == IndexType::FullText }

    pub fn same_definition(&self, other: &ColumnDef) -> bool { self.path == other.path && self.index_type == other.index_type }

    /// SQL reading this index's value from a soup table row.
    ///
    /// Column names are unique across soups, so only json1 expressions need the qualifier.
    pub fn expression(&self, qualifier: Option<&str>) -> String {
        match self.index_type {
            IndexType::Json1 => {
                let payload = match qualifier {
                    Some(table) => format!(r#"{}."soup""#, quote_ident(table)),
                    None => r#""soup""#.to_string(),
                };
                format!("json_extract({}, '{}')", payload, json_path(&self.path))
            }
            _ => quote_ident(&self.column_name),
        }
    }

    pub fn index_name(&self) -> String { format!("{}_idx", self.column_name) }

    pub fn to_index_spec(&self) -> IndexSpec {
        IndexSpec { path: self.path.clone(), index_type: self.index_type, column_name: Some(self.column_name.clone()) }
    }
}

/// `$.a.b` form understood by SQLite's JSON functions
pub fn json_path(path: &str) -> String { format!("$.{}", path.replace('\'', "''")) }

/// Project `path` out of `doc`. Missing keys and scalars in the middle of the path yield null.
pub fn project(doc: &Value, path: &str) -> Value {
    let segments: Vec<&str> = path.split('.').collect();
    project_segments(doc, &segments)
}

fn project_segments(value: &Value, segments: &[&str]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return value.clone();
    };
    match value {
        Value::Object(map) => match map.get(*first) {
            Some(child) => project_segments(child, rest),
            None => Value::Null,
        },
        Value::Array(items) => Value::Array(items.iter().map(|item| project_segments(item, segments)).collect()),
        _ => Value::Null,
    }
}

/// Value stored in the column backing `column` for `doc`
pub fn extract_value(doc: &Value, column: &ColumnDef) -> SqliteValue { column_value(column.index_type, &project(doc, &column.path)) }

/// Coerce an already projected value to what an index of `index_type` stores
pub fn column_value(index_type: IndexType, value: &Value) -> SqliteValue {
    match index_type {
        IndexType::String | IndexType::FullText => match value {
            Value::String(s) => SqliteValue::Text(s.clone()),
            Value::Number(n) => SqliteValue::Text(n.to_string()),
            Value::Bool(b) => SqliteValue::Text(b.to_string()),
            _ => SqliteValue::Null,
        },
        IndexType::Integer => match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqliteValue::Integer(i),
                None => n.as_f64().map(|f| SqliteValue::Integer(f as i64)).unwrap_or(SqliteValue::Null),
            },
            _ => SqliteValue::Null,
        },
        IndexType::Floating => match value.as_f64() {
            Some(f) => SqliteValue::Real(f),
            None => SqliteValue::Null,
        },
        IndexType::Json1 => match value {
            Value::Null => SqliteValue::Null,
            Value::Bool(b) => SqliteValue::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqliteValue::Integer(i),
                None => n.as_f64().map(SqliteValue::Real).unwrap_or(SqliteValue::Null),
            },
            Value::String(s) => SqliteValue::Text(s.clone()),
            aggregate => SqliteValue::Text(aggregate.to_string()),
        },
    }
}

/// Coerce a caller supplied query key. Numeric indexes also accept numeric strings.
pub fn query_key(index_type: IndexType, key: &Value) -> SqliteValue {
    match (index_type, key) {
        (IndexType::Integer, Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(i) => SqliteValue::Integer(i),
            Err(_) => s.trim().parse::<f64>().map(|f| SqliteValue::Integer(f as i64)).unwrap_or(SqliteValue::Null),
        },
        (IndexType::Floating, Value::String(s)) => s.trim().parse::<f64>().map(SqliteValue::Real).unwrap_or(SqliteValue::Null),
        _ => column_value(index_type, key),
    }
}

pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(SoupStoreError::InvalidSpec("index path must not be empty".to_string()));
    }
    if RESERVED_PATHS.contains(&path) {
        return Err(SoupStoreError::InvalidSpec(format!("path {} is reserved", path)));
    }
    if path.split('.').any(|segment| segment.is_empty()) {
        return Err(SoupStoreError::InvalidSpec(format!("path {} has an empty segment", path)));
    }
    if path.chars().any(|c| matches!(c, '\'' | '"' | '{' | '}' | '[' | ']') || c.is_control()) {
        return Err(SoupStoreError::InvalidSpec(format!("path {} contains a forbidden character", path)));
    }
    Ok(())
}

/// What the running SQLite build and the store configuration allow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub full_text: bool,
    pub external_storage: bool,
}

/// Reject index lists the store cannot honour
pub fn validate_index_specs(soup_spec: &SoupSpec, specs: &[IndexSpec], capabilities: Capabilities) -> Result<()> {
    if soup_spec.name.trim().is_empty() {
        return Err(SoupStoreError::InvalidSpec("soup name must not be empty".to_string()));
    }
    if specs.is_empty() {
        return Err(SoupStoreError::InvalidSpec(format!("soup {} needs at least one index spec", soup_spec.name)));
    }
    if soup_spec.uses_external_storage() && !capabilities.external_storage {
        return Err(SoupStoreError::InvalidSpec(format!("soup {} uses external storage but no storage directory is configured", soup_spec.name)));
    }

    let mut seen = HashSet::new();
    for spec in specs {
        validate_path(&spec.path)?;
        if !seen.insert(spec.path.as_str()) {
            return Err(SoupStoreError::InvalidSpec(format!("path {} is indexed twice", spec.path)));
        }
        match spec.index_type {
            IndexType::FullText if !capabilities.full_text => {
                return Err(SoupStoreError::UnsupportedIndexType(format!("full_text on {}: FTS5 is not available", spec.path)));
            }
            IndexType::Json1 if soup_spec.uses_external_storage() => {
                return Err(SoupStoreError::InvalidSpec(format!("json1 index on {} needs the payload in the soup table", spec.path)));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Assign columns to `specs`. Definitions already present in `existing` keep their column,
/// new ones take the lowest free `<table>_<n>` name.
pub fn layout(table: &str, specs: &[IndexSpec], existing: &[ColumnDef]) -> Vec<ColumnDef> {
    let reused: Vec<Option<&ColumnDef>> = specs.iter().map(|spec| existing.iter().find(|c| c.path == spec.path && c.index_type == spec.index_type)).collect();
    let mut used: HashSet<String> = reused.iter().flatten().map(|c| c.column_name.clone()).collect();

    let mut next = 0usize;
    specs
        .iter()
        .zip(reused)
        .map(|(spec, reused)| match reused {
            Some(column) => column.clone(),
            None => {
                let name = loop {
                    let candidate = format!("{}_{}", table, next);
                    next += 1;
                    if !used.contains(&candidate) {
                        break candidate;
                    }
                };
                used.insert(name.clone());
                ColumnDef::new(spec, name)
            }
        })
        .collect()
}
