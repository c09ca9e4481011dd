//! Soup and index specifications

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SoupStoreError;

/// Entry id injected into every stored document
pub const SOUP_ENTRY_ID: &str = "_soupEntryId";
/// Last-modified timestamp (epoch milliseconds) injected into every stored document
pub const SOUP_LAST_MODIFIED_DATE: &str = "_soupLastModifiedDate";
/// Creation timestamp, addressable from smart SQL only
pub const SOUP_CREATED_DATE: &str = "_soupCreatedDate";
/// The raw payload, addressable from smart SQL only
pub const SOUP_PAYLOAD: &str = "_soup";

/// Paths that may never be indexed
pub const RESERVED_PATHS: [&str; 4] = [SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE, SOUP_CREATED_DATE, SOUP_PAYLOAD];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    String,
    Integer,
    #[serde(alias = "number")]
    Floating,
    FullText,
    Json1,
}

impl IndexType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::String => "string",
            IndexType::Integer => "integer",
            IndexType::Floating => "floating",
            IndexType::FullText => "full_text",
            IndexType::Json1 => "json1",
        }
    }

    /// Column type of the backing column; json1 indexes have none
    pub fn sql_type(&self) -> Option<&'static str> {
        match self {
            IndexType::String | IndexType::FullText => Some("TEXT"),
            IndexType::Integer => Some("INTEGER"),
            IndexType::Floating => Some("REAL"),
            IndexType::Json1 => None,
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for IndexType {
    type Err = SoupStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(IndexType::String),
            "integer" => Ok(IndexType::Integer),
            "floating" | "number" => Ok(IndexType::Floating),
            "full_text" => Ok(IndexType::FullText),
            "json1" => Ok(IndexType::Json1),
            other => Err(SoupStoreError::UnsupportedIndexType(other.to_string())),
        }
    }
}

/// One indexed path of a soup
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpec {
    pub path: String,
    #[serde(rename = "type")]
    pub index_type: IndexType,
    /// Physical column assigned by the store; ignored on input
    #[serde(rename = "columnName", default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
}

impl IndexSpec {
    pub fn new(path: impl Into<String>, index_type: IndexType) -> Self { Self { path: path.into(), index_type, column_name: None } }

    pub fn string(path: impl Into<String>) -> Self { Self::new(path, IndexType::String) }

    pub fn integer(path: impl Into<String>) -> Self { Self::new(path, IndexType::Integer) }

    pub fn floating(path: impl Into<String>) -> Self { Self::new(path, IndexType::Floating) }

    pub fn full_text(path: impl Into<String>) -> Self { Self::new(path, IndexType::FullText) }

    pub fn json1(path: impl Into<String>) -> Self { Self::new(path, IndexType::Json1) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SoupFeature {
    /// Payloads live in one file per entry instead of the soup table
    #[serde(rename = "externalStorage")]
    ExternalStorage,
}

/// Name plus storage features of a soup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoupSpec {
    pub name: String,
    #[serde(default)]
    pub features: Vec<SoupFeature>,
}

impl SoupSpec {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), features: Vec::new() } }

    pub fn external(name: impl Into<String>) -> Self { Self { name: name.into(), features: vec![SoupFeature::ExternalStorage] } }

    pub fn uses_external_storage(&self) -> bool { self.features.contains(&SoupFeature::ExternalStorage) }

    /// Feature sets compare as sets
    pub fn same_definition(&self, other: &SoupSpec) -> bool {
        self.name == other.name && self.uses_external_storage() == other.uses_external_storage()
    }
}

/// Compare two index spec lists as sets of (path, type); declaration order is not identity
pub fn same_index_specs(a: &[IndexSpec], b: &[IndexSpec]) -> bool {
    fn definitions(specs: &[IndexSpec]) -> HashSet<(&str, IndexType)> { specs.iter().map(|s| (s.path.as_str(), s.index_type)).collect() }
    a.len() == b.len() && definitions(a) == definitions(b)
}
