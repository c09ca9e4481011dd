//! Query specifications

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SoupStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            OrderDirection::Ascending => "ASC",
            OrderDirection::Descending => "DESC",
        }
    }
}

/// The kinds of query a soup answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queryType", rename_all = "snake_case")]
pub enum QueryKind {
    /// Every entry
    All,
    /// Entries whose index value equals `key`
    Exact {
        #[serde(rename = "indexPath")]
        path: String,
        #[serde(rename = "matchKey")]
        key: Value,
    },
    /// Entries whose index value lies in `[begin, end]`; a missing bound is open
    Range {
        #[serde(rename = "indexPath")]
        path: String,
        #[serde(rename = "beginKey", default)]
        begin: Option<Value>,
        #[serde(rename = "endKey", default)]
        end: Option<Value>,
    },
    /// SQL LIKE pattern against an index
    Like {
        #[serde(rename = "indexPath")]
        path: String,
        #[serde(rename = "likeKey")]
        pattern: String,
    },
    /// Full-text search, over one full_text index or all of them
    Match {
        #[serde(rename = "indexPath", default)]
        path: Option<String>,
        #[serde(rename = "matchKey")]
        query: String,
    },
    /// Raw SQL with `{soup}` / `{soup:path}` placeholders
    Smart {
        #[serde(rename = "smartSql")]
        sql: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    /// Target soup; smart queries name their soups inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soup_name: Option<String>,
    #[serde(flatten)]
    pub kind: QueryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_path: Option<String>,
    #[serde(default)]
    pub order: OrderDirection,
    pub page_size: usize,
}

impl QuerySpec {
    fn structured(soup: impl Into<String>, kind: QueryKind, page_size: usize) -> Self {
        Self { soup_name: Some(soup.into()), kind, order_path: None, order: OrderDirection::Ascending, page_size }
    }

    pub fn all(soup: impl Into<String>, page_size: usize) -> Self { Self::structured(soup, QueryKind::All, page_size) }

    pub fn exact(soup: impl Into<String>, path: impl Into<String>, key: impl Into<Value>, page_size: usize) -> Self {
        Self::structured(soup, QueryKind::Exact { path: path.into(), key: key.into() }, page_size)
    }

    pub fn range(soup: impl Into<String>, path: impl Into<String>, begin: Option<Value>, end: Option<Value>, page_size: usize) -> Self {
        Self::structured(soup, QueryKind::Range { path: path.into(), begin, end }, page_size)
    }

    pub fn like(soup: impl Into<String>, path: impl Into<String>, pattern: impl Into<String>, page_size: usize) -> Self {
        Self::structured(soup, QueryKind::Like { path: path.into(), pattern: pattern.into() }, page_size)
    }

    pub fn matching(soup: impl Into<String>, path: Option<&str>, query: impl Into<String>, page_size: usize) -> Self {
        Self::structured(soup, QueryKind::Match { path: path.map(str::to_string), query: query.into() }, page_size)
    }

    pub fn smart(sql: impl Into<String>, page_size: usize) -> Self {
        Self { soup_name: None, kind: QueryKind::Smart { sql: sql.into() }, order_path: None, order: OrderDirection::Ascending, page_size }
    }

    pub fn order_by(mut self, path: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_path = Some(path.into());
        self.order = direction;
        self
    }

    /// Parse the JSON form of a query spec
    pub fn from_json(json: &str) -> Result<Self> { serde_json::from_str(json).map_err(|e| SoupStoreError::InvalidSpec(format!("malformed query spec: {}", e))) }

    pub fn is_smart(&self) -> bool { matches!(self.kind, QueryKind::Smart { .. }) }

    /// The soup a structured query targets
    pub fn target_soup(&self) -> Result<&str> {
        self.soup_name.as_deref().ok_or_else(|| SoupStoreError::InvalidSpec("structured query without a soup name".to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(SoupStoreError::InvalidSpec("page size must be positive".to_string()));
        }
        if let QueryKind::Smart { sql } = &self.kind {
            if sql.trim().is_empty() {
                return Err(SoupStoreError::InvalidSpec("smart query is empty".to_string()));
            }
        } else {
            self.target_soup()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let spec: QuerySpec = serde_json::from_value(json!({
            "soupName": "employees",
            "queryType": "range",
            "indexPath": "salary",
            "beginKey": 1000,
            "orderPath": "lastName",
            "order": "descending",
            "pageSize": 10
        }))
        .unwrap();
        assert_eq!(spec, QuerySpec::range("employees", "salary", Some(json!(1000)), None, 10).order_by("lastName", OrderDirection::Descending));

        let spec: QuerySpec = serde_json::from_value(json!({"queryType": "smart", "smartSql": "select count(*) from {employees}", "pageSize": 1})).unwrap();
        assert!(spec.is_smart());
        assert_eq!(spec.order, OrderDirection::Ascending);
    }

    #[test]
    fn test_malformed_json_is_invalid_spec() {
        let err = QuerySpec::from_json(r#"{"queryType": "exact", "pageSize": 5}"#).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidSpec);
        assert!(QuerySpec::from_json(r#"{"soupName": "a", "queryType": "all", "pageSize": 5}"#).is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(QuerySpec::all("a", 0).validate().is_err());
        assert!(QuerySpec::smart("  ", 5).validate().is_err());
        let mut spec = QuerySpec::all("a", 5);
        spec.soup_name = None;
        assert_eq!(spec.validate().unwrap_err().kind(), crate::ErrorKind::InvalidSpec);
    }
}
