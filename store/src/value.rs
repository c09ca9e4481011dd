//! SQLite value type conversions

use rusqlite::types::Value as SqlValue;

/// A value held in (or bound against) a soup table column
#[derive(Debug, Clone, PartialEq)]
pub enum SqliteValue {
    /// TEXT type for strings
    Text(String),
    /// INTEGER type for integers and booleans
    Integer(i64),
    /// REAL type for floating point
    Real(f64),
    /// NULL
    Null,
}

impl SqliteValue {
    /// Get the SQLite type name for column creation
    pub fn sqlite_type(&self) -> &'static str {
        match self {
            SqliteValue::Text(_) => "TEXT",
            SqliteValue::Integer(_) => "INTEGER",
            SqliteValue::Real(_) => "REAL",
            SqliteValue::Null => "TEXT", // Default to TEXT for NULL
        }
    }

    pub fn is_null(&self) -> bool { matches!(self, SqliteValue::Null) }

    /// Convert to a rusqlite parameter value
    pub fn to_sql(&self) -> SqlValue {
        match self {
            SqliteValue::Text(s) => SqlValue::Text(s.clone()),
            SqliteValue::Integer(i) => SqlValue::Integer(*i),
            SqliteValue::Real(f) => SqlValue::Real(*f),
            SqliteValue::Null => SqlValue::Null,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqliteValue::Text(s) => serde_json::Value::String(s.clone()),
            SqliteValue::Integer(i) => serde_json::Value::from(*i),
            // NaN and infinities have no JSON form
            SqliteValue::Real(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
            SqliteValue::Null => serde_json::Value::Null,
        }
    }

    /// Rendering used in error messages
    pub fn display(&self) -> String {
        match self {
            SqliteValue::Text(s) => format!("{:?}", s),
            SqliteValue::Integer(i) => i.to_string(),
            SqliteValue::Real(f) => f.to_string(),
            SqliteValue::Null => "null".to_string(),
        }
    }
}

impl From<SqlValue> for SqliteValue {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Text(s) => SqliteValue::Text(s),
            SqlValue::Integer(i) => SqliteValue::Integer(i),
            SqlValue::Real(f) => SqliteValue::Real(f),
            SqlValue::Blob(bytes) => SqliteValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
            SqlValue::Null => SqliteValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_rendering() {
        assert_eq!(SqliteValue::Text("a".into()).to_json(), json!("a"));
        assert_eq!(SqliteValue::Integer(42).to_json(), json!(42));
        assert_eq!(SqliteValue::Real(1.5).to_json(), json!(1.5));
        assert_eq!(SqliteValue::Real(f64::NAN).to_json(), json!(null));
        assert_eq!(SqliteValue::Null.to_json(), json!(null));
    }

    #[test]
    fn test_blob_reads_as_text() {
        assert_eq!(SqliteValue::from(SqlValue::Blob(b"abc".to_vec())), SqliteValue::Text("abc".into()));
    }
}
