//! Query plan capture

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::SqliteValue;

/// One row of `EXPLAIN QUERY PLAN`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainRow {
    pub id: i64,
    pub parent: i64,
    pub notused: i64,
    pub detail: String,
}

/// The plan of the most recently run query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainPlan {
    pub sql: String,
    pub args: Vec<serde_json::Value>,
    pub rows: Vec<ExplainRow>,
}

impl ExplainPlan {
    /// Whether any step of the plan mentions `needle`, e.g. an index name
    pub fn mentions(&self, needle: &str) -> bool { self.rows.iter().any(|row| row.detail.contains(needle)) }
}

pub fn explain(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<ExplainPlan> {
    let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {}", sql))?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| Ok(ExplainRow { id: row.get(0)?, parent: row.get(1)?, notused: row.get(2)?, detail: row.get(3)? }))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let args = params.iter().map(|p| SqliteValue::from(p.clone()).to_json()).collect();
    Ok(ExplainPlan { sql: sql.to_string(), args, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_names_the_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(r#"CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT); CREATE INDEX t_name_idx ON t (name);"#).unwrap();
        let plan = explain(&conn, "SELECT id FROM t WHERE name = ?", &[SqlValue::Text("x".into())]).unwrap();
        assert!(plan.mentions("t_name_idx"), "{:?}", plan);
        assert_eq!(plan.args, vec![serde_json::json!("x")]);
    }
}
