//! Upsert resolver: decides insert versus update for each document and writes it

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

use crate::catalog::SoupMetadata;
use crate::error::{Result, SoupStoreError};
use crate::external::{ExternalStorage, StagedPayload};
use crate::path::{extract_value, project, query_key};
use crate::spec::{SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE};
use crate::sql_builder::quote_ident;
use crate::table::{self, CREATED_COL, ID_COL, LAST_MODIFIED_COL, SOUP_COL};
use crate::value::SqliteValue;

/// How an incoming document is matched to a stored entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityRule {
    /// Only by its `_soupEntryId`
    EntryId,
    /// By `_soupEntryId` if present, otherwise by the value at an indexed path
    ExternalIdPath(String),
}

impl IdentityRule {
    pub fn from_path(path: &str) -> Self {
        if path == SOUP_ENTRY_ID {
            IdentityRule::EntryId
        } else {
            IdentityRule::ExternalIdPath(path.to_string())
        }
    }
}

/// Timestamps of an existing row
struct ExistingRow {
    id: i64,
    last_modified: i64,
}

/// Upsert `entries` in one transaction. Either every document is stored or none is.
///
/// Payload files of external soups are staged during the transaction and only moved into
/// place once it has committed.
pub fn upsert(conn: &mut Connection, meta: &SoupMetadata, storage: &ExternalStorage, entries: Vec<Value>, rule: &IdentityRule) -> Result<Vec<Value>> {
    if let IdentityRule::ExternalIdPath(path) = rule {
        meta.require_column(path)?;
    }

    let mut staged: Vec<StagedPayload> = Vec::new();
    match upsert_in_transaction(conn, meta, storage, entries, rule, &mut staged) {
        Ok(stored) => {
            for payload in staged {
                storage.publish(payload)?;
            }
            Ok(stored)
        }
        Err(e) => {
            storage.discard(staged);
            Err(e)
        }
    }
}

fn upsert_in_transaction(
    conn: &mut Connection,
    meta: &SoupMetadata,
    storage: &ExternalStorage,
    entries: Vec<Value>,
    rule: &IdentityRule,
    staged: &mut Vec<StagedPayload>,
) -> Result<Vec<Value>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = crate::now_millis();
    let mut stored = Vec::with_capacity(entries.len());
    for entry in entries {
        stored.push(upsert_one(&tx, meta, storage, entry, rule, now, staged)?);
    }
    tx.commit()?;
    debug!("Upserted {} entries into {}", stored.len(), meta.name());
    Ok(stored)
}

fn upsert_one(
    conn: &Connection,
    meta: &SoupMetadata,
    storage: &ExternalStorage,
    mut entry: Value,
    rule: &IdentityRule,
    now: i64,
    staged: &mut Vec<StagedPayload>,
) -> Result<Value> {
    if !entry.is_object() {
        return Err(SoupStoreError::InvalidSpec(format!("entries of soup {} must be JSON objects", meta.name())));
    }

    let mut existing = match entry.get(SOUP_ENTRY_ID).and_then(Value::as_i64) {
        Some(id) => find_row(conn, &meta.table_name, id)?,
        None => None,
    };
    if existing.is_none() {
        if let IdentityRule::ExternalIdPath(path) = rule {
            if let Some(id) = lookup_entry_id(conn, meta, path, &project(&entry, path))? {
                existing = find_row(conn, &meta.table_name, id)?;
            }
        }
    }

    let (id, last_modified) = match &existing {
        Some(row) => (row.id, now.max(row.last_modified)),
        None => (next_entry_id(conn, &meta.table_name)?, now),
    };

    if let Some(object) = entry.as_object_mut() {
        object.insert(SOUP_ENTRY_ID.to_string(), Value::from(id));
        object.insert(SOUP_LAST_MODIFIED_DATE.to_string(), Value::from(last_modified));
    }

    let payload = if meta.uses_external_storage() { SqlValue::Null } else { SqlValue::Text(entry.to_string()) };
    let physical: Vec<_> = meta.physical_columns().collect();
    let index_values = physical.iter().map(|c| extract_value(&entry, c).to_sql());
    let table = quote_ident(&meta.table_name);

    if existing.is_some() {
        let mut assignments = vec![format!("{} = ?", quote_ident(SOUP_COL)), format!("{} = ?", quote_ident(LAST_MODIFIED_COL))];
        assignments.extend(physical.iter().map(|c| format!("{} = ?", quote_ident(&c.column_name))));
        let values: Vec<SqlValue> =
            [payload, SqlValue::Integer(last_modified)].into_iter().chain(index_values).chain(std::iter::once(SqlValue::Integer(id))).collect();
        conn.execute(&format!("UPDATE {} SET {} WHERE {} = ?", table, assignments.join(", "), quote_ident(ID_COL)), params_from_iter(values))?;
    } else {
        let mut names = vec![quote_ident(ID_COL), quote_ident(SOUP_COL), quote_ident(CREATED_COL), quote_ident(LAST_MODIFIED_COL)];
        names.extend(physical.iter().map(|c| quote_ident(&c.column_name)));
        let values: Vec<SqlValue> = [SqlValue::Integer(id), payload, SqlValue::Integer(now), SqlValue::Integer(last_modified)].into_iter().chain(index_values).collect();
        let placeholders = vec!["?"; names.len()].join(", ");
        conn.execute(&format!("INSERT INTO {} ({}) VALUES ({})", table, names.join(", "), placeholders), params_from_iter(values))?;
    }
    table::refresh_fts_row(conn, &meta.table_name, &meta.columns, id)?;

    if meta.uses_external_storage() {
        // a later copy of the same entry in this batch replaces the staged file
        let payload = storage.stage(&meta.table_name, id, &entry)?;
        staged.retain(|p| p.target() != payload.target());
        staged.push(payload);
    }
    Ok(entry)
}

fn find_row(conn: &Connection, table: &str, id: i64) -> Result<Option<ExistingRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {}, {} FROM {} WHERE {} = ?", quote_ident(ID_COL), quote_ident(LAST_MODIFIED_COL), quote_ident(table), quote_ident(ID_COL)),
            [id],
            |row| Ok(ExistingRow { id: row.get(0)?, last_modified: row.get::<_, Option<i64>>(1)?.unwrap_or(0) }),
        )
        .optional()?;
    Ok(row)
}

/// Next id the AUTOINCREMENT sequence would hand out
fn next_entry_id(conn: &Connection, table: &str) -> Result<i64> {
    let seq: Option<i64> = conn.query_row("SELECT seq FROM sqlite_sequence WHERE name = ?", [table], |row| row.get(0)).optional()?;
    Ok(seq.unwrap_or(0) + 1)
}

/// Entry id whose value at `path` equals `value`. Null keys never match.
pub fn lookup_entry_id(conn: &Connection, meta: &SoupMetadata, path: &str, value: &Value) -> Result<Option<i64>> {
    let column = meta.require_column(path)?;
    let key = query_key(column.index_type, value);
    if key == SqliteValue::Null {
        return Ok(None);
    }

    let mut stmt = conn.prepare(&format!("SELECT {} FROM {} WHERE {} = ?", quote_ident(ID_COL), quote_ident(&meta.table_name), column.expression(None)))?;
    let ids = stmt.query_map([key.to_sql()], |row| row.get::<_, i64>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
    match ids.as_slice() {
        [] => Ok(None),
        [id] => Ok(Some(*id)),
        many => Err(SoupStoreError::AmbiguousExternalId { soup: meta.name().to_string(), path: path.to_string(), value: key.display(), matches: many.len() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::spec::{IndexSpec, SoupSpec};
    use serde_json::json;

    fn soup(conn: &Connection, specs: &[IndexSpec]) -> SoupMetadata {
        catalog::create_metadata_tables(conn).unwrap();
        let meta = catalog::register(conn, &SoupSpec::new("employees"), specs).unwrap();
        table::create_table(conn, &meta.table_name, &meta.columns).unwrap();
        meta
    }

    #[test]
    fn test_insert_then_update_by_entry_id() {
        let mut conn = Connection::open_in_memory().unwrap();
        let meta = soup(&conn, &[IndexSpec::string("name")]);
        let storage = ExternalStorage::new(None);

        let stored = upsert(&mut conn, &meta, &storage, vec![json!({"name": "a"}), json!({"name": "b"})], &IdentityRule::EntryId).unwrap();
        assert_eq!(stored[0][SOUP_ENTRY_ID], json!(1));
        assert_eq!(stored[1][SOUP_ENTRY_ID], json!(2));

        let mut changed = stored[0].clone();
        changed["name"] = json!("z");
        let updated = upsert(&mut conn, &meta, &storage, vec![changed], &IdentityRule::EntryId).unwrap();
        assert_eq!(updated[0][SOUP_ENTRY_ID], json!(1));
        assert!(updated[0][SOUP_LAST_MODIFIED_DATE].as_i64().unwrap() >= stored[0][SOUP_LAST_MODIFIED_DATE].as_i64().unwrap());

        let name: String = conn.query_row(r#"SELECT "TABLE_1_0" FROM "TABLE_1" WHERE "id" = 1"#, [], |r| r.get(0)).unwrap();
        assert_eq!(name, "z");
    }

    #[test]
    fn test_stale_entry_id_inserts_fresh_row() {
        let mut conn = Connection::open_in_memory().unwrap();
        let meta = soup(&conn, &[IndexSpec::string("name")]);
        let stored = upsert(&mut conn, &meta, &ExternalStorage::new(None), vec![json!({"name": "a", "_soupEntryId": 99})], &IdentityRule::EntryId).unwrap();
        assert_eq!(stored[0][SOUP_ENTRY_ID], json!(1));
    }

    #[test]
    fn test_external_id_resolution() {
        let mut conn = Connection::open_in_memory().unwrap();
        let meta = soup(&conn, &[IndexSpec::string("employeeId"), IndexSpec::string("name")]);
        let storage = ExternalStorage::new(None);
        let rule = IdentityRule::from_path("employeeId");

        upsert(&mut conn, &meta, &storage, vec![json!({"employeeId": "E1", "name": "a"})], &rule).unwrap();
        let stored = upsert(&mut conn, &meta, &storage, vec![json!({"employeeId": "E1", "name": "b"})], &rule).unwrap();
        assert_eq!(stored[0][SOUP_ENTRY_ID], json!(1));
        assert_eq!(lookup_entry_id(&conn, &meta, "employeeId", &json!("E1")).unwrap(), Some(1));
        assert_eq!(lookup_entry_id(&conn, &meta, "employeeId", &json!(null)).unwrap(), None);

        // null external ids always insert
        upsert(&mut conn, &meta, &storage, vec![json!({"name": "c"}), json!({"name": "d"})], &rule).unwrap();
        let count: i64 = conn.query_row(r#"SELECT count(*) FROM "TABLE_1""#, [], |r| r.get(0)).unwrap();
        assert_eq!(count, 3);

        // duplicates slipped in through plain upserts are reported
        upsert(&mut conn, &meta, &storage, vec![json!({"employeeId": "E1", "name": "dup"})], &IdentityRule::EntryId).unwrap();
        let err = upsert(&mut conn, &meta, &storage, vec![json!({"employeeId": "E1"})], &rule).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::AmbiguousExternalId);

        let err = upsert(&mut conn, &meta, &storage, vec![json!({"x": 1})], &IdentityRule::from_path("badge")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PathNotIndexed);
    }

    #[test]
    fn test_batch_is_atomic() {
        let mut conn = Connection::open_in_memory().unwrap();
        let meta = soup(&conn, &[IndexSpec::string("name")]);
        let err = upsert(&mut conn, &meta, &ExternalStorage::new(None), vec![json!({"name": "a"}), json!("not an object")], &IdentityRule::EntryId).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidSpec);
        let count: i64 = conn.query_row(r#"SELECT count(*) FROM "TABLE_1""#, [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
