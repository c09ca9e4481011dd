//! Document table manager: DDL and bulk row movement for soup tables
//!
//! Every soup owns a table with the fixed columns `id`, `soup`, `created` and `lastModified`,
//! one column per physical index, and an FTS5 mirror `<table>_fts` (keyed by rowid = id) when
//! it has full_text indexes.

use std::collections::BTreeSet;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tracing::debug;

use crate::catalog::SoupMetadata;
use crate::error::{Result, SoupStoreError};
use crate::external::ExternalStorage;
use crate::path::{extract_value, ColumnDef};
use crate::spec::SoupSpec;
use crate::sql_builder::quote_ident;

pub const ID_COL: &str = "id";
pub const SOUP_COL: &str = "soup";
pub const CREATED_COL: &str = "created";
pub const LAST_MODIFIED_COL: &str = "lastModified";

pub fn fts_table_name(table: &str) -> String { format!("{}_fts", table) }

pub fn shadow_table_name(table: &str) -> String { format!("{}__shadow", table) }

pub fn old_table_name(table: &str) -> String { format!("{}__old", table) }

/// Column metadata as reported by `PRAGMA table_info`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SqliteColumn {
    pub name: String,
    pub data_type: String,
}

/// Create a soup table (and its FTS mirror) without indexes
pub fn create_table(conn: &Connection, table: &str, columns: &[ColumnDef]) -> Result<()> {
    let mut definitions = vec![
        format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_ident(ID_COL)),
        format!("{} TEXT", quote_ident(SOUP_COL)),
        format!("{} INTEGER", quote_ident(CREATED_COL)),
        format!("{} INTEGER", quote_ident(LAST_MODIFIED_COL)),
    ];
    for column in columns {
        if let Some(sql_type) = column.index_type.sql_type() {
            definitions.push(format!("{} {}", quote_ident(&column.column_name), sql_type));
        }
    }
    let query = format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(table), definitions.join(", "));
    debug!("Creating soup table: {}", query);
    conn.execute(&query, [])?;

    let fts_columns: Vec<&str> = columns.iter().filter(|c| c.is_full_text()).map(|c| c.column_name.as_str()).collect();
    if !fts_columns.is_empty() {
        let query = format!("CREATE VIRTUAL TABLE IF NOT EXISTS {} USING fts5({})", quote_ident(&fts_table_name(table)), fts_columns.join(", "));
        debug!("Creating full-text table: {}", query);
        conn.execute(&query, [])?;
    }
    Ok(())
}

pub fn create_indexes(conn: &Connection, table: &str, columns: &[ColumnDef]) -> Result<()> {
    for column in columns {
        let query = format!("CREATE INDEX IF NOT EXISTS {} ON {} ({})", quote_ident(&column.index_name()), quote_ident(table), column.expression(None));
        debug!("Creating index: {}", query);
        conn.execute(&query, [])?;
    }
    Ok(())
}

/// Drop every explicitly created index on `table`
pub fn drop_indexes(conn: &Connection, table: &str) -> Result<()> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL")?;
    let names = stmt.query_map([table], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
    for name in names {
        conn.execute(&format!("DROP INDEX IF EXISTS {}", quote_ident(&name)), [])?;
    }
    Ok(())
}

pub fn drop_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&fts_table_name(table))), [])?;
    conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
    Ok(())
}

/// Rename a soup table and its FTS mirror, if present
pub fn rename_table(conn: &Connection, from: &str, to: &str) -> Result<()> {
    if table_exists(conn, from)? {
        conn.execute(&format!("ALTER TABLE {} RENAME TO {}", quote_ident(from), quote_ident(to)), [])?;
    }
    let (from_fts, to_fts) = (fts_table_name(from), fts_table_name(to));
    if table_exists(conn, &from_fts)? {
        conn.execute(&format!("ALTER TABLE {} RENAME TO {}", quote_ident(&from_fts), quote_ident(&to_fts)), [])?;
    }
    Ok(())
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row("SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?", [name], |row| row.get(0))?;
    Ok(count > 0)
}

pub fn physical_columns(conn: &Connection, table: &str) -> Result<Vec<SqliteColumn>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| Ok(SqliteColumn { name: row.get(1)?, data_type: row.get(2)? }))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Whether the soup's FTS5 build is present in this SQLite
pub fn fts_supported(conn: &Connection) -> Result<bool> {
    let used: i64 = conn.query_row("SELECT sqlite_compileoption_used('ENABLE_FTS5')", [], |row| row.get(0))?;
    Ok(used == 1)
}

fn expected_columns(columns: &[ColumnDef]) -> BTreeSet<SqliteColumn> {
    let fixed = [(ID_COL, "INTEGER"), (SOUP_COL, "TEXT"), (CREATED_COL, "INTEGER"), (LAST_MODIFIED_COL, "INTEGER")];
    let mut expected: BTreeSet<SqliteColumn> = fixed.iter().map(|(name, data_type)| SqliteColumn { name: name.to_string(), data_type: data_type.to_string() }).collect();
    for column in columns {
        if let Some(sql_type) = column.index_type.sql_type() {
            expected.insert(SqliteColumn { name: column.column_name.clone(), data_type: sql_type.to_string() });
        }
    }
    expected
}

/// Check that the live table has exactly the columns the catalog describes
pub fn verify_layout(conn: &Connection, meta: &SoupMetadata) -> Result<()> {
    let expected = expected_columns(&meta.columns);
    let actual: BTreeSet<SqliteColumn> = physical_columns(conn, &meta.table_name)?.into_iter().collect();
    if actual != expected {
        let describe = |set: &BTreeSet<SqliteColumn>| set.iter().map(|c| format!("{} {}", c.name, c.data_type)).collect::<Vec<_>>().join(", ");
        return Err(SoupStoreError::SchemaMismatch(format!(
            "soup {} table {} has columns [{}], catalog expects [{}]",
            meta.name(),
            meta.table_name,
            describe(&actual),
            describe(&expected)
        )));
    }
    if !meta.full_text_columns().is_empty() && !table_exists(conn, &fts_table_name(&meta.table_name))? {
        return Err(SoupStoreError::SchemaMismatch(format!("soup {} is missing its full-text table", meta.name())));
    }
    Ok(())
}

/// Whether moving from `meta` to the new layout needs a table rebuild
pub fn needs_rebuild(meta: &SoupMetadata, new_spec: &SoupSpec, new_columns: &[ColumnDef]) -> bool {
    // a column name may be handed to a different path with the same SQL type
    let physical = |columns: &[ColumnDef]| {
        columns.iter().filter(|c| c.is_physical()).map(|c| (c.column_name.clone(), c.path.clone(), c.index_type.as_str())).collect::<BTreeSet<_>>()
    };
    meta.uses_external_storage() != new_spec.uses_external_storage() || physical(&meta.columns) != physical(new_columns)
}

/// Decode a stored payload, from the soup column or the entry's external file
pub fn load_payload(storage: &ExternalStorage, table: &str, external: bool, id: i64, soup: Option<&str>) -> Result<Value> {
    if external {
        return storage.read(table, id);
    }
    match soup {
        Some(text) => Ok(serde_json::from_str(text)?),
        None => Err(SoupStoreError::SchemaMismatch(format!("entry {} of {} has no payload", id, table))),
    }
}

/// Refill the FTS mirror of `table` from its full_text columns
pub fn rebuild_fts(conn: &Connection, table: &str, columns: &[ColumnDef]) -> Result<()> {
    let fts_columns: Vec<String> = columns.iter().filter(|c| c.is_full_text()).map(|c| quote_ident(&c.column_name)).collect();
    if fts_columns.is_empty() {
        return Ok(());
    }
    let fts = quote_ident(&fts_table_name(table));
    conn.execute(&format!("DELETE FROM {}", fts), [])?;
    conn.execute(
        &format!("INSERT INTO {} (rowid, {cols}) SELECT {}, {cols} FROM {}", fts, quote_ident(ID_COL), quote_ident(table), cols = fts_columns.join(", ")),
        [],
    )?;
    Ok(())
}

/// Replace the FTS row of one entry with the current column values
pub fn refresh_fts_row(conn: &Connection, table: &str, columns: &[ColumnDef], id: i64) -> Result<()> {
    let fts_columns: Vec<String> = columns.iter().filter(|c| c.is_full_text()).map(|c| quote_ident(&c.column_name)).collect();
    if fts_columns.is_empty() {
        return Ok(());
    }
    let fts = quote_ident(&fts_table_name(table));
    conn.execute(&format!("DELETE FROM {} WHERE rowid = ?", fts), [id])?;
    conn.execute(
        &format!("INSERT INTO {} (rowid, {cols}) SELECT {id}, {cols} FROM {} WHERE {id} = ?", fts, quote_ident(table), cols = fts_columns.join(", "), id = quote_ident(ID_COL)),
        [id],
    )?;
    Ok(())
}

/// How to move a soup's rows into a rebuilt table
#[derive(Debug, Clone)]
pub struct CopyPlan<'a> {
    pub from_table: &'a str,
    pub to_table: &'a str,
    /// Table name payload files are kept under
    pub live_table: &'a str,
    pub old_columns: &'a [ColumnDef],
    pub new_columns: &'a [ColumnDef],
    /// Recompute every index value from the payload instead of carrying old values over
    pub reindex: bool,
    pub from_external: bool,
    pub to_external: bool,
}

/// Copy every row from `plan.from_table` into `plan.to_table`. Retained index values are
/// carried over, new indexes are left null unless reindexing. The destination is emptied first
/// and the AUTOINCREMENT sequence follows the rows.
pub fn copy_rows(conn: &Connection, plan: &CopyPlan<'_>, storage: &ExternalStorage) -> Result<usize> {
    let to = quote_ident(plan.to_table);
    let from = quote_ident(plan.from_table);
    conn.execute(&format!("DELETE FROM {}", to), [])?;

    let new_physical: Vec<&ColumnDef> = plan.new_columns.iter().filter(|c| c.is_physical()).collect();
    let sources: Vec<Option<&ColumnDef>> =
        new_physical.iter().map(|new| plan.old_columns.iter().find(|old| old.is_physical() && old.same_definition(new))).collect();

    let fixed = [ID_COL, SOUP_COL, CREATED_COL, LAST_MODIFIED_COL].map(quote_ident);
    let target_columns: Vec<String> = fixed.iter().cloned().chain(new_physical.iter().map(|c| quote_ident(&c.column_name))).collect();
    let source_columns: Vec<String> = fixed
        .iter()
        .cloned()
        .chain(sources.iter().map(|source| match source {
            Some(old) => quote_ident(&old.column_name),
            None => "NULL".to_string(),
        }))
        .collect();

    let copied = if !plan.reindex && plan.from_external == plan.to_external {
        conn.execute(&format!("INSERT INTO {} ({}) SELECT {} FROM {}", to, target_columns.join(", "), source_columns.join(", "), from), [])?
    } else {
        let placeholders = vec!["?"; target_columns.len()].join(", ");
        let mut insert = conn.prepare(&format!("INSERT INTO {} ({}) VALUES ({})", to, target_columns.join(", "), placeholders))?;
        let mut select = conn.prepare(&format!("SELECT {} FROM {} ORDER BY {}", source_columns.join(", "), from, quote_ident(ID_COL)))?;
        let mut rows = select.query([])?;
        let mut copied = 0;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let soup: Option<String> = row.get(1)?;
            let payload = load_payload(storage, plan.live_table, plan.from_external, id, soup.as_deref())?;

            let stored_soup = if plan.to_external {
                if !plan.from_external {
                    storage.write(plan.live_table, id, &payload)?;
                }
                SqlValue::Null
            } else {
                SqlValue::Text(payload.to_string())
            };

            let mut values: Vec<SqlValue> = vec![SqlValue::Integer(id), stored_soup, row.get(2)?, row.get(3)?];
            for (index, column) in new_physical.iter().enumerate() {
                let value = if plan.reindex { extract_value(&payload, column).to_sql() } else { row.get::<_, SqlValue>(4 + index)? };
                values.push(value);
            }
            insert.execute(params_from_iter(values))?;
            copied += 1;
        }
        copied
    };

    if table_exists(conn, &fts_table_name(plan.to_table))? {
        rebuild_fts(conn, plan.to_table, plan.new_columns)?;
    }
    carry_sequence(conn, plan.from_table, plan.to_table)?;
    debug!("Copied {} rows from {} to {}", copied, plan.from_table, plan.to_table);
    Ok(copied)
}

/// Ids never get reused, even across a rebuild
fn carry_sequence(conn: &Connection, from: &str, to: &str) -> Result<()> {
    conn.execute("DELETE FROM sqlite_sequence WHERE name = ?1", [to])?;
    conn.execute(
        &format!(
            "INSERT INTO sqlite_sequence (name, seq) SELECT ?1, max(COALESCE((SELECT seq FROM sqlite_sequence WHERE name = ?2), 0), COALESCE((SELECT max({}) FROM {}), 0))",
            quote_ident(ID_COL),
            quote_ident(to)
        ),
        [to, from],
    )?;
    Ok(())
}

/// Recompute the given index columns of every row from its payload
pub fn recompute_columns(conn: &Connection, meta: &SoupMetadata, columns: &[ColumnDef], storage: &ExternalStorage) -> Result<usize> {
    let physical: Vec<&ColumnDef> = columns.iter().filter(|c| c.is_physical()).collect();
    if physical.is_empty() {
        return Ok(0);
    }
    let table = quote_ident(&meta.table_name);

    let rows = {
        let mut stmt = conn.prepare(&format!("SELECT {}, {} FROM {}", quote_ident(ID_COL), quote_ident(SOUP_COL), table))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let assignments = physical.iter().map(|c| format!("{} = ?", quote_ident(&c.column_name))).collect::<Vec<_>>().join(", ");
    let mut update = conn.prepare(&format!("UPDATE {} SET {} WHERE {} = ?", table, assignments, quote_ident(ID_COL)))?;
    for (id, soup) in &rows {
        let payload = load_payload(storage, &meta.table_name, meta.uses_external_storage(), *id, soup.as_deref())?;
        let mut values: Vec<SqlValue> = physical.iter().map(|c| extract_value(&payload, c).to_sql()).collect();
        values.push(SqlValue::Integer(*id));
        update.execute(params_from_iter(values))?;
    }

    if physical.iter().any(|c| c.is_full_text()) {
        rebuild_fts(conn, &meta.table_name, &meta.columns)?;
    }
    debug!("Recomputed {} index columns over {} rows of {}", physical.len(), rows.len(), meta.name());
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::layout;
    use crate::spec::IndexSpec;
    use serde_json::json;

    fn seed(conn: &Connection, table: &str, columns: &[ColumnDef], rows: &[(i64, Value)]) {
        create_table(conn, table, columns).unwrap();
        for (id, doc) in rows {
            let mut names = vec![quote_ident(ID_COL), quote_ident(SOUP_COL), quote_ident(CREATED_COL), quote_ident(LAST_MODIFIED_COL)];
            let mut values = vec![SqlValue::Integer(*id), SqlValue::Text(doc.to_string()), SqlValue::Integer(1), SqlValue::Integer(1)];
            for column in columns.iter().filter(|c| c.is_physical()) {
                names.push(quote_ident(&column.column_name));
                values.push(extract_value(doc, column).to_sql());
            }
            let sql = format!("INSERT INTO {} ({}) VALUES ({})", quote_ident(table), names.join(", "), vec!["?"; names.len()].join(", "));
            conn.execute(&sql, params_from_iter(values)).unwrap();
        }
        rebuild_fts(conn, table, columns).unwrap();
    }

    #[test]
    fn test_create_table_layout() {
        let conn = Connection::open_in_memory().unwrap();
        let columns = layout("TABLE_1", &[IndexSpec::string("name"), IndexSpec::full_text("bio"), IndexSpec::json1("meta.x")], &[]);
        create_table(&conn, "TABLE_1", &columns).unwrap();
        create_indexes(&conn, "TABLE_1", &columns).unwrap();

        let names: Vec<String> = physical_columns(&conn, "TABLE_1").unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["id", "soup", "created", "lastModified", "TABLE_1_0", "TABLE_1_1"]);
        assert!(table_exists(&conn, "TABLE_1_fts").unwrap());

        drop_indexes(&conn, "TABLE_1").unwrap();
        let indexes: i64 = conn.query_row("SELECT count(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = 'TABLE_1' AND sql IS NOT NULL", [], |r| r.get(0)).unwrap();
        assert_eq!(indexes, 0);

        drop_table(&conn, "TABLE_1").unwrap();
        assert!(!table_exists(&conn, "TABLE_1").unwrap());
        assert!(!table_exists(&conn, "TABLE_1_fts").unwrap());
    }

    #[test]
    fn test_copy_keeps_retained_values_and_sequence() {
        let conn = Connection::open_in_memory().unwrap();
        let storage = ExternalStorage::new(None);
        let old = layout("TABLE_1", &[IndexSpec::string("name")], &[]);
        seed(&conn, "TABLE_1", &old, &[(1, json!({"name": "a", "age": 3})), (5, json!({"name": "b", "age": 4}))]);
        conn.execute("DELETE FROM \"TABLE_1\" WHERE id = 5", []).unwrap();

        let new = layout("TABLE_1", &[IndexSpec::string("name"), IndexSpec::integer("age")], &old);
        create_table(&conn, "TABLE_1__shadow", &new).unwrap();
        let plan = CopyPlan {
            from_table: "TABLE_1",
            to_table: "TABLE_1__shadow",
            live_table: "TABLE_1",
            old_columns: &old,
            new_columns: &new,
            reindex: false,
            from_external: false,
            to_external: false,
        };
        assert_eq!(copy_rows(&conn, &plan, &storage).unwrap(), 1);
        // copying twice is harmless
        assert_eq!(copy_rows(&conn, &plan, &storage).unwrap(), 1);

        let (name, age): (String, Option<i64>) = conn.query_row(r#"SELECT "TABLE_1_0", "TABLE_1_1" FROM "TABLE_1__shadow""#, [], |r| Ok((r.get(0)?, r.get(1)?))).unwrap();
        assert_eq!((name.as_str(), age), ("a", None));
        let seq: i64 = conn.query_row("SELECT seq FROM sqlite_sequence WHERE name = 'TABLE_1__shadow'", [], |r| r.get(0)).unwrap();
        assert_eq!(seq, 5);

        let plan = CopyPlan { reindex: true, ..plan };
        copy_rows(&conn, &plan, &storage).unwrap();
        let age: i64 = conn.query_row(r#"SELECT "TABLE_1_1" FROM "TABLE_1__shadow""#, [], |r| r.get(0)).unwrap();
        assert_eq!(age, 3);
    }

    #[test]
    fn test_copy_to_external_storage() {
        let conn = Connection::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage = ExternalStorage::new(Some(dir.path().to_path_buf()));
        let columns = layout("TABLE_1", &[IndexSpec::string("name")], &[]);
        seed(&conn, "TABLE_1", &columns, &[(1, json!({"name": "a"}))]);
        create_table(&conn, "TABLE_1__shadow", &columns).unwrap();

        let plan = CopyPlan {
            from_table: "TABLE_1",
            to_table: "TABLE_1__shadow",
            live_table: "TABLE_1",
            old_columns: &columns,
            new_columns: &columns,
            reindex: false,
            from_external: false,
            to_external: true,
        };
        copy_rows(&conn, &plan, &storage).unwrap();
        let soup: Option<String> = conn.query_row(r#"SELECT "soup" FROM "TABLE_1__shadow""#, [], |r| r.get(0)).unwrap();
        assert_eq!(soup, None);
        assert_eq!(storage.read("TABLE_1", 1).unwrap(), json!({"name": "a"}));
    }

    #[test]
    fn test_verify_layout_and_rebuild_detection() {
        let conn = Connection::open_in_memory().unwrap();
        let columns = layout("TABLE_1", &[IndexSpec::string("name")], &[]);
        create_table(&conn, "TABLE_1", &columns).unwrap();
        let meta = SoupMetadata { soup_spec: SoupSpec::new("people"), table_name: "TABLE_1".into(), columns: columns.clone(), created: 0, last_modified: 0 };
        verify_layout(&conn, &meta).unwrap();

        let wider = layout("TABLE_1", &[IndexSpec::string("name"), IndexSpec::integer("age")], &columns);
        let wrong = SoupMetadata { columns: wider.clone(), ..meta.clone() };
        assert_eq!(verify_layout(&conn, &wrong).unwrap_err().kind(), crate::ErrorKind::SchemaMismatch);

        assert!(needs_rebuild(&meta, &SoupSpec::new("people"), &wider));
        assert!(needs_rebuild(&meta, &SoupSpec::external("people"), &columns));
        let with_json1 = layout("TABLE_1", &[IndexSpec::string("name"), IndexSpec::json1("x")], &columns);
        assert!(!needs_rebuild(&meta, &SoupSpec::new("people"), &with_json1));
        let renamed = layout("TABLE_1", &[IndexSpec::string("nickname")], &columns);
        assert_eq!(renamed[0].column_name, columns[0].column_name);
        assert!(needs_rebuild(&meta, &SoupSpec::new("people"), &renamed));
    }

    #[test]
    fn test_recompute_columns() {
        let conn = Connection::open_in_memory().unwrap();
        let columns = layout("TABLE_1", &[IndexSpec::string("name"), IndexSpec::full_text("bio")], &[]);
        seed(&conn, "TABLE_1", &columns, &[(1, json!({"name": "a", "bio": "likes rust"}))]);
        conn.execute(r#"UPDATE "TABLE_1" SET "TABLE_1_0" = NULL, "TABLE_1_1" = NULL"#, []).unwrap();

        let meta = SoupMetadata { soup_spec: SoupSpec::new("people"), table_name: "TABLE_1".into(), columns: columns.clone(), created: 0, last_modified: 0 };
        assert_eq!(recompute_columns(&conn, &meta, &columns, &ExternalStorage::new(None)).unwrap(), 1);
        let name: String = conn.query_row(r#"SELECT "TABLE_1_0" FROM "TABLE_1""#, [], |r| r.get(0)).unwrap();
        assert_eq!(name, "a");
        let hits: i64 = conn.query_row(r#"SELECT count(*) FROM "TABLE_1_fts" WHERE "TABLE_1_fts" MATCH 'rust'"#, [], |r| r.get(0)).unwrap();
        assert_eq!(hits, 1);
    }
}
