//! Schema catalog: which soups exist, where their rows live and how they are indexed

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, SoupStoreError};
use crate::long_ops;
use crate::path::{self, ColumnDef};
use crate::spec::{IndexSpec, SoupFeature, SoupSpec};

pub const SOUP_ATTRS_TABLE: &str = "soup_attrs";
pub const SOUP_INDEX_MAP_TABLE: &str = "soup_index_map";

/// Create the catalog tables and the long operation log if missing
pub fn create_metadata_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{attrs}" (
             "id" INTEGER PRIMARY KEY AUTOINCREMENT,
             "soupName" TEXT NOT NULL UNIQUE,
             "tableName" TEXT,
             "externalStorage" INTEGER NOT NULL DEFAULT 0,
             "created" INTEGER NOT NULL,
             "lastModified" INTEGER NOT NULL
           );
           CREATE TABLE IF NOT EXISTS "{index_map}" (
             "soupName" TEXT NOT NULL,
             "path" TEXT NOT NULL,
             "columnName" TEXT NOT NULL,
             "columnType" TEXT NOT NULL
           );
           CREATE INDEX IF NOT EXISTS "{index_map}_0" ON "{index_map}" ("soupName");"#,
        attrs = SOUP_ATTRS_TABLE,
        index_map = SOUP_INDEX_MAP_TABLE
    ))?;
    long_ops::create_long_operations_table(conn)?;
    Ok(())
}

/// Catalog view of one soup
#[derive(Debug, Clone, PartialEq)]
pub struct SoupMetadata {
    pub soup_spec: SoupSpec,
    pub table_name: String,
    pub columns: Vec<ColumnDef>,
    pub created: i64,
    pub last_modified: i64,
}

impl SoupMetadata {
    pub fn name(&self) -> &str { &self.soup_spec.name }

    pub fn uses_external_storage(&self) -> bool { self.soup_spec.uses_external_storage() }

    pub fn column_for_path(&self, path: &str) -> Option<&ColumnDef> { self.columns.iter().find(|c| c.path == path) }

    pub fn require_column(&self, path: &str) -> Result<&ColumnDef> {
        self.column_for_path(path).ok_or_else(|| SoupStoreError::not_indexed(self.name(), path))
    }

    pub fn physical_columns(&self) -> impl Iterator<Item = &ColumnDef> { self.columns.iter().filter(|c| c.is_physical()) }

    pub fn full_text_columns(&self) -> Vec<&ColumnDef> { self.columns.iter().filter(|c| c.is_full_text()).collect() }

    pub fn index_specs(&self) -> Vec<IndexSpec> { self.columns.iter().map(ColumnDef::to_index_spec).collect() }

    /// Whether registering `soup_spec` with `specs` would change nothing
    pub fn matches(&self, soup_spec: &SoupSpec, specs: &[IndexSpec]) -> bool {
        self.soup_spec.same_definition(soup_spec) && crate::spec::same_index_specs(&self.index_specs(), specs)
    }
}

pub fn lookup(conn: &Connection, soup: &str) -> Result<Option<SoupMetadata>> {
    let attrs = conn
        .query_row(
            &format!(r#"SELECT "tableName", "externalStorage", "created", "lastModified" FROM "{}" WHERE "soupName" = ?"#, SOUP_ATTRS_TABLE),
            [soup],
            |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, bool>(1)?, row.get::<_, i64>(2)?, row.get::<_, i64>(3)?)),
        )
        .optional()?;

    let Some((table_name, external, created, last_modified)) = attrs else {
        return Ok(None);
    };
    let table_name = table_name.ok_or_else(|| SoupStoreError::SchemaMismatch(format!("soup {} has no table", soup)))?;

    let mut stmt = conn.prepare(&format!(r#"SELECT "path", "columnName", "columnType" FROM "{}" WHERE "soupName" = ? ORDER BY rowid"#, SOUP_INDEX_MAP_TABLE))?;
    let rows = stmt.query_map([soup], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?;
    let mut columns = Vec::new();
    for row in rows {
        let (path, column_name, column_type) = row?;
        columns.push(ColumnDef { path, index_type: column_type.parse()?, column_name });
    }

    let soup_spec = SoupSpec { name: soup.to_string(), features: if external { vec![SoupFeature::ExternalStorage] } else { Vec::new() } };
    Ok(Some(SoupMetadata { soup_spec, table_name, columns, created, last_modified }))
}

pub fn require(conn: &Connection, soup: &str) -> Result<SoupMetadata> { lookup(conn, soup)?.ok_or_else(|| SoupStoreError::soup_not_found(soup)) }

pub fn soup_exists(conn: &Connection, soup: &str) -> Result<bool> {
    let count: i64 = conn.query_row(&format!(r#"SELECT count(*) FROM "{}" WHERE "soupName" = ?"#, SOUP_ATTRS_TABLE), [soup], |row| row.get(0))?;
    Ok(count > 0)
}

pub fn list_soups(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(r#"SELECT "soupName" FROM "{}" ORDER BY "soupName""#, SOUP_ATTRS_TABLE))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Record a new soup and lay out its columns. The caller creates the table in the same transaction.
pub fn register(conn: &Connection, soup_spec: &SoupSpec, specs: &[IndexSpec]) -> Result<SoupMetadata> {
    let now = crate::now_millis();
    conn.execute(
        &format!(r#"INSERT INTO "{}" ("soupName", "externalStorage", "created", "lastModified") VALUES (?1, ?2, ?3, ?3)"#, SOUP_ATTRS_TABLE),
        params![soup_spec.name, soup_spec.uses_external_storage(), now],
    )?;
    let table_name = format!("TABLE_{}", conn.last_insert_rowid());
    conn.execute(&format!(r#"UPDATE "{}" SET "tableName" = ? WHERE "soupName" = ?"#, SOUP_ATTRS_TABLE), params![table_name, soup_spec.name])?;

    let columns = path::layout(&table_name, specs, &[]);
    insert_columns(conn, &soup_spec.name, &columns)?;
    debug!("Registered soup {} as {} with {} indexes", soup_spec.name, table_name, columns.len());

    Ok(SoupMetadata { soup_spec: soup_spec.clone(), table_name, columns, created: now, last_modified: now })
}

/// Swap in a new index layout and storage mode for an existing soup
pub fn replace_index_specs(conn: &Connection, soup_spec: &SoupSpec, columns: &[ColumnDef], table_name: &str) -> Result<()> {
    conn.execute(&format!(r#"DELETE FROM "{}" WHERE "soupName" = ?"#, SOUP_INDEX_MAP_TABLE), [&soup_spec.name])?;
    insert_columns(conn, &soup_spec.name, columns)?;
    let updated = conn.execute(
        &format!(r#"UPDATE "{}" SET "tableName" = ?1, "externalStorage" = ?2, "lastModified" = ?3 WHERE "soupName" = ?4"#, SOUP_ATTRS_TABLE),
        params![table_name, soup_spec.uses_external_storage(), crate::now_millis(), soup_spec.name],
    )?;
    if updated == 0 {
        return Err(SoupStoreError::soup_not_found(&soup_spec.name));
    }
    Ok(())
}

/// Forget a soup, including any operation still logged against it. The caller drops its tables.
pub fn remove(conn: &Connection, soup: &str) -> Result<()> {
    long_ops::delete_records_for_soup(conn, soup)?;
    conn.execute(&format!(r#"DELETE FROM "{}" WHERE "soupName" = ?"#, SOUP_INDEX_MAP_TABLE), [soup])?;
    conn.execute(&format!(r#"DELETE FROM "{}" WHERE "soupName" = ?"#, SOUP_ATTRS_TABLE), [soup])?;
    Ok(())
}

fn insert_columns(conn: &Connection, soup: &str, columns: &[ColumnDef]) -> Result<()> {
    let mut stmt = conn.prepare(&format!(r#"INSERT INTO "{}" ("soupName", "path", "columnName", "columnType") VALUES (?, ?, ?, ?)"#, SOUP_INDEX_MAP_TABLE))?;
    for column in columns {
        stmt.execute(params![soup, column.path, column.column_name, column.index_type.as_str()])?;
    }
    Ok(())
}
