//! Long operation recovery log
//!
//! Multi-step schema changes record themselves in `long_operations_status` before touching any
//! table. Each step commits its work together with the status update, so after a crash the
//! operation resumes from the last committed step.

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog;
use crate::error::{Result, SoupStoreError};
use crate::external::ExternalStorage;
use crate::path::ColumnDef;
use crate::spec::SoupSpec;
use crate::table::{self, CopyPlan};

pub const LONG_OPERATIONS_STATUS_TABLE: &str = "long_operations_status";

pub fn create_long_operations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        &format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                 "id" INTEGER PRIMARY KEY AUTOINCREMENT,
                 "type" TEXT NOT NULL,
                 "details" TEXT NOT NULL,
                 "status" TEXT NOT NULL,
                 "created" INTEGER NOT NULL,
                 "lastModified" INTEGER NOT NULL
               )"#,
            LONG_OPERATIONS_STATUS_TABLE
        ),
        [],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LongOperationType {
    AlterSoup,
    ReIndexSoup,
}

impl LongOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LongOperationType::AlterSoup => "alterSoup",
            LongOperationType::ReIndexSoup => "reIndexSoup",
        }
    }
}

impl FromStr for LongOperationType {
    type Err = SoupStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "alterSoup" => Ok(LongOperationType::AlterSoup),
            "reIndexSoup" => Ok(LongOperationType::ReIndexSoup),
            other => Err(SoupStoreError::SchemaMismatch(format!("unknown long operation type {}", other))),
        }
    }
}

/// A row of the recovery log
#[derive(Debug, Clone, PartialEq)]
pub struct LongOperationRecord {
    pub id: i64,
    pub op_type: LongOperationType,
    pub details: serde_json::Value,
    pub status: String,
    pub created: i64,
    pub last_modified: i64,
}

pub fn insert_record(conn: &Connection, op_type: LongOperationType, details: &serde_json::Value, status: &str) -> Result<i64> {
    let now = crate::now_millis();
    conn.execute(
        &format!(r#"INSERT INTO "{}" ("type", "details", "status", "created", "lastModified") VALUES (?1, ?2, ?3, ?4, ?4)"#, LONG_OPERATIONS_STATUS_TABLE),
        params![op_type.as_str(), details.to_string(), status, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_status(conn: &Connection, id: i64, status: &str) -> Result<()> {
    conn.execute(
        &format!(r#"UPDATE "{}" SET "status" = ?1, "lastModified" = ?2 WHERE "id" = ?3"#, LONG_OPERATIONS_STATUS_TABLE),
        params![status, crate::now_millis(), id],
    )?;
    Ok(())
}

pub fn delete_record(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(&format!(r#"DELETE FROM "{}" WHERE "id" = ?"#, LONG_OPERATIONS_STATUS_TABLE), [id])?;
    Ok(())
}

/// Unfinished operations, oldest first
pub fn pending(conn: &Connection) -> Result<Vec<LongOperationRecord>> {
    let mut stmt =
        conn.prepare(&format!(r#"SELECT "id", "type", "details", "status", "created", "lastModified" FROM "{}" ORDER BY "id""#, LONG_OPERATIONS_STATUS_TABLE))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, String>(3)?, row.get::<_, i64>(4)?, row.get::<_, i64>(5)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for (id, op_type, details, status, created, last_modified) in rows {
        records.push(LongOperationRecord { id, op_type: op_type.parse()?, details: serde_json::from_str(&details)?, status, created, last_modified });
    }
    Ok(records)
}

/// Forget every logged operation on `soup`, which is being removed
pub fn delete_records_for_soup(conn: &Connection, soup: &str) -> Result<usize> {
    let deleted = conn.execute(&format!(r#"DELETE FROM "{}" WHERE json_extract("details", '$.soupName') = ?"#, LONG_OPERATIONS_STATUS_TABLE), [soup])?;
    if deleted > 0 {
        debug!("Discarded {} pending operations of removed soup {}", deleted, soup);
    }
    Ok(deleted)
}

/// Steps of an alteration, in execution order. A record's status names the last committed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlterSoupStep {
    CreateTable,
    CopyTable,
    RenameTable,
    DropOldTable,
    Done,
}

impl AlterSoupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlterSoupStep::CreateTable => "CREATE_TABLE",
            AlterSoupStep::CopyTable => "COPY_TABLE",
            AlterSoupStep::RenameTable => "RENAME_TABLE",
            AlterSoupStep::DropOldTable => "DROP_OLD_TABLE",
            AlterSoupStep::Done => "DONE",
        }
    }

    pub fn next(&self) -> Option<AlterSoupStep> {
        match self {
            AlterSoupStep::CreateTable => Some(AlterSoupStep::CopyTable),
            AlterSoupStep::CopyTable => Some(AlterSoupStep::RenameTable),
            AlterSoupStep::RenameTable => Some(AlterSoupStep::DropOldTable),
            AlterSoupStep::DropOldTable => Some(AlterSoupStep::Done),
            AlterSoupStep::Done => None,
        }
    }
}

impl fmt::Display for AlterSoupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for AlterSoupStep {
    type Err = SoupStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE_TABLE" => Ok(AlterSoupStep::CreateTable),
            "COPY_TABLE" => Ok(AlterSoupStep::CopyTable),
            "RENAME_TABLE" => Ok(AlterSoupStep::RenameTable),
            "DROP_OLD_TABLE" => Ok(AlterSoupStep::DropOldTable),
            "DONE" => Ok(AlterSoupStep::Done),
            other => Err(SoupStoreError::SchemaMismatch(format!("unknown alter soup status {}", other))),
        }
    }
}

/// Everything needed to finish an alteration without the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterSoupDetails {
    pub soup_name: String,
    pub table_name: String,
    pub old_soup_spec: SoupSpec,
    pub new_soup_spec: SoupSpec,
    pub old_columns: Vec<ColumnDef>,
    pub new_columns: Vec<ColumnDef>,
    pub re_index_data: bool,
}

#[derive(Debug, Clone)]
pub struct AlterSoupOperation {
    record_id: Option<i64>,
    details: AlterSoupDetails,
    last_step: Option<AlterSoupStep>,
}

impl AlterSoupOperation {
    pub fn new(details: AlterSoupDetails) -> Self { Self { record_id: None, details, last_step: None } }

    pub fn from_record(record: &LongOperationRecord) -> Result<Self> {
        Ok(Self { record_id: Some(record.id), details: serde_json::from_value(record.details.clone())?, last_step: Some(record.status.parse()?) })
    }

    /// Run the remaining steps; `stop_after` halts once that step has committed
    pub fn run(&mut self, conn: &mut Connection, storage: &ExternalStorage, stop_after: Option<AlterSoupStep>) -> Result<()> {
        loop {
            let step = match self.last_step {
                None => AlterSoupStep::CreateTable,
                Some(last) => match last.next() {
                    Some(step) => step,
                    None => break,
                },
            };
            self.execute(conn, storage, step)?;
            self.last_step = Some(step);
            if stop_after == Some(step) {
                debug!("Alteration of {} stopped after {}", self.details.soup_name, step);
                break;
            }
        }
        Ok(())
    }

    fn execute(&mut self, conn: &mut Connection, storage: &ExternalStorage, step: AlterSoupStep) -> Result<()> {
        let details = &self.details;
        let live = details.table_name.as_str();
        let shadow = table::shadow_table_name(live);
        let old = table::old_table_name(live);
        debug!("Alter soup {}: {}", details.soup_name, step);

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match step {
            AlterSoupStep::CreateTable => {
                table::drop_table(&tx, &shadow)?;
                table::create_table(&tx, &shadow, &details.new_columns)?;
                let id = insert_record(&tx, LongOperationType::AlterSoup, &serde_json::to_value(details)?, step.as_str())?;
                self.record_id = Some(id);
            }
            AlterSoupStep::CopyTable => {
                let plan = CopyPlan {
                    from_table: live,
                    to_table: &shadow,
                    live_table: live,
                    old_columns: &details.old_columns,
                    new_columns: &details.new_columns,
                    reindex: details.re_index_data,
                    from_external: details.old_soup_spec.uses_external_storage(),
                    to_external: details.new_soup_spec.uses_external_storage(),
                };
                table::copy_rows(&tx, &plan, storage)?;
            }
            AlterSoupStep::RenameTable => {
                table::drop_table(&tx, &old)?;
                table::drop_indexes(&tx, live)?;
                table::rename_table(&tx, live, &old)?;
                table::rename_table(&tx, &shadow, live)?;
                table::create_indexes(&tx, live, &details.new_columns)?;
                catalog::replace_index_specs(&tx, &details.new_soup_spec, &details.new_columns, live)?;
            }
            AlterSoupStep::DropOldTable => {
                table::drop_table(&tx, &old)?;
                if details.old_soup_spec.uses_external_storage() && !details.new_soup_spec.uses_external_storage() {
                    storage.remove_soup_dir(live)?;
                }
            }
            AlterSoupStep::Done => {}
        }

        let record_id = self.record_id.ok_or_else(|| SoupStoreError::SchemaMismatch(format!("alteration of {} has no log record", details.soup_name)))?;
        match step {
            AlterSoupStep::Done => delete_record(&tx, record_id)?,
            _ => update_status(&tx, record_id, step.as_str())?,
        }
        tx.commit()?;
        Ok(())
    }
}

/// Reindexing recorded in the log, for resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReIndexSoupDetails {
    pub soup_name: String,
    pub paths: Vec<String>,
}

pub const REINDEX_STARTING: &str = "STARTING";

/// Record the reindex, then recompute and clear the record in a second transaction
pub fn reindex_soup(conn: &mut Connection, storage: &ExternalStorage, details: &ReIndexSoupDetails) -> Result<usize> {
    let meta = catalog::require(conn, &details.soup_name)?;
    for path in &details.paths {
        meta.require_column(path)?;
    }

    let id = {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = insert_record(&tx, LongOperationType::ReIndexSoup, &serde_json::to_value(details)?, REINDEX_STARTING)?;
        tx.commit()?;
        id
    };
    finish_reindex(conn, storage, id, details)
}

fn finish_reindex(conn: &mut Connection, storage: &ExternalStorage, record_id: i64, details: &ReIndexSoupDetails) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let touched = match catalog::lookup(&tx, &details.soup_name)? {
        Some(meta) => {
            let mut columns = Vec::new();
            for path in &details.paths {
                match meta.column_for_path(path) {
                    Some(column) => columns.push(column.clone()),
                    None => warn!("Skipping reindex of {}.{}: path is no longer indexed", details.soup_name, path),
                }
            }
            table::recompute_columns(&tx, &meta, &columns, storage)?
        }
        None => {
            warn!("Dropping reindex of {}: soup no longer exists", details.soup_name);
            0
        }
    };
    delete_record(&tx, record_id)?;
    tx.commit()?;
    Ok(touched)
}

/// Drop the leftovers of an alteration that can no longer finish
fn discard_alteration(conn: &mut Connection, record_id: i64, details: &AlterSoupDetails) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    table::drop_table(&tx, &table::shadow_table_name(&details.table_name))?;
    table::drop_table(&tx, &table::old_table_name(&details.table_name))?;
    delete_record(&tx, record_id)?;
    tx.commit()?;
    Ok(())
}

/// Finish every interrupted operation, oldest first. Returns how many were resumed.
pub fn resume_all(conn: &mut Connection, storage: &ExternalStorage) -> Result<usize> {
    let records = pending(conn)?;
    for record in &records {
        info!("Resuming {} operation {} at {}", record.op_type.as_str(), record.id, record.status);
        match record.op_type {
            LongOperationType::AlterSoup => {
                let mut operation = AlterSoupOperation::from_record(record)?;
                if catalog::lookup(conn, &operation.details.soup_name)?.is_some() {
                    operation.run(conn, storage, None)?;
                } else {
                    warn!("Dropping alteration of {}: soup no longer exists", operation.details.soup_name);
                    discard_alteration(conn, record.id, &operation.details)?;
                }
            }
            LongOperationType::ReIndexSoup => {
                let details: ReIndexSoupDetails = serde_json::from_value(record.details.clone())?;
                finish_reindex(conn, storage, record.id, &details)?;
            }
        }
    }
    Ok(records.len())
}

/// Rebuild every soup whose table disagrees with the catalog. Returns how many were repaired.
pub fn repair_schemas(conn: &mut Connection, storage: &ExternalStorage) -> Result<usize> {
    let mut repaired = 0;
    for soup in catalog::list_soups(conn)? {
        let meta = catalog::require(conn, &soup)?;
        if !table::table_exists(conn, &meta.table_name)? {
            warn!("Soup {} lost its table {}; recreating it empty", soup, meta.table_name);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            table::create_table(&tx, &meta.table_name, &meta.columns)?;
            table::create_indexes(&tx, &meta.table_name, &meta.columns)?;
            tx.commit()?;
            repaired += 1;
            continue;
        }

        match table::verify_layout(conn, &meta) {
            Ok(()) => {}
            Err(SoupStoreError::SchemaMismatch(detail)) => {
                warn!("{}; rebuilding soup {} from the catalog", detail, soup);
                let present: Vec<String> = table::physical_columns(conn, &meta.table_name)?.into_iter().map(|c| c.name).collect();
                let old_columns = meta.columns.iter().filter(|c| !c.is_physical() || present.contains(&c.column_name)).cloned().collect();
                let details = AlterSoupDetails {
                    soup_name: soup.clone(),
                    table_name: meta.table_name.clone(),
                    old_soup_spec: meta.soup_spec.clone(),
                    new_soup_spec: meta.soup_spec.clone(),
                    old_columns,
                    new_columns: meta.columns.clone(),
                    re_index_data: true,
                };
                AlterSoupOperation::new(details).run(conn, storage, None)?;
                repaired += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(repaired)
}
