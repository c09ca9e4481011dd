//! Store façade
//!
//! A [`SoupStore`] owns a one-connection pool. Every operation checks that connection out for its
//! whole duration, which serializes catalog, table and recovery log changes per store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::{self, SoupMetadata};
use crate::config::StoreConfig;
use crate::connection::{SqliteConfig, SqliteConnectionManager};
use crate::error::{Result, SoupStoreError};
use crate::explain::{self, ExplainPlan};
use crate::external::ExternalStorage;
use crate::long_ops::{self, AlterSoupDetails, AlterSoupOperation, AlterSoupStep, LongOperationRecord, ReIndexSoupDetails};
use crate::path::{self, Capabilities};
use crate::query::{QueryKind, QuerySpec};
use crate::spec::{IndexSpec, SoupSpec};
use crate::sql_builder::{self, quote_ident, Projection, TranslatedQuery};
use crate::table::{self, ID_COL, SOUP_COL};
use crate::upsert::{self, IdentityRule};
use crate::value::SqliteValue;

/// Rendered smart SQL keyed by the caller's text
type SmartSqlCache = Arc<RwLock<HashMap<String, String>>>;

/// Row count and on-disk footprint of one soup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoupStats {
    pub rows: usize,
    /// Bytes used by the soup's table and indexes; None when DBSTAT is unavailable
    pub bytes: Option<u64>,
}

#[derive(Clone)]
pub struct SoupStore {
    name: String,
    location: SqliteConfig,
    pool: bb8::Pool<SqliteConnectionManager>,
    storage: ExternalStorage,
    capabilities: Capabilities,
    capture_explain: Arc<AtomicBool>,
    last_explain: Arc<RwLock<Option<ExplainPlan>>>,
    smart_sql_cache: SmartSqlCache,
    data_protection_active: Arc<AtomicBool>,
    /// Set while the recovery log holds operations; changes would race the pending table swap
    needs_resume: Arc<AtomicBool>,
}

impl SoupStore {
    /// Open (creating if needed) the store described by `config`
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let manager = SqliteConnectionManager::new(config.location.clone()).with_keys(config.key_provider.clone(), config.salt_provider.clone());

        // A rejected key has to fail here rather than as a pool checkout timeout
        let first = manager.clone();
        let full_text = tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = first.create_connection()?;
            table::fts_supported(&conn)
        })
        .await
        .map_err(|e| SoupStoreError::TaskJoin(e.to_string()))??;

        let pool = bb8::Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .test_on_check_out(false)
            .retry_connection(false)
            .build(manager)
            .await?;

        let storage = ExternalStorage::new(config.resolved_external_storage_dir());
        let store = Self {
            name: config.name.clone(),
            location: config.location.clone(),
            pool,
            capabilities: Capabilities { full_text, external_storage: storage.is_configured() },
            storage,
            capture_explain: Arc::new(AtomicBool::new(config.capture_explain_query_plan)),
            last_explain: Arc::new(RwLock::new(None)),
            smart_sql_cache: Arc::new(RwLock::new(HashMap::new())),
            data_protection_active: Arc::new(AtomicBool::new(false)),
            needs_resume: Arc::new(AtomicBool::new(false)),
        };

        store.connection().await?.with_connection(|c| catalog::create_metadata_tables(c)).await?;
        info!("Opened soup store {} ({:?})", store.name, store.location);

        if config.resume_on_open {
            store.resume_long_operations().await?;
        } else {
            store.refresh_resume_gate().await?;
        }
        Ok(store)
    }

    /// Open an unencrypted in-memory store (for testing)
    pub async fn open_in_memory(name: impl Into<String>) -> Result<Self> { Self::open(StoreConfig::memory(name)).await }

    pub fn name(&self) -> &str { &self.name }

    pub fn location(&self) -> &SqliteConfig { &self.location }

    pub fn supports_full_text(&self) -> bool { self.capabilities.full_text }

    async fn connection(&self) -> Result<bb8::PooledConnection<'_, SqliteConnectionManager>> { Ok(self.pool.get().await?) }

    fn invalidate_smart_sql_cache(&self) { self.smart_sql_cache.write().expect("RwLock poisoned").clear(); }

    /// Refuse changes until logged operations have been resumed
    fn ensure_resumed(&self) -> Result<()> {
        if self.needs_resume.load(Ordering::Acquire) {
            return Err(SoupStoreError::ResumeRequired);
        }
        Ok(())
    }

    async fn refresh_resume_gate(&self) -> Result<()> {
        let pending = self.connection().await?.with_connection(|c| Ok(long_ops::pending(c)?.len())).await?;
        if pending > 0 {
            warn!("Store {}: {} long operations pending; changes are refused until they are resumed", self.name, pending);
        }
        self.needs_resume.store(pending > 0, Ordering::Release);
        Ok(())
    }

    // Long operations

    /// Finish interrupted alterations and reindexes, then repair any table that drifted from the
    /// catalog. Returns how many logged operations were resumed.
    pub async fn resume_long_operations(&self) -> Result<usize> {
        let storage = self.storage.clone();
        let conn = self.connection().await?;
        let (resumed, repaired) = conn
            .with_connection_mut(move |c| {
                let resumed = long_ops::resume_all(c, &storage)?;
                let repaired = long_ops::repair_schemas(c, &storage)?;
                Ok((resumed, repaired))
            })
            .await?;
        self.needs_resume.store(false, Ordering::Release);
        if resumed > 0 || repaired > 0 {
            info!("Store {}: resumed {} long operations, repaired {} soups", self.name, resumed, repaired);
            self.invalidate_smart_sql_cache();
        }
        Ok(resumed)
    }

    pub async fn pending_long_operations(&self) -> Result<Vec<LongOperationRecord>> {
        self.connection().await?.with_connection(|c| long_ops::pending(c)).await
    }

    // Soup lifecycle

    pub async fn register_soup(&self, soup: &str, specs: Vec<IndexSpec>) -> Result<()> { self.register_soup_with_spec(SoupSpec::new(soup), specs).await }

    /// Register a soup. Registering the same definition again is a no-op.
    pub async fn register_soup_with_spec(&self, soup_spec: SoupSpec, specs: Vec<IndexSpec>) -> Result<()> {
        self.ensure_resumed()?;
        path::validate_index_specs(&soup_spec, &specs, self.capabilities)?;
        let soup = soup_spec.name.clone();
        let conn = self.connection().await?;
        let created = conn
            .with_connection_mut(move |c| {
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if let Some(existing) = catalog::lookup(&tx, &soup_spec.name)? {
                    if existing.matches(&soup_spec, &specs) {
                        return Ok(false);
                    }
                    return Err(SoupStoreError::AlreadyExists(soup_spec.name.clone()));
                }
                let meta = catalog::register(&tx, &soup_spec, &specs)?;
                table::create_table(&tx, &meta.table_name, &meta.columns)?;
                table::create_indexes(&tx, &meta.table_name, &meta.columns)?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        if created {
            info!("Registered soup {}", soup);
            self.invalidate_smart_sql_cache();
        }
        Ok(())
    }

    pub async fn soup_exists(&self, soup: &str) -> Result<bool> {
        let soup = soup.to_string();
        self.connection().await?.with_connection(move |c| catalog::soup_exists(c, &soup)).await
    }

    pub async fn soup_metadata(&self, soup: &str) -> Result<SoupMetadata> {
        let soup = soup.to_string();
        self.connection().await?.with_connection(move |c| catalog::require(c, &soup)).await
    }

    pub async fn soup_spec(&self, soup: &str) -> Result<SoupSpec> { Ok(self.soup_metadata(soup).await?.soup_spec) }

    /// Index specs in declaration order, with their assigned columns
    pub async fn index_specs(&self, soup: &str) -> Result<Vec<IndexSpec>> { Ok(self.soup_metadata(soup).await?.index_specs()) }

    pub async fn all_soup_names(&self) -> Result<Vec<String>> { self.connection().await?.with_connection(|c| catalog::list_soups(c)).await }

    /// Check that a soup's table matches its catalog entry
    pub async fn verify_schema(&self, soup: &str) -> Result<()> {
        let soup = soup.to_string();
        self.connection().await?.with_connection(move |c| table::verify_layout(c, &catalog::require(c, &soup)?)).await
    }

    /// Change a soup's indexes and, with `soup_spec`, its storage mode
    pub async fn alter_soup(&self, soup: &str, soup_spec: Option<SoupSpec>, specs: Vec<IndexSpec>, reindex: bool) -> Result<()> {
        self.alter(soup, soup_spec, specs, reindex, None).await
    }

    /// Alter, but stop once `stop_after` has committed, leaving the rest to resume
    #[doc(hidden)]
    pub async fn alter_soup_interrupted(&self, soup: &str, soup_spec: Option<SoupSpec>, specs: Vec<IndexSpec>, reindex: bool, stop_after: AlterSoupStep) -> Result<()> {
        self.alter(soup, soup_spec, specs, reindex, Some(stop_after)).await
    }

    async fn alter(&self, soup: &str, soup_spec: Option<SoupSpec>, specs: Vec<IndexSpec>, reindex: bool, stop_after: Option<AlterSoupStep>) -> Result<()> {
        self.ensure_resumed()?;
        let soup = soup.to_string();
        let storage = self.storage.clone();
        let capabilities = self.capabilities;
        info!("Altering soup {} (reindex: {})", soup, reindex);
        let altered = self
            .connection()
            .await?
            .with_connection_mut(move |c| {
                let meta = catalog::require(c, &soup)?;
                let new_spec = soup_spec.unwrap_or_else(|| meta.soup_spec.clone());
                if new_spec.name != soup {
                    return Err(SoupStoreError::InvalidSpec(format!("soup spec names {} while altering {}", new_spec.name, soup)));
                }
                path::validate_index_specs(&new_spec, &specs, capabilities)?;
                let new_columns = path::layout(&meta.table_name, &specs, &meta.columns);

                if !reindex && !table::needs_rebuild(&meta, &new_spec, &new_columns) {
                    debug!("Alter soup {}: catalog and expression indexes only", soup);
                    let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    table::drop_indexes(&tx, &meta.table_name)?;
                    table::create_indexes(&tx, &meta.table_name, &new_columns)?;
                    catalog::replace_index_specs(&tx, &new_spec, &new_columns, &meta.table_name)?;
                    tx.commit()?;
                    return Ok(());
                }

                let details = AlterSoupDetails {
                    soup_name: soup.clone(),
                    table_name: meta.table_name.clone(),
                    old_soup_spec: meta.soup_spec.clone(),
                    new_soup_spec: new_spec,
                    old_columns: meta.columns.clone(),
                    new_columns,
                    re_index_data: reindex,
                };
                AlterSoupOperation::new(details).run(c, &storage, stop_after)
            })
            .await;
        // A failed or stopped alteration may already have touched the catalog
        self.invalidate_smart_sql_cache();
        if altered.is_err() || stop_after.is_some() {
            self.refresh_resume_gate().await?;
        }
        altered
    }

    /// Recompute the index columns of `paths` from the stored payloads
    pub async fn reindex_soup(&self, soup: &str, paths: Vec<String>) -> Result<()> {
        self.ensure_resumed()?;
        let details = ReIndexSoupDetails { soup_name: soup.to_string(), paths };
        let storage = self.storage.clone();
        let reindexed = self.connection().await?.with_connection_mut(move |c| long_ops::reindex_soup(c, &storage, &details)).await;
        let rows = match reindexed {
            Ok(rows) => rows,
            Err(err) => {
                self.refresh_resume_gate().await?;
                return Err(err);
            }
        };
        info!("Reindexed {} rows of soup {}", rows, soup);
        Ok(())
    }

    /// Drop a soup with its table and payload files. Removing an unknown soup does nothing.
    /// Allowed while operations are pending, since it forgets those logged against the soup.
    pub async fn remove_soup(&self, soup: &str) -> Result<()> {
        let name = soup.to_string();
        let removed = self
            .connection()
            .await?
            .with_connection_mut(move |c| {
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(meta) = catalog::lookup(&tx, &name)? else {
                    return Ok(None);
                };
                table::drop_table(&tx, &meta.table_name)?;
                table::drop_table(&tx, &table::shadow_table_name(&meta.table_name))?;
                table::drop_table(&tx, &table::old_table_name(&meta.table_name))?;
                catalog::remove(&tx, &name)?;
                tx.commit()?;
                Ok(Some(meta.table_name))
            })
            .await?;

        if let Some(table_name) = removed {
            self.storage.remove_soup_dir(&table_name)?;
            self.invalidate_smart_sql_cache();
            info!("Removed soup {}", soup);
            if self.needs_resume.load(Ordering::Acquire) {
                self.refresh_resume_gate().await?;
            }
        }
        Ok(())
    }

    pub async fn remove_all_soups(&self) -> Result<()> {
        for soup in self.all_soup_names().await? {
            self.remove_soup(&soup).await?;
        }
        Ok(())
    }

    /// Delete every entry but keep the soup and its indexes
    pub async fn clear_soup(&self, soup: &str) -> Result<()> {
        self.ensure_resumed()?;
        let soup = soup.to_string();
        let conn = self.connection().await?;
        let meta = conn
            .with_connection_mut(move |c| {
                let meta = catalog::require(c, &soup)?;
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(&format!("DELETE FROM {}", quote_ident(&meta.table_name)), [])?;
                if table::table_exists(&tx, &table::fts_table_name(&meta.table_name))? {
                    tx.execute(&format!("DELETE FROM {}", quote_ident(&table::fts_table_name(&meta.table_name))), [])?;
                }
                tx.commit()?;
                Ok(meta)
            })
            .await?;
        if meta.uses_external_storage() {
            self.storage.remove_soup_dir(&meta.table_name)?;
        }
        Ok(())
    }

    // Documents

    /// Insert or update documents, matching them by `_soupEntryId`
    pub async fn upsert(&self, soup: &str, entries: Vec<Value>) -> Result<Vec<Value>> { self.upsert_with_rule(soup, entries, IdentityRule::EntryId).await }

    /// Insert or update documents, matching documents without a known `_soupEntryId` by the
    /// value at `external_id_path`
    pub async fn upsert_with_external_id(&self, soup: &str, entries: Vec<Value>, external_id_path: &str) -> Result<Vec<Value>> {
        self.upsert_with_rule(soup, entries, IdentityRule::from_path(external_id_path)).await
    }

    async fn upsert_with_rule(&self, soup: &str, entries: Vec<Value>, rule: IdentityRule) -> Result<Vec<Value>> {
        self.ensure_resumed()?;
        let soup = soup.to_string();
        let storage = self.storage.clone();
        self.connection()
            .await?
            .with_connection_mut(move |c| {
                let meta = catalog::require(c, &soup)?;
                upsert::upsert(c, &meta, &storage, entries, &rule)
            })
            .await
    }

    pub async fn lookup_soup_entry_id(&self, soup: &str, path: &str, value: Value) -> Result<Option<i64>> {
        let (soup, path) = (soup.to_string(), path.to_string());
        self.connection()
            .await?
            .with_connection(move |c| {
                let meta = catalog::require(c, &soup)?;
                upsert::lookup_entry_id(c, &meta, &path, &value)
            })
            .await
    }

    /// Entries with the given ids, in id order. Unknown ids are skipped.
    pub async fn retrieve(&self, soup: &str, ids: &[i64]) -> Result<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let soup = soup.to_string();
        let ids = ids.to_vec();
        let storage = self.storage.clone();
        self.connection()
            .await?
            .with_connection(move |c| {
                let meta = catalog::require(c, &soup)?;
                let sql = format!(
                    "SELECT {id}, {soup} FROM {} WHERE {id} IN ({}) ORDER BY {id}",
                    quote_ident(&meta.table_name),
                    vec!["?"; ids.len()].join(", "),
                    id = quote_ident(ID_COL),
                    soup = quote_ident(SOUP_COL)
                );
                let mut stmt = c.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(ids.iter()), |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?;
                rows.iter().map(|(id, payload)| table::load_payload(&storage, &meta.table_name, meta.uses_external_storage(), *id, payload.as_deref())).collect()
            })
            .await
    }

    /// Delete entries by id. Returns how many rows were removed.
    pub async fn remove_entries(&self, soup: &str, ids: &[i64]) -> Result<usize> {
        self.ensure_resumed()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let soup = soup.to_string();
        let ids = ids.to_vec();
        let conn = self.connection().await?;
        let (removed, meta, ids) = conn
            .with_connection_mut(move |c| {
                let meta = catalog::require(c, &soup)?;
                let placeholders = vec!["?"; ids.len()].join(", ");
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let removed =
                    tx.execute(&format!("DELETE FROM {} WHERE {} IN ({})", quote_ident(&meta.table_name), quote_ident(ID_COL), placeholders), params_from_iter(ids.iter()))?;
                if !meta.full_text_columns().is_empty() {
                    tx.execute(&format!("DELETE FROM {} WHERE rowid IN ({})", quote_ident(&table::fts_table_name(&meta.table_name)), placeholders), params_from_iter(ids.iter()))?;
                }
                tx.commit()?;
                Ok((removed, meta, ids))
            })
            .await?;
        if meta.uses_external_storage() {
            self.storage.remove_quietly(&meta.table_name, &ids);
        }
        Ok(removed)
    }

    /// Delete everything `spec` matches in one statement, regardless of its page size.
    /// Smart queries must project entry ids of `soup`.
    pub async fn remove_by_query(&self, soup: &str, spec: QuerySpec) -> Result<usize> {
        self.ensure_resumed()?;
        spec.validate()?;
        if !spec.is_smart() && spec.target_soup()? != soup {
            return Err(SoupStoreError::InvalidSpec(format!("query targets {} but removal is from {}", spec.target_soup()?, soup)));
        }
        let soup = soup.to_string();
        let cache = self.smart_sql_cache.clone();
        let conn = self.connection().await?;
        let (removed, meta, external_ids) = conn
            .with_connection_mut(move |c| {
                let meta = catalog::require(c, &soup)?;
                let translated = translate_on(c, &spec, &cache)?;
                let table = quote_ident(&meta.table_name);
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let external_ids = if meta.uses_external_storage() {
                    let mut stmt = tx.prepare(&translated.ids_sql)?;
                    let ids = stmt.query_map(params_from_iter(translated.params.iter()), |row| row.get::<_, i64>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
                    ids
                } else {
                    Vec::new()
                };

                let removed =
                    tx.execute(&format!("DELETE FROM {} WHERE {} IN ({})", table, quote_ident(ID_COL), translated.ids_sql), params_from_iter(translated.params.iter()))?;
                if !meta.full_text_columns().is_empty() {
                    let fts = quote_ident(&table::fts_table_name(&meta.table_name));
                    tx.execute(&format!("DELETE FROM {} WHERE rowid NOT IN (SELECT {} FROM {})", fts, quote_ident(ID_COL), table), [])?;
                }
                tx.commit()?;
                debug!("Removed {} entries from {} by query", removed, meta.name());
                Ok((removed, meta, external_ids))
            })
            .await?;
        if meta.uses_external_storage() {
            self.storage.remove_quietly(&meta.table_name, &external_ids);
        }
        Ok(removed)
    }

    // Queries

    /// The SQL a query spec translates to
    pub async fn translate(&self, spec: &QuerySpec) -> Result<TranslatedQuery> {
        spec.validate()?;
        let spec = spec.clone();
        let cache = self.smart_sql_cache.clone();
        self.connection().await?.with_connection(move |c| translate_on(c, &spec, &cache)).await
    }

    pub async fn count(&self, spec: &QuerySpec) -> Result<usize> {
        spec.validate()?;
        let spec = spec.clone();
        let cache = self.smart_sql_cache.clone();
        self.connection()
            .await?
            .with_connection(move |c| {
                let translated = translate_on(c, &spec, &cache)?;
                let count: i64 = c.query_row(&translated.count_sql, params_from_iter(translated.params.iter()), |row| row.get(0))?;
                Ok(count as usize)
            })
            .await
    }

    /// One page of results. Structured queries yield documents, smart queries yield rows as arrays.
    pub async fn query(&self, spec: &QuerySpec, page_index: usize) -> Result<Vec<Value>> {
        spec.validate()?;
        let spec = spec.clone();
        let cache = self.smart_sql_cache.clone();
        let storage = self.storage.clone();
        let capture = self.capture_explain.load(Ordering::Relaxed);
        let (results, plan) = self
            .connection()
            .await?
            .with_connection(move |c| {
                let translated = translate_on(c, &spec, &cache)?;
                let params = translated.page_params(page_index, spec.page_size);
                let plan = if capture { Some(explain::explain(c, &translated.page_sql, &params)?) } else { None };
                let results = run_page(c, &storage, &translated, params)?;
                Ok((results, plan))
            })
            .await?;
        if let Some(plan) = plan {
            *self.last_explain.write().expect("RwLock poisoned") = Some(plan);
        }
        Ok(results)
    }

    // Diagnostics and introspection

    pub fn set_capture_explain_query_plan(&self, capture: bool) { self.capture_explain.store(capture, Ordering::Relaxed); }

    pub fn last_explain_query_plan(&self) -> Option<ExplainPlan> { self.last_explain.read().expect("RwLock poisoned").clone() }

    /// Only reported back; never gates an operation
    pub fn set_file_data_protection_active(&self, active: bool) { self.data_protection_active.store(active, Ordering::Relaxed); }

    pub fn is_file_data_protection_active(&self) -> bool { self.data_protection_active.load(Ordering::Relaxed) }

    /// Database size in bytes
    pub async fn database_size(&self) -> Result<u64> {
        self.connection()
            .await?
            .with_connection(|c| {
                let pages: i64 = c.query_row("PRAGMA page_count", [], |row| row.get(0))?;
                let page_size: i64 = c.query_row("PRAGMA page_size", [], |row| row.get(0))?;
                Ok((pages * page_size) as u64)
            })
            .await
    }

    pub async fn soup_stats(&self, soup: &str) -> Result<SoupStats> {
        let soup = soup.to_string();
        self.connection()
            .await?
            .with_connection(move |c| {
                let meta = catalog::require(c, &soup)?;
                let rows: i64 = c.query_row(&format!("SELECT count(*) FROM {}", quote_ident(&meta.table_name)), [], |row| row.get(0))?;
                let bytes = c
                    .query_row(
                        "SELECT COALESCE(SUM(pgsize), 0) FROM dbstat WHERE name = ?1 OR name IN (SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1)",
                        [&meta.table_name],
                        |row| row.get::<_, i64>(0),
                    )
                    .ok()
                    .map(|bytes| bytes as u64);
                Ok(SoupStats { rows: rows as usize, bytes })
            })
            .await
    }

    /// Bytes used by a soup's payload files
    pub async fn external_storage_size(&self, soup: &str) -> Result<u64> {
        let meta = self.soup_metadata(soup).await?;
        Ok(self.storage.usage(&meta.table_name)?.0)
    }

    pub async fn external_files_count(&self, soup: &str) -> Result<usize> {
        let meta = self.soup_metadata(soup).await?;
        Ok(self.storage.usage(&meta.table_name)?.1)
    }

    pub async fn compile_options(&self) -> Result<Vec<String>> {
        self.connection()
            .await?
            .with_connection(|c| {
                let mut stmt = c.prepare("PRAGMA compile_options")?;
                let options = stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(options)
            })
            .await
    }

    pub async fn engine_version(&self) -> Result<String> {
        self.connection().await?.with_connection(|c| Ok(c.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))?)).await
    }

    /// SQLCipher version, None on a plain SQLite build
    pub async fn cipher_version(&self) -> Result<Option<String>> {
        self.connection().await?.with_connection(|c| Ok(c.query_row("PRAGMA cipher_version", [], |row| row.get::<_, String>(0)).optional()?)).await
    }

    /// Convert a `_soupLastModifiedDate` value back into a timestamp
    pub fn date_from_last_modified(millis: i64) -> Option<DateTime<Utc>> { DateTime::<Utc>::from_timestamp_millis(millis) }
}

impl std::fmt::Debug for SoupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoupStore").field("name", &self.name).field("location", &self.location).field("storage", &self.storage).finish()
    }
}

fn translate_on(conn: &Connection, spec: &QuerySpec, cache: &SmartSqlCache) -> Result<TranslatedQuery> {
    match &spec.kind {
        QueryKind::Smart { sql } => {
            if let Some(rendered) = cache.read().expect("RwLock poisoned").get(sql) {
                return Ok(sql_builder::smart_query(rendered));
            }
            let smart = soupql::parse_smart_sql(sql)?;
            let translated = sql_builder::translate_smart(&smart, |soup| catalog::require(conn, soup))?;
            cache.write().expect("RwLock poisoned").insert(sql.clone(), translated.select_sql.clone());
            Ok(translated)
        }
        _ => sql_builder::translate(spec, &catalog::require(conn, spec.target_soup()?)?),
    }
}

fn run_page(conn: &Connection, storage: &ExternalStorage, query: &TranslatedQuery, params: Vec<SqlValue>) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(&query.page_sql)?;
    match &query.projection {
        Projection::Entries { table, external } => {
            let rows =
                stmt.query_map(params_from_iter(params), |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter().map(|(id, payload)| table::load_payload(storage, table, *external, *id, payload.as_deref())).collect()
        }
        Projection::Rows => {
            let payload_columns: Vec<bool> = stmt.column_names().iter().map(|name| *name == SOUP_COL).collect();
            let mut rows = stmt.query(params_from_iter(params))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(payload_columns.len());
                for (index, is_payload) in payload_columns.iter().enumerate() {
                    let value = match (is_payload, SqliteValue::from(row.get::<_, SqlValue>(index)?)) {
                        (true, SqliteValue::Text(text)) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
                        (_, value) => value.to_json(),
                    };
                    values.push(value);
                }
                results.push(Value::Array(values));
            }
            Ok(results)
        }
    }
}
