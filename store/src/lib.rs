//! Encrypted, indexable JSON document store on SQLite
//!
//! Documents are JSON objects grouped into named *soups*. Each soup is one SQLite table whose index
//! columns are derived from registered path specs, so queries on indexed paths are plain SQL.
//!
//! - Structured queries (exact, range, like, full-text match) and "smart SQL" with `{soup:path}`
//!   placeholders
//! - Upserts keyed by `_soupEntryId` or by an external id path
//! - Index changes rebuild the table through a step log that resumes after a crash
//! - Optional SQLCipher encryption (`sqlcipher` feature) and per-entry payload files
//!
//! # SQLite Version Requirements
//!
//! Alteration repair uses `ALTER TABLE ... DROP COLUMN` (3.35.0) and the json1 functions. The
//! bundled SQLite shipped with `rusqlite` satisfies both. FTS5 is detected at open; full_text index
//! specs are rejected when it is missing.
//!
//! # Example
//!
//! ```rust,ignore
//! use soupstore::{IndexSpec, QuerySpec, SoupStore, StoreConfig};
//!
//! let store = SoupStore::open(StoreConfig::file("main", "app.db")).await?;
//! store.register_soup("employees", vec![IndexSpec::string("lastName"), IndexSpec::integer("age")]).await?;
//! store.upsert("employees", vec![json!({"lastName": "Doe", "age": 40})]).await?;
//! let page = store.query(&QuerySpec::exact("employees", "lastName", "Doe", 10), 0).await?;
//! ```

mod catalog;
mod config;
mod connection;
mod encryption;
mod error;
mod explain;
mod external;
mod long_ops;
mod path;
mod query;
mod spec;
pub mod sql_builder;
mod store;
mod table;
mod upsert;
mod value;

pub use catalog::SoupMetadata;
pub use config::StoreConfig;
pub use connection::{SqliteConfig, SqliteConnectionManager};
pub use encryption::{KeyProvider, SaltProvider, StaticKey, StaticSalt};
pub use error::{ErrorKind, Result, SoupStoreError};
pub use explain::{ExplainPlan, ExplainRow};
pub use long_ops::{AlterSoupStep, LongOperationRecord, LongOperationType};
pub use path::ColumnDef;
pub use query::{OrderDirection, QueryKind, QuerySpec};
pub use spec::{IndexSpec, IndexType, SoupFeature, SoupSpec, SOUP_CREATED_DATE, SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE};
pub use store::{SoupStats, SoupStore};
pub use value::SqliteValue;

pub(crate) fn now_millis() -> i64 { chrono::Utc::now().timestamp_millis() }
