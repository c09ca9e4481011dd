//! Keyed connections for the store's single-connection bb8 pool

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::encryption::{self, KeyProvider, SaltProvider};
use crate::error::{Result, SoupStoreError};

/// Where the store's database lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqliteConfig {
    /// File-based database
    File(PathBuf),
    /// In-memory database (for testing)
    Memory,
}

/// Opens connections with the store's key applied before anything reads the file
#[derive(Clone)]
pub struct SqliteConnectionManager {
    config: SqliteConfig,
    keys: Option<Arc<dyn KeyProvider>>,
    salt: Option<Arc<dyn SaltProvider>>,
}

impl SqliteConnectionManager {
    pub fn new(config: SqliteConfig) -> Self { Self { config, keys: None, salt: None } }

    pub fn with_keys(mut self, keys: Option<Arc<dyn KeyProvider>>, salt: Option<Arc<dyn SaltProvider>>) -> Self {
        self.keys = keys;
        self.salt = salt;
        self
    }

    pub(crate) fn create_connection(&self) -> Result<Connection> {
        let conn = match &self.config {
            SqliteConfig::File(path) => Connection::open(path)?,
            SqliteConfig::Memory => Connection::open_in_memory()?,
        };
        encryption::apply_key(&conn, self.keys.as_deref(), self.salt.as_deref())?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA cache_size=-64000;
             PRAGMA temp_store=MEMORY;",
        )?;
        Ok(conn)
    }
}

/// Run blocking engine work off the async runtime
async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| SoupStoreError::TaskJoin(e.to_string()))?
}

/// The store's connection. rusqlite connections are not Sync, so every use takes the lock on a
/// blocking thread.
#[derive(Clone)]
pub struct PooledConnection {
    inner: Arc<Mutex<Connection>>,
}

impl PooledConnection {
    fn new(conn: Connection) -> Self { Self { inner: Arc::new(Mutex::new(conn)) } }

    /// Run `f` against the locked connection on a blocking thread
    pub async fn with_connection_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.inner.clone();
        blocking(move || {
            let mut guard = conn.blocking_lock();
            f(&mut guard)
        })
        .await
    }

    /// Same as [`with_connection_mut`](Self::with_connection_mut) for work that needs no transaction
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_connection_mut(move |conn| f(conn)).await
    }
}

impl bb8::ManageConnection for SqliteConnectionManager {
    type Connection = PooledConnection;
    type Error = SoupStoreError;

    fn connect(&self) -> impl std::future::Future<Output = Result<Self::Connection>> + Send {
        let manager = self.clone();
        blocking(move || manager.create_connection().map(PooledConnection::new))
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> impl std::future::Future<Output = Result<()>> + Send {
        let conn = conn.clone();
        async move { conn.with_connection(|c| Ok(c.execute_batch("SELECT 1")?)).await }
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool { false }
}
