//! Key material for encrypted stores
//!
//! Keys and salts are pulled from the host every time a connection is opened. A store
//! configured with a key provider refuses to open when the provider has nothing to offer.

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, SoupStoreError};

/// Bytes at the head of the database file left in plaintext when a salt is supplied
pub const PLAINTEXT_HEADER_SIZE: usize = 32;

/// Supplies the current encryption key
pub trait KeyProvider: Send + Sync {
    fn encryption_key(&self) -> Option<String>;
}

/// Supplies the current 16 byte salt, hex encoded
pub trait SaltProvider: Send + Sync {
    fn encryption_salt(&self) -> Option<String>;
}

/// A key that never changes, mostly useful for tests and tools
#[derive(Clone)]
pub struct StaticKey(String);

impl StaticKey {
    pub fn new(key: impl Into<String>) -> Self { Self(key.into()) }
}

impl KeyProvider for StaticKey {
    fn encryption_key(&self) -> Option<String> { Some(self.0.clone()) }
}

#[derive(Clone)]
pub struct StaticSalt(String);

impl StaticSalt {
    pub fn new(salt: impl Into<String>) -> Self { Self(salt.into()) }
}

impl SaltProvider for StaticSalt {
    fn encryption_salt(&self) -> Option<String> { Some(self.0.clone()) }
}

impl<F> KeyProvider for F
where F: Fn() -> Option<String> + Send + Sync
{
    fn encryption_key(&self) -> Option<String> { self() }
}

impl std::fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("StaticKey(..)") }
}

impl std::fmt::Debug for StaticSalt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("StaticSalt(..)") }
}

/// Apply key and salt to a freshly opened connection and prove the key opens the database.
///
/// Must run before any other statement touches the file.
pub fn apply_key(conn: &Connection, keys: Option<&dyn KeyProvider>, salt: Option<&dyn SaltProvider>) -> Result<()> {
    let Some(keys) = keys else {
        return Ok(());
    };

    let key = keys.encryption_key().filter(|k| !k.is_empty()).ok_or_else(|| SoupStoreError::Encryption("encryption key unavailable".to_string()))?;
    conn.pragma_update(None, "key", &key).map_err(|e| SoupStoreError::Encryption(format!("failed to apply key: {}", e)))?;
    require_cipher(conn)?;

    if let Some(salt) = salt.and_then(|s| s.encryption_salt()) {
        validate_salt(&salt)?;
        conn.execute_batch(&format!("PRAGMA cipher_plaintext_header_size = {}; PRAGMA cipher_salt = \"x'{}'\";", PLAINTEXT_HEADER_SIZE, salt))
            .map_err(|e| SoupStoreError::Encryption(format!("failed to apply salt: {}", e)))?;
    }

    verify_key(conn)
}

/// Plain SQLite ignores `PRAGMA key`, so a key is only honoured when the engine reports a cipher
fn require_cipher(conn: &Connection) -> Result<String> {
    let version: Option<String> = conn
        .query_row("PRAGMA cipher_version", [], |row| row.get(0))
        .optional()
        .map_err(|e| SoupStoreError::Encryption(format!("could not query cipher support: {}", e)))?;
    version.ok_or_else(|| SoupStoreError::Encryption("engine has no cipher support; build with the sqlcipher feature".to_string()))
}

/// A wrong key only surfaces once the first page is read
pub fn verify_key(conn: &Connection) -> Result<()> {
    let tables: i64 = conn
        .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))
        .map_err(|e| SoupStoreError::Encryption(format!("database could not be opened with the supplied key: {}", e)))?;
    debug!("Key accepted, {} schema objects visible", tables);
    Ok(())
}

fn validate_salt(salt: &str) -> Result<()> {
    if salt.len() != 32 || !salt.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SoupStoreError::Encryption("salt must be 16 bytes encoded as 32 hex characters".to_string()));
    }
    Ok(())
}
