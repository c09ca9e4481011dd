//! Store configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::connection::SqliteConfig;
use crate::encryption::{KeyProvider, SaltProvider};

/// Everything needed to open a [`SoupStore`](crate::SoupStore)
#[derive(Clone)]
pub struct StoreConfig {
    pub name: String,
    pub location: SqliteConfig,
    pub key_provider: Option<Arc<dyn KeyProvider>>,
    pub salt_provider: Option<Arc<dyn SaltProvider>>,
    /// Root directory for externally stored payloads
    pub external_storage_dir: Option<PathBuf>,
    pub capture_explain_query_plan: bool,
    /// Resume interrupted long operations as part of opening
    pub resume_on_open: bool,
}

impl StoreConfig {
    pub fn new(name: impl Into<String>, location: SqliteConfig) -> Self {
        Self {
            name: name.into(),
            location,
            key_provider: None,
            salt_provider: None,
            external_storage_dir: None,
            capture_explain_query_plan: false,
            resume_on_open: true,
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self { Self::new(name, SqliteConfig::File(path.into())) }

    pub fn memory(name: impl Into<String>) -> Self { Self::new(name, SqliteConfig::Memory) }

    pub fn with_key_provider(mut self, provider: impl KeyProvider + 'static) -> Self {
        self.key_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_salt_provider(mut self, provider: impl SaltProvider + 'static) -> Self {
        self.salt_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_external_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.external_storage_dir = Some(dir.into());
        self
    }

    pub fn capture_explain_query_plan(mut self, capture: bool) -> Self {
        self.capture_explain_query_plan = capture;
        self
    }

    pub fn resume_on_open(mut self, resume: bool) -> Self {
        self.resume_on_open = resume;
        self
    }

    /// The configured external storage root, or `<stem>_external` next to a file database.
    /// In-memory stores get no default.
    pub fn resolved_external_storage_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.external_storage_dir {
            return Some(dir.clone());
        }
        match &self.location {
            SqliteConfig::File(path) => Some(default_external_dir(path)),
            SqliteConfig::Memory => None,
        }
    }
}

fn default_external_dir(db_path: &Path) -> PathBuf {
    let stem = db_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "store".to_string());
    let dir = format!("{}_external", stem);
    match db_path.parent() {
        Some(parent) => parent.join(dir),
        None => PathBuf::from(dir),
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("name", &self.name)
            .field("location", &self.location)
            .field("encrypted", &self.key_provider.is_some())
            .field("salted", &self.salt_provider.is_some())
            .field("external_storage_dir", &self.external_storage_dir)
            .field("capture_explain_query_plan", &self.capture_explain_query_plan)
            .field("resume_on_open", &self.resume_on_open)
            .finish()
    }
}
