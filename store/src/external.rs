//! Payload files for soups stored externally
//!
//! Each externally stored entry is one JSON file `soupelt_<id>` in a directory named after the
//! soup's table, under the store's external storage root.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SoupStoreError};

const ENTRY_FILE_PREFIX: &str = "soupelt_";
const STAGED_SUFFIX: &str = ".staged";

/// A payload written next to its final location, waiting for the owning transaction to commit
#[derive(Debug)]
pub struct StagedPayload {
    staged: PathBuf,
    target: PathBuf,
}

impl StagedPayload {
    pub fn target(&self) -> &Path { &self.target }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalStorage {
    root: Option<PathBuf>,
}

impl ExternalStorage {
    pub fn new(root: Option<PathBuf>) -> Self { Self { root } }

    pub fn is_configured(&self) -> bool { self.root.is_some() }

    pub fn soup_dir(&self, table: &str) -> Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.join(table)),
            None => Err(SoupStoreError::InvalidSpec("no external storage directory configured".to_string())),
        }
    }

    pub fn entry_path(&self, table: &str, id: i64) -> Result<PathBuf> { Ok(self.soup_dir(table)?.join(format!("{}{}", ENTRY_FILE_PREFIX, id))) }

    pub fn write(&self, table: &str, id: i64, payload: &Value) -> Result<PathBuf> {
        let dir = self.soup_dir(table)?;
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}{}", ENTRY_FILE_PREFIX, id));
        fs::write(&path, serde_json::to_vec(payload)?)?;
        Ok(path)
    }

    pub fn stage(&self, table: &str, id: i64, payload: &Value) -> Result<StagedPayload> {
        let target = self.entry_path(table, id)?;
        let staged = target.with_file_name(format!("{}{}{}", ENTRY_FILE_PREFIX, id, STAGED_SUFFIX));
        if let Some(dir) = staged.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&staged, serde_json::to_vec(payload)?)?;
        Ok(StagedPayload { staged, target })
    }

    pub fn publish(&self, payload: StagedPayload) -> Result<()> {
        fs::rename(&payload.staged, &payload.target)?;
        Ok(())
    }

    pub fn discard(&self, staged: Vec<StagedPayload>) {
        for payload in staged {
            if let Err(e) = fs::remove_file(&payload.staged) {
                warn!("Failed to discard staged payload {}: {}", payload.staged.display(), e);
            }
        }
    }

    pub fn read(&self, table: &str, id: i64) -> Result<Value> {
        let path = self.entry_path(table, id)?;
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            IoErrorKind::NotFound => SoupStoreError::NotFound(format!("payload file {}", path.display())),
            _ => SoupStoreError::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Missing files are not an error
    pub fn remove(&self, table: &str, id: i64) -> Result<()> {
        match fs::remove_file(self.entry_path(table, id)?) {
            Err(e) if e.kind() != IoErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Best effort cleanup after the rows are already gone
    pub fn remove_quietly(&self, table: &str, ids: &[i64]) {
        for id in ids {
            if let Err(e) = self.remove(table, *id) {
                warn!("Failed to remove payload file {} of {}: {}", id, table, e);
            }
        }
    }

    pub fn remove_soup_dir(&self, table: &str) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let dir = root.join(table);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("Removed external storage {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Total bytes and number of payload files kept for `table`
    pub fn usage(&self, table: &str) -> Result<(u64, usize)> {
        let Some(root) = &self.root else {
            return Ok((0, 0));
        };
        let entries = match fs::read_dir(root.join(table)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };

        let (mut bytes, mut files) = (0u64, 0usize);
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(ENTRY_FILE_PREFIX) && !name.ends_with(STAGED_SUFFIX) {
                bytes += entry.metadata()?.len();
                files += 1;
            }
        }
        Ok((bytes, files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ExternalStorage::new(Some(dir.path().to_path_buf()));

        storage.write("TABLE_1", 7, &json!({"a": 1})).unwrap();
        assert_eq!(storage.read("TABLE_1", 7).unwrap(), json!({"a": 1}));
        assert_eq!(storage.usage("TABLE_1").unwrap().1, 1);

        storage.remove("TABLE_1", 7).unwrap();
        storage.remove("TABLE_1", 7).unwrap();
        assert_eq!(storage.read("TABLE_1", 7).unwrap_err().kind(), crate::ErrorKind::NotFound);

        storage.write("TABLE_1", 8, &json!([1])).unwrap();
        storage.remove_soup_dir("TABLE_1").unwrap();
        assert_eq!(storage.usage("TABLE_1").unwrap(), (0, 0));
        storage.remove_soup_dir("TABLE_1").unwrap();
    }

    #[test]
    fn test_staged_payloads_are_invisible_until_published() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ExternalStorage::new(Some(dir.path().to_path_buf()));
        storage.write("TABLE_2", 1, &json!({"v": 1})).unwrap();

        let staged = storage.stage("TABLE_2", 1, &json!({"v": 2})).unwrap();
        assert_eq!(storage.read("TABLE_2", 1).unwrap(), json!({"v": 1}));
        assert_eq!(storage.usage("TABLE_2").unwrap().1, 1);
        storage.publish(staged).unwrap();
        assert_eq!(storage.read("TABLE_2", 1).unwrap(), json!({"v": 2}));

        let staged = storage.stage("TABLE_2", 1, &json!({"v": 3})).unwrap();
        storage.discard(vec![staged]);
        assert_eq!(storage.read("TABLE_2", 1).unwrap(), json!({"v": 2}));
        assert_eq!(storage.usage("TABLE_2").unwrap().1, 1);
    }

    #[test]
    fn test_unconfigured() {
        let storage = ExternalStorage::new(None);
        assert!(!storage.is_configured());
        assert_eq!(storage.write("TABLE_1", 1, &json!({})).unwrap_err().kind(), crate::ErrorKind::InvalidSpec);
        assert_eq!(storage.usage("TABLE_1").unwrap(), (0, 0));
    }
}
