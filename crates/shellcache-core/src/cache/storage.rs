use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::{Arc, Mutex};

use tokio::fs;
use tracing::info;

use super::{CacheStore, StoreError};

/// The set of named stores under one root directory.
#[derive(Debug, Clone)]
pub struct CacheStorage {
    root: PathBuf,
    /// Store names whose deletion fails, for exercising activation errors.
    #[cfg(test)]
    undeletable: Arc<Mutex<Vec<String>>>,
}

impl CacheStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            #[cfg(test)]
            undeletable: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store names double as directory names; reject anything that could
    /// escape the root or collide with staging files.
    pub fn validate_name(name: &str) -> Result<(), StoreError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(StoreError::InvalidName(name.to_string()))
        }
    }

    /// Open the store called `name`, creating it if absent.
    /// Only install creates stores; everything else goes through `get`.
    pub async fn open(&self, name: &str) -> Result<CacheStore, StoreError> {
        Self::validate_name(name)?;
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).await?;
        Ok(CacheStore::new(name.to_string(), dir))
    }

    /// Open the store called `name` only if it exists.
    pub async fn get(&self, name: &str) -> Result<Option<CacheStore>, StoreError> {
        if !self.has(name).await? {
            return Ok(None);
        }
        Ok(Some(CacheStore::new(name.to_string(), self.root.join(name))))
    }

    pub async fn has(&self, name: &str) -> Result<bool, StoreError> {
        Self::validate_name(name)?;
        match fs::metadata(self.root.join(name)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of every existing store, sorted.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if Self::validate_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a whole store. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Self::validate_name(name)?;
        #[cfg(test)]
        if self.undeletable.lock().unwrap().iter().any(|n| n == name) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("store {} is locked", name),
            )
            .into());
        }
        match fs::remove_dir_all(self.root.join(name)).await {
            Ok(()) => {
                info!(store = name, "Deleted cache store");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_undeletable(&self, name: &str, locked: bool) {
        let mut undeletable = self.undeletable.lock().unwrap();
        undeletable.retain(|n| n != name);
        if locked {
            undeletable.push(name.to_string());
        }
    }
}
