use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::models::{Request, Response};
use crate::network::Network;

use super::StoreError;

/// Extension of committed entry files.
const ENTRY_EXT: &str = "entry";

/// Extension of staged, not yet committed entry files.
const STAGING_EXT: &str = "tmp";

/// Extension of entries set aside while a bulk add commits.
const BACKUP_EXT: &str = "bak";

/// HTTP 206 is never stored.
const STATUS_PARTIAL_CONTENT: u16 = 206;

/// Distinguishes concurrent staging files for the same key.
static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    cached_at: DateTime<Utc>,
}

/// A response snapshot read back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn into_response(self) -> Response {
        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Clock skew lands here too
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

/// One named generation of cached responses.
#[derive(Debug, Clone)]
pub struct CacheStore {
    name: String,
    dir: PathBuf,
}

impl CacheStore {
    pub(crate) fn new(name: String, dir: PathBuf) -> Self {
        Self { name, dir }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.{}", hex::encode(digest), ENTRY_EXT))
    }

    /// Look up an entry by exact key.
    pub async fn match_key(&self, key: &str) -> Result<Option<CachedResponse>, StoreError> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let cached = decode_entry(raw)?;
        // Guard against a digest collision serving the wrong resource
        if cached.url != key {
            warn!(store = %self.name, key, stored = %cached.url, "Cache key mismatch");
            return Ok(None);
        }
        Ok(Some(cached))
    }

    /// Store `response` under `key`, replacing any previous entry wholesale.
    pub async fn put(&self, key: &str, response: &Response) -> Result<(), StoreError> {
        let staged = self.stage(key, response).await?;
        self.commit(&staged, key).await
    }

    /// Fetch every request and store them all, or store none of them.
    ///
    /// Every response must resolve with a 2xx status before anything is
    /// written. Entries are then staged to temporary files and only renamed
    /// into place once every one of them has been written. If a rename
    /// fails, entries already renamed are removed and any entries they
    /// replaced are put back.
    pub async fn add_all<N: Network + ?Sized>(
        &self,
        network: &N,
        requests: &[Request],
    ) -> Result<(), StoreError> {
        let responses = try_join_all(requests.iter().map(|request| async move {
            let response = network
                .fetch(request)
                .await
                .map_err(|source| StoreError::Fetch {
                    url: request.url.to_string(),
                    source,
                })?;
            if !response.is_ok() {
                return Err(StoreError::BadStatus {
                    url: request.url.to_string(),
                    status: response.status,
                });
            }
            Ok::<_, StoreError>((request.cache_key(), response))
        }))
        .await?;

        let mut staged = Vec::with_capacity(responses.len());
        for (key, response) in &responses {
            match self.stage(key, response).await {
                Ok(path) => staged.push((path, key.as_str())),
                Err(e) => {
                    discard_staged(staged.iter().map(|(p, _)| p.as_path())).await;
                    return Err(e);
                }
            }
        }

        // Entries this batch replaces are set aside until every rename lands
        let mut committed: Vec<(&str, Option<PathBuf>)> = Vec::with_capacity(staged.len());
        for (i, (path, key)) in staged.iter().enumerate() {
            let key = *key;
            let result = match self.set_aside(key).await {
                Ok(previous) => match self.commit(path, key).await {
                    Ok(()) => {
                        committed.push((key, previous));
                        Ok(())
                    }
                    Err(e) => {
                        if let Some(previous) = previous {
                            committed.push((key, Some(previous)));
                        }
                        Err(e)
                    }
                },
                Err(e) => {
                    let _ = fs::remove_file(path).await;
                    Err(e)
                }
            };
            if let Err(e) = result {
                discard_staged(staged[i + 1..].iter().map(|(p, _)| p.as_path())).await;
                self.roll_back(committed).await;
                return Err(e);
            }
        }

        for (_, previous) in committed {
            if let Some(previous) = previous {
                if let Err(e) = fs::remove_file(&previous).await {
                    warn!(store = %self.name, path = %previous.display(), error = %e, "Failed to remove replaced entry");
                }
            }
        }
        debug!(store = %self.name, count = staged.len(), "Bulk add committed");
        Ok(())
    }

    /// Move the committed entry for `key`, if any, out of the way.
    /// Returns where it went.
    async fn set_aside(&self, key: &str) -> Result<Option<PathBuf>, StoreError> {
        let entry = self.entry_path(key);
        match fs::metadata(&entry).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let seq = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
        let backup = entry.with_extension(format!("{}.{}.{}", std::process::id(), seq, BACKUP_EXT));
        fs::rename(&entry, &backup).await?;
        Ok(Some(backup))
    }

    /// Undo the renames of a failed bulk add, restoring replaced entries.
    async fn roll_back(&self, committed: Vec<(&str, Option<PathBuf>)>) {
        for (key, previous) in committed.into_iter().rev() {
            let result = match &previous {
                Some(previous) => fs::rename(previous, self.entry_path(key)).await,
                None => match fs::remove_file(self.entry_path(key)).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = result {
                warn!(store = %self.name, key, error = %e, "Failed to roll back bulk add entry");
            }
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys of every committed entry, sorted.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for path in self.entry_files().await? {
            let cached = decode_entry(fs::read(&path).await?)?;
            keys.push(cached.url);
        }
        keys.sort();
        Ok(keys)
    }

    /// Every committed entry, oldest first.
    pub async fn entries(&self) -> Result<Vec<CachedResponse>, StoreError> {
        let mut entries = Vec::new();
        for path in self.entry_files().await? {
            entries.push(decode_entry(fs::read(&path).await?)?);
        }
        entries.sort_by_key(|e| e.cached_at);
        Ok(entries)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entry_files().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    async fn entry_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            // Deleted underneath us by an activating version
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXT) {
                files.push(path);
            }
        }
        Ok(files)
    }

    async fn stage(&self, key: &str, response: &Response) -> Result<PathBuf, StoreError> {
        if response.status == STATUS_PARTIAL_CONTENT {
            return Err(StoreError::PartialContent(key.to_string()));
        }
        // No create_dir_all: a store deleted by activation stays deleted
        let meta = EntryMeta {
            url: key.to_string(),
            status: response.status,
            headers: response.headers.clone(),
            cached_at: Utc::now(),
        };
        let mut contents = serde_json::to_vec(&meta)?;
        contents.push(b'\n');
        contents.extend_from_slice(&response.body);

        let seq = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = self
            .entry_path(key)
            .with_extension(format!("{}.{}.{}", std::process::id(), seq, STAGING_EXT));
        fs::write(&path, contents).await?;
        Ok(path)
    }

    async fn commit(&self, staged: &Path, key: &str) -> Result<(), StoreError> {
        if let Err(e) = fs::rename(staged, self.entry_path(key)).await {
            let _ = fs::remove_file(staged).await;
            return Err(e.into());
        }
        Ok(())
    }
}

async fn discard_staged<'a>(paths: impl Iterator<Item = &'a Path>) {
    for path in paths {
        let _ = fs::remove_file(path).await;
    }
}

fn decode_entry(raw: Vec<u8>) -> Result<CachedResponse, StoreError> {
    let mut raw = Bytes::from(raw);
    // serde_json escapes newlines, so the first one ends the metadata
    let split = raw.iter().position(|&b| b == b'\n').unwrap_or(raw.len());
    let meta_bytes = raw.split_to(split);
    let meta: EntryMeta = serde_json::from_slice(&meta_bytes)?;
    if !raw.is_empty() {
        // Drop the separator
        let _ = raw.split_to(1);
    }
    Ok(CachedResponse {
        url: meta.url,
        status: meta.status,
        headers: meta.headers,
        body: raw,
        cached_at: meta.cached_at,
    })
}
