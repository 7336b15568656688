//! Cache storage persisted to a directory, one JSON document per cache.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheResult, CacheStorage, CacheTable, CacheTables, RequestKey};

const FILE_EXTENSION: &str = "json";

/// On-disk form of one cache.
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    name: String,
    created: u64,
    entries: Vec<CacheEntry>,
}

/// Cache storage backed by a directory.
///
/// Every mutation is written through before it returns, so a new
/// `DiskCacheStorage` on the same directory sees the same caches.
#[derive(Debug)]
pub struct DiskCacheStorage {
    dir: PathBuf,
    tables: RwLock<CacheTables>,
}

impl DiskCacheStorage {
    /// Open (creating if needed) the storage directory and load every cache in it.
    pub async fn open_dir(dir: impl AsRef<Path>) -> CacheResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut tables = CacheTables::default();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(dirent) = read_dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            match load_cache_file(&path).await {
                Ok(file) => {
                    let mut table = CacheTable {
                        created: file.created,
                        ..Default::default()
                    };
                    for entry in file.entries {
                        table.entries.insert(entry.key(), entry);
                    }
                    tables.restore(file.name, table);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache file"),
            }
        }

        info!(dir = %dir.display(), caches = tables.names().len(), "Disk cache storage opened");

        Ok(Self {
            dir,
            tables: RwLock::new(tables),
        })
    }

    /// Directory holding the cache files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", urlencoding::encode(name), FILE_EXTENSION))
    }

    /// Write one cache to disk via a temp file and rename.
    async fn persist(&self, tables: &CacheTables, name: &str) -> CacheResult<()> {
        let Some(table) = tables.get(name) else {
            return Ok(());
        };

        let mut entries: Vec<CacheEntry> = table.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        let file = CacheFile {
            name: name.to_string(),
            created: table.created,
            entries,
        };

        let path = self.path_for(name);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&file)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(cache = %name, path = %path.display(), "Cache persisted");
        Ok(())
    }
}

async fn load_cache_file(path: &Path) -> CacheResult<CacheFile> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> CacheResult<()> {
        let mut tables = self.tables.write().await;
        if tables.open(name) {
            debug!(cache = %name, "Cache created");
            if let Err(e) = self.persist(&tables, name).await {
                tables.delete(name);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> CacheResult<bool> {
        Ok(self.tables.read().await.has(name))
    }

    async fn delete(&self, name: &str) -> CacheResult<bool> {
        let mut tables = self.tables.write().await;
        if !tables.has(name) {
            return Ok(false);
        }
        // The file goes first; if it cannot be removed the cache stays listed.
        match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tables.delete(name);
        Ok(true)
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.tables.read().await.names())
    }

    async fn match_in(&self, name: &str, key: &RequestKey) -> CacheResult<Option<CacheEntry>> {
        self.tables.read().await.match_in(name, key)
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> CacheResult<()> {
        let mut tables = self.tables.write().await;
        let key = entry.key();
        let previous = tables.put(name, entry)?;
        if let Err(e) = self.persist(&tables, name).await {
            tables.revert_entry(name, &key, previous);
            return Err(e);
        }
        Ok(())
    }

    async fn delete_entry(&self, name: &str, key: &RequestKey) -> CacheResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(removed) = tables.delete_entry(name, key)? else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&tables, name).await {
            tables.revert_entry(name, key, Some(removed));
            return Err(e);
        }
        Ok(true)
    }

    async fn entries(&self, name: &str) -> CacheResult<Vec<RequestKey>> {
        self.tables.read().await.entries(name)
    }
}
