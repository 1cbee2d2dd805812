//! Disk store for cached responses.
//!
//! One JSON file per fingerprint under the cache folder. Writes go to a
//! temporary file that is renamed into place, so readers never observe a
//! partial entry and concurrent writers of the same key resolve to the last
//! rename. Entry lifetime is checked on lookup; the total size is bounded by
//! evicting the oldest entries after each write.

use crate::error::CacheError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// A cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// `METHOD url` of the request that produced the entry
    pub request: String,
    pub status: u16,
    /// Header list in the order it was received
    pub headers: Vec<StoredHeader>,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

/// One response header. Values are raw bytes, since obs-text is not UTF-8.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

impl StoredHeader {
    pub fn new(name: &str, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
        }
    }

    /// Headers in map order; repeated names keep every value.
    pub fn list(headers: &HeaderMap) -> Vec<Self> {
        headers
            .iter()
            .map(|(name, value)| Self::new(name.as_str(), value.as_bytes()))
            .collect()
    }

    /// Rebuild a header map in stored order. Invalid entries are skipped.
    pub fn to_map(list: &[Self]) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(list.len());
        for header in list {
            match (
                HeaderName::from_bytes(header.name.as_bytes()),
                HeaderValue::from_bytes(&header.value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!("Skipping invalid stored header '{}'", header.name),
            }
        }
        headers
    }
}

mod base64_bytes {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub folder: PathBuf,
    pub ttl: Option<Duration>,
    pub max_size: u64,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    size: u64,
    stored: SystemTime,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, IndexEntry>,
    total: u64,
}

impl Index {
    fn insert(&mut self, key: String, entry: IndexEntry) {
        if let Some(old) = self.entries.insert(key, entry) {
            self.total -= old.size;
        }
        self.total += entry.size;
    }

    fn remove(&mut self, key: &str) {
        if let Some(old) = self.entries.remove(key) {
            self.total -= old.size;
        }
    }

    fn oldest(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| e.stored)
            .map(|(k, _)| k.clone())
    }
}

pub struct DiskStore {
    options: StoreOptions,
    index: Mutex<Index>,
}

impl DiskStore {
    /// Prepare the cache folder.
    ///
    /// Without `use_existing` the folder is wiped first; with it, entries
    /// left by earlier runs are indexed (expired ones are removed).
    pub fn open(options: StoreOptions, use_existing: bool) -> Result<Self, CacheError> {
        let folder = &options.folder;
        if !use_existing && folder.exists() {
            fs::remove_dir_all(folder).map_err(|e| CacheError::io(folder, e))?;
            debug!("Removed cache folder {:?}", folder);
        }
        fs::create_dir_all(folder).map_err(|e| CacheError::io(folder, e))?;

        let store = Self {
            options,
            index: Mutex::new(Index::default()),
        };
        if use_existing {
            let count = store.scan()?;
            info!("Loaded {} cached responses from {:?}", count, store.options.folder);
            store.evict();
        }
        Ok(store)
    }

    fn scan(&self) -> Result<usize, CacheError> {
        let folder = &self.options.folder;
        let entries = fs::read_dir(folder).map_err(|e| CacheError::io(folder, e))?;
        let mut index = self.index.lock();

        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(folder, e))?;
            let path = entry.path();
            let extension = path.extension().and_then(|e| e.to_str());

            if extension == Some(TEMP_EXTENSION) {
                let _ = fs::remove_file(&path);
                continue;
            }
            if extension != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let metadata = entry.metadata().map_err(|e| CacheError::io(&path, e))?;
            let stored = metadata.modified().unwrap_or_else(|_| SystemTime::now());

            if self.expired(stored) {
                let _ = fs::remove_file(&path);
                continue;
            }
            index.insert(
                key,
                IndexEntry {
                    size: metadata.len(),
                    stored,
                },
            );
        }
        Ok(index.entries.len())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.options.folder.join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    fn expired(&self, stored: SystemTime) -> bool {
        match self.options.ttl {
            Some(ttl) => SystemTime::now()
                .duration_since(stored)
                .map(|age| age > ttl)
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.index.lock().remove(key);
                return Ok(None);
            }
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let entry: CacheEntry = serde_json::from_slice(&contents)
            .map_err(|e| CacheError::Corrupt(key.to_string(), e.to_string()))?;

        if self.expired(entry.stored_at.into()) {
            debug!("Cache entry {} expired", key);
            self.remove(key);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    pub fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let json = serde_json::to_vec(entry)
            .map_err(|e| CacheError::Corrupt(key.to_string(), e.to_string()))?;
        let size = json.len() as u64;
        if size > self.options.max_size {
            warn!(
                "Not caching {}: entry of {} bytes exceeds cache size {}",
                entry.request, size, self.options.max_size
            );
            return Ok(());
        }

        let temp = self.options.folder.join(format!(
            "{key}.{:016x}.{TEMP_EXTENSION}",
            rand::random::<u64>()
        ));
        let path = self.entry_path(key);
        fs::write(&temp, &json).map_err(|e| CacheError::io(&temp, e))?;
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(CacheError::io(&path, e));
        }

        self.index.lock().insert(
            key.to_string(),
            IndexEntry {
                size,
                stored: SystemTime::now(),
            },
        );
        self.evict();
        Ok(())
    }

    pub fn remove(&self, key: &str) {
        let path = self.entry_path(key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove cache entry {:?}: {}", path, e);
            }
        }
        self.index.lock().remove(key);
    }

    fn evict(&self) {
        loop {
            let victim = {
                let index = self.index.lock();
                if index.total <= self.options.max_size {
                    return;
                }
                index.oldest()
            };
            match victim {
                Some(key) => {
                    debug!("Evicting cache entry {}", key);
                    self.remove(&key);
                }
                None => return,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of indexed entries, bytes.
    pub fn size(&self) -> u64 {
        self.index.lock().total
    }

    pub fn folder(&self) -> &Path {
        &self.options.folder
    }
}
