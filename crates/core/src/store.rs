//! Persistent key-value store
//!
//! An on-disk key -> blob store with an in-memory write buffer and a
//! tombstone set. Keys map to file paths under a root directory (a leading
//! `/` is stripped, remaining `/` separators become subdirectories). Values
//! are opaque JSON blobs; `preserve_order` keeps object round-trips exact.
//!
//! The store is not safe for concurrent use across processes; callers
//! guarantee exclusivity.

use crate::errors::{LimarError, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

pub struct Store {
    root: PathBuf,
    cache: HashMap<String, Value>,
    marked_for_removal: HashSet<String>,
}

impl Store {
    /// Open a store rooted at the given directory, creating it if needed
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| LimarError::StoreIo {
            key: root.display().to_string(),
            source: e,
        })?;

        Ok(Self {
            root,
            cache: HashMap::new(),
            marked_for_removal: HashSet::new(),
        })
    }

    /// The directory this store persists under
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Buffer a value for the given key, clearing any pending removal
    pub fn set(&mut self, key: &str, value: Value) {
        trace!(key, "store set");
        self.cache.insert(key.to_string(), value);
        self.marked_for_removal.remove(key);
    }

    /// Fetch the value for a key, reading through to disk on a buffer miss
    ///
    /// Keys marked for removal are misses even if their file still exists;
    /// the deletion is pending, not forgotten.
    pub fn get(&mut self, key: &str) -> Result<Value> {
        if self.marked_for_removal.contains(key) {
            return Err(LimarError::StoreKeyNotFound {
                key: key.to_string(),
            });
        }

        if let Some(value) = self.cache.get(key) {
            trace!(key, "store hit (memory)");
            return Ok(value.clone());
        }

        let path = self.path_for(key);
        let raw = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LimarError::StoreKeyNotFound {
                    key: key.to_string(),
                }
            } else {
                LimarError::StoreIo {
                    key: key.to_string(),
                    source: e,
                }
            }
        })?;

        let value: Value = serde_json::from_str(&raw).map_err(|e| LimarError::StoreCodec {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        trace!(key, "store hit (disk)");
        self.cache.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Whether the key currently has a buffered (in-memory) value
    pub fn has_buffered(&self, key: &str) -> bool {
        self.cache.contains_key(key) && !self.marked_for_removal.contains(key)
    }

    /// Drop the buffered value and mark the key's file for deletion
    pub fn remove(&mut self, key: &str) {
        trace!(key, "store remove");
        self.cache.remove(key);
        self.marked_for_removal.insert(key.to_string());
    }

    /// Write every buffered entry and delete every tombstoned file
    ///
    /// Parent directories are created as needed on write. On delete, parents
    /// left empty are pruned up to (but not including) the store root; prune
    /// failures are non-fatal.
    pub fn persist(&mut self) -> Result<()> {
        for (key, value) in &self.cache {
            let path = self.path_for(key);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| LimarError::StoreIo {
                    key: key.clone(),
                    source: e,
                })?;
            }

            let encoded =
                serde_json::to_string(value).map_err(|e| LimarError::StoreCodec {
                    key: key.clone(),
                    message: e.to_string(),
                })?;
            fs::write(&path, encoded).map_err(|e| LimarError::StoreIo {
                key: key.clone(),
                source: e,
            })?;
        }

        for key in &self.marked_for_removal {
            let path = self.path_for(key);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(key, error = %e, "failed to remove tombstoned store file");
                }
            }

            // Prune empty parents until a non-empty one (or the root) is hit
            let mut dir = path.parent();
            while let Some(d) = dir {
                if d == self.root || fs::remove_dir(d).is_err() {
                    break;
                }
                dir = d.parent();
            }
        }

        debug!(
            entries = self.cache.len(),
            removed = self.marked_for_removal.len(),
            "store persisted"
        );
        self.marked_for_removal.clear();
        Ok(())
    }

    /// Persist, then clear the in-memory buffer
    pub fn flush(&mut self) -> Result<()> {
        self.persist()?;
        self.cache.clear();
        Ok(())
    }

    /// List keys, optionally including persisted entries not yet loaded
    pub fn list(&self, read_persistent: bool) -> Vec<String> {
        let mut keys: Vec<String> = self.cache.keys().cloned().collect();

        if read_persistent {
            let mut stack = vec![self.root.clone()];
            while let Some(dir) = stack.pop() {
                let Ok(entries) = fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else if let Ok(rel) = path.strip_prefix(&self.root) {
                        let key = rel.to_string_lossy().to_string();
                        if !keys.contains(&key) && !self.marked_for_removal.contains(&key) {
                            keys.push(key);
                        }
                    }
                }
            }
        }

        keys.sort();
        keys
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.strip_prefix('/').unwrap_or(key))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("buffered", &self.cache.len())
            .field("tombstones", &self.marked_for_removal.len())
            .finish()
    }
}
