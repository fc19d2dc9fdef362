//! File-backed durable storage for the named logical stores.
//!
//! Each store is one file written with the stage-then-rename discipline:
//! serialize into a staging file, fsync it, then atomically rename over
//! the canonical file. A crash mid-write leaves either the old complete
//! file or the new complete file on disk, never a torn one.

use crate::error::PolicyError;
use crate::ports::outbound::{BlobMap, BlobStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk blob envelope; bump the version when the layout changes.
#[derive(Serialize, Deserialize)]
struct PersistedBlob {
    version: u32,
    entries: BlobMap,
}

const BLOB_FORMAT_VERSION: u32 = 1;

/// Store files live under one directory, one `<store>.dat` per store.
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    /// Create a store rooted at `dir`. The directory is created on the
    /// first save.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn canonical_path(&self, store: &str) -> PathBuf {
        self.dir.join(format!("{store}.dat"))
    }

    fn staging_path(&self, store: &str) -> PathBuf {
        self.dir.join(format!("{store}.dat.staging"))
    }

    fn decode(store: &str, bytes: &[u8]) -> Option<BlobMap> {
        let blob: PersistedBlob = match bincode::deserialize(bytes) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(store, error = %e, "corrupt persisted blob, treating as empty");
                return None;
            }
        };
        if blob.version != BLOB_FORMAT_VERSION {
            warn!(
                store,
                version = blob.version,
                "unknown blob format version, treating as empty"
            );
            return None;
        }
        Some(blob.entries)
    }

    fn io_error(store: &str, e: std::io::Error) -> PolicyError {
        PolicyError::Persistence {
            store: store.to_string(),
            message: e.to_string(),
        }
    }
}

impl BlobStore for FileBlobStore {
    fn load(&self, store: &str) -> BlobMap {
        // Canonical first; a staging file is only consulted when an
        // interrupted first write left no canonical file behind.
        for path in [self.canonical_path(store), self.staging_path(store)] {
            match std::fs::read(&path) {
                Ok(bytes) => {
                    if let Some(entries) = Self::decode(store, &bytes) {
                        debug!(store, path = %path.display(), entries = entries.len(), "loaded store");
                        return entries;
                    }
                    return BlobMap::new();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(store, error = %e, "failed to read store, treating as empty");
                    return BlobMap::new();
                }
            }
        }
        BlobMap::new()
    }

    fn save(&self, store: &str, map: &BlobMap) -> Result<(), PolicyError> {
        let canonical = self.canonical_path(store);
        let staging = self.staging_path(store);

        if map.is_empty() {
            for path in [canonical, staging] {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Self::io_error(store, e)),
                }
            }
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir).map_err(|e| Self::io_error(store, e))?;

        let blob = PersistedBlob {
            version: BLOB_FORMAT_VERSION,
            entries: map.clone(),
        };
        let bytes = bincode::serialize(&blob)
            .map_err(|e| PolicyError::Serialization(e.to_string()))?;

        let mut file = std::fs::File::create(&staging).map_err(|e| Self::io_error(store, e))?;
        file.write_all(&bytes).map_err(|e| Self::io_error(store, e))?;
        file.sync_all().map_err(|e| Self::io_error(store, e))?;
        drop(file);

        std::fs::rename(&staging, &canonical).map_err(|e| Self::io_error(store, e))?;
        Ok(())
    }
}

/// In-memory store for tests and simulation runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    stores: Mutex<HashMap<String, BlobMap>>,
}

impl MemoryBlobStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&self, store: &str) -> BlobMap {
        self.stores.lock().get(store).cloned().unwrap_or_default()
    }

    fn save(&self, store: &str, map: &BlobMap) -> Result<(), PolicyError> {
        let mut stores = self.stores.lock();
        if map.is_empty() {
            stores.remove(store);
        } else {
            stores.insert(store.to_string(), map.clone());
        }
        Ok(())
    }
}
