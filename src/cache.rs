//! Persistent device state cache.
//!
//! Maps an upper-cased device address to the hex-encoded resume blob the
//! board produced after its last full setup. Entries never expire: a stale
//! blob is simply refused by the board and the connection falls back to
//! full setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from loading or saving the cache file.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to access device cache {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device cache {path:?} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Address-keyed store of resume blobs.
#[derive(Debug, Default, Clone)]
pub struct DeviceCache {
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
}

impl DeviceCache {
    /// A cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the cache from `path`. A missing file is an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => {
                let raw: BTreeMap<String, String> =
                    serde_json::from_str(&content).map_err(|source| CacheError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                raw.into_iter()
                    .map(|(address, blob)| (normalize(&address), blob))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(CacheError::Io { path, source }),
        };

        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    /// Load the cache, starting empty when the file is unreadable.
    ///
    /// The broken file is overwritten on the next successful connect.
    pub fn load_or_empty(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(&path) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!("{e}; starting with an empty device cache");
                Self {
                    path: Some(path),
                    entries: BTreeMap::new(),
                }
            }
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Decoded resume blob for `address`.
    pub fn resume_blob(&self, address: &str) -> Option<Vec<u8>> {
        let encoded = self.entries.get(&normalize(address))?;
        match hex::decode(encoded) {
            Ok(blob) if !blob.is_empty() => Some(blob),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(mac = %address, "Ignoring malformed cached state: {e}");
                None
            }
        }
    }

    /// Replace the blob for `address` and rewrite the backing file.
    pub fn store(&mut self, address: &str, blob: &[u8]) -> Result<(), CacheError> {
        self.entries.insert(normalize(address), hex::encode(blob));
        self.save()
    }

    /// Rewrite the backing file with the current entries.
    pub fn save(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| CacheError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| io_err(std::io::Error::other(e)))?;

        // Write beside the target and rename so a crash never leaves half a file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(&normalize(address))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize(address: &str) -> String {
    address.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DeviceCache::load(dir.path().join("absent.json")).unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.resume_blob("AA:BB:CC:DD:EE:FF"), None);
    }

    #[test]
    fn test_store_persists_uppercase_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = DeviceCache::load(&path).unwrap();
        cache.store("aa:bb:cc:dd:ee:ff", &[0xde, 0xad, 0xbe, 0xef]).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["AA:BB:CC:DD:EE:FF"], "deadbeef");

        let reloaded = DeviceCache::load(&path).unwrap();
        assert_eq!(
            reloaded.resume_blob("AA:bb:CC:dd:EE:ff"),
            Some(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn test_store_replaces_existing_entry() {
        let mut cache = DeviceCache::in_memory();
        cache.store("AA:BB:CC:DD:EE:FF", b"old").unwrap();
        cache.store("AA:BB:CC:DD:EE:FF", b"new").unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resume_blob("AA:BB:CC:DD:EE:FF"), Some(b"new".to_vec()));
    }

    #[test]
    fn test_corrupt_file_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            DeviceCache::load(&path),
            Err(CacheError::Parse { .. })
        ));

        let mut cache = DeviceCache::load_or_empty(&path);
        assert!(cache.is_empty());
        cache.store("AA:BB:CC:DD:EE:FF", b"blob").unwrap();
        assert!(DeviceCache::load(&path).unwrap().contains("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_malformed_hex_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, r#"{"AA:BB:CC:DD:EE:FF": "zz"}"#).unwrap();

        let cache = DeviceCache::load(&path).unwrap();
        assert!(cache.contains("AA:BB:CC:DD:EE:FF"));
        assert_eq!(cache.resume_blob("AA:BB:CC:DD:EE:FF"), None);
    }
}
