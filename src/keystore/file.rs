//! File-backed key store (`spec.md` §4.1's "file-backed" reference implementation).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use super::{KeyStore, KeyStoreError};

/// Loads `identity:hex(secret)` pairs, one per line, eagerly at construction.
/// A malformed line fails the load entirely rather than silently skipping an
/// entry (`spec.md` §7 "configuration errors fail fast at startup").
pub struct FileKeyStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl FileKeyStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = Self::parse(&path)?;
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn parse(path: &Path) -> Result<HashMap<String, Vec<u8>>, KeyStoreError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| KeyStoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let mut entries = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (identity, hex_secret) = line.split_once(':').ok_or_else(|| {
                KeyStoreError::Malformed(format!("{}:{}: missing ':' separator", path.display(), lineno + 1))
            })?;
            let secret = hex::decode(hex_secret.trim()).map_err(|e| {
                KeyStoreError::Malformed(format!("{}:{}: {}", path.display(), lineno + 1, e))
            })?;
            entries.insert(identity.trim().to_string(), secret);
        }
        Ok(entries)
    }

    /// Re-reads the backing file, replacing the in-memory set atomically.
    /// Used by operators rotating keys without a full server restart; not
    /// invoked automatically.
    pub fn reload(&self) -> Result<(), KeyStoreError> {
        let entries = Self::parse(&self.path)?;
        *self.entries.write() = entries;
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn lookup(&self, identity: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        Ok(self.entries.read().get(identity).cloned())
    }

    fn exists(&self, identity: &str) -> Result<bool, KeyStoreError> {
        Ok(self.entries.read().contains_key(identity))
    }
}
