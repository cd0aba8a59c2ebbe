//! DB-backed key store (`spec.md` §4.1's "DB-backed" reference implementation).
//!
//! No real SQLite driver is wired in here; this is the shape a production
//! deployment would fill in, plus an injectable fault used by tests that
//! exercise "fail closed on a backing-store error" (`spec.md` §4.1, §8).

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{KeyStore, KeyStoreError};

#[derive(Clone)]
enum Fault {
    None,
    AlwaysUnavailable(String),
}

/// An in-memory stand-in for a real DB connection pool. `dsn` is kept only
/// for diagnostics; no connection is actually opened.
pub struct SqliteKeyStore {
    dsn: String,
    rows: RwLock<HashMap<String, Vec<u8>>>,
    fault: RwLock<Fault>,
}

impl SqliteKeyStore {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            rows: RwLock::new(HashMap::new()),
            fault: RwLock::new(Fault::None),
        }
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    pub fn insert(&self, identity: impl Into<String>, secret: Vec<u8>) {
        self.rows.write().insert(identity.into(), secret);
    }

    pub fn remove(&self, identity: &str) {
        self.rows.write().remove(identity);
    }

    /// Makes every subsequent lookup fail with `KeyStoreError::Unavailable`,
    /// simulating a dropped connection pool.
    pub fn inject_fault(&self, reason: impl Into<String>) {
        *self.fault.write() = Fault::AlwaysUnavailable(reason.into());
    }

    pub fn clear_fault(&self) {
        *self.fault.write() = Fault::None;
    }
}

impl KeyStore for SqliteKeyStore {
    fn lookup(&self, identity: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        if let Fault::AlwaysUnavailable(reason) = &*self.fault.read() {
            return Err(KeyStoreError::Unavailable(reason.clone()));
        }
        Ok(self.rows.read().get(identity).cloned())
    }

    fn exists(&self, identity: &str) -> Result<bool, KeyStoreError> {
        if let Fault::AlwaysUnavailable(reason) = &*self.fault.read() {
            return Err(KeyStoreError::Unavailable(reason.clone()));
        }
        Ok(self.rows.read().contains_key(identity))
    }
}
