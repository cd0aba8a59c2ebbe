//! Pre-shared-key lookup (`spec.md` §4.1 "Key Store").
//!
//! The trait is synchronous rather than `async_trait` because its only
//! caller is the OpenSSL PSK callback in [`crate::tls`], which OpenSSL
//! invokes as a plain C-style callback with no way to suspend and resume —
//! there is nothing to `.await` at that boundary. Implementations that need
//! real I/O (a remote database, say) are expected to keep a warm in-memory
//! cache and treat a cache miss as a genuine lookup failure rather than
//! blocking the handshake on network I/O.

pub mod file;
pub mod sqlite;

use thiserror::Error;

pub use file::FileKeyStore;
pub use sqlite::SqliteKeyStore;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed key store entry: {0}")]
    Malformed(String),
}

/// `spec.md` §4.1: `Lookup(identity) -> secret | not-found`, `Exists(identity) -> bool`.
/// Any backing-store error is reported, never silently treated as "not found"
/// — callers must fail closed rather than let a transient outage read as an
/// unknown identity (`spec.md` §4.1 "fails closed on any backing-store error").
///
/// `exists` is a predicate "without secret retrieval" (`spec.md` §4.1) — an
/// implementation backed by real storage should answer it with a row/key
/// lookup that never materializes the secret bytes. The default below goes
/// through `lookup` and is only a fallback for implementors that have no
/// cheaper existence check to offer; `FileKeyStore` and `SqliteKeyStore` both
/// override it with one.
pub trait KeyStore: Send + Sync {
    fn lookup(&self, identity: &str) -> Result<Option<Vec<u8>>, KeyStoreError>;
    fn exists(&self, identity: &str) -> Result<bool, KeyStoreError> {
        Ok(self.lookup(identity)?.is_some())
    }
}
