//! Server configuration.
//!
//! `ServerConfig` is handed to the core by the (out-of-scope) CLI/config-file
//! collaborator already deserialized; the core only owns validation and
//! defaults, not file/format parsing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::tls::cipher::{CipherSuite, CompiledCipherPolicy};

/// `listen: {host, port}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Named cipher policies; see `spec.md` §3 "CipherSuite" for the suite tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherPolicyKind {
    /// AES_128_CBC_SHA256, AES_256_CBC_SHA384 only.
    Default,
    /// Default tier plus AES_128_CBC_SHA, AES_256_CBC_SHA.
    Legacy,
    /// Legacy tier plus NULL_SHA, NULL_SHA256.
    All,
    /// NULL ciphers only; for debugging on an isolated bench, never production.
    NullDebug,
}

impl Default for CipherPolicyKind {
    fn default() -> Self {
        CipherPolicyKind::Default
    }
}

impl CipherPolicyKind {
    /// Expands the named policy into its concrete suite set.
    pub fn suites(self) -> Vec<CipherSuite> {
        use CipherSuite::*;
        match self {
            CipherPolicyKind::Default => vec![Aes128CbcSha256, Aes256CbcSha384],
            CipherPolicyKind::Legacy => {
                vec![Aes128CbcSha256, Aes256CbcSha384, Aes128CbcSha, Aes256CbcSha]
            }
            CipherPolicyKind::All => vec![
                Aes128CbcSha256,
                Aes256CbcSha384,
                Aes128CbcSha,
                Aes256CbcSha,
                NullSha,
                NullSha256,
            ],
            CipherPolicyKind::NullDebug => vec![NullSha, NullSha256],
        }
    }
}

/// `keyStore: {kind, path-or-DSN}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum KeyStoreConfig {
    File { path: String },
    Sqlite { dsn: String },
}

/// Top-level configuration struct, one-to-one with `spec.md` §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub cipher_policy: CipherPolicyKind,

    #[serde(default)]
    pub enable_null_ciphers: bool,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    #[serde(default = "default_session_timeout_sec")]
    pub session_timeout_sec: u64,

    #[serde(default = "default_sweep_interval_sec")]
    pub sweep_interval_sec: u64,

    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,

    #[serde(default = "default_mismatch_threshold")]
    pub mismatch_threshold: u32,

    #[serde(default = "default_mismatch_window_sec")]
    pub mismatch_window_sec: u64,

    #[serde(default)]
    pub error_rate_thresholds: HashMap<String, f64>,

    pub key_store: KeyStoreConfig,

    #[serde(default = "default_admin_path")]
    pub admin_path: String,

    /// Ambient: caps the in-memory `apduHistory` per session (spec.md §3
    /// allows "optionally bounded or offloaded to storage").
    #[serde(default = "default_max_history_per_session")]
    pub max_history_per_session: usize,

    /// Ambient: idle window after a 204 before keep-alive is torn down.
    #[serde(default = "default_keepalive_idle_ms")]
    pub keepalive_idle_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}
fn default_socket_timeout_ms() -> u64 {
    60_000
}
fn default_session_timeout_sec() -> u64 {
    300
}
fn default_sweep_interval_sec() -> u64 {
    10
}
fn default_max_concurrent_connections() -> usize {
    10
}
fn default_mismatch_threshold() -> u32 {
    3
}
fn default_mismatch_window_sec() -> u64 {
    60
}
fn default_admin_path() -> String {
    "/admin".to_string()
}
fn default_max_history_per_session() -> usize {
    256
}
fn default_keepalive_idle_ms() -> u64 {
    5_000
}

impl ServerConfig {
    /// Validates cross-field invariants the core relies on. Called once at
    /// startup; failures are `ServerError::Configuration` and fail-fast
    /// (spec.md §7 "Configuration errors").
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.sweep_interval_sec == 0 || self.sweep_interval_sec > 30 {
            return Err(ServerError::configuration(
                "sweep_interval_sec must be in 1..=30",
            ));
        }
        if self.max_concurrent_connections == 0 {
            return Err(ServerError::configuration(
                "max_concurrent_connections must be at least 1",
            ));
        }
        if self.admin_path.is_empty() || !self.admin_path.starts_with('/') {
            return Err(ServerError::configuration(
                "admin_path must be a non-empty absolute path",
            ));
        }
        if self.cipher_policy == CipherPolicyKind::NullDebug && !self.enable_null_ciphers {
            return Err(ServerError::configuration(
                "cipher_policy=null-debug requires enable_null_ciphers=true",
            ));
        }
        Ok(())
    }

    /// Expands `cipher_policy` into its concrete suite set, then drops any
    /// NULL suite unless `enable_null_ciphers` is set — `enableNullCiphers`
    /// is "ignored unless policy permits" (`spec.md` §6), i.e. it gates the
    /// named policy rather than adding suites of its own.
    pub fn compiled_cipher_policy(&self) -> CompiledCipherPolicy {
        let suites = self
            .cipher_policy
            .suites()
            .into_iter()
            .filter(|s| !s.is_null() || self.enable_null_ciphers)
            .collect();
        CompiledCipherPolicy::compile(suites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            listen: ListenConfig::default(),
            cipher_policy: CipherPolicyKind::Default,
            enable_null_ciphers: false,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            session_timeout_sec: default_session_timeout_sec(),
            sweep_interval_sec: default_sweep_interval_sec(),
            max_concurrent_connections: default_max_concurrent_connections(),
            mismatch_threshold: default_mismatch_threshold(),
            mismatch_window_sec: default_mismatch_window_sec(),
            error_rate_thresholds: HashMap::new(),
            key_store: KeyStoreConfig::File {
                path: "keys.txt".into(),
            },
            admin_path: default_admin_path(),
            max_history_per_session: default_max_history_per_session(),
            keepalive_idle_ms: default_keepalive_idle_ms(),
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn null_debug_requires_explicit_opt_in() {
        let mut cfg = base_config();
        cfg.cipher_policy = CipherPolicyKind::NullDebug;
        assert!(cfg.validate().is_err());
        cfg.enable_null_ciphers = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_sweep_interval() {
        let mut cfg = base_config();
        cfg.sweep_interval_sec = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversized_sweep_interval() {
        let mut cfg = base_config();
        cfg.sweep_interval_sec = 31;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn admin_path_must_be_absolute() {
        let mut cfg = base_config();
        cfg.admin_path = "admin".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn null_suites_are_dropped_unless_explicitly_enabled() {
        let mut cfg = base_config();
        cfg.cipher_policy = CipherPolicyKind::All;
        assert!(!cfg.compiled_cipher_policy().has_null);
        cfg.enable_null_ciphers = true;
        assert!(cfg.compiled_cipher_policy().has_null);
    }
}
