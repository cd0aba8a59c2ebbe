//! Cipher-suite taxonomy (`spec.md` §3 "CipherSuite").

use serde::{Deserialize, Serialize};

/// The symbolic suite tags this server negotiates. Only these six; anything
/// else proposed by a peer must fail the handshake (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherSuite {
    /// Default-on, "production" tier.
    Aes128CbcSha256,
    /// Default-on, "production" tier.
    Aes256CbcSha384,
    /// "Legacy" opt-in tier.
    Aes128CbcSha,
    /// "Legacy" opt-in tier.
    Aes256CbcSha,
    /// "Null" opt-in tier; no confidentiality. Requires an operator warning
    /// both at startup and on every connection that negotiates it.
    NullSha,
    /// "Null" opt-in tier; no confidentiality.
    NullSha256,
}

impl CipherSuite {
    pub fn is_null(self) -> bool {
        matches!(self, CipherSuite::NullSha | CipherSuite::NullSha256)
    }

    /// The OpenSSL cipher-list name for this suite. PSK-TLS 1.2 suites live
    /// outside OpenSSL's default cipher list and must be requested by name.
    pub fn openssl_name(self) -> &'static str {
        match self {
            CipherSuite::Aes128CbcSha256 => "PSK-AES128-CBC-SHA256",
            CipherSuite::Aes256CbcSha384 => "PSK-AES256-CBC-SHA384",
            CipherSuite::Aes128CbcSha => "PSK-AES128-CBC-SHA",
            CipherSuite::Aes256CbcSha => "PSK-AES256-CBC-SHA",
            CipherSuite::NullSha => "PSK-NULL-SHA",
            CipherSuite::NullSha256 => "PSK-NULL-SHA256",
        }
    }

    /// Reverse lookup used when classifying the cipher OpenSSL reports as
    /// negotiated, for the `TLSSessionInfo` populated after a handshake.
    pub fn from_openssl_name(name: &str) -> Option<Self> {
        match name {
            "PSK-AES128-CBC-SHA256" => Some(CipherSuite::Aes128CbcSha256),
            "PSK-AES256-CBC-SHA384" => Some(CipherSuite::Aes256CbcSha384),
            "PSK-AES128-CBC-SHA" => Some(CipherSuite::Aes128CbcSha),
            "PSK-AES256-CBC-SHA" => Some(CipherSuite::Aes256CbcSha),
            "PSK-NULL-SHA" => Some(CipherSuite::NullSha),
            "PSK-NULL-SHA256" => Some(CipherSuite::NullSha256),
            _ => None,
        }
    }
}

/// Only TLS 1.2 is supported; PSK cipher suites used here have no
/// standardized TLS 1.3 equivalents (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsProtocolVersion {
    Tls12,
}

/// A validated, expanded cipher policy ready to hand to the TLS engine.
/// Computing `has_null` once here (rather than re-deriving it at each
/// warning call site) keeps the startup warning and the per-connection
/// warning from ever disagreeing about what was actually configured.
#[derive(Debug, Clone)]
pub struct CompiledCipherPolicy {
    suites: Vec<CipherSuite>,
    pub has_null: bool,
}

impl CompiledCipherPolicy {
    pub fn compile(suites: Vec<CipherSuite>) -> Self {
        let has_null = suites.iter().any(|s| s.is_null());
        Self { suites, has_null }
    }

    pub fn suites(&self) -> &[CipherSuite] {
        &self.suites
    }

    pub fn contains(&self, suite: CipherSuite) -> bool {
        self.suites.contains(&suite)
    }

    /// OpenSSL `SSL_CTX_set_cipher_list` string: colon-joined suite names.
    pub fn openssl_cipher_list(&self) -> String {
        self.suites
            .iter()
            .map(|s| s.openssl_name())
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn summary(&self) -> String {
        self.suites
            .iter()
            .map(|s| format!("{:?}", s))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_detection_is_precomputed() {
        let policy = CompiledCipherPolicy::compile(vec![CipherSuite::Aes128CbcSha256]);
        assert!(!policy.has_null);
        let policy = CompiledCipherPolicy::compile(vec![CipherSuite::Aes128CbcSha256, CipherSuite::NullSha]);
        assert!(policy.has_null);
    }

    #[test]
    fn openssl_name_roundtrip() {
        for suite in [
            CipherSuite::Aes128CbcSha256,
            CipherSuite::Aes256CbcSha384,
            CipherSuite::Aes128CbcSha,
            CipherSuite::Aes256CbcSha,
            CipherSuite::NullSha,
            CipherSuite::NullSha256,
        ] {
            assert_eq!(CipherSuite::from_openssl_name(suite.openssl_name()), Some(suite));
        }
    }
}
