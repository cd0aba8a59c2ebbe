//! PSK-TLS 1.2 handshake handling (`spec.md` §4.2 "TLS Handler").
//!
//! `rustls` has no RFC 4279 PSK cipher suites, so the handshake itself runs
//! on `openssl` via `tokio-openssl`; everything above this module only sees
//! [`TlsSessionInfo`] and [`HandshakeFailure`].

pub mod cipher;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::ssl::{Ssl, SslContext, SslMethod, SslVerifyMode};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::keystore::KeyStore;
use cipher::{CipherSuite, CompiledCipherPolicy, TlsProtocolVersion};

/// Snapshot of a completed handshake, owned by the `Session` it seeds
/// (`spec.md` §3 "TLSSessionInfo").
#[derive(Debug, Clone, Serialize)]
pub struct TlsSessionInfo {
    pub identity: String,
    pub cipher: CipherSuite,
    pub negotiated_protocol_version: TlsProtocolVersion,
    pub handshake_duration_ms: u64,
    pub peer_address: SocketAddr,
    pub is_null_cipher: bool,
}

/// Classification used for diagnostics and for `TlsHandshakeComplete.failure_kind`
/// (`spec.md` §4.2's exception -> alert -> diagnostic table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeFailureKind {
    UnknownIdentity,
    PskMismatch,
    Timeout,
    UnsupportedCipher,
    PeerDisconnected,
    Protocol,
}

/// A handshake that did not produce a session. Carries enough context for the
/// Error Handler to classify it without re-parsing TLS internals.
#[derive(Debug, Error)]
pub enum HandshakeFailure {
    #[error("unknown PSK identity presented by {peer_addr}")]
    UnknownIdentity { peer_addr: SocketAddr },

    #[error("PSK mismatch for identity {identity:?} from {peer_addr}")]
    PskMismatch {
        identity: String,
        peer_addr: SocketAddr,
    },

    #[error("handshake with {peer_addr} timed out after {elapsed_ms}ms (state={partial_state})")]
    Timeout {
        peer_addr: SocketAddr,
        elapsed_ms: u64,
        partial_state: String,
    },

    #[error("{peer_addr} proposed no supported cipher suite")]
    UnsupportedCipher { peer_addr: SocketAddr },

    #[error("{peer_addr} disconnected mid-handshake (state={partial_state})")]
    PeerDisconnected {
        peer_addr: SocketAddr,
        partial_state: String,
    },

    #[error("TLS protocol error with {peer_addr}: {message}")]
    Protocol {
        peer_addr: SocketAddr,
        message: String,
    },
}

impl HandshakeFailure {
    pub fn kind(&self) -> HandshakeFailureKind {
        match self {
            HandshakeFailure::UnknownIdentity { .. } => HandshakeFailureKind::UnknownIdentity,
            HandshakeFailure::PskMismatch { .. } => HandshakeFailureKind::PskMismatch,
            HandshakeFailure::Timeout { .. } => HandshakeFailureKind::Timeout,
            HandshakeFailure::UnsupportedCipher { .. } => HandshakeFailureKind::UnsupportedCipher,
            HandshakeFailure::PeerDisconnected { .. } => HandshakeFailureKind::PeerDisconnected,
            HandshakeFailure::Protocol { .. } => HandshakeFailureKind::Protocol,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            HandshakeFailure::UnknownIdentity { peer_addr }
            | HandshakeFailure::PskMismatch { peer_addr, .. }
            | HandshakeFailure::Timeout { peer_addr, .. }
            | HandshakeFailure::UnsupportedCipher { peer_addr }
            | HandshakeFailure::PeerDisconnected { peer_addr, .. }
            | HandshakeFailure::Protocol { peer_addr, .. } => *peer_addr,
        }
    }
}

/// Shared mutable state the PSK callback (invoked synchronously by OpenSSL,
/// possibly on this same task's stack) writes into, since the callback
/// signature has no way to hand back a typed outcome of its own. The accept
/// loop reads it after the handshake future resolves (successfully or not)
/// to tell "unknown identity" apart from "known identity, wrong secret".
struct PskOutcome {
    identity: parking_lot::Mutex<Option<String>>,
    known: std::sync::atomic::AtomicBool,
}

impl PskOutcome {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            identity: parking_lot::Mutex::new(None),
            known: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

/// The ex_data slot every `Ssl` carries its own [`PskOutcome`] under. One
/// index is shared process-wide, as `openssl`'s ex_data API intends — it is
/// allocated once and indexes into per-`Ssl` storage, not global storage.
fn psk_outcome_index() -> Index<Ssl, Arc<PskOutcome>> {
    static INDEX: OnceLock<Index<Ssl, Arc<PskOutcome>>> = OnceLock::new();
    *INDEX.get_or_init(|| Ssl::new_ex_index().expect("ex_data index allocation cannot fail twice"))
}

/// Builds the `SslContext` once at startup, with the PSK callback and
/// cipher policy baked in; hands out a fresh `Ssl` (and [`PskOutcome`]) per
/// connection (`spec.md` §4.2's "one handshake at a time per connection,
/// acceptor itself is stateless").
pub struct TlsAcceptor {
    context: SslContext,
    policy: CompiledCipherPolicy,
    handshake_timeout: Duration,
}

impl TlsAcceptor {
    pub fn new(
        policy: CompiledCipherPolicy,
        handshake_timeout: Duration,
        keystore: Arc<dyn KeyStore>,
    ) -> Result<Self, ErrorStack> {
        let index = psk_outcome_index();
        let mut builder = openssl::ssl::SslContextBuilder::new(SslMethod::tls())?;
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_cipher_list(&policy.openssl_cipher_list())?;
        builder.set_min_proto_version(Some(openssl::ssl::SslVersion::TLS1_2))?;
        builder.set_max_proto_version(Some(openssl::ssl::SslVersion::TLS1_2))?;
        builder.set_psk_server_callback(move |ssl, identity, psk_out| {
            let Some(outcome) = ssl.ex_data(index) else {
                return Ok(0);
            };
            let outcome = outcome.clone();
            let identity = match identity.and_then(|b| std::str::from_utf8(b).ok()) {
                Some(id) => id.to_string(),
                None => return Ok(0),
            };
            tracing::info!(identity, "PSK identity presented");
            match keystore.lookup(&identity) {
                Ok(Some(secret)) => {
                    *outcome.identity.lock() = Some(identity);
                    outcome.known.store(true, std::sync::atomic::Ordering::SeqCst);
                    if secret.len() > psk_out.len() {
                        return Ok(0);
                    }
                    psk_out[..secret.len()].copy_from_slice(&secret);
                    Ok(secret.len())
                }
                Ok(None) => {
                    *outcome.identity.lock() = Some(identity);
                    outcome.known.store(false, std::sync::atomic::Ordering::SeqCst);
                    Ok(0)
                }
                Err(err) => {
                    tracing::error!(error = %err, "key store lookup failed during PSK callback");
                    outcome.known.store(false, std::sync::atomic::Ordering::SeqCst);
                    Ok(0)
                }
            }
        });

        if policy.has_null {
            tracing::warn!(
                suites = %policy.summary(),
                "NULL cipher suites enabled: UNENCRYPTED TRAFFIC is possible on this listener"
            );
        }

        Ok(Self {
            context: builder.build(),
            policy,
            handshake_timeout,
        })
    }

    pub fn policy(&self) -> &CompiledCipherPolicy {
        &self.policy
    }

    /// Drives one server-side handshake to completion, classifying any
    /// failure per `spec.md` §4.2. On success the returned stream is ready
    /// for the HTTP layer; no bytes beyond the handshake have been consumed.
    pub async fn accept(
        &self,
        tcp: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(SslStream<TcpStream>, TlsSessionInfo), HandshakeFailure> {
        let outcome = PskOutcome::new();
        let index = psk_outcome_index();

        let mut ssl = Ssl::new(&self.context).map_err(|e| HandshakeFailure::Protocol {
            peer_addr,
            message: e.to_string(),
        })?;
        ssl.set_ex_data(index, outcome.clone());

        let started = Instant::now();
        let mut stream = SslStream::new(ssl, tcp).map_err(|e| HandshakeFailure::Protocol {
            peer_addr,
            message: e.to_string(),
        })?;

        let handshake = Pin::new(&mut stream).accept();
        let result = tokio::time::timeout(self.handshake_timeout, handshake).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Err(_) => Err(HandshakeFailure::Timeout {
                peer_addr,
                elapsed_ms,
                partial_state: "client_hello_or_later".to_string(),
            }),
            Ok(Err(err)) => {
                if let Some(identity) = outcome.identity.lock().clone() {
                    if outcome.known.load(std::sync::atomic::Ordering::SeqCst) {
                        return Err(HandshakeFailure::PskMismatch { identity, peer_addr });
                    }
                    return Err(HandshakeFailure::UnknownIdentity { peer_addr });
                }
                if is_peer_disconnect(&err) {
                    Err(HandshakeFailure::PeerDisconnected {
                        peer_addr,
                        partial_state: "pre_client_hello_or_mid_handshake".to_string(),
                    })
                } else {
                    Err(HandshakeFailure::Protocol {
                        peer_addr,
                        message: err.to_string(),
                    })
                }
            }
            Ok(Ok(())) => {
                let identity = outcome.identity.lock().clone().unwrap_or_default();
                let cipher_name = stream
                    .ssl()
                    .current_cipher()
                    .map(|c| c.standard_name().unwrap_or(c.name()).to_string())
                    .unwrap_or_default();
                let cipher = CipherSuite::from_openssl_name(&cipher_name).ok_or_else(|| {
                    HandshakeFailure::UnsupportedCipher { peer_addr }
                })?;
                if cipher.is_null() {
                    tracing::warn!(%peer_addr, identity = %identity, "connection negotiated a NULL cipher suite");
                }
                Ok((
                    stream,
                    TlsSessionInfo {
                        identity,
                        cipher,
                        negotiated_protocol_version: TlsProtocolVersion::Tls12,
                        handshake_duration_ms: elapsed_ms,
                        peer_address: peer_addr,
                        is_null_cipher: cipher.is_null(),
                    },
                ))
            }
        }
    }
}

fn is_peer_disconnect(err: &openssl::ssl::Error) -> bool {
    matches!(err.code(), openssl::ssl::ErrorCode::ZERO_RETURN)
        || err
            .io_error()
            .map(|io| {
                matches!(
                    io.kind(),
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
                )
            })
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_and_peer_addr_agree_across_variants() {
        let addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let failures = vec![
            HandshakeFailure::UnknownIdentity { peer_addr: addr },
            HandshakeFailure::PskMismatch { identity: "x".into(), peer_addr: addr },
            HandshakeFailure::Timeout { peer_addr: addr, elapsed_ms: 1, partial_state: "x".into() },
            HandshakeFailure::UnsupportedCipher { peer_addr: addr },
            HandshakeFailure::PeerDisconnected { peer_addr: addr, partial_state: "x".into() },
            HandshakeFailure::Protocol { peer_addr: addr, message: "x".into() },
        ];
        for f in failures {
            assert_eq!(f.peer_addr(), addr);
        }
    }

    #[test]
    fn psk_outcome_index_is_stable_across_calls() {
        assert_eq!(psk_outcome_index(), psk_outcome_index());
    }
}
