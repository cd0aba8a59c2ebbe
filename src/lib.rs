//! GlobalPlatform Amendment B Remote Application Management server core.
//!
//! Implements RAM-over-HTTPS with PSK-TLS (SCP81): a PSK-TLS acceptor, a
//! forward-only session state machine, HTTP/1.1 GP Admin framing, an APDU
//! dispatcher, a typed event fabric, and the diagnostics/error-classification
//! layer that ties handshake and connection failures to it.

pub mod apdu;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod http;
pub mod keystore;
pub mod server;
pub mod session;
pub mod tls;

pub use config::{CipherPolicyKind, KeyStoreConfig, ListenConfig, ServerConfig};
pub use error::ServerError;
pub use events::{Event, EventEmitter, EventKind};
pub use server::AdminServer;
pub use session::{CloseReason, Session, SessionManager, SessionState};
pub use tls::{HandshakeFailure, TlsAcceptor, TlsSessionInfo};
