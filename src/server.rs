//! Acceptor and orchestrator (`spec.md` §4.8 "Admin Server").

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::apdu::Dispatcher;
use crate::config::{KeyStoreConfig, ServerConfig};
use crate::diagnostics::{ErrorHandler, ErrorHandlerConfig};
use crate::error::ServerError;
use crate::events::{Event, EventEmitter, ServerStarted, ServerStopped, TlsHandshakeComplete, TlsHandshakeStart};
use crate::keystore::{FileKeyStore, KeyStore, SqliteKeyStore};
use crate::session::{CloseReason, SessionManager};
use crate::tls::{HandshakeFailure, TlsAcceptor};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Composes every component named in `spec.md` §2 into one runnable server.
pub struct AdminServer {
    config: ServerConfig,
    tls: Arc<TlsAcceptor>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    events: EventEmitter,
    errors: ErrorHandler,
}

impl AdminServer {
    /// Validates `config`, builds the KeyStore and TLS acceptor, and wires
    /// the rest of the core together. Any failure here is a configuration
    /// error and the caller should exit non-zero (`spec.md` §7, §6 CLI exit
    /// code 1).
    pub fn build(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let keystore: Arc<dyn KeyStore> = match &config.key_store {
            KeyStoreConfig::File { path } => Arc::new(FileKeyStore::load(path)?),
            KeyStoreConfig::Sqlite { dsn } => Arc::new(SqliteKeyStore::new(dsn.clone())),
        };

        let policy = config.compiled_cipher_policy();
        let handshake_timeout = Duration::from_millis(config.handshake_timeout_ms);
        let tls = TlsAcceptor::new(policy, handshake_timeout, keystore)?;

        let events = EventEmitter::new();
        let sessions = Arc::new(SessionManager::new(
            events.clone(),
            Duration::from_secs(config.session_timeout_sec),
            config.max_history_per_session,
        ));
        let errors = ErrorHandler::new(
            events.clone(),
            sessions.clone(),
            ErrorHandlerConfig {
                mismatch_threshold: config.mismatch_threshold,
                mismatch_window: Duration::from_secs(config.mismatch_window_sec),
                error_rate_thresholds: config.error_rate_thresholds.clone(),
                error_rate_window: Duration::from_secs(config.mismatch_window_sec),
            },
        );

        Ok(Self {
            config,
            tls: Arc::new(tls),
            sessions,
            dispatcher: Arc::new(Dispatcher::with_default_handlers()),
            events,
            errors,
        })
    }

    pub fn events(&self) -> EventEmitter {
        self.events.clone()
    }

    /// Binds and accepts until `shutdown` resolves. `shutdown` is typically
    /// `tokio::signal::ctrl_c()` wrapped to ignore its error, or a test's
    /// own oneshot channel.
    pub async fn run(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) -> Result<(), ServerError> {
        let addr: SocketAddr = format!("{}:{}", self.config.listen.host, self.config.listen.port)
            .parse()
            .map_err(|e| ServerError::configuration(format!("invalid listen address: {}", e)))?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ServerError::transport(format!("bind {} failed: {}", addr, e))
        })?;

        self.events.emit(Event::ServerStarted(ServerStarted {
            listen_addr: addr,
            cipher_policy_summary: self.tls.policy().summary(),
            null_ciphers_enabled: self.tls.policy().has_null,
        }));

        let sweeper = self
            .sessions
            .spawn_sweeper(Duration::from_secs(self.config.sweep_interval_sec));

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_connections));
        let mut workers: JoinSet<()> = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp, peer)) => {
                            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                                // Backpressure: refuse rather than queue (spec.md §5).
                                drop(tcp);
                                continue;
                            };
                            let server = self.clone();
                            workers.spawn(async move {
                                server.handle_connection(tcp, peer).await;
                                drop(permit);
                            });
                        }
                        Err(err) if is_transient(&err) => {
                            tracing::warn!(error = %err, "transient accept error, continuing");
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "fatal accept error, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        sweeper.abort();
        for session in self.sessions.active_sessions() {
            self.sessions.close(session.id, CloseReason::Normal);
        }

        let drain = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drain.is_err() {
            tracing::error!("shutdown deadline elapsed with workers still active; aborting remaining");
            workers.shutdown().await;
        }

        self.events.emit(Event::ServerStopped(ServerStopped {
            reason: "normal".to_string(),
        }));
        Ok(())
    }

    async fn handle_connection(&self, tcp: TcpStream, peer: SocketAddr) {
        self.events.emit(Event::TlsHandshakeStart(TlsHandshakeStart { peer_addr: peer }));

        let handshake = self.tls.accept(tcp, peer).await;
        let (stream, tls_info) = match handshake {
            Ok(pair) => pair,
            Err(failure) => {
                self.route_handshake_failure(failure);
                return;
            }
        };

        self.events.emit(Event::TlsHandshakeComplete(TlsHandshakeComplete {
            peer_addr: peer,
            success: true,
            identity: Some(tls_info.identity.clone()),
            cipher: Some(tls_info.cipher),
            duration_ms: tls_info.handshake_duration_ms,
            failure_kind: None,
        }));

        let session = self.sessions.create(tls_info);
        crate::http::serve_session(
            stream,
            session,
            self.sessions.clone(),
            self.dispatcher.clone(),
            self.events.clone(),
            self.errors.clone(),
            crate::http::HttpHandlerConfig {
                admin_path: self.config.admin_path.clone(),
                socket_timeout: Duration::from_millis(self.config.socket_timeout_ms),
                keepalive_idle: Duration::from_millis(self.config.keepalive_idle_ms),
            },
        )
        .await;
    }

    /// Routes a failed handshake per `spec.md` §4.2/§4.6: `PskMismatch` and
    /// timeouts/disconnects go through the Error Handler (dedicated
    /// diagnostics); everything else is reported directly as a failed
    /// `tls_handshake_complete` since it has no dedicated diagnostic kind.
    fn route_handshake_failure(&self, failure: HandshakeFailure) {
        let peer_addr = failure.peer_addr();
        match &failure {
            HandshakeFailure::PskMismatch { identity, .. } => {
                self.errors.on_psk_mismatch(identity, peer_addr, true);
            }
            HandshakeFailure::Timeout { partial_state, .. } => {
                self.errors.on_handshake_interrupted(peer_addr, partial_state, "timeout");
            }
            HandshakeFailure::PeerDisconnected { partial_state, .. } => {
                self.errors
                    .on_handshake_interrupted(peer_addr, partial_state, "peer_disconnected");
            }
            HandshakeFailure::UnknownIdentity { .. }
            | HandshakeFailure::UnsupportedCipher { .. }
            | HandshakeFailure::Protocol { .. } => {
                self.events.emit(Event::TlsHandshakeComplete(TlsHandshakeComplete {
                    peer_addr,
                    success: false,
                    identity: None,
                    cipher: None,
                    duration_ms: 0,
                    failure_kind: Some(failure.kind()),
                }));
            }
        }
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::ConnectionReset
    )
}
