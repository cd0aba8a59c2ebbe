use thiserror::Error;

/// Top-level error taxonomy for the server core.
///
/// Variants mirror the classification in the design's error-handling section:
/// configuration errors fail the process at startup, everything else is
/// scoped to a connection/session and never escapes it.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake error: {0}")]
    Handshake(#[from] crate::tls::HandshakeFailure),

    #[error("http protocol error: {0}")]
    Http(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        ServerError::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        ServerError::Transport(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ServerError::Internal(msg.into())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Transport(err.to_string())
    }
}

impl From<crate::keystore::KeyStoreError> for ServerError {
    fn from(err: crate::keystore::KeyStoreError) -> Self {
        ServerError::Configuration(err.to_string())
    }
}

impl From<openssl::error::ErrorStack> for ServerError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        ServerError::Configuration(format!("TLS setup failed: {}", err))
    }
}
