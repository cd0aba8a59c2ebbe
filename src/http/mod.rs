//! HTTP/1.1 subset for the GP Admin endpoint (`spec.md` §4.4 "HTTP Handler").
//!
//! Only what the protocol needs: `POST` to one configured path, a
//! `Content-Length` or `chunked` body, and optional keep-alive. Nothing here
//! understands redirects, ranges, trailers beyond the terminating chunk, or
//! any method but `POST`.

pub mod gpadmin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::apdu::Dispatcher;
use crate::diagnostics::ErrorHandler;
use crate::events::{ApduReceived, ApduSent, Event, EventEmitter};
use crate::session::{CloseReason, Session, SessionManager};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    Ok200,
    NoContent204,
    BadRequest400,
    NotFound404,
    MethodNotAllowed405,
    UnsupportedMediaType415,
    InternalError500,
}

impl HttpStatus {
    fn line(self) -> &'static str {
        match self {
            HttpStatus::Ok200 => "200 OK",
            HttpStatus::NoContent204 => "204 No Content",
            HttpStatus::BadRequest400 => "400 Bad Request",
            HttpStatus::NotFound404 => "404 Not Found",
            HttpStatus::MethodNotAllowed405 => "405 Method Not Allowed",
            HttpStatus::UnsupportedMediaType415 => "415 Unsupported Media Type",
            HttpStatus::InternalError500 => "500 Internal Server Error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("malformed request line or headers")]
    MalformedRequest,
    #[error("malformed chunked or content-length framing")]
    MalformedFraming,
    #[error("request body exceeds the configured limit")]
    BodyTooLarge,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct ParsedRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl ParsedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) => v.eq_ignore_ascii_case("keep-alive"),
            None => false,
        }
    }
}

/// Reads one HTTP/1.1 request. Returns `Ok(None)` if the peer closed the
/// connection before sending any bytes (a clean end of a keep-alive loop,
/// not an error).
async fn read_request<R>(reader: &mut BufReader<R>) -> Result<Option<ParsedRequest>, HttpError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut request_line = String::new();
    let n = reader.read_line(&mut request_line).await?;
    if n == 0 {
        return Ok(None);
    }
    let request_line = request_line.trim_end();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(HttpError::MalformedRequest)?.to_string();
    let path = parts.next().ok_or(HttpError::MalformedRequest)?.to_string();
    let _version = parts.next().ok_or(HttpError::MalformedRequest)?;

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(HttpError::MalformedRequest);
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(HttpError::MalformedRequest)?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let body = if headers
        .get("transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        read_chunked_body(reader).await?
    } else if let Some(len) = headers.get("content-length") {
        let len: usize = len.parse().map_err(|_| HttpError::MalformedFraming)?;
        if len > MAX_BODY_BYTES {
            return Err(HttpError::BodyTooLarge);
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        buf
    } else {
        Vec::new()
    };

    Ok(Some(ParsedRequest { method, path, headers, body }))
}

async fn read_chunked_body<R>(reader: &mut BufReader<R>) -> Result<Vec<u8>, HttpError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        let n = reader.read_line(&mut size_line).await?;
        if n == 0 {
            return Err(HttpError::MalformedFraming);
        }
        let size_line = size_line.trim_end();
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or(""), 16)
            .map_err(|_| HttpError::MalformedFraming)?;
        if size == 0 {
            // consume the trailing CRLF after the terminating zero-chunk.
            let mut trailer = String::new();
            reader.read_line(&mut trailer).await?;
            break;
        }
        if body.len() + size > MAX_BODY_BYTES {
            return Err(HttpError::BodyTooLarge);
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(HttpError::MalformedFraming);
        }
    }
    Ok(body)
}

async fn write_response<W>(
    writer: &mut W,
    status: HttpStatus,
    body: &[u8],
    keep_alive: bool,
) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: {}\r\n",
        status.line(),
        body.len(),
        if keep_alive { "keep-alive" } else { "close" }
    );
    if !body.is_empty() {
        head.push_str(&format!("Content-Type: {}\r\n", gpadmin::CONTENT_TYPE));
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    if !body.is_empty() {
        writer.write_all(body).await?;
    }
    writer.flush().await
}

pub struct HttpHandlerConfig {
    pub admin_path: String,
    pub socket_timeout: Duration,
    pub keepalive_idle: Duration,
}

/// Drives the request/response loop for one authenticated `Session` until
/// the peer disconnects, the session times out, a fatal protocol error
/// occurs, or a `204` is sent and no further request arrives within the
/// idle window (`spec.md` §4.4 "Keep-alive").
pub async fn serve_session<S>(
    stream: S,
    session: Session,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    events: EventEmitter,
    errors: ErrorHandler,
    config: HttpHandlerConfig,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let read_result = tokio::time::timeout(config.socket_timeout, read_request(&mut reader)).await;
        let parsed = match read_result {
            Err(_elapsed) => {
                errors.on_connection_interrupted(Some(session.id), Some(session.tls.peer_address), None);
                return;
            }
            Ok(Err(HttpError::Io(_))) => {
                errors.on_connection_interrupted(Some(session.id), Some(session.tls.peer_address), None);
                return;
            }
            Ok(Err(HttpError::MalformedRequest | HttpError::MalformedFraming | HttpError::BodyTooLarge)) => {
                // spec.md §4.4 "On malformed framing -> 400 and close": the
                // connection is still writable even though the request
                // never parsed, so respond before tearing it down.
                let _ = tokio::time::timeout(
                    config.socket_timeout,
                    write_response(&mut write_half, HttpStatus::BadRequest400, &[], false),
                )
                .await;
                sessions.close(session.id, CloseReason::Error);
                return;
            }
            Ok(Ok(None)) => {
                sessions.close(session.id, CloseReason::ClientDisconnect);
                return;
            }
            Ok(Ok(Some(req))) => req,
        };

        let keep_alive = parsed.keep_alive();
        let outcome = handle_one_request(&parsed, &session, &sessions, &dispatcher, &events, &config);
        let (status, body) = match outcome {
            Ok(pair) => pair,
            Err(status) => (status, Vec::new()),
        };

        let write_result = tokio::time::timeout(
            config.socket_timeout,
            write_response(&mut write_half, status, &body, keep_alive),
        )
        .await;
        if write_result.is_err() || write_result.unwrap().is_err() {
            errors.on_connection_interrupted(Some(session.id), Some(session.tls.peer_address), None);
            return;
        }

        if !keep_alive {
            sessions.close(session.id, CloseReason::Normal);
            return;
        }

        if status == HttpStatus::NoContent204 {
            let idle = tokio::time::timeout(config.keepalive_idle, peek_more_data(&mut reader)).await;
            if idle.is_err() {
                sessions.close(session.id, CloseReason::Normal);
                return;
            }
        }

        if sessions.get(session.id).is_none() {
            return;
        }
    }
}

/// Blocks until at least one more byte is buffered, without consuming it;
/// used only to detect "no further request within the idle window" after a
/// `204` on a keep-alive connection.
async fn peek_more_data<R>(reader: &mut BufReader<R>) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    reader.fill_buf().await.map(|_| ())
}

fn handle_one_request(
    req: &ParsedRequest,
    session: &Session,
    sessions: &Arc<SessionManager>,
    dispatcher: &Arc<Dispatcher>,
    events: &EventEmitter,
    config: &HttpHandlerConfig,
) -> Result<(HttpStatus, Vec<u8>), HttpStatus> {
    if req.method != "POST" {
        return Err(HttpStatus::MethodNotAllowed405);
    }
    if req.path != config.admin_path {
        return Err(HttpStatus::NotFound404);
    }
    let content_type_ok = req
        .header("content-type")
        .map(|v| {
            v.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case(gpadmin::CONTENT_TYPE.split(';').next().unwrap())
        })
        .unwrap_or(false);
    if !content_type_ok {
        return Err(HttpStatus::UnsupportedMediaType415);
    }

    let command = gpadmin::decode_single_apdu(&req.body).map_err(|_| HttpStatus::BadRequest400)?;

    let Some(command_bytes) = command else {
        // Bootstrap: an empty body opens the session but carries no
        // exchange of its own (SPEC_FULL.md §9 Open Questions).
        return Ok((HttpStatus::NoContent204, Vec::new()));
    };

    events.emit(Event::ApduReceived(ApduReceived {
        session_id: session.id,
        sequence_number: session.command_count() + 1,
        ins: command_bytes.get(1).copied().unwrap_or(0),
        len: command_bytes.len(),
    }));

    let (response, duration_ms) = dispatcher.dispatch(&command_bytes, session);
    let response_bytes = response.to_bytes();

    let seq = sessions
        .record_exchange(session.id, command_bytes, response_bytes.clone(), response.sw, duration_ms)
        .map_err(|_| HttpStatus::InternalError500)?;

    events.emit(Event::ApduSent(ApduSent {
        session_id: session.id,
        sequence_number: seq,
        status_word: response.sw,
        duration_ms,
    }));

    let body = gpadmin::encode_single_apdu(Some(&response_bytes));
    Ok((HttpStatus::Ok200, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::Dispatcher;
    use crate::tls::cipher::{CipherSuite, TlsProtocolVersion};
    use crate::tls::TlsSessionInfo;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config() -> HttpHandlerConfig {
        HttpHandlerConfig {
            admin_path: "/admin".to_string(),
            socket_timeout: Duration::from_secs(5),
            keepalive_idle: Duration::from_millis(50),
        }
    }

    fn post(path: &str, content_type: Option<&str>, body: &[u8], keep_alive: bool) -> Vec<u8> {
        let mut req = format!("POST {} HTTP/1.1\r\nHost: localhost\r\n", path);
        if let Some(ct) = content_type {
            req.push_str(&format!("Content-Type: {}\r\n", ct));
        }
        req.push_str(&format!("Content-Length: {}\r\n", body.len()));
        req.push_str(&format!("Connection: {}\r\n", if keep_alive { "keep-alive" } else { "close" }));
        req.push_str("\r\n");
        let mut out = req.into_bytes();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn bootstrap_then_one_exchange_over_keep_alive() {
        let (client, server) = tokio::io::duplex(8192);
        let events = EventEmitter::new();
        let sessions = Arc::new(SessionManager::new(events.clone(), Duration::from_secs(300), 16));
        let session = sessions.create(TlsSessionInfo {
            identity: "UICC_001".into(),
            cipher: CipherSuite::Aes128CbcSha256,
            negotiated_protocol_version: TlsProtocolVersion::Tls12,
            handshake_duration_ms: 1,
            peer_address: "127.0.0.1:1".parse().unwrap(),
            is_null_cipher: false,
        });
        let session_id = session.id;
        let dispatcher = Arc::new(Dispatcher::with_default_handlers());
        let errors = ErrorHandler::new(
            events.clone(),
            sessions.clone(),
            crate::diagnostics::ErrorHandlerConfig::default(),
        );

        let serve = tokio::spawn(serve_session(
            server,
            session,
            sessions.clone(),
            dispatcher,
            events,
            errors,
            test_config(),
        ));

        let mut client = client;
        // Bootstrap: empty body.
        client.write_all(&post("/admin", Some(gpadmin::CONTENT_TYPE), &[], true)).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("HTTP/1.1 204"));

        // One real exchange: SELECT with a 5-byte AID.
        let command = vec![0x00, 0xA4, 0x04, 0x00, 0x05, 0xA0, 0x00, 0x00, 0x00, 0x03];
        let envelope = gpadmin::encode_single_apdu(Some(&command));
        client
            .write_all(&post("/admin", Some(gpadmin::CONTENT_TYPE), &envelope, false))
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("HTTP/1.1 200"));

        serve.await.unwrap();
        assert_eq!(sessions.get(session_id).map(|s| s.command_count()), None);
    }

    #[tokio::test]
    async fn malformed_framing_gets_a_400_response_before_the_connection_closes() {
        let (client, server) = tokio::io::duplex(8192);
        let events = EventEmitter::new();
        let sessions = Arc::new(SessionManager::new(events.clone(), Duration::from_secs(300), 16));
        let session = sessions.create(TlsSessionInfo {
            identity: "UICC_001".into(),
            cipher: CipherSuite::Aes128CbcSha256,
            negotiated_protocol_version: TlsProtocolVersion::Tls12,
            handshake_duration_ms: 1,
            peer_address: "127.0.0.1:1".parse().unwrap(),
            is_null_cipher: false,
        });
        let dispatcher = Arc::new(Dispatcher::with_default_handlers());
        let errors = ErrorHandler::new(
            events.clone(),
            sessions.clone(),
            crate::diagnostics::ErrorHandlerConfig::default(),
        );

        let serve = tokio::spawn(serve_session(
            server,
            session,
            sessions.clone(),
            dispatcher,
            events,
            errors,
            test_config(),
        ));

        let mut client = client;
        // A Content-Length that doesn't parse as a number is malformed framing.
        client
            .write_all(b"POST /admin HTTP/1.1\r\nHost: localhost\r\nContent-Length: not-a-number\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("HTTP/1.1 400"));

        serve.await.unwrap();
    }

    #[test]
    fn wrong_method_is_rejected() {
        let req = ParsedRequest {
            method: "GET".to_string(),
            path: "/admin".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        let events = EventEmitter::new();
        let sessions = Arc::new(SessionManager::new(events.clone(), Duration::from_secs(300), 16));
        let session = sessions.create(TlsSessionInfo {
            identity: "UICC_001".into(),
            cipher: CipherSuite::Aes128CbcSha256,
            negotiated_protocol_version: TlsProtocolVersion::Tls12,
            handshake_duration_ms: 1,
            peer_address: "127.0.0.1:1".parse().unwrap(),
            is_null_cipher: false,
        });
        let dispatcher = Arc::new(Dispatcher::with_default_handlers());
        let result = handle_one_request(&req, &session, &sessions, &dispatcher, &events, &test_config());
        assert_eq!(result, Err(HttpStatus::MethodNotAllowed405));
    }
}
