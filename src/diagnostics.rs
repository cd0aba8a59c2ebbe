//! Error Handler: a shared sink for session-fatal, non-fatal-to-process
//! conditions (`spec.md` §4.6).

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::events::{
    ConnectionInterrupted, Event, EventEmitter, HandshakeInterrupted, HighErrorRate, PskMismatch,
};
use crate::session::{CloseReason, SessionManager};

/// A time-stamped count pruned to a trailing window on every access. Shared
/// shape for both the per-peer mismatch tracker and the per-kind error-rate
/// tracker (`spec.md` §4.6 "the rate tracker may use the same data structure").
#[derive(Default)]
struct SlidingWindow {
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    fn record(&mut self, now: Instant, window: Duration) -> usize {
        self.hits.push_back(now);
        self.prune(now, window);
        self.hits.len()
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&front) = self.hits.front() {
            if now.saturating_duration_since(front) > window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate_per_sec(&self, now: Instant, window: Duration) -> f64 {
        let count = self.hits.iter().filter(|t| now.saturating_duration_since(**t) <= window).count();
        count as f64 / window.as_secs_f64().max(1.0)
    }
}

pub struct ErrorHandlerConfig {
    pub mismatch_threshold: u32,
    pub mismatch_window: Duration,
    pub error_rate_thresholds: HashMap<String, f64>,
    pub error_rate_window: Duration,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            mismatch_threshold: 3,
            mismatch_window: Duration::from_secs(60),
            error_rate_thresholds: HashMap::new(),
            error_rate_window: Duration::from_secs(60),
        }
    }
}

/// Implements the four operations of `spec.md` §4.6. Cheap to clone; shares
/// its trackers and its `EventEmitter`/`SessionManager` handles.
#[derive(Clone)]
pub struct ErrorHandler {
    events: EventEmitter,
    sessions: Arc<SessionManager>,
    mismatch_windows: Arc<Mutex<HashMap<IpAddr, SlidingWindow>>>,
    rate_windows: Arc<Mutex<HashMap<String, SlidingWindow>>>,
    config: Arc<ErrorHandlerConfig>,
}

impl ErrorHandler {
    pub fn new(events: EventEmitter, sessions: Arc<SessionManager>, config: ErrorHandlerConfig) -> Self {
        Self {
            events,
            sessions,
            mismatch_windows: Arc::new(Mutex::new(HashMap::new())),
            rate_windows: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    /// `spec.md` §4.6 `OnConnectionInterrupted`. Closes the session with
    /// `ERROR` and emits `connection_interrupted`; also feeds the per-kind
    /// error-rate tracker so a burst of interruptions can trip `high_error_rate`.
    pub fn on_connection_interrupted(
        &self,
        session_id: Option<Uuid>,
        peer_addr: Option<SocketAddr>,
        last_command_bytes_len: Option<usize>,
    ) {
        if let Some(id) = session_id {
            self.sessions.close(id, CloseReason::Error);
        }
        self.events.emit(Event::ConnectionInterrupted(ConnectionInterrupted {
            session_id,
            peer_addr,
            last_command_bytes_len,
        }));
        self.check_error_rate("connection_interrupted");
    }

    /// `spec.md` §4.6 `OnPSKMismatch`. `identity_exists` distinguishes a
    /// genuine MAC mismatch from an unknown identity; only the former is a
    /// `psk_mismatch` diagnostic (the caller is responsible for routing an
    /// unknown identity to `TlsHandshakeComplete` instead, per `spec.md` §4.2).
    pub fn on_psk_mismatch(&self, identity: &str, peer_addr: SocketAddr, identity_exists: bool) {
        if !identity_exists {
            return;
        }
        self.events.emit(Event::PskMismatch(PskMismatch {
            identity: identity.to_string(),
            peer_addr,
        }));
        let now = Instant::now();
        let count = {
            let mut windows = self.mismatch_windows.lock();
            windows
                .entry(peer_addr.ip())
                .or_default()
                .record(now, self.config.mismatch_window)
        };
        if count as u32 >= self.config.mismatch_threshold {
            tracing::warn!(
                %peer_addr,
                identity,
                count,
                threshold = self.config.mismatch_threshold,
                "PSK mismatch rate exceeds threshold: probable misconfiguration or attack"
            );
        }
        self.check_error_rate("psk_mismatch");
    }

    /// `spec.md` §4.6 `OnHandshakeInterrupted`.
    pub fn on_handshake_interrupted(&self, peer_addr: SocketAddr, partial_state: &str, reason: &str) {
        let likely_network_issue = partial_state == "CLIENT_HELLO_ONLY";
        self.events.emit(Event::HandshakeInterrupted(HandshakeInterrupted {
            peer_addr,
            partial_state: partial_state.to_string(),
            reason: reason.to_string(),
            likely_network_issue,
        }));
        self.check_error_rate("handshake_interrupted");
    }

    /// `spec.md` §4.6 `CheckErrorRate`. Emits `high_error_rate` when the
    /// configured threshold for `kind` is both present and exceeded; kinds
    /// with no configured threshold are tracked but never trip the alarm.
    pub fn check_error_rate(&self, kind: &str) {
        let Some(&threshold) = self.config.error_rate_thresholds.get(kind) else {
            return;
        };
        let now = Instant::now();
        let observed_rate = {
            let mut windows = self.rate_windows.lock();
            let window = windows.entry(kind.to_string()).or_default();
            window.record(now, self.config.error_rate_window);
            window.rate_per_sec(now, self.config.error_rate_window)
        };
        if observed_rate > threshold {
            self.events.emit(Event::HighErrorRate(HighErrorRate {
                kind: kind.to_string(),
                observed_rate,
                threshold,
            }));
        }
    }
}
