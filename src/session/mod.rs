//! Session ownership and lifecycle (`spec.md` §3 "Session", §4.3 "Session Manager").

pub mod state;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::events::{Event, EventEmitter, SessionEnded};
use crate::tls::cipher::CipherSuite;
use crate::tls::TlsSessionInfo;
pub use state::SessionState;

/// `closeReason ∈ {NORMAL, TIMEOUT, ERROR, CLIENT_DISCONNECT}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Normal,
    Timeout,
    Error,
    ClientDisconnect,
}

/// Immutable record of one command/response round-trip (`spec.md` §3 "APDUExchange").
#[derive(Debug, Clone)]
pub struct ApduExchange {
    pub sequence_number: u64,
    pub command_bytes: Vec<u8>,
    pub response_bytes: Vec<u8>,
    pub status_word: u16,
    pub timestamp: Instant,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is not ACTIVE (state={0:?})")]
    NotActive(SessionState),
    #[error(transparent)]
    InvalidTransition(#[from] state::InvalidTransition),
    #[error("session already closed")]
    AlreadyClosed,
}

struct SessionData {
    state: SessionState,
    created_at: Instant,
    last_activity_at: Instant,
    closed_at: Option<Instant>,
    command_count: u64,
    apdu_history: VecDeque<ApduExchange>,
    close_reason: Option<CloseReason>,
}

/// One per accepted+authenticated connection. Cheap to clone (`Arc` inside);
/// every clone refers to the same underlying session.
///
/// All mutable fields live behind a single lock (unlike the ordinary pattern
/// of one lock per field) because `spec.md` §4.3 "Ordering" requires that
/// `commandCount` and `apduHistory.length` never be observed to diverge —
/// that's only guaranteed if both are updated under one critical section.
#[derive(Clone)]
pub struct Session {
    pub id: Uuid,
    pub tls: TlsSessionInfo,
    data: std::sync::Arc<Mutex<SessionData>>,
    max_history: usize,
}

impl Session {
    fn new(tls: TlsSessionInfo, max_history: usize) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            tls,
            data: std::sync::Arc::new(Mutex::new(SessionData {
                state: SessionState::Connected,
                created_at: now,
                last_activity_at: now,
                closed_at: None,
                command_count: 0,
                apdu_history: VecDeque::new(),
                close_reason: None,
            })),
            max_history,
        }
    }

    pub fn state(&self) -> SessionState {
        self.data.lock().state
    }

    pub fn created_at(&self) -> Instant {
        self.data.lock().created_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.data.lock().last_activity_at
    }

    pub fn command_count(&self) -> u64 {
        self.data.lock().command_count
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.data.lock().close_reason
    }

    pub fn history(&self) -> Vec<ApduExchange> {
        self.data.lock().apdu_history.iter().cloned().collect()
    }

    /// Records one APDU exchange. Transitions CONNECTED -> ACTIVE on the
    /// first call (`spec.md` §4.3 "RecordExchange"). Rejects the call when
    /// the session is CLOSED or still HANDSHAKING.
    fn record_exchange(
        &self,
        command: Vec<u8>,
        response: Vec<u8>,
        sw: u16,
        duration_ms: u64,
    ) -> Result<u64, SessionError> {
        let mut guard = self.data.lock();
        match guard.state {
            SessionState::Connected => {
                guard.state = guard.state.transition(SessionState::Active)?;
            }
            SessionState::Active => {}
            other => return Err(SessionError::NotActive(other)),
        }
        guard.command_count += 1;
        let seq = guard.command_count;
        let now = Instant::now();
        guard.last_activity_at = now;
        guard.apdu_history.push_back(ApduExchange {
            sequence_number: seq,
            command_bytes: command,
            response_bytes: response,
            status_word: sw,
            timestamp: now,
            duration_ms,
        });
        let max_history = self.max_history;
        while guard.apdu_history.len() > max_history {
            guard.apdu_history.pop_front();
        }
        Ok(seq)
    }

    fn touch(&self) {
        self.data.lock().last_activity_at = Instant::now();
    }

    fn close(&self, reason: CloseReason) -> Result<(), SessionError> {
        let mut guard = self.data.lock();
        if guard.state == SessionState::Closed {
            return Err(SessionError::AlreadyClosed);
        }
        guard.state = guard.state.transition(SessionState::Closed)?;
        guard.closed_at = Some(Instant::now());
        guard.close_reason = Some(reason);
        Ok(())
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.data.lock().last_activity_at)
    }

    fn closed_at(&self) -> Option<Instant> {
        self.data.lock().closed_at
    }
}

/// Owns all live `Session`s, keyed by id (`spec.md` §4.3).
pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, Session>>,
    events: EventEmitter,
    session_timeout: Duration,
    max_history: usize,
}

impl SessionManager {
    pub fn new(events: EventEmitter, session_timeout: Duration, max_history: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            events,
            session_timeout,
            max_history,
        }
    }

    /// Allocates a new session id, state HANDSHAKING -> CONNECTED on return
    /// (the handshake has already succeeded by the time this is called; the
    /// HANDSHAKING state describes the in-flight period the TLS Handler
    /// tracks before a `Session` object exists at all).
    pub fn create(&self, tls: TlsSessionInfo) -> Session {
        let session = Session::new(tls, self.max_history);
        self.sessions.lock().insert(session.id, session.clone());
        session
    }

    pub fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn record_exchange(
        &self,
        id: Uuid,
        command: Vec<u8>,
        response: Vec<u8>,
        sw: u16,
        duration_ms: u64,
    ) -> Result<u64, SessionError> {
        let session = self.get(id).ok_or(SessionError::AlreadyClosed)?;
        session.record_exchange(command, response, sw, duration_ms)
    }

    pub fn touch(&self, id: Uuid) {
        if let Some(session) = self.get(id) {
            session.touch();
        }
    }

    /// Closes the session and removes it from the live set, emitting exactly
    /// one `session_ended` (`spec.md` §4.3 "Close", §8 "Closing an
    /// already-closed session is a no-op and emits no duplicate session_ended").
    pub fn close(&self, id: Uuid, reason: CloseReason) {
        let session = self.sessions.lock().remove(&id);
        let Some(session) = session else { return };
        if session.close(reason).is_err() {
            // Already closed by someone else (e.g. a racing sweep and an
            // explicit close): no duplicate event.
            return;
        }
        let duration_ms = session
            .closed_at()
            .unwrap()
            .saturating_duration_since(session.created_at())
            .as_millis() as u64;
        self.events.emit(Event::SessionEnded(SessionEnded {
            session_id: session.id,
            duration_ms,
            command_count: session.command_count(),
            reason,
            cipher: session.tls.cipher,
            is_null_cipher: session.tls.is_null_cipher,
        }));
    }

    pub fn active_sessions(&self) -> Vec<Session> {
        self.sessions.lock().values().cloned().collect()
    }

    /// One expiration sweep: closes every live session idle longer than the
    /// configured timeout (`spec.md` §4.3 "Expiration sweeper").
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.state().is_live() && s.idle_for(now) > self.session_timeout)
            .map(|s| s.id)
            .collect();
        for id in expired {
            self.close(id, CloseReason::Timeout);
        }
    }

    /// Spawns the background sweeper task; returns a handle the caller can
    /// abort on shutdown.
    pub fn spawn_sweeper(self: &std::sync::Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                manager.sweep_expired();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cipher::TlsProtocolVersion;

    fn make_tls() -> TlsSessionInfo {
        TlsSessionInfo {
            identity: "UICC_001".to_string(),
            cipher: CipherSuite::Aes128CbcSha256,
            negotiated_protocol_version: TlsProtocolVersion::Tls12,
            handshake_duration_ms: 5,
            peer_address: "127.0.0.1:1".parse().unwrap(),
            is_null_cipher: false,
        }
    }

    #[test]
    fn create_starts_connected() {
        let events = EventEmitter::new();
        let mgr = SessionManager::new(events, Duration::from_secs(300), 16);
        let s = mgr.create(make_tls());
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[test]
    fn first_exchange_transitions_to_active() {
        let events = EventEmitter::new();
        let mgr = SessionManager::new(events, Duration::from_secs(300), 16);
        let s = mgr.create(make_tls());
        mgr.record_exchange(s.id, vec![0x00, 0xA4], vec![0x90, 0x00], 0x9000, 1)
            .unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.command_count(), 1);
        assert_eq!(s.history().len(), 1);
    }

    #[test]
    fn command_count_and_history_len_never_diverge() {
        let events = EventEmitter::new();
        let mgr = SessionManager::new(events, Duration::from_secs(300), 2);
        let s = mgr.create(make_tls());
        for _ in 0..5 {
            mgr.record_exchange(s.id, vec![0], vec![0x90, 0x00], 0x9000, 1)
                .unwrap();
        }
        // history is capped at 2, but commandCount keeps counting every exchange.
        assert_eq!(s.command_count(), 5);
        assert_eq!(s.history().len(), 2);
    }

    #[test]
    fn close_emits_exactly_one_session_ended() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let events = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        events.subscribe(crate::events::EventKind::SessionEnded, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let mgr = SessionManager::new(events, Duration::from_secs(300), 16);
        let s = mgr.create(make_tls());
        mgr.close(s.id, CloseReason::Normal);
        mgr.close(s.id, CloseReason::Normal); // no-op, already removed
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_session_rejects_further_exchanges() {
        let events = EventEmitter::new();
        let mgr = SessionManager::new(events, Duration::from_secs(300), 16);
        let s = mgr.create(make_tls());
        mgr.close(s.id, CloseReason::Normal);
        let err = s.record_exchange(vec![0], vec![0x90, 0x00], 0x9000, 1);
        assert!(err.is_err());
    }

    #[test]
    fn sweep_closes_only_past_timeout_not_at_boundary() {
        let events = EventEmitter::new();
        let mgr = SessionManager::new(events, Duration::from_millis(20), 16);
        let s = mgr.create(make_tls());
        std::thread::sleep(Duration::from_millis(5));
        mgr.sweep_expired();
        assert!(mgr.get(s.id).is_some(), "should not expire before timeout");
        std::thread::sleep(Duration::from_millis(30));
        mgr.sweep_expired();
        assert!(mgr.get(s.id).is_none(), "should expire once idle exceeds timeout");
    }
}
