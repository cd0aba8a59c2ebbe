//! APDU parsing and dispatch (`spec.md` §4.5 "APDU Dispatcher").

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::session::Session;

pub const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
pub const SW_WRONG_P1P2: u16 = 0x6A86;
pub const SW_WRONG_LENGTH: u16 = 0x6A87;
pub const SW_UNKNOWN_ERROR: u16 = 0x6F00;
pub const SW_OK: u16 = 0x9000;

/// A parsed command APDU (`spec.md` §4.5: `{CLA, INS, P1, P2, Lc?, Data?, Le?}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    pub le: Option<u8>,
}

/// A handler's response: data plus a status word. `sw` is always present;
/// `data` is empty for most status-only responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    pub data: Vec<u8>,
    pub sw: u16,
}

impl ResponseApdu {
    pub fn status_only(sw: u16) -> Self {
        Self { data: Vec::new(), sw }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.push((self.sw >> 8) as u8);
        out.push((self.sw & 0xff) as u8);
        out
    }
}

/// Parses raw command-APDU bytes per ISO 7816-4 case 1-4 rules. A malformed
/// APDU never reaches a handler; the dispatcher turns the parse error
/// directly into a status word (`spec.md` §4.5).
pub fn parse_command(bytes: &[u8]) -> Result<CommandApdu, u16> {
    if bytes.len() < 4 {
        return Err(SW_WRONG_P1P2);
    }
    let cla = bytes[0];
    let ins = bytes[1];
    let p1 = bytes[2];
    let p2 = bytes[3];
    let rest = &bytes[4..];

    // Case 1: header only.
    if rest.is_empty() {
        return Ok(CommandApdu {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        });
    }

    // Case 2: header + Le.
    if rest.len() == 1 {
        return Ok(CommandApdu {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: Some(rest[0]),
        });
    }

    // Case 3/4: header + Lc + Data [+ Le].
    let lc = rest[0] as usize;
    let remaining = &rest[1..];
    if remaining.len() < lc {
        return Err(SW_WRONG_LENGTH);
    }
    let data = remaining[..lc].to_vec();
    let tail = &remaining[lc..];
    let le = match tail.len() {
        0 => None,
        1 => Some(tail[0]),
        _ => return Err(SW_WRONG_LENGTH),
    };
    Ok(CommandApdu { cla, ins, p1, p2, data, le })
}

/// `fn(apdu, session) -> ResponseApdu`. Handlers never see the raw socket or
/// TLS state, only the parsed command and a reference to the owning Session
/// (`spec.md` §4.5 "read-only where possible").
pub trait ApduHandler: Send + Sync {
    fn handle(&self, apdu: &CommandApdu, session: &Session) -> ResponseApdu;
}

impl<F> ApduHandler for F
where
    F: Fn(&CommandApdu, &Session) -> ResponseApdu + Send + Sync,
{
    fn handle(&self, apdu: &CommandApdu, session: &Session) -> ResponseApdu {
        (self)(apdu, session)
    }
}

/// INS-keyed routing table, built once at startup and shared read-only
/// across every connection (`spec.md` §4.5 "Registration is dynamic at startup").
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<u8, Arc<dyn ApduHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ins: u8, handler: Arc<dyn ApduHandler>) {
        self.handlers.insert(ins, handler);
    }

    /// The default GP-surface dispatcher: `SELECT`, `INSTALL`, `DELETE`,
    /// `GET STATUS`, `GET DATA`, `INITIALIZE UPDATE`, `EXTERNAL AUTHENTICATE`.
    pub fn with_default_handlers() -> Self {
        let mut d = Self::new();
        d.register(0xA4, Arc::new(handlers::select));
        d.register(0xE6, Arc::new(handlers::install));
        d.register(0xE4, Arc::new(handlers::delete));
        d.register(0xF2, Arc::new(handlers::get_status));
        d.register(0xCA, Arc::new(handlers::get_data));
        d.register(0x50, Arc::new(handlers::initialize_update));
        d.register(0x82, Arc::new(handlers::external_authenticate));
        d
    }

    /// Parses, routes, and invokes, returning both the response and how long
    /// the handler took (`spec.md` §4.5 "Measures handler duration").
    ///
    /// A handler panic is caught here and turned into `SW_UNKNOWN_ERROR`
    /// rather than propagated, so one broken handler cannot take down the
    /// connection it is serving (`spec.md` §7 "Handler errors").
    pub fn dispatch(&self, command_bytes: &[u8], session: &Session) -> (ResponseApdu, u64) {
        let started = Instant::now();
        let apdu = match parse_command(command_bytes) {
            Ok(apdu) => apdu,
            Err(sw) => return (ResponseApdu::status_only(sw), elapsed_ms(started)),
        };
        let Some(handler) = self.handlers.get(&apdu.ins) else {
            return (ResponseApdu::status_only(SW_INS_NOT_SUPPORTED), elapsed_ms(started));
        };
        let response = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.handle(&apdu, session)
        }))
        .unwrap_or_else(|_| {
            tracing::error!(session_id = %session.id, ins = apdu.ins, "APDU handler panicked");
            ResponseApdu::status_only(SW_UNKNOWN_ERROR)
        });
        (response, elapsed_ms(started))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case1_header_only() {
        let apdu = parse_command(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
        assert_eq!(apdu.data, Vec::<u8>::new());
        assert_eq!(apdu.le, None);
    }

    #[test]
    fn case2_header_plus_le() {
        let apdu = parse_command(&[0x00, 0xCA, 0x00, 0x66, 0x10]).unwrap();
        assert_eq!(apdu.le, Some(0x10));
    }

    #[test]
    fn case3_header_lc_data() {
        let apdu = parse_command(&[0x00, 0xE6, 0x02, 0x00, 0x03, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(apdu.data, vec![0x01, 0x02, 0x03]);
        assert_eq!(apdu.le, None);
    }

    #[test]
    fn case4_header_lc_data_le() {
        let apdu = parse_command(&[0x00, 0xE6, 0x02, 0x00, 0x02, 0xAA, 0xBB, 0x10]).unwrap();
        assert_eq!(apdu.data, vec![0xAA, 0xBB]);
        assert_eq!(apdu.le, Some(0x10));
    }

    #[test]
    fn too_short_is_wrong_p1p2() {
        assert_eq!(parse_command(&[0x00, 0xA4]), Err(SW_WRONG_P1P2));
    }

    #[test]
    fn lc_exceeds_available_data_is_wrong_length() {
        assert_eq!(
            parse_command(&[0x00, 0xE6, 0x00, 0x00, 0x05, 0x01, 0x02]),
            Err(SW_WRONG_LENGTH)
        );
    }

    #[test]
    fn unregistered_ins_returns_ins_not_supported() {
        let dispatcher = Dispatcher::new();
        let session = test_session();
        let (resp, _) = dispatcher.dispatch(&[0x00, 0x99, 0x00, 0x00], &session);
        assert_eq!(resp.sw, SW_INS_NOT_SUPPORTED);
    }

    #[test]
    fn panicking_handler_yields_unknown_error_status() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(0x01, Arc::new(|_: &CommandApdu, _: &Session| -> ResponseApdu {
            panic!("boom")
        }));
        let session = test_session();
        let (resp, _) = dispatcher.dispatch(&[0x00, 0x01, 0x00, 0x00], &session);
        assert_eq!(resp.sw, SW_UNKNOWN_ERROR);
    }

    fn test_session() -> Session {
        use crate::events::EventEmitter;
        use crate::session::SessionManager;
        use crate::tls::cipher::{CipherSuite, TlsProtocolVersion};
        use crate::tls::TlsSessionInfo;
        use std::time::Duration;

        let events = EventEmitter::new();
        let mgr = SessionManager::new(events, Duration::from_secs(300), 16);
        mgr.create(TlsSessionInfo {
            identity: "UICC_001".into(),
            cipher: CipherSuite::Aes128CbcSha256,
            negotiated_protocol_version: TlsProtocolVersion::Tls12,
            handshake_duration_ms: 1,
            peer_address: "127.0.0.1:1".parse().unwrap(),
            is_null_cipher: false,
        })
    }
}
