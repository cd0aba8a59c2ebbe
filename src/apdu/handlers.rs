//! Built-in GP Amendment B handlers. Test-grade: each returns a plausible,
//! spec-shaped response sufficient for end-to-end UICC testing, not a full
//! GlobalPlatform Card Specification implementation (`spec.md` §4.5).

use super::{CommandApdu, ResponseApdu, SW_OK};
use crate::session::Session;

/// `SELECT (A4)` — acknowledges selection of the referenced AID/object with
/// a minimal FCI template.
pub fn select(apdu: &CommandApdu, _session: &Session) -> ResponseApdu {
    if apdu.data.is_empty() {
        return ResponseApdu::status_only(0x6A82); // file/application not found
    }
    let mut fci = vec![0x6F, (apdu.data.len() + 2) as u8, 0x84, apdu.data.len() as u8];
    fci.extend_from_slice(&apdu.data);
    ResponseApdu { data: fci, sw: SW_OK }
}

/// `INSTALL (E6)` — acknowledges an install step; no load-file state is
/// actually tracked.
pub fn install(_apdu: &CommandApdu, _session: &Session) -> ResponseApdu {
    ResponseApdu::status_only(SW_OK)
}

/// `DELETE (E4)` — acknowledges deletion of the referenced object.
pub fn delete(_apdu: &CommandApdu, _session: &Session) -> ResponseApdu {
    ResponseApdu::status_only(SW_OK)
}

/// `GET STATUS (F2)` — returns a single synthetic GP registry entry so test
/// tooling has something to assert against.
pub fn get_status(_apdu: &CommandApdu, session: &Session) -> ResponseApdu {
    let mut data = session.tls.identity.as_bytes().to_vec();
    data.truncate(16);
    ResponseApdu { data, sw: SW_OK }
}

/// `GET DATA (CA)` — returns the requested tag echoed back with a fixed
/// placeholder value; real card data objects are out of scope.
pub fn get_data(apdu: &CommandApdu, _session: &Session) -> ResponseApdu {
    let tag = [apdu.p1, apdu.p2];
    let mut data = tag.to_vec();
    data.extend_from_slice(b"\x00\x00\x00\x00");
    ResponseApdu { data, sw: SW_OK }
}

/// `INITIALIZE UPDATE (50)` — returns a synthetic key-diversification/card
/// challenge response shaped like SCP02/SCP03's 28-byte reply, enough for a
/// simulator to proceed to `EXTERNAL AUTHENTICATE`.
pub fn initialize_update(apdu: &CommandApdu, session: &Session) -> ResponseApdu {
    if apdu.data.len() != 8 {
        return ResponseApdu::status_only(super::SW_WRONG_LENGTH);
    }
    let mut data = Vec::with_capacity(28);
    data.extend_from_slice(&[0x00; 10]); // key diversification data (synthetic)
    data.extend_from_slice(&[0x02, 0x55]); // key info: version/SCP id (synthetic)
    data.extend_from_slice(&apdu.data); // echo host challenge
    data.extend_from_slice(session.id.as_bytes().get(..8).unwrap_or(&[0u8; 8]));
    ResponseApdu { data, sw: SW_OK }
}

/// `EXTERNAL AUTHENTICATE (82)` — accepts any presented MAC; this server
/// does not perform real SCP02/SCP03 session-key cryptography.
pub fn external_authenticate(_apdu: &CommandApdu, _session: &Session) -> ResponseApdu {
    ResponseApdu::status_only(SW_OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEmitter;
    use crate::session::SessionManager;
    use crate::tls::cipher::{CipherSuite, TlsProtocolVersion};
    use crate::tls::TlsSessionInfo;
    use std::time::Duration;

    fn test_session() -> Session {
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

    #[test]
    fn select_with_empty_aid_is_not_found() {
        let apdu = CommandApdu { cla: 0, ins: 0xA4, p1: 4, p2: 0, data: vec![], le: None };
        assert_eq!(select(&apdu, &test_session()).sw, 0x6A82);
    }

    #[test]
    fn select_with_aid_echoes_it_in_fci() {
        let aid = vec![0xA0, 0x00, 0x00, 0x00, 0x03];
        let apdu = CommandApdu { cla: 0, ins: 0xA4, p1: 4, p2: 0, data: aid.clone(), le: None };
        let resp = select(&apdu, &test_session());
        assert_eq!(resp.sw, SW_OK);
        assert!(resp.data.ends_with(&aid));
    }

    #[test]
    fn initialize_update_rejects_wrong_challenge_length() {
        let apdu = CommandApdu { cla: 0x80, ins: 0x50, p1: 0, p2: 0, data: vec![0; 4], le: None };
        assert_eq!(initialize_update(&apdu, &test_session()).sw, super::super::SW_WRONG_LENGTH);
    }

    #[test]
    fn initialize_update_echoes_host_challenge() {
        let challenge = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let apdu = CommandApdu { cla: 0x80, ins: 0x50, p1: 0, p2: 0, data: challenge.clone(), le: None };
        let resp = initialize_update(&apdu, &test_session());
        assert_eq!(resp.sw, SW_OK);
        assert_eq!(&resp.data[12..20], &challenge[..]);
    }
}
