//! GP Admin TLV envelope (`spec.md` §4.4 "Body semantics").
//!
//! The wire format is a single BER-TLV: tag `0x53` ("Remote APDU"), a
//! short- or long-form length, and the raw command/response APDU bytes as
//! the value. A request body may carry zero such TLVs (the bootstrap case)
//! or exactly one; a body with more than one is rejected with `400` rather
//! than silently processing only the first (`SPEC_FULL.md` §9, multi-APDU
//! bodies are out of scope for this server).

pub const CONTENT_TYPE: &str = "application/vnd.globalplatform.card-content-mgt;version=1.0";

const APDU_TAG: u8 = 0x53;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GpAdminError {
    #[error("truncated TLV: expected {expected} more byte(s)")]
    Truncated { expected: usize },
    #[error("unexpected tag {0:#04x}, expected 0x53")]
    UnexpectedTag(u8),
    #[error("request body carries more than one APDU TLV")]
    MultipleApdus,
}

/// Decodes a request body into at most one APDU. `Ok(None)` is the bootstrap
/// (empty-body) case; `Ok(Some(_))` is the normal one-APDU case.
pub fn decode_single_apdu(body: &[u8]) -> Result<Option<Vec<u8>>, GpAdminError> {
    if body.is_empty() {
        return Ok(None);
    }
    let (apdu, consumed) = decode_one_tlv(body)?;
    if consumed != body.len() {
        return Err(GpAdminError::MultipleApdus);
    }
    Ok(Some(apdu))
}

fn decode_one_tlv(buf: &[u8]) -> Result<(Vec<u8>, usize), GpAdminError> {
    if buf.is_empty() {
        return Err(GpAdminError::Truncated { expected: 1 });
    }
    let tag = buf[0];
    if tag != APDU_TAG {
        return Err(GpAdminError::UnexpectedTag(tag));
    }
    if buf.len() < 2 {
        return Err(GpAdminError::Truncated { expected: 1 });
    }
    let (len, header_len) = decode_ber_length(&buf[1..])?;
    let header_len = header_len + 1;
    let total = header_len + len;
    if buf.len() < total {
        return Err(GpAdminError::Truncated {
            expected: total - buf.len(),
        });
    }
    Ok((buf[header_len..total].to_vec(), total))
}

/// BER short form (`< 0x80`) or long form (`0x81 len8` / `0x82 len16`).
/// Sufficient for APDUs, which never approach the 16-bit length ceiling.
fn decode_ber_length(buf: &[u8]) -> Result<(usize, usize), GpAdminError> {
    if buf.is_empty() {
        return Err(GpAdminError::Truncated { expected: 1 });
    }
    let first = buf[0];
    if first < 0x80 {
        return Ok((first as usize, 1));
    }
    let extra_bytes = (first & 0x7f) as usize;
    if extra_bytes == 0 || extra_bytes > 2 {
        return Err(GpAdminError::UnexpectedTag(first));
    }
    if buf.len() < 1 + extra_bytes {
        return Err(GpAdminError::Truncated {
            expected: 1 + extra_bytes - buf.len(),
        });
    }
    let mut len = 0usize;
    for &b in &buf[1..1 + extra_bytes] {
        len = (len << 8) | b as usize;
    }
    Ok((len, 1 + extra_bytes))
}

fn encode_ber_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push((len & 0xff) as u8);
    }
}

/// Encodes a single APDU as one TLV. `None` encodes to an empty body (the
/// HTTP layer turns that into `204 No Content`).
pub fn encode_single_apdu(apdu: Option<&[u8]>) -> Vec<u8> {
    let Some(apdu) = apdu else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(apdu.len() + 4);
    out.push(APDU_TAG);
    encode_ber_length(apdu.len(), &mut out);
    out.extend_from_slice(apdu);
    out
}
