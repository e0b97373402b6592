//!
//! Wire format, fixed little-endian:
//!
//! ```text
//! request:  [ type: u8 ][ key_size: u64 ][ val_size: u64 ][ key ][ value ]
//! response: [ status: i32 ][ payload_size: u64 ][ payload ]
//! ```
//!
//! Payload is present only in PUT requests (the value) and successful GET
//! responses.
//!

use fragstore_core::common::{fail, OpResult, RawBytes, StatusCode};

pub const REQ_HDR_SIZE: usize = 1 + 8 + 8;
pub const RESP_HDR_SIZE: usize = 4 + 8;

/// Largest key+value a peer may send; anything bigger is a framing error.
pub const MAX_MSG_SIZE: usize = 64 << 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestType {
    Get = 2,
    Put = 3,
    Remove = 4,
}

impl RequestType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            2 => Some(RequestType::Get),
            3 => Some(RequestType::Put),
            4 => Some(RequestType::Remove),
            _ => None,
        }
    }
}

pub fn encode_request(ty: RequestType, key: &[u8], value: &[u8]) -> RawBytes {
    let mut msg = Vec::with_capacity(REQ_HDR_SIZE + key.len() + value.len());
    msg.push(ty as u8);
    msg.extend_from_slice(&(key.len() as u64).to_le_bytes());
    msg.extend_from_slice(&(value.len() as u64).to_le_bytes());
    msg.extend_from_slice(key);
    msg.extend_from_slice(value);
    msg
}

pub fn encode_response(status: StatusCode, payload: &[u8]) -> RawBytes {
    let mut msg = Vec::with_capacity(RESP_HDR_SIZE + payload.len());
    msg.extend_from_slice(&status.to_wire().to_le_bytes());
    msg.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    msg.extend_from_slice(payload);
    msg
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

/// Try to peel one complete request off the front of a receive buffer.
/// Returns the parsed message and the number of bytes it occupied.
pub fn try_parse_request(
    buf: &[u8],
) -> OpResult<Option<(RequestType, RawBytes, RawBytes, usize)>> {
    if buf.len() < REQ_HDR_SIZE {
        return Ok(None);
    }
    let Some(ty) = RequestType::from_u8(buf[0]) else {
        return fail(StatusCode::NotSupported);
    };
    let key_size = read_u64(buf, 1) as usize;
    let val_size = read_u64(buf, 9) as usize;
    if key_size + val_size > MAX_MSG_SIZE {
        return fail(StatusCode::NotSupported);
    }
    let total = REQ_HDR_SIZE + key_size + val_size;
    if buf.len() < total {
        return Ok(None);
    }
    let key = buf[REQ_HDR_SIZE..REQ_HDR_SIZE + key_size].to_vec();
    let value = buf[REQ_HDR_SIZE + key_size..total].to_vec();
    Ok(Some((ty, key, value, total)))
}

/// Same, for the response side of a session.
pub fn try_parse_response(
    buf: &[u8],
) -> OpResult<Option<(StatusCode, RawBytes, usize)>> {
    if buf.len() < RESP_HDR_SIZE {
        return Ok(None);
    }
    let status =
        StatusCode::from_wire(i32::from_le_bytes(buf[..4].try_into().unwrap()));
    let payload_size = read_u64(buf, 4) as usize;
    if payload_size > MAX_MSG_SIZE {
        return fail(StatusCode::NotSupported);
    }
    let total = RESP_HDR_SIZE + payload_size;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((status, buf[RESP_HDR_SIZE..total].to_vec(), total)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let msg = encode_request(RequestType::Put, b"key-0123", b"payload");
        let (ty, key, value, used) =
            try_parse_request(&msg).unwrap().unwrap();
        assert_eq!(ty, RequestType::Put);
        assert_eq!(key, b"key-0123");
        assert_eq!(value, b"payload");
        assert_eq!(used, msg.len());

        // a short read parses to "not yet"
        assert!(try_parse_request(&msg[..5]).unwrap().is_none());
        assert!(try_parse_request(&msg[..msg.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn response_roundtrip() {
        let msg = encode_response(StatusCode::KeyNotFound, &[]);
        let (status, payload, used) =
            try_parse_response(&msg).unwrap().unwrap();
        assert_eq!(status, StatusCode::KeyNotFound);
        assert!(payload.is_empty());
        assert_eq!(used, RESP_HDR_SIZE);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut msg = encode_request(RequestType::Get, b"k", b"");
        msg[0] = 9;
        assert!(try_parse_request(&msg).is_err());
    }

    #[test]
    fn request_types_match_the_wire_contract() {
        assert_eq!(RequestType::Get as u8, 2);
        assert_eq!(RequestType::Put as u8, 3);
        assert_eq!(RequestType::Remove as u8, 4);
    }
}
