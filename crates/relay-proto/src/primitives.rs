//! Encode/decode helpers for the primitive value types command payloads are
//! built from: length-prefixed strings, single-byte booleans, and
//! length-prefixed JSON documents.

use bytes::{Buf, BufMut};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::ProtoError;
use crate::ProtoResult;

/// Strings longer than this are rejected rather than silently truncated.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

pub fn encode_string(buf: &mut impl BufMut, s: &str) -> ProtoResult<()> {
    let bytes = s.as_bytes();
    if bytes.len() > MAX_STRING_LEN {
        return Err(ProtoError::StringTooLong(bytes.len(), MAX_STRING_LEN));
    }
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

pub fn decode_string(buf: &mut impl Buf) -> ProtoResult<String> {
    if buf.remaining() < 2 {
        return Err(ProtoError::Truncated(2));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ProtoError::Truncated(len));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(std::str::from_utf8(&raw)?.to_string())
}

pub fn encode_bool(buf: &mut impl BufMut, b: bool) {
    buf.put_u8(b as u8);
}

pub fn decode_bool(buf: &mut impl Buf) -> ProtoResult<bool> {
    if buf.remaining() < 1 {
        return Err(ProtoError::Truncated(1));
    }
    Ok(buf.get_u8() != 0)
}

pub fn encode_json<T: Serialize>(buf: &mut impl BufMut, value: &T) -> ProtoResult<()> {
    let raw = serde_json::to_vec(value)?;
    if raw.len() > u32::MAX as usize {
        return Err(ProtoError::FrameTooLarge(raw.len()));
    }
    buf.put_u32(raw.len() as u32);
    buf.put_slice(&raw);
    Ok(())
}

pub fn decode_json<T: DeserializeOwned>(buf: &mut impl Buf) -> ProtoResult<T> {
    if buf.remaining() < 4 {
        return Err(ProtoError::Truncated(4));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ProtoError::Truncated(len));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use quickcheck::quickcheck;

    quickcheck! {
        fn string_round_trips(s: String) -> bool {
            let mut buf = BytesMut::new();
            if encode_string(&mut buf, &s).is_err() {
                return true;
            }
            let mut frozen = buf.freeze();
            decode_string(&mut frozen).unwrap() == s
        }

        fn bool_round_trips(b: bool) -> bool {
            let mut buf = BytesMut::new();
            encode_bool(&mut buf, b);
            let mut frozen = buf.freeze();
            decode_bool(&mut frozen).unwrap() == b
        }
    }

    #[test]
    fn json_round_trips() {
        let mut buf = BytesMut::new();
        let value = serde_json::json!({"a": 1, "b": "two"});
        encode_json(&mut buf, &value).unwrap();
        let mut frozen = buf.freeze();
        let decoded: Value = decode_json(&mut frozen).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn truncated_string_errors() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 5, b'h', b'i']);
        let mut frozen = buf.freeze();
        assert!(decode_string(&mut frozen).is_err());
    }
}
