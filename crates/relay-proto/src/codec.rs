use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{command::Command, error::ProtoError};

/// Maximum payload size a single frame may carry, guarding against a
/// corrupt or hostile length prefix driving an unbounded allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// `u32` payload length (type tag + data) followed by a `u16` type tag.
const LEN_FIELD: usize = 4;
const TYPE_FIELD: usize = 2;
pub const HEADER_LEN: usize = LEN_FIELD + TYPE_FIELD;

fn check_len(len: usize) -> Result<(), ProtoError> {
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }
    Ok(())
}

/// Length-prefixed framing for [`Command`]: no encryption, no handshake,
/// just `[u32 len][u16 type][data]`.
#[derive(Debug, Default)]
pub struct FrameCodec {
    next_len: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Command;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let body_len = match self.next_len {
            Some(len) => len,
            None => {
                if src.len() < LEN_FIELD {
                    return Ok(None);
                }
                let len = u32::from_be_bytes(src[..LEN_FIELD].try_into().unwrap()) as usize;
                check_len(len)?;
                src.advance(LEN_FIELD);
                self.next_len = Some(len);
                len
            }
        };

        if body_len < TYPE_FIELD {
            return Err(ProtoError::Truncated(TYPE_FIELD));
        }

        if src.len() < body_len {
            src.reserve(body_len - src.len());
            return Ok(None);
        }

        let mut body = src.split_to(body_len);
        self.next_len = None;

        let ty = body.get_u16();
        let data = body.freeze();
        Ok(Some(Command::new(ty, data)))
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = TYPE_FIELD + item.data().len();
        check_len(body_len)?;

        dst.reserve(LEN_FIELD + body_len);
        dst.put_u32(body_len as u32);
        dst.put_u16(item.ty());
        dst.put_slice(item.data());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::MessageType;

    #[test]
    fn encode_then_decode_yields_same_command() {
        let mut codec = FrameCodec::new();
        let cmd = Command::control(MessageType::JoinRoom, &b"room-a"[..]);

        let mut buf = BytesMut::new();
        codec.encode(cmd.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("full frame");
        assert_eq!(decoded, cmd);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut codec = FrameCodec::new();
        let cmd = Command::control(MessageType::LeaveRoom, &b"room-a"[..]);

        let mut buf = BytesMut::new();
        codec.encode(cmd, &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn byte_size_matches_encoded_length() {
        let cmd = Command::control(MessageType::Content, &b"hello"[..]);
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(cmd.clone(), &mut buf).unwrap();
        assert_eq!(cmd.byte_size(), buf.len());
    }
}
