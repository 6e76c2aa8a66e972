use bytes::Bytes;

use crate::{codec::HEADER_LEN, opcode::MessageType};

/// A single framed application message: a numeric type tag plus an opaque
/// payload. Commands are immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    ty: u16,
    data: Bytes,
}

impl Command {
    pub fn new(ty: u16, data: impl Into<Bytes>) -> Self {
        Self {
            ty,
            data: data.into(),
        }
    }

    pub fn control(ty: MessageType, data: impl Into<Bytes>) -> Self {
        Self::new(ty.into(), data)
    }

    pub fn ty(&self) -> u16 {
        self.ty
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// `None` if this command's type is an application-defined room-scoped
    /// command rather than one of the control types the core recognizes.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.ty).ok()
    }

    /// On-wire length of the whole framed message, header included.
    pub fn byte_size(&self) -> usize {
        HEADER_LEN + self.data.len()
    }
}
