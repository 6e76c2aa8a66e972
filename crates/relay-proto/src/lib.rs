pub mod codec;
pub mod command;
pub mod error;
pub mod opcode;
pub mod primitives;

pub use codec::FrameCodec;
pub use command::Command;
pub use error::ProtoError;
pub use opcode::MessageType;

pub type ProtoResult<T> = Result<T, ProtoError>;
