use std::io;

use relay_proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO")]
    Io(#[from] io::Error),
    #[error("protocol")]
    Proto(#[from] ProtoError),
    #[error("connection disconnected")]
    Disconnected,
    #[error("room {0} does not exist")]
    RoomNotFound(String),
    #[error("room {0} is not empty")]
    RoomNotEmpty(String),
    #[error("room {0} has a join in progress")]
    RoomJoining(String),
}
