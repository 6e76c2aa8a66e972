use std::{io, str::Utf8Error};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("IO")]
    Io(#[from] io::Error),
    #[error("string utf8 error")]
    StringUtf8(#[from] Utf8Error),
    #[error("string of length {0} exceeds limit {1}")]
    StringTooLong(usize, usize),
    #[error("frame of length {0} is too large")]
    FrameTooLarge(usize),
    #[error("json")]
    Json(#[from] serde_json::Error),
    #[error("truncated frame, expected at least {0} bytes")]
    Truncated(usize),
}
