use thiserror::Error;

pub type WireResult<T> = Result<T, WireError>;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame payload exceeds maximum size of {max} bytes (got {got})")]
    PayloadTooLarge { max: u32, got: u32 },

    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    #[error("malformed preamble: expected {expected:?}, got {got:?}")]
    BadPreamble { expected: [u8; 3], got: [u8; 3] },

    #[error("frame header declares an impossible total length {total_len}")]
    BadFrameLength { total_len: u32 },

    #[error("payload codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
