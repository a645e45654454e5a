/// Errors that can occur while reading, writing or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// A bracketed packet could not be decoded.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Packet content does not fit the 4-hex-digit length field.
    #[error("packet content too long ({len} bytes, max {max})")]
    ContentTooLong { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
