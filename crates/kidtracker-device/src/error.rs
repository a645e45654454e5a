use std::fmt;

/// Why a presented confirmation token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMismatch {
    /// The token string is pending on the device, but for a different user.
    OtherUser,
    /// No pending token with this string exists on the device.
    Unknown,
}

impl fmt::Display for TokenMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenMismatch::OtherUser => f.write_str("token was issued to another user"),
            TokenMismatch::Unknown => f.write_str("no such token"),
        }
    }
}

/// Errors that can occur in device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] kidtracker_transport::TransportError),

    /// Frame-level error outside of a live connection (e.g. encoding).
    #[error("frame error: {0}")]
    Frame(#[from] kidtracker_frame::FrameError),

    /// The connection is closed or its stream is unusable.
    #[error("connection [{id}] failed: {source}")]
    Connection {
        id: String,
        source: kidtracker_frame::FrameError,
    },

    /// The device has no live connection.
    #[error("device {0} is not connected")]
    NotConnected(String),

    /// The device is not among the connected devices (token operations).
    #[error("unknown device {0}")]
    UnknownDevice(String),

    /// The user does not exist.
    #[error("unknown user {0}")]
    UnknownUser(u64),

    /// The presented confirmation token does not match a pending command.
    #[error("invalid token for device {device_id}: {mismatch}")]
    InvalidToken {
        device_id: String,
        mismatch: TokenMismatch,
    },

    /// The presented confirmation token has outlived its TTL.
    #[error("token for device {0} has expired")]
    ExpiredToken(String),

    /// A contact could not be encoded into a device command.
    #[error("encode error: {0}")]
    Encode(#[from] crate::encoder::EncodeError),

    /// A storage collaborator failed.
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// The per-connection thread could not be started.
    #[error("failed to spawn connection thread: {0}")]
    Thread(std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
