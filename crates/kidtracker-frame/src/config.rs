use std::time::Duration;

/// Default read chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Configuration for frame reading and writing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Size of each read. A read returning fewer bytes ends the frame.
    pub chunk_size: usize,
    /// How long a read may wait for input before the reader reports that
    /// nothing is available. `None` blocks indefinitely.
    pub poll_interval: Option<Duration>,
    /// Write timeout for outbound frames.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval: Some(Duration::from_millis(200)),
            write_timeout: Some(Duration::from_secs(10)),
        }
    }
}
