//! Framing for tracker watch connections.
//!
//! Watches do not length-prefix their traffic. A frame is whatever arrives
//! in one burst: the reader drains the socket in fixed-size chunks and stops
//! at the first short read. Inside a frame, messages use the bracketed
//! envelope
//!
//! ```text
//! [MF*DEVICEID*LLLL*TYPE,param,param...]
//! ```
//!
//! where `LLLL` is the content length in bytes as four uppercase hex digits.
//! Several envelopes may share one frame.

pub mod codec;
pub mod config;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{decode_packets, encode_packet, Frame, Packet, MAX_CONTENT_LEN};
pub use config::{FrameConfig, DEFAULT_CHUNK_SIZE};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
