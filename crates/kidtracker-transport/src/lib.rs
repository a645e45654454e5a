//! TCP transport for tracker watch connections.
//!
//! Watches keep a single long-lived TCP connection open to the platform and
//! push telemetry over it; commands travel back over the same socket.
//!
//! This is the lowest layer of kidtracker. Everything else builds on top of
//! the [`DeviceStream`] type provided here.

pub mod error;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use tcp::DeviceSocket;
pub use traits::DeviceStream;
