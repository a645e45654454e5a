//! TCP gateway for GPS tracker watches.
//!
//! kidtracker accepts the long-lived TCP connections that children's GPS
//! watches open to their platform, keeps the live state of every connected
//! watch, and brokers commands back to it.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP listener and device streams
//! - [`frame`]: burst framing and the bracketed packet envelope
//! - [`device`]: connections, registry, storage seams and reports (behind `device` feature)

/// Re-export transport types.
pub mod transport {
    pub use kidtracker_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use kidtracker_frame::*;
}

/// Re-export device types (requires `device` feature).
#[cfg(feature = "device")]
pub mod device {
    pub use kidtracker_device::*;
}
