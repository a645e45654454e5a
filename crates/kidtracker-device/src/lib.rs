//! Device connections, live state and command brokering.
//!
//! This is the working layer of kidtracker. Watches connect through a
//! [`DeviceListener`], their packets are routed by the [`Registry`] to a
//! per-device [`Device`], and commands flow back the same way. Commands that
//! need a user's confirmation are staged behind a numeric token that the
//! watch itself texts to the user.

pub mod command;
pub mod connection;
pub mod device;
pub mod encoder;
pub mod error;
pub mod handler;
pub mod listener;
pub mod message;
pub mod model;
pub mod processor;
pub mod registry;
pub mod report;
pub mod store;
pub mod temporal;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{Command, UserToken};
pub use connection::{Connection, Outbound};
pub use device::Device;
pub use encoder::{check_slot, encode_config, encode_contact, to_utf16_hex, ContactType, EncodeError};
pub use error::{DeviceError, Result, TokenMismatch};
pub use handler::{DebugHandler, FrameHandler, MessageHandler};
pub use listener::{serve_connection, DeviceListener};
pub use message::{Link, Location, Message, ParseError, Source};
pub use model::{Config, Contact, UserInfo};
pub use processor::DeviceProcessor;
pub use registry::{Registry, RegistryConfig};
pub use report::{Position, Report, Snapshot, Status};
pub use store::{
    ConfigStore, ContactStore, DeviceStore, MemoryStore, MessageStore, StoreError, UserStore,
};
pub use temporal::Temporal;
