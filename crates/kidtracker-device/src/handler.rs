use std::sync::Arc;

use kidtracker_frame::{decode_packets, Frame};

use crate::connection::Connection;
use crate::error::{DeviceError, Result};
use crate::message::Message;
use crate::registry::Registry;

/// Consumes the frames read from one connection.
///
/// An error ends the connection.
pub trait FrameHandler: Send + Sync {
    fn handle(&self, frame: &Frame, connection: &Arc<Connection>) -> Result<()>;
}

/// Decodes packets and routes them to the registry.
pub struct MessageHandler {
    registry: Arc<Registry>,
}

impl MessageHandler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl FrameHandler for MessageHandler {
    fn handle(&self, frame: &Frame, connection: &Arc<Connection>) -> Result<()> {
        let text = frame.text();
        for packet in decode_packets(&text) {
            let packet = match packet {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::warn!(
                        connection = connection.id(),
                        frame = %text,
                        error = %err,
                        "malformed packet skipped"
                    );
                    continue;
                }
            };

            let message = Message::from_device(packet);
            match self.registry.on_message(&message, connection) {
                Ok(()) => {}
                // The stream is gone, nothing else in this frame can be answered.
                Err(err @ DeviceError::Connection { .. }) => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        connection = connection.id(),
                        %message,
                        error = %err,
                        "message not processed"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Logs raw frames without interpreting them.
pub struct DebugHandler;

impl FrameHandler for DebugHandler {
    fn handle(&self, frame: &Frame, connection: &Arc<Connection>) -> Result<()> {
        tracing::info!(connection = connection.id(), frame = %frame.text(), ">>>");
        Ok(())
    }
}
