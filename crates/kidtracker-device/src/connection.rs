use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use kidtracker_frame::{encode_packet, FrameConfig, FrameWriter, Packet};
use kidtracker_transport::{DeviceStream, TransportError};
use rand::Rng;

use crate::error::{DeviceError, Result};

const ID_ALPHABET: &[u8] = b"0123456789abcdef";
const ID_LENGTH: usize = 8;

/// Write half of a connection that can also be torn down.
pub trait Outbound: Write + Send {
    /// Shut the underlying stream down in both directions.
    fn shutdown(&mut self) -> std::io::Result<()>;
}

impl Outbound for DeviceStream {
    fn shutdown(&mut self) -> std::io::Result<()> {
        DeviceStream::shutdown(self).map_err(|err| match err {
            TransportError::Io(io) | TransportError::Accept(io) => io,
            TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => source,
        })
    }
}

/// One live session with a watch.
///
/// The reading side is owned by the connection thread; this handle is shared
/// with the registry and carries the id, the send path and the closed flag.
pub struct Connection {
    id: String,
    writer: Mutex<FrameWriter<Box<dyn Outbound>>>,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap an outbound stream under an explicit id.
    pub fn new(id: impl Into<String>, outbound: Box<dyn Outbound>) -> Self {
        Self::with_config(id, outbound, FrameConfig::default())
    }

    pub fn with_config(
        id: impl Into<String>,
        outbound: Box<dyn Outbound>,
        config: FrameConfig,
    ) -> Self {
        Self {
            id: id.into(),
            writer: Mutex::new(FrameWriter::with_config(outbound, config)),
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap an outbound stream under a fresh random id.
    pub fn open(outbound: Box<dyn Outbound>, config: FrameConfig) -> Self {
        Self::with_config(random_id(), outbound, config)
    }

    /// Correlation id used in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write raw frame text to the watch.
    pub fn send(&self, frame: &str) -> Result<()> {
        if self.is_closed() {
            return Err(self.failed(kidtracker_frame::FrameError::ConnectionClosed));
        }
        self.writer()
            .send(frame.as_bytes())
            .map_err(|source| self.failed(source))?;
        tracing::trace!(connection = %self.id, frame, "sent frame");
        Ok(())
    }

    /// Encode and write one packet.
    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        let text = encode_packet(packet)?;
        self.send(&text)
    }

    /// Close the connection. Only the first call touches the stream.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.writer().get_mut().shutdown() {
            tracing::debug!(connection = %self.id, error = %err, "shutdown failed");
        }
        tracing::debug!(connection = %self.id, "connection closed");
    }

    fn writer(&self) -> MutexGuard<'_, FrameWriter<Box<dyn Outbound>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failed(&self, source: kidtracker_frame::FrameError) -> DeviceError {
        DeviceError::Connection {
            id: self.id.clone(),
            source,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LENGTH)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use kidtracker_frame::FrameError;

    use super::*;
    use crate::testing::RecordingOutbound;

    #[test]
    fn random_ids_use_hex_alphabet() {
        let connection = Connection::open(
            Box::new(RecordingOutbound::default()),
            FrameConfig::default(),
        );
        assert_eq!(connection.id().len(), 8);
        assert!(connection
            .id()
            .bytes()
            .all(|b| ID_ALPHABET.contains(&b)));
    }

    #[test]
    fn send_writes_frame() {
        let outbound = RecordingOutbound::default();
        let connection = Connection::new("c1", Box::new(outbound.clone()));

        connection.send("[3G*1*0002*LK]").unwrap();
        assert_eq!(outbound.text(), "[3G*1*0002*LK]");
    }

    #[test]
    fn send_packet_encodes_length() {
        let outbound = RecordingOutbound::default();
        let connection = Connection::new("c1", Box::new(outbound.clone()));

        connection
            .send_packet(&Packet::new("3G", "1", "AL", &[]))
            .unwrap();
        assert_eq!(outbound.text(), "[3G*1*0002*AL]");
    }

    #[test]
    fn close_is_idempotent() {
        let outbound = RecordingOutbound::default();
        let connection = Connection::new("c1", Box::new(outbound.clone()));

        connection.close();
        connection.close();
        assert!(connection.is_closed());
        assert_eq!(outbound.shutdowns(), 1);
    }

    #[test]
    fn send_after_close_fails() {
        let outbound = RecordingOutbound::default();
        let connection = Connection::new("c1", Box::new(outbound.clone()));
        connection.close();

        let err = connection.send("[3G*1*0002*LK]").unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Connection { ref id, source: FrameError::ConnectionClosed } if id == "c1"
        ));
        assert!(outbound.text().is_empty());
    }

    #[test]
    fn broken_stream_is_connection_error() {
        let outbound = RecordingOutbound::default();
        outbound.break_pipe();
        let connection = Connection::new("c1", Box::new(outbound));

        let err = connection.send("[3G*1*0002*LK]").unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Connection {
                source: FrameError::Io(_),
                ..
            }
        ));
        assert!(!connection.is_closed());
    }
}
