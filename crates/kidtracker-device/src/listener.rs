use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use kidtracker_frame::{FrameConfig, FrameError, FrameReader};
use kidtracker_transport::DeviceSocket;

use crate::connection::Connection;
use crate::error::{DeviceError, Result};
use crate::handler::FrameHandler;

/// Accepts watch connections and serves each on its own thread.
pub struct DeviceListener {
    socket: DeviceSocket,
    handler: Arc<dyn FrameHandler>,
    frame_config: FrameConfig,
    name: String,
}

impl DeviceListener {
    /// Bind to a TCP address such as `0.0.0.0:8001`.
    pub fn bind(addr: &str, handler: Arc<dyn FrameHandler>) -> Result<Self> {
        let socket = DeviceSocket::bind(addr)?;
        Ok(Self {
            socket,
            handler,
            frame_config: FrameConfig::default(),
            name: "device".to_string(),
        })
    }

    /// Override chunk size, poll interval and write timeout.
    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    /// Name used for log fields and connection thread names.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accept the next connection and start serving it.
    pub fn accept(&self) -> Result<Arc<Connection>> {
        let stream = self.socket.accept()?;
        let peer = stream.peer_addr();

        let reader = FrameReader::with_config_tcp(stream.try_clone()?, self.frame_config.clone())?;
        stream.set_write_timeout(self.frame_config.write_timeout)?;
        let connection = Arc::new(Connection::open(
            Box::new(stream),
            self.frame_config.clone(),
        ));
        tracing::info!(
            listener = %self.name,
            connection = connection.id(),
            peer = ?peer,
            "connection accepted"
        );

        let handler = Arc::clone(&self.handler);
        let served = Arc::clone(&connection);
        thread::Builder::new()
            .name(format!("{}-{}", self.name, connection.id()))
            .spawn(move || serve_connection(reader, &served, handler.as_ref()))
            .map_err(|err| {
                connection.close();
                DeviceError::Thread(err)
            })?;
        Ok(connection)
    }

    /// Accept connections until `running` is cleared. The flag is checked
    /// between connections. Accept failures are logged and do not stop the
    /// listener.
    pub fn run(&self, running: &AtomicBool) {
        tracing::info!(listener = %self.name, addr = %self.local_addr(), "listening");
        while running.load(Ordering::SeqCst) {
            if let Err(err) = self.accept() {
                tracing::warn!(listener = %self.name, error = %err, "accept failed");
            }
        }
        tracing::info!(listener = %self.name, "listener stopped");
    }
}

/// Read frames and hand them to `handler` until the connection ends.
///
/// End of stream, read errors and handler errors all close the connection.
/// Nothing is retried: a watch that loses its link reconnects on its own.
pub fn serve_connection<R: Read>(
    mut reader: FrameReader<R>,
    connection: &Arc<Connection>,
    handler: &dyn FrameHandler,
) {
    loop {
        if connection.is_closed() {
            tracing::debug!(connection = connection.id(), "connection closed, reader stopping");
            break;
        }

        let frame = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(FrameError::ConnectionClosed) => {
                tracing::info!(connection = connection.id(), "peer closed connection");
                break;
            }
            Err(err) => {
                if !connection.is_closed() {
                    tracing::warn!(connection = connection.id(), error = %err, "read failed");
                }
                break;
            }
        };

        if let Err(err) = handler.handle(&frame, connection) {
            tracing::warn!(connection = connection.id(), error = %err, "frame handling failed");
            break;
        }
    }
    connection.close();
}
