use std::net::{SocketAddr, TcpListener, TcpStream};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::DeviceStream;

/// TCP transport for watch connections.
///
/// Provides bind/accept/connect over plain TCP. Watches dial in and keep the
/// socket open indefinitely, so every accepted stream is long-lived.
pub struct DeviceSocket {
    listener: TcpListener,
    local: SocketAddr,
}

impl DeviceSocket {
    /// Bind and listen on a TCP address such as `0.0.0.0:8001`.
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

        info!(%local, "listening for devices");

        Ok(Self { listener, local })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<DeviceStream> {
        let (stream, addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%addr, "accepted connection");
        Ok(DeviceStream::from_tcp(stream))
    }

    /// Connect to a listening tracker port (blocking).
    pub fn connect(addr: &str) -> Result<DeviceStream> {
        let stream = TcpStream::connect(addr).map_err(|e| TransportError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
        debug!(addr, "connected to tracker port");
        Ok(DeviceStream::from_tcp(stream))
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}
