//! In-process doubles shared by the unit tests.

use std::io::{ErrorKind, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kidtracker_frame::{decode_packets, Packet};

use crate::connection::{Connection, Outbound};

/// Outbound stream that records everything written to it.
#[derive(Clone, Default)]
pub(crate) struct RecordingOutbound {
    sent: Arc<Mutex<Vec<u8>>>,
    shutdowns: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
}

impl RecordingOutbound {
    pub(crate) fn text(&self) -> String {
        String::from_utf8(self.sent.lock().unwrap().clone()).unwrap()
    }

    /// Every packet written so far, in order.
    pub(crate) fn packets(&self) -> Vec<Packet> {
        decode_packets(&self.text())
            .into_iter()
            .map(|packet| packet.unwrap())
            .collect()
    }

    /// Packet contents (`TYPE,params`) written so far.
    pub(crate) fn contents(&self) -> Vec<String> {
        self.packets().into_iter().map(|p| p.content).collect()
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Make every following write fail with `BrokenPipe`.
    pub(crate) fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Write for RecordingOutbound {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(std::io::Error::from(ErrorKind::BrokenPipe));
        }
        self.sent.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Outbound for RecordingOutbound {
    fn shutdown(&mut self) -> std::io::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A connection backed by a recording stream.
pub(crate) fn recorded_connection(id: &str) -> (Arc<Connection>, RecordingOutbound) {
    let outbound = RecordingOutbound::default();
    let connection = Arc::new(Connection::new(id, Box::new(outbound.clone())));
    (connection, outbound)
}
