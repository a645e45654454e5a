use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use kidtracker_transport::DeviceStream;

use crate::codec::Frame;
use crate::config::FrameConfig;
use crate::error::{FrameError, Result};

/// Reads bursts of bytes from any `Read` stream.
///
/// Framing is heuristic: the reader keeps pulling fixed-size chunks while
/// every read fills the chunk completely, and treats the first short read as
/// the end of the frame. Consequences the caller has to live with:
///
/// - a message whose length is an exact multiple of the chunk size is merged
///   with whatever arrives next (or ends the frame when the stream goes
///   quiet for one poll interval);
/// - a message that the network delivers in two bursts is split in two.
///
/// Watches send small messages and wait between them, so this works in
/// practice. It is not a length-prefixed protocol.
pub struct FrameReader<T> {
    inner: T,
    chunk: Vec<u8>,
    config: FrameConfig,
    eof: bool,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        let chunk_size = config.chunk_size.max(1);
        Self {
            inner,
            chunk: vec![0u8; chunk_size],
            config,
            eof: false,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when no input arrived within the poll interval
    /// (the underlying read timed out before the first byte), so the caller
    /// can check whether it should keep going. Returns
    /// `Err(FrameError::ConnectionClosed)` once the stream reached EOF.
    ///
    /// EOF right after a full chunk still delivers the bytes read so far as
    /// a final frame; the following call reports the closed connection.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        if self.eof {
            return Err(FrameError::ConnectionClosed);
        }

        let mut frame = BytesMut::new();
        loop {
            let read = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_idle(&err) => {
                    if frame.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                self.eof = true;
                if frame.is_empty() {
                    return Err(FrameError::ConnectionClosed);
                }
                break;
            }

            frame.extend_from_slice(&self.chunk[..read]);
            if read < self.chunk.len() {
                break;
            }
        }

        Ok(Some(Frame::new(frame.freeze())))
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<DeviceStream> {
    /// Create a frame reader for `DeviceStream` and apply the poll interval
    /// as the socket read timeout.
    pub fn with_config_tcp(inner: DeviceStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.poll_interval)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

// Socket read timeouts surface as WouldBlock on Unix and TimedOut on Windows.
fn is_idle(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

pub(crate) fn transport_to_frame_error(err: kidtracker_transport::TransportError) -> FrameError {
    match err {
        kidtracker_transport::TransportError::Io(io)
        | kidtracker_transport::TransportError::Accept(io) => FrameError::Io(io),
        kidtracker_transport::TransportError::Bind { source, .. }
        | kidtracker_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{Cursor, Write};

    use super::*;

    fn small_chunks(chunk_size: usize) -> FrameConfig {
        FrameConfig {
            chunk_size,
            ..FrameConfig::default()
        }
    }

    /// Replays scripted read results, one per call.
    struct ScriptedReader {
        steps: VecDeque<std::io::Result<Vec<u8>>>,
    }

    impl ScriptedReader {
        fn new(steps: Vec<std::io::Result<Vec<u8>>>) -> Self {
            Self {
                steps: steps.into(),
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.steps.pop_front() {
                None => Ok(0),
                Some(Err(err)) => Err(err),
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.steps.push_front(Ok(bytes[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }
    }

    #[test]
    fn read_single_short_message() {
        let mut reader = FrameReader::new(Cursor::new(b"[3G*1*0002*LK]".to_vec()));
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.text(), "[3G*1*0002*LK]");

        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn message_longer_than_chunk_is_concatenated() {
        let data = b"0123456789abcdefXYZ".to_vec();
        let mut reader = FrameReader::with_config(Cursor::new(data.clone()), small_chunks(8));
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), data.as_slice());
    }

    #[test]
    fn exact_chunk_multiple_then_eof_delivers_pending_bytes() {
        let data = vec![b'x'; 1024];
        let mut reader = FrameReader::new(Cursor::new(data));

        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 1024);

        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn exact_chunk_multiple_merges_with_next_burst() {
        let reader = ScriptedReader::new(vec![Ok(b"abcd".to_vec()), Ok(b"ef".to_vec())]);
        let mut framed = FrameReader::with_config(reader, small_chunks(4));

        let frame = framed.read_frame().unwrap().unwrap();
        assert_eq!(frame.text(), "abcdef");
    }

    #[test]
    fn exact_chunk_multiple_then_idle_ends_frame() {
        let reader = ScriptedReader::new(vec![
            Ok(b"abcd".to_vec()),
            Err(std::io::Error::from(ErrorKind::WouldBlock)),
            Ok(b"ef".to_vec()),
        ]);
        let mut framed = FrameReader::with_config(reader, small_chunks(4));

        assert_eq!(framed.read_frame().unwrap().unwrap().text(), "abcd");
        assert_eq!(framed.read_frame().unwrap().unwrap().text(), "ef");
    }

    #[test]
    fn message_delivered_in_two_bursts_is_split() {
        let reader = ScriptedReader::new(vec![
            Ok(b"[3G*1*00".to_vec()),
            Ok(b"02*LK]".to_vec()),
        ]);
        let mut framed = FrameReader::with_config(reader, small_chunks(1024));

        assert_eq!(framed.read_frame().unwrap().unwrap().text(), "[3G*1*00");
        assert_eq!(framed.read_frame().unwrap().unwrap().text(), "02*LK]");
    }

    #[test]
    fn idle_stream_reports_no_frame() {
        let reader = ScriptedReader::new(vec![
            Err(std::io::Error::from(ErrorKind::TimedOut)),
            Ok(b"hi".to_vec()),
        ]);
        let mut framed = FrameReader::new(reader);

        assert!(framed.read_frame().unwrap().is_none());
        assert_eq!(framed.read_frame().unwrap().unwrap().text(), "hi");
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = ScriptedReader::new(vec![
            Err(std::io::Error::from(ErrorKind::Interrupted)),
            Ok(b"ok".to_vec()),
        ]);
        let mut framed = FrameReader::new(reader);
        assert_eq!(framed.read_frame().unwrap().unwrap().text(), "ok");
    }

    #[test]
    fn io_error_propagates() {
        let reader = ScriptedReader::new(vec![Err(std::io::Error::from(
            ErrorKind::ConnectionReset,
        ))]);
        let mut framed = FrameReader::new(reader);
        let err = framed.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::ConnectionReset));
    }

    #[test]
    fn empty_stream_is_closed() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn accessors_and_into_inner() {
        let cursor = Cursor::new(Vec::<u8>::new());
        let mut reader = FrameReader::new(cursor);

        assert_eq!(reader.config().chunk_size, 1024);
        let _ = reader.get_ref();
        let _ = reader.get_mut();
        let _inner = reader.into_inner();
    }

    #[test]
    fn frames_over_tcp_stream() {
        let listener = kidtracker_transport::DeviceSocket::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().to_string();

        let client = std::thread::spawn(move || {
            let mut stream = kidtracker_transport::DeviceSocket::connect(&addr).unwrap();
            stream.write_all(b"[3G*1*0002*LK]").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(100));
        });

        let stream = listener.accept().unwrap();
        let cfg = FrameConfig {
            poll_interval: Some(std::time::Duration::from_millis(20)),
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config_tcp(stream, cfg).unwrap();

        let frame = loop {
            if let Some(frame) = reader.read_frame().unwrap() {
                break frame;
            }
        };
        assert_eq!(frame.text(), "[3G*1*0002*LK]");

        client.join().unwrap();
        let closed = loop {
            match reader.read_frame() {
                Ok(None) => continue,
                other => break other,
            }
        };
        assert!(matches!(closed, Err(FrameError::ConnectionClosed)));
    }
}
