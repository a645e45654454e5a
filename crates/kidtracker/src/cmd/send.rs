use std::io::Read;
use std::time::{Duration, Instant};

use kidtracker_frame::{
    decode_packets, encode_packet, Frame, FrameConfig, FrameError, FrameReader, FrameWriter,
    Packet,
};
use kidtracker_transport::DeviceSocket;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{frame_error, transport_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_packet, OutputFormat};

const REPLY_POLL: Duration = Duration::from_millis(100);

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let text = resolve_frame(&args)?;

    let stream =
        DeviceSocket::connect(&args.addr).map_err(|err| transport_error("connect failed", err))?;
    let reply_stream = if args.wait {
        Some(
            stream
                .try_clone()
                .map_err(|err| transport_error("connect failed", err))?,
        )
    } else {
        None
    };

    let mut writer = FrameWriter::with_config_tcp(stream, FrameConfig::default())
        .map_err(|err| frame_error("connect failed", err))?;
    writer
        .send(text.as_bytes())
        .map_err(|err| frame_error("send failed", err))?;
    tracing::debug!(addr = %args.addr, frame = %text, "<<<");

    if let Some(reply_stream) = reply_stream {
        let config = FrameConfig {
            poll_interval: Some(REPLY_POLL),
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config_tcp(reply_stream, config)
            .map_err(|err| frame_error("receive failed", err))?;
        let frame = wait_for_frame(&mut reader, wait_timeout)?;
        for packet in reply_packets(&frame)? {
            print_packet(&packet, format);
        }
    }

    Ok(SUCCESS)
}

fn resolve_frame(args: &SendArgs) -> CliResult<String> {
    if let Some(raw) = &args.raw {
        return Ok(raw.clone());
    }
    let device = args
        .device
        .as_deref()
        .ok_or_else(|| CliError::new(USAGE, "--device is required without --raw"))?;
    let packet = Packet::new(args.manufacturer.as_str(), device, &args.kind, &args.params);
    encode_packet(&packet).map_err(|err| frame_error("invalid packet", err))
}

/// Source of reply frames, so waiting can be exercised without a socket.
trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError>;
}

impl<R: Read> FrameSource for FrameReader<R> {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        self.read_frame()
    }
}

fn wait_for_frame<S: FrameSource>(source: &mut S, timeout: Duration) -> CliResult<Frame> {
    let deadline = Instant::now() + timeout;
    loop {
        match source.next_frame() {
            Ok(Some(frame)) => return Ok(frame),
            Ok(None) if Instant::now() >= deadline => {
                return Err(CliError::new(
                    TIMEOUT,
                    format!("no reply within {}ms", timeout.as_millis()),
                ));
            }
            Ok(None) => {}
            Err(err) => return Err(frame_error("receive failed", err)),
        }
    }
}

/// A reply frame must hold at least one well-formed packet.
fn reply_packets(frame: &Frame) -> CliResult<Vec<Packet>> {
    let packets = decode_packets(&frame.text())
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| frame_error("invalid reply", err))?;
    if packets.is_empty() {
        return Err(frame_error(
            "invalid reply",
            FrameError::MalformedPacket(frame.text().into_owned()),
        ));
    }
    Ok(packets)
}
