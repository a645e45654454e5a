use std::borrow::Cow;

use bytes::Bytes;

use crate::error::{FrameError, Result};

/// Largest content length expressible in the 4-hex-digit length field.
pub const MAX_CONTENT_LEN: usize = 0xFFFF;

const OPEN: u8 = b'[';
const CLOSE: u8 = b']';
const SEPARATOR: u8 = b'*';
const LENGTH_DIGITS: usize = 4;
// Manufacturer tag and device id are short; anything longer is garbage.
const MAX_HEADER_LEN: usize = 64;

/// One burst of bytes read from a connection.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw bytes as received.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Frame contents as text. Invalid UTF-8 is replaced, never rejected.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A single bracketed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Manufacturer tag, e.g. `3G` or `SG`.
    pub manufacturer: String,
    /// Hardware-assigned device id.
    pub device_id: String,
    /// Everything between the length field and the closing bracket.
    pub content: String,
}

impl Packet {
    /// Build a packet from a message type and its parameters.
    pub fn new(
        manufacturer: impl Into<String>,
        device_id: impl Into<String>,
        kind: &str,
        params: &[String],
    ) -> Self {
        let mut content = String::from(kind);
        for param in params {
            content.push(',');
            content.push_str(param);
        }
        Self {
            manufacturer: manufacturer.into(),
            device_id: device_id.into(),
            content,
        }
    }

    /// Message type: the content up to the first comma.
    pub fn kind(&self) -> &str {
        match self.content.split_once(',') {
            Some((kind, _)) => kind,
            None => &self.content,
        }
    }

    /// Message payload: the content after the first comma.
    pub fn payload(&self) -> &str {
        match self.content.split_once(',') {
            Some((_, payload)) => payload,
            None => "",
        }
    }
}

/// Encode a packet into its wire text.
///
/// Wire format:
/// ```text
/// ┌───┬────┬───┬──────────┬───┬──────────┬───┬───────────────┬───┐
/// │ [ │ MF │ * │ DEVICEID │ * │ LLLL hex │ * │ TYPE,params   │ ] │
/// └───┴────┴───┴──────────┴───┴──────────┴───┴───────────────┴───┘
/// ```
pub fn encode_packet(packet: &Packet) -> Result<String> {
    let len = packet.content.len();
    if len > MAX_CONTENT_LEN {
        return Err(FrameError::ContentTooLong {
            len,
            max: MAX_CONTENT_LEN,
        });
    }
    Ok(format!(
        "[{}*{}*{:04X}*{}]",
        packet.manufacturer, packet.device_id, len, packet.content
    ))
}

/// Decode every bracketed packet found in a frame.
///
/// A malformed packet yields an error entry and decoding resumes at the next
/// opening bracket, so one bad envelope does not poison the rest of the frame.
/// Bytes outside of any envelope are ignored.
pub fn decode_packets(text: &str) -> Vec<Result<Packet>> {
    let bytes = text.as_bytes();
    let mut packets = Vec::new();
    let mut pos = 0usize;

    while let Some(offset) = bytes[pos..].iter().position(|&b| b == OPEN) {
        let start = pos + offset;
        match decode_one(&bytes[start..]) {
            Ok((packet, consumed)) => {
                packets.push(Ok(packet));
                pos = start + consumed;
            }
            Err(err) => {
                packets.push(Err(err));
                pos = start + 1;
            }
        }
    }

    packets
}

/// Decode one packet starting at an opening bracket. Returns the packet and
/// the number of bytes consumed.
fn decode_one(src: &[u8]) -> Result<(Packet, usize)> {
    let mut fields = [0usize; 3];
    let mut found = 0usize;
    let header_end = src.len().min(MAX_HEADER_LEN);
    for (i, &b) in src.iter().enumerate().take(header_end).skip(1) {
        if b == SEPARATOR {
            fields[found] = i;
            found += 1;
            if found == fields.len() {
                break;
            }
        }
    }
    if found < fields.len() {
        return Err(FrameError::MalformedPacket("incomplete header".to_string()));
    }

    let manufacturer = header_field(&src[1..fields[0]], "manufacturer")?;
    let device_id = header_field(&src[fields[0] + 1..fields[1]], "device id")?;

    let length_field = &src[fields[1] + 1..fields[2]];
    if length_field.len() != LENGTH_DIGITS {
        return Err(FrameError::MalformedPacket(format!(
            "length field must be {LENGTH_DIGITS} hex digits"
        )));
    }
    let length_text = std::str::from_utf8(length_field)
        .map_err(|_| FrameError::MalformedPacket("length field is not text".to_string()))?;
    let content_len = usize::from_str_radix(length_text, 16)
        .map_err(|_| FrameError::MalformedPacket(format!("invalid length {length_text}")))?;

    let content_start = fields[2] + 1;
    let content_end = content_start + content_len;
    if src.len() <= content_end {
        return Err(FrameError::MalformedPacket(format!(
            "truncated content (declared {content_len} bytes)"
        )));
    }
    if src[content_end] != CLOSE {
        return Err(FrameError::MalformedPacket(
            "declared length does not end at closing bracket".to_string(),
        ));
    }

    let content = String::from_utf8_lossy(&src[content_start..content_end]).into_owned();
    Ok((
        Packet {
            manufacturer,
            device_id,
            content,
        },
        content_end + 1,
    ))
}

fn header_field(raw: &[u8], name: &str) -> Result<String> {
    let value = std::str::from_utf8(raw)
        .map_err(|_| FrameError::MalformedPacket(format!("{name} is not text")))?;
    if value.is_empty() {
        return Err(FrameError::MalformedPacket(format!("empty {name}")));
    }
    Ok(value.to_string())
}
