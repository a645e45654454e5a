use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use kidtracker_frame::Packet;
use serde::{Deserialize, Serialize};

use crate::command::Command;

/// Keep-alive: `LK[,pedometer,rolls,battery]`.
pub const LINK: &str = "LK";
/// Alarm (SOS button); payload has the location layout.
pub const ALARM: &str = "AL";
/// Instructs the watch to text a message: `SMS,phone,text`.
pub const SMS: &str = "SMS";
/// Message types whose payload carries a location.
pub const LOCATION_TYPES: &[&str] = &["UD", "UD2", "UD_LTE", "UD_WCDMA", ALARM];
/// Message types that carry health counters.
pub const SNAPSHOT_TYPES: &[&str] = &["UD", "UD2", "UD_LTE", "UD_WCDMA", ALARM, LINK];

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Sent by a watch.
    Device,
    /// Sent by the platform to a watch.
    Platform,
}

/// A decoded packet with its arrival (or sending) time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub manufacturer: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    pub source: Source,
}

impl Message {
    /// A message received from a watch just now.
    pub fn from_device(packet: Packet) -> Self {
        Self::from_packet(packet, Source::Device, Utc::now())
    }

    pub fn from_packet(packet: Packet, source: Source, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: packet.kind().to_string(),
            payload: packet.payload().to_string(),
            manufacturer: packet.manufacturer,
            device_id: packet.device_id,
            timestamp,
            source,
        }
    }

    /// A command addressed to a watch, stamped now.
    pub fn platform(manufacturer: &str, device_id: &str, command: &Command) -> Self {
        Self {
            manufacturer: manufacturer.to_string(),
            device_id: device_id.to_string(),
            kind: command.kind().to_string(),
            payload: command.params().join(","),
            timestamp: Utc::now(),
            source: Source::Platform,
        }
    }

    pub fn to_packet(&self) -> Packet {
        let mut content = self.kind.clone();
        if !self.payload.is_empty() {
            content.push(',');
            content.push_str(&self.payload);
        }
        Packet {
            manufacturer: self.manufacturer.clone(),
            device_id: self.device_id.clone(),
            content,
        }
    }

    fn fields(&self) -> Vec<&str> {
        if self.payload.is_empty() {
            Vec::new()
        } else {
            self.payload.split(',').collect()
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}*{}*{}", self.manufacturer, self.device_id, self.kind)?;
        if !self.payload.is_empty() {
            write!(f, ",{}", self.payload)?;
        }
        f.write_str("]")
    }
}

/// Malformed telemetry payload.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("{kind} is not a {expected} message")]
    UnexpectedType { kind: String, expected: &'static str },

    #[error("{kind} message has no {field} field")]
    MissingField { kind: String, field: &'static str },

    #[error("invalid {field} value {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// A position fix reported by a watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub timestamp: DateTime<Utc>,
    /// GPS fix quality flag (`A` = valid, `V` = estimated).
    pub valid: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub course: f64,
    pub altitude: f64,
    pub satellites: u32,
    pub battery: u32,
    pub pedometer: u64,
}

impl Location {
    /// Parse a location-bearing message.
    ///
    /// Payload layout: `ddMMyy,HHmmss,A|V,lat,N|S,lon,E|W,speed,course,
    /// altitude,satellites,gsm,battery,pedometer,...`
    pub fn parse(message: &Message) -> Result<Self, ParseError> {
        if !LOCATION_TYPES.contains(&message.kind.as_str()) {
            return Err(ParseError::UnexpectedType {
                kind: message.kind.clone(),
                expected: "location",
            });
        }
        let fields = Fields::new(message);

        let date = fields.get(0, "date")?;
        let time = fields.get(1, "time")?;
        let timestamp = NaiveDateTime::parse_from_str(&format!("{date}{time}"), "%d%m%y%H%M%S")
            .map_err(|_| ParseError::InvalidField {
                field: "timestamp",
                value: format!("{date},{time}"),
            })?
            .and_utc();

        let latitude: f64 = fields.number(3, "latitude")?;
        let longitude: f64 = fields.number(5, "longitude")?;

        Ok(Self {
            timestamp,
            valid: fields.get(2, "validity")? == "A",
            latitude: if fields.get(4, "latitude hemisphere")? == "S" {
                -latitude
            } else {
                latitude
            },
            longitude: if fields.get(6, "longitude hemisphere")? == "W" {
                -longitude
            } else {
                longitude
            },
            speed: fields.number(7, "speed")?,
            course: fields.number(8, "course")?,
            altitude: fields.number(9, "altitude")?,
            satellites: fields.number(10, "satellites")?,
            battery: fields.number(12, "battery")?,
            pedometer: fields.number(13, "pedometer")?,
        })
    }
}

/// Health counters carried by keep-alive messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub timestamp: DateTime<Utc>,
    pub pedometer: u64,
    pub rolls: u64,
    pub battery: u32,
}

impl Link {
    /// Parse a keep-alive message: `LK,pedometer,rolls,battery`.
    pub fn parse(message: &Message) -> Result<Self, ParseError> {
        if message.kind != LINK {
            return Err(ParseError::UnexpectedType {
                kind: message.kind.clone(),
                expected: "link",
            });
        }
        let fields = Fields::new(message);
        Ok(Self {
            timestamp: message.timestamp,
            pedometer: fields.number(0, "pedometer")?,
            rolls: fields.number(1, "rolls")?,
            battery: fields.number(2, "battery")?,
        })
    }
}

struct Fields<'a> {
    kind: &'a str,
    values: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(message: &'a Message) -> Self {
        Self {
            kind: &message.kind,
            values: message.fields(),
        }
    }

    fn get(&self, index: usize, field: &'static str) -> Result<&'a str, ParseError> {
        self.values
            .get(index)
            .copied()
            .ok_or_else(|| ParseError::MissingField {
                kind: self.kind.to_string(),
                field,
            })
    }

    fn number<N: FromStr>(&self, index: usize, field: &'static str) -> Result<N, ParseError> {
        let raw = self.get(index, field)?;
        raw.trim().parse().map_err(|_| ParseError::InvalidField {
            field,
            value: raw.to_string(),
        })
    }
}
