//! Read models served to platform users.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::message::{Link, Location, Message, ParseError, LINK};

/// Where a watch was at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub valid: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub course: f64,
    pub battery: u32,
}

impl Position {
    pub fn new(device_id: &str, location: &Location) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp: location.timestamp,
            valid: location.valid,
            latitude: location.latitude,
            longitude: location.longitude,
            speed: location.speed,
            course: location.course,
            battery: location.battery,
        }
    }
}

/// Health counters of a watch at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub pedometer: u64,
    /// Only keep-alives carry the roll counter.
    pub rolls: Option<u64>,
    pub battery: u32,
}

impl Snapshot {
    pub fn new(device_id: &str, link: &Link) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp: link.timestamp,
            pedometer: link.pedometer,
            rolls: Some(link.rolls),
            battery: link.battery,
        }
    }

    /// Counters from a stored keep-alive or location message, stamped with
    /// the time the message arrived.
    pub fn from_message(message: &Message) -> Result<Self, ParseError> {
        if message.kind == LINK {
            return Ok(Self::new(&message.device_id, &Link::parse(message)?));
        }
        let location = Location::parse(message)?;
        Ok(Self {
            device_id: message.device_id.clone(),
            timestamp: message.timestamp,
            pedometer: location.pedometer,
            rolls: None,
            battery: location.battery,
        })
    }
}

/// Live overview of a set of connected watches.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub positions: Vec<Position>,
    pub snapshots: Vec<Snapshot>,
    /// Watches with a raised SOS alarm.
    pub alarms: Vec<String>,
    /// Last time each watch was heard from.
    pub last: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub device_id: String,
    pub online: bool,
    /// Last time the watch was heard from, if ever.
    pub last: Option<DateTime<Utc>>,
}
