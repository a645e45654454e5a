//! Records owned by the storage collaborators.

use serde::{Deserialize, Serialize};

use crate::encoder::ContactType;

/// A phone number stored in one of the watch's contact slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "type")]
    pub kind: ContactType,
    pub index: usize,
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A watch configuration parameter, e.g. `UPLOAD` = `600`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub parameter: String,
    #[serde(default)]
    pub value: String,
}

/// A platform user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: u64,
    pub name: String,
    pub phone: String,
}
