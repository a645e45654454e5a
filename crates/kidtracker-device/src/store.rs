//! Storage collaborators and an in-memory implementation.
//!
//! The registry and processor only talk to storage through these traits.
//! `MemoryStore` backs the standalone server and the tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::encoder::ContactType;
use crate::message::{Message, Source};
use crate::model::{Config, Contact, UserInfo};

/// A storage collaborator failed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Devices registered on the platform.
pub trait DeviceStore: Send + Sync {
    fn exists(&self, device_id: &str) -> StoreResult<bool>;
}

/// Message history.
pub trait MessageStore: Send + Sync {
    fn save(&self, message: &Message) -> StoreResult<()>;

    /// Latest message per device among `device_ids`, restricted to `kinds`
    /// (any type when empty) and `source`, strictly older than `before` when
    /// given. Devices without a match are absent from the result.
    fn last(
        &self,
        device_ids: &[String],
        kinds: &[&str],
        source: Source,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Message>>;

    /// Messages of one device in `[start, end]`, oldest first.
    fn slice(
        &self,
        device_id: &str,
        kinds: &[&str],
        source: Source,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Message>>;
}

/// Contacts kept per device and list.
pub trait ContactStore: Send + Sync {
    fn contacts(&self, device_id: &str, kind: ContactType) -> StoreResult<Vec<Contact>>;

    /// Insert or replace the contact in its slot.
    fn put_contact(&self, device_id: &str, contact: &Contact) -> StoreResult<()>;

    /// Returns whether a contact was stored in the slot.
    fn remove_contact(&self, device_id: &str, kind: ContactType, index: usize)
        -> StoreResult<bool>;
}

/// Configuration parameters kept per device.
pub trait ConfigStore: Send + Sync {
    fn configs(&self, device_id: &str) -> StoreResult<Vec<Config>>;

    fn config(&self, device_id: &str, parameter: &str) -> StoreResult<Option<Config>>;

    fn put_config(&self, device_id: &str, config: &Config) -> StoreResult<()>;

    fn remove_config(&self, device_id: &str, parameter: &str) -> StoreResult<bool>;
}

pub trait UserStore: Send + Sync {
    fn user(&self, user_id: u64) -> StoreResult<Option<UserInfo>>;
}

/// Every collaborator trait backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<HashSet<String>>,
    users: RwLock<HashMap<u64, UserInfo>>,
    messages: RwLock<Vec<Message>>,
    contacts: RwLock<HashMap<(String, ContactType), BTreeMap<usize, Contact>>>,
    configs: RwLock<HashMap<String, BTreeMap<String, Config>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device id so that its connections are admitted.
    pub fn add_device(&self, device_id: impl Into<String>) -> StoreResult<()> {
        write(&self.devices)?.insert(device_id.into());
        Ok(())
    }

    pub fn add_user(&self, user: UserInfo) -> StoreResult<()> {
        write(&self.users)?.insert(user.id, user);
        Ok(())
    }

    /// Snapshot of every saved message, in save order.
    pub fn messages(&self) -> StoreResult<Vec<Message>> {
        Ok(read(&self.messages)?.clone())
    }
}

impl DeviceStore for MemoryStore {
    fn exists(&self, device_id: &str) -> StoreResult<bool> {
        Ok(read(&self.devices)?.contains(device_id))
    }
}

impl MessageStore for MemoryStore {
    fn save(&self, message: &Message) -> StoreResult<()> {
        write(&self.messages)?.push(message.clone());
        Ok(())
    }

    fn last(
        &self,
        device_ids: &[String],
        kinds: &[&str],
        source: Source,
        before: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Message>> {
        let messages = read(&self.messages)?;
        let last = device_ids
            .iter()
            .filter_map(|device_id| {
                messages
                    .iter()
                    .filter(|m| &m.device_id == device_id && matches(m, kinds, source))
                    .filter(|m| before.map_or(true, |before| m.timestamp < before))
                    // Later saves win ties.
                    .max_by_key(|m| m.timestamp)
                    .cloned()
            })
            .collect();
        Ok(last)
    }

    fn slice(
        &self,
        device_id: &str,
        kinds: &[&str],
        source: Source,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Message>> {
        let mut slice: Vec<Message> = read(&self.messages)?
            .iter()
            .filter(|m| m.device_id == device_id && matches(m, kinds, source))
            .filter(|m| m.timestamp >= start && m.timestamp <= end)
            .cloned()
            .collect();
        slice.sort_by_key(|m| m.timestamp);
        Ok(slice)
    }
}

impl ContactStore for MemoryStore {
    fn contacts(&self, device_id: &str, kind: ContactType) -> StoreResult<Vec<Contact>> {
        let contacts = read(&self.contacts)?;
        Ok(contacts
            .get(&(device_id.to_string(), kind))
            .map(|slots| slots.values().cloned().collect())
            .unwrap_or_default())
    }

    fn put_contact(&self, device_id: &str, contact: &Contact) -> StoreResult<()> {
        write(&self.contacts)?
            .entry((device_id.to_string(), contact.kind))
            .or_default()
            .insert(contact.index, contact.clone());
        Ok(())
    }

    fn remove_contact(
        &self,
        device_id: &str,
        kind: ContactType,
        index: usize,
    ) -> StoreResult<bool> {
        Ok(write(&self.contacts)?
            .get_mut(&(device_id.to_string(), kind))
            .and_then(|slots| slots.remove(&index))
            .is_some())
    }
}

impl ConfigStore for MemoryStore {
    fn configs(&self, device_id: &str) -> StoreResult<Vec<Config>> {
        Ok(read(&self.configs)?
            .get(device_id)
            .map(|configs| configs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn config(&self, device_id: &str, parameter: &str) -> StoreResult<Option<Config>> {
        Ok(read(&self.configs)?
            .get(device_id)
            .and_then(|configs| configs.get(parameter))
            .cloned())
    }

    fn put_config(&self, device_id: &str, config: &Config) -> StoreResult<()> {
        write(&self.configs)?
            .entry(device_id.to_string())
            .or_default()
            .insert(config.parameter.clone(), config.clone());
        Ok(())
    }

    fn remove_config(&self, device_id: &str, parameter: &str) -> StoreResult<bool> {
        Ok(write(&self.configs)?
            .get_mut(device_id)
            .and_then(|configs| configs.remove(parameter))
            .is_some())
    }
}

impl UserStore for MemoryStore {
    fn user(&self, user_id: u64) -> StoreResult<Option<UserInfo>> {
        Ok(read(&self.users)?.get(&user_id).cloned())
    }
}

fn matches(message: &Message, kinds: &[&str], source: Source) -> bool {
    message.source == source && (kinds.is_empty() || kinds.contains(&message.kind.as_str()))
}

fn read<T>(lock: &RwLock<T>) -> StoreResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> StoreResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
}
