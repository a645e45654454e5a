use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::command::{Command, UserToken};
use crate::encoder::{check_slot, encode_config, encode_contact, ContactType};
use crate::error::{DeviceError, Result};
use crate::message::{
    Link, Location, Message, ParseError, Source, LINK, LOCATION_TYPES, SNAPSHOT_TYPES,
};
use crate::model::{Config, Contact};
use crate::registry::Registry;
use crate::report::{Position, Report, Snapshot, Status};
use crate::store::{ConfigStore, ContactStore, MessageStore, UserStore};

/// Platform-facing operations on watches.
///
/// Keeps contacts and configs in storage and on the watch in step, brokers
/// confirmed commands for users, and builds read models from live state with
/// a fallback to message history.
pub struct DeviceProcessor {
    registry: Arc<Registry>,
    users: Arc<dyn UserStore>,
    messages: Arc<dyn MessageStore>,
    contacts: Arc<dyn ContactStore>,
    configs: Arc<dyn ConfigStore>,
}

impl DeviceProcessor {
    pub fn new(
        registry: Arc<Registry>,
        users: Arc<dyn UserStore>,
        messages: Arc<dyn MessageStore>,
        contacts: Arc<dyn ContactStore>,
        configs: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            registry,
            users,
            messages,
            contacts,
            configs,
        }
    }

    /// Use one store for every collaborator.
    pub fn with_store<S>(registry: Arc<Registry>, store: Arc<S>) -> Self
    where
        S: UserStore + MessageStore + ContactStore + ConfigStore + 'static,
    {
        Self::new(
            registry,
            store.clone(),
            store.clone(),
            store.clone(),
            store,
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn contacts(&self, device_id: &str, kind: ContactType) -> Result<Vec<Contact>> {
        Ok(self.contacts.contacts(device_id, kind)?)
    }

    /// Store the contact and re-send its slot (or page) to the watch.
    pub fn update_contact(&self, device_id: &str, contact: &Contact) -> Result<()> {
        check_slot(contact.kind, contact.index)?;
        self.contacts.put_contact(device_id, contact)?;
        self.sync_contact(device_id, contact.kind, contact.index)
    }

    /// Drop the contact and re-send its slot (or page) to the watch.
    pub fn remove_contact(&self, device_id: &str, kind: ContactType, index: usize) -> Result<()> {
        check_slot(kind, index)?;
        self.contacts.remove_contact(device_id, kind, index)?;
        self.sync_contact(device_id, kind, index)
    }

    pub fn configs(&self, device_id: &str) -> Result<Vec<Config>> {
        Ok(self.configs.configs(device_id)?)
    }

    /// Store the parameter and send the stored value to the watch.
    pub fn update_config(&self, device_id: &str, config: &Config) -> Result<()> {
        self.configs.put_config(device_id, config)?;
        if let Some(stored) = self.configs.config(device_id, &config.parameter)? {
            self.registry.send(device_id, &encode_config(&stored))?;
        }
        Ok(())
    }

    /// Forget a parameter. The watch keeps its current value: there is no
    /// command that resets a parameter to its factory default.
    pub fn remove_config(&self, device_id: &str, parameter: &str) -> Result<bool> {
        Ok(self.configs.remove_config(device_id, parameter)?)
    }

    /// Stage `command` for `user_id`; the watch texts the token to the user.
    pub fn apply(&self, user_id: u64, device_id: &str, command: Command) -> Result<()> {
        let user = self
            .users
            .user(user_id)?
            .ok_or(DeviceError::UnknownUser(user_id))?;
        self.registry.apply(&user, device_id, command)
    }

    pub fn execute(&self, user_id: u64, token: &str, device_id: &str) -> Result<()> {
        self.registry
            .execute(&UserToken::new(user_id, token), device_id)
    }

    /// Live overview of the connected devices among `device_ids`.
    ///
    /// A device that has not reported a location or keep-alive counters
    /// since it connected is filled from its latest stored message.
    pub fn report(&self, device_ids: &[String]) -> Report {
        let mut report = Report::default();
        for device in self.registry.select(device_ids) {
            let id = device.id();

            let location = device
                .location_or_fetch(|| self.historical(id, LOCATION_TYPES, Location::parse));
            if let Some(location) = location {
                report.positions.push(Position::new(id, &location));
            }

            let link = device.link_or_fetch(|| self.historical(id, &[LINK], Link::parse));
            if let Some(link) = link {
                report.snapshots.push(Snapshot::new(id, &link));
            }

            if device.alarm() {
                report.alarms.push(id.to_string());
            }
            report.last.insert(id.to_string(), device.last());
        }
        report
    }

    /// Online flag and last-seen time for each id, in input order.
    pub fn status(&self, device_ids: &[String]) -> Result<Vec<Status>> {
        let live: HashMap<&str, DateTime<Utc>> = device_ids
            .iter()
            .filter_map(|id| self.registry.last(id).map(|last| (id.as_str(), last)))
            .collect();

        let offline: Vec<String> = device_ids
            .iter()
            .filter(|id| !live.contains_key(id.as_str()))
            .cloned()
            .collect();
        let history: HashMap<String, DateTime<Utc>> = if offline.is_empty() {
            HashMap::new()
        } else {
            self.messages
                .last(&offline, &[], Source::Device, None)?
                .into_iter()
                .map(|message| (message.device_id, message.timestamp))
                .collect()
        };

        Ok(device_ids
            .iter()
            .map(|id| match live.get(id.as_str()) {
                Some(last) => Status {
                    device_id: id.clone(),
                    online: true,
                    last: Some(*last),
                },
                None => Status {
                    device_id: id.clone(),
                    online: false,
                    last: history.get(id).copied(),
                },
            })
            .collect())
    }

    /// Stored positions of a device between `start` and `end`, oldest first.
    /// Unparsable messages are skipped.
    pub fn path(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Position>> {
        let messages = self
            .messages
            .slice(device_id, LOCATION_TYPES, Source::Device, start, end)?;
        Ok(messages
            .iter()
            .filter_map(|message| Location::parse(message).ok())
            .map(|location| Position::new(device_id, &location))
            .collect())
    }

    /// Stored health counters of a device between `start` and `end`, oldest
    /// first, from both location and keep-alive messages. Unparsable messages
    /// are skipped.
    pub fn snapshots(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>> {
        let messages = self
            .messages
            .slice(device_id, SNAPSHOT_TYPES, Source::Device, start, end)?;
        Ok(messages
            .iter()
            .filter_map(|message| Snapshot::from_message(message).ok())
            .collect())
    }

    /// Latest stored counters of a device strictly before `before`.
    pub fn last_snapshot(
        &self,
        device_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Snapshot>> {
        Ok(self
            .last_snapshots(&[device_id.to_string()], before)?
            .pop())
    }

    /// Latest stored counters strictly before `before`, one per device that
    /// has any.
    pub fn last_snapshots(
        &self,
        device_ids: &[String],
        before: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>> {
        let messages = self
            .messages
            .last(device_ids, SNAPSHOT_TYPES, Source::Device, Some(before))?;
        Ok(messages
            .iter()
            .filter_map(|message| match Snapshot::from_message(message) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    tracing::warn!(device = %message.device_id, %message, error = %err, "unable to parse snapshot message");
                    None
                }
            })
            .collect())
    }

    fn sync_contact(&self, device_id: &str, kind: ContactType, index: usize) -> Result<()> {
        let contacts = self.contacts.contacts(device_id, kind)?;
        let command = encode_contact(kind, index, &contacts)?;
        self.registry.send(device_id, &command)
    }

    fn historical<T>(
        &self,
        device_id: &str,
        kinds: &[&str],
        parse: fn(&Message) -> std::result::Result<T, ParseError>,
    ) -> Option<T> {
        let message = match self
            .messages
            .last(&[device_id.to_string()], kinds, Source::Device, None)
        {
            Ok(mut found) => found.pop()?,
            Err(err) => {
                tracing::warn!(device = %device_id, error = %err, "message history unavailable");
                return None;
            }
        };
        tracing::debug!(device = %device_id, %message, "using historical message");
        match parse(&message) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(device = %device_id, %message, error = %err, "unable to parse historical message");
                None
            }
        }
    }
}
