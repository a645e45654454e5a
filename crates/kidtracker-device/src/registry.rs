use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;

use crate::command::{Command, UserToken};
use crate::connection::Connection;
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::message::{Message, SMS};
use crate::model::UserInfo;
use crate::store::{DeviceStore, MessageStore};
use crate::temporal::Temporal;

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Digits in a confirmation token.
    pub token_length: usize,
    /// How long a staged command waits for its token.
    pub token_ttl: Duration,
    /// How long a welcome job waits for its watch to connect.
    pub device_job_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            token_length: 6,
            token_ttl: Duration::from_secs(5 * 60),
            device_job_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Connected watches, keyed by device id.
///
/// Routes inbound messages to their [`Device`], sends commands, holds welcome
/// jobs for watches that are offline and brokers token-confirmed commands.
/// Map guards are never held across network I/O.
pub struct Registry {
    devices: DashMap<String, Arc<Device>>,
    welcome_jobs: DashMap<String, Temporal<Command>>,
    device_store: Arc<dyn DeviceStore>,
    message_store: Arc<dyn MessageStore>,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(
        device_store: Arc<dyn DeviceStore>,
        message_store: Arc<dyn MessageStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            devices: DashMap::new(),
            welcome_jobs: DashMap::new(),
            device_store,
            message_store,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Route a message received on `connection`.
    ///
    /// Messages from ids that are neither known to the device store nor
    /// awaited by a live welcome job are logged and dropped.
    pub fn on_message(&self, message: &Message, connection: &Arc<Connection>) -> Result<()> {
        let device_id = &message.device_id;

        let device = match self.registered(device_id) {
            Some(device) => {
                device.check(connection);
                device
            }
            None => {
                if !self.admits(device_id)? {
                    tracing::warn!(
                        device = %device_id,
                        manufacturer = %message.manufacturer,
                        connection = connection.id(),
                        %message,
                        "unknown device, message dropped"
                    );
                    return Ok(());
                }
                let (device, created) = match self.devices.entry(device_id.clone()) {
                    Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
                    Entry::Vacant(entry) => {
                        let device = Arc::new(Device::new(
                            device_id.clone(),
                            message.manufacturer.clone(),
                            Arc::clone(connection),
                        ));
                        entry.insert(Arc::clone(&device));
                        (device, true)
                    }
                };
                if created {
                    tracing::info!(
                        device = %device_id,
                        manufacturer = %message.manufacturer,
                        connection = connection.id(),
                        "device connected"
                    );
                    self.on_device(&device)?;
                } else {
                    device.check(connection);
                }
                device
            }
        };

        self.message_store.save(message)?;
        tracing::debug!(connection = connection.id(), %message, ">>>");

        if let Some(reply) = device.process(message) {
            self.dispatch(&device, &reply)?;
        }
        Ok(())
    }

    /// Run the welcome job of a freshly connected device, unless it expired.
    ///
    /// The job leaves the map before it is sent, so it runs at most once.
    /// Expired jobs stay for [`Registry::clean`].
    pub fn on_device(&self, device: &Device) -> Result<()> {
        let ttl = self.config.device_job_ttl;
        let Some((_, job)) = self
            .welcome_jobs
            .remove_if(device.id(), |_, job| !job.is_expired(ttl))
        else {
            return Ok(());
        };
        tracing::info!(device = device.id(), command = %job.value(), "running welcome job");
        self.dispatch(device, job.value())
    }

    /// Send a command to a connected device.
    pub fn send(&self, device_id: &str, command: &Command) -> Result<()> {
        let device = self
            .connected(device_id)
            .ok_or_else(|| DeviceError::NotConnected(device_id.to_string()))?;
        self.dispatch(&device, command)
    }

    /// Send now, or leave a welcome job for the next time the device
    /// connects. A newer welcome job replaces an older one.
    pub fn send_or_apply(&self, device_id: &str, command: &Command) -> Result<()> {
        match self.connected(device_id) {
            Some(device) => self.dispatch(&device, command),
            None => {
                self.welcome_jobs
                    .insert(device_id.to_string(), Temporal::new(command.clone()));
                tracing::info!(device = %device_id, %command, "device offline, welcome job created");
                Ok(())
            }
        }
    }

    /// Stage `command` behind a fresh token and have the watch text the
    /// token to the user.
    pub fn apply(&self, user: &UserInfo, device_id: &str, command: Command) -> Result<()> {
        let device = self
            .connected(device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?;

        let token = UserToken::new(user.id, numeric_token(self.config.token_length));
        let sms = Command::new(SMS, vec![user.phone.clone(), token.token.clone()]);
        tracing::info!(device = %device_id, %token, %command, "command staged for confirmation");
        device.stage(token, command);
        self.dispatch(&device, &sms)
    }

    /// Send the command staged behind `token`.
    pub fn execute(&self, token: &UserToken, device_id: &str) -> Result<()> {
        let device = self
            .connected(device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?;
        let command = device.redeem(token, self.config.token_ttl)?;
        tracing::info!(device = %device_id, %token, %command, "confirmed command executed");
        self.dispatch(&device, &command)
    }

    /// Registered devices among `device_ids`. Unknown ids are skipped.
    pub fn select(&self, device_ids: &[String]) -> Vec<Arc<Device>> {
        device_ids
            .iter()
            .filter_map(|id| self.registered(id))
            .collect()
    }

    /// Last time a connected device was heard from.
    pub fn last(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.connected(device_id).map(|device| device.last())
    }

    /// Whether the device is registered and its connection is open.
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.connected(device_id).is_some()
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<Device>> {
        let removed = self.devices.remove(device_id).map(|(_, device)| device);
        if removed.is_some() {
            tracing::info!(device = %device_id, "device removed");
        }
        removed
    }

    pub fn alarm_off(&self, device_id: &str) {
        if let Some(device) = self.registered(device_id) {
            device.alarm_off();
        }
    }

    /// Purge expired token jobs and welcome jobs, and forget devices whose
    /// connection is closed.
    pub fn clean(&self) {
        let token_ttl = self.config.token_ttl;
        let devices: Vec<Arc<Device>> = self
            .devices
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for device in devices {
            for token in device.clean(token_ttl) {
                tracing::info!(device = device.id(), %token, "expired token job removed");
            }
        }

        let job_ttl = self.config.device_job_ttl;
        self.welcome_jobs.retain(|device_id, job| {
            let expired = job.is_expired(job_ttl);
            if expired {
                tracing::info!(device = %device_id, "expired welcome job removed");
            }
            !expired
        });

        self.devices.retain(|device_id, device| {
            let closed = device.is_closed();
            if closed {
                tracing::info!(device = %device_id, "device offline, removed");
            }
            !closed
        });
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of queued welcome jobs, expired ones included.
    pub fn welcome_jobs(&self) -> usize {
        self.welcome_jobs.len()
    }

    fn registered(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices
            .get(device_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn connected(&self, device_id: &str) -> Option<Arc<Device>> {
        self.registered(device_id)
            .filter(|device| !device.is_closed())
    }

    /// A queued welcome job admits its device even once expired; it is
    /// the job that must not run, see [`Registry::on_device`].
    fn admits(&self, device_id: &str) -> Result<bool> {
        Ok(self.welcome_jobs.contains_key(device_id) || self.device_store.exists(device_id)?)
    }

    /// Send and record a platform message. A failed save does not undo the
    /// send.
    fn dispatch(&self, device: &Device, command: &Command) -> Result<()> {
        let message = device.send(command)?;
        if let Err(err) = self.message_store.save(&message) {
            tracing::warn!(device = device.id(), %message, error = %err, "sent command not saved");
        }
        Ok(())
    }
}

fn numeric_token(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use kidtracker_frame::Packet;

    use super::*;
    use crate::error::TokenMismatch;
    use crate::message::{Source, LINK};
    use crate::store::MemoryStore;
    use crate::testing::{recorded_connection, RecordingOutbound};

    const DEVICE: &str = "8800000015";

    fn config() -> RegistryConfig {
        RegistryConfig {
            token_length: 6,
            token_ttl: Duration::from_secs(60),
            device_job_ttl: Duration::from_secs(60),
        }
    }

    fn registry_with(config: RegistryConfig) -> (Registry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(store.clone(), store.clone(), config);
        (registry, store)
    }

    fn known_registry() -> (Registry, Arc<MemoryStore>) {
        let (registry, store) = registry_with(config());
        store.add_device(DEVICE).unwrap();
        (registry, store)
    }

    fn message(kind: &str) -> Message {
        Message::from_device(Packet::new("3G", DEVICE, kind, &[]))
    }

    fn user() -> UserInfo {
        UserInfo {
            id: 7,
            name: "Alice".to_string(),
            phone: "+79990001122".to_string(),
        }
    }

    fn connect(registry: &Registry, id: &str) -> (Arc<Connection>, RecordingOutbound) {
        let (connection, outbound) = recorded_connection(id);
        registry.on_message(&message("UD"), &connection).unwrap();
        (connection, outbound)
    }

    fn sent_token(outbound: &RecordingOutbound) -> String {
        let sms = outbound
            .packets()
            .into_iter()
            .rev()
            .find(|p| p.kind() == SMS)
            .expect("an SMS command should have been sent");
        let (phone, token) = sms.payload().split_once(',').unwrap();
        assert_eq!(phone, "+79990001122");
        token.to_string()
    }

    #[test]
    fn unknown_device_is_dropped() {
        let (registry, store) = registry_with(config());
        let (connection, outbound) = recorded_connection("c1");

        registry.on_message(&message(LINK), &connection).unwrap();

        assert!(registry.is_empty());
        assert!(!registry.is_connected(DEVICE));
        assert!(store.messages().unwrap().is_empty());
        assert!(outbound.text().is_empty());
    }

    #[test]
    fn known_device_is_registered_and_keepalive_answered() {
        let (registry, store) = known_registry();
        let (connection, outbound) = recorded_connection("c1");

        registry.on_message(&message(LINK), &connection).unwrap();

        assert!(registry.is_connected(DEVICE));
        assert_eq!(outbound.contents(), vec!["LK"]);
        let saved = store.messages().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].source, Source::Device);
        assert_eq!(saved[1].source, Source::Platform);
        assert_eq!(saved[1].kind, "LK");
    }

    #[test]
    fn closed_connection_is_not_connected_until_swept() {
        let (registry, _) = known_registry();
        let (connection, _) = connect(&registry, "c1");

        connection.close();
        assert!(!registry.is_connected(DEVICE));
        assert_eq!(registry.select(&[DEVICE.to_string()]).len(), 1);
        assert!(matches!(
            registry.send(DEVICE, &Command::of("CR")),
            Err(DeviceError::NotConnected(_))
        ));

        registry.clean();
        assert!(registry.is_empty());
    }

    #[test]
    fn reconnect_rebinds_and_closes_stale_connection() {
        let (registry, _) = known_registry();
        let (first, first_out) = connect(&registry, "c1");
        let (second, second_out) = connect(&registry, "c2");

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.len(), 1);

        registry.send(DEVICE, &Command::of("CR")).unwrap();
        assert!(first_out.text().is_empty());
        assert_eq!(second_out.contents(), vec!["CR"]);
    }

    #[test]
    fn send_to_offline_device_fails() {
        let (registry, _) = known_registry();
        let err = registry.send(DEVICE, &Command::of("CR")).unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected(ref id) if id == DEVICE));
        assert_eq!(registry.welcome_jobs(), 0);
    }

    #[test]
    fn send_or_apply_sends_to_connected_device() {
        let (registry, _) = known_registry();
        let (_connection, outbound) = connect(&registry, "c1");

        registry.send_or_apply(DEVICE, &Command::of("CR")).unwrap();
        assert_eq!(outbound.contents(), vec!["CR"]);
        assert_eq!(registry.welcome_jobs(), 0);
    }

    #[test]
    fn welcome_job_admits_device_and_runs_once() {
        let (registry, store) = registry_with(config());
        registry
            .send_or_apply(DEVICE, &Command::of("FIND"))
            .unwrap();
        registry
            .send_or_apply(DEVICE, &Command::of("CR"))
            .unwrap();
        assert_eq!(registry.welcome_jobs(), 1);

        let (connection, outbound) = recorded_connection("c1");
        registry.on_message(&message(LINK), &connection).unwrap();
        registry.on_message(&message(LINK), &connection).unwrap();

        assert!(registry.is_connected(DEVICE));
        assert_eq!(registry.welcome_jobs(), 0);
        assert_eq!(outbound.contents(), vec!["CR", "LK", "LK"]);
        assert!(store
            .messages()
            .unwrap()
            .iter()
            .any(|m| m.source == Source::Platform && m.kind == "CR"));

        // A physical reconnect inside the TTL does not replay it.
        let (_, second_out) = connect(&registry, "c2");
        assert!(second_out.text().is_empty());
    }

    #[test]
    fn expired_welcome_job_never_runs() {
        let (registry, store) = registry_with(RegistryConfig {
            device_job_ttl: Duration::from_millis(10),
            ..config()
        });
        store.add_device(DEVICE).unwrap();
        registry
            .send_or_apply(DEVICE, &Command::of("CR"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let (connection, outbound) = recorded_connection("c1");
        registry.on_message(&message(LINK), &connection).unwrap();
        assert_eq!(outbound.contents(), vec!["LK"]);
        assert_eq!(registry.welcome_jobs(), 1);

        registry.clean();
        assert_eq!(registry.welcome_jobs(), 0);
        assert!(registry.is_connected(DEVICE));
    }

    #[test]
    fn queued_expired_welcome_job_admits_without_running() {
        let (registry, store) = registry_with(RegistryConfig {
            device_job_ttl: Duration::from_millis(10),
            ..config()
        });
        registry
            .send_or_apply(DEVICE, &Command::of("CR"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.welcome_jobs(), 1);

        let (connection, outbound) = recorded_connection("c1");
        registry.on_message(&message(LINK), &connection).unwrap();
        assert!(registry.is_connected(DEVICE));
        assert_eq!(outbound.contents(), vec!["LK"]);

        let saved = store.messages().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].source, Source::Device);
        assert_eq!(saved[1].kind, "LK");

        registry.clean();
        assert_eq!(registry.welcome_jobs(), 0);
    }

    #[test]
    fn swept_welcome_job_no_longer_admits() {
        let (registry, store) = registry_with(RegistryConfig {
            device_job_ttl: Duration::from_millis(10),
            ..config()
        });
        registry
            .send_or_apply(DEVICE, &Command::of("CR"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        registry.clean();

        let (connection, outbound) = recorded_connection("c1");
        registry.on_message(&message(LINK), &connection).unwrap();
        assert!(registry.is_empty());
        assert!(outbound.text().is_empty());
        assert!(store.messages().unwrap().is_empty());
    }

    #[test]
    fn apply_then_execute_sends_staged_command_once() {
        let (registry, _) = known_registry();
        let (_connection, outbound) = connect(&registry, "c1");

        registry
            .apply(&user(), DEVICE, Command::of("POWEROFF"))
            .unwrap();
        let token = sent_token(&outbound);
        assert_eq!(token.len(), 6);
        assert!(token.bytes().all(|b| b.is_ascii_digit()));
        assert!(!outbound.contents().contains(&"POWEROFF".to_string()));

        let token = UserToken::new(user().id, token);
        registry.execute(&token, DEVICE).unwrap();
        assert_eq!(outbound.contents().last().unwrap(), "POWEROFF");
        assert_eq!(registry.select(&[DEVICE.to_string()])[0].pending(), 0);

        let err = registry.execute(&token, DEVICE).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidToken {
                mismatch: TokenMismatch::Unknown,
                ..
            }
        ));
    }

    #[test]
    fn token_presented_by_other_user_is_rejected() {
        let (registry, _) = known_registry();
        let (_connection, outbound) = connect(&registry, "c1");
        registry
            .apply(&user(), DEVICE, Command::of("POWEROFF"))
            .unwrap();
        let token = sent_token(&outbound);

        let err = registry
            .execute(&UserToken::new(99, token), DEVICE)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidToken {
                mismatch: TokenMismatch::OtherUser,
                ..
            }
        ));
        assert!(!outbound.contents().contains(&"POWEROFF".to_string()));
    }

    #[test]
    fn expired_token_fails_without_sweep() {
        let (registry, store) = registry_with(RegistryConfig {
            token_ttl: Duration::from_millis(10),
            ..config()
        });
        store.add_device(DEVICE).unwrap();
        let (_connection, outbound) = connect(&registry, "c1");
        registry
            .apply(&user(), DEVICE, Command::of("POWEROFF"))
            .unwrap();
        let token = UserToken::new(user().id, sent_token(&outbound));
        std::thread::sleep(Duration::from_millis(30));

        let err = registry.execute(&token, DEVICE).unwrap_err();
        assert!(matches!(err, DeviceError::ExpiredToken(_)));
        assert!(!outbound.contents().contains(&"POWEROFF".to_string()));
    }

    #[test]
    fn clean_purges_expired_tokens() {
        let (registry, store) = registry_with(RegistryConfig {
            token_ttl: Duration::from_millis(10),
            ..config()
        });
        store.add_device(DEVICE).unwrap();
        connect(&registry, "c1");
        registry
            .apply(&user(), DEVICE, Command::of("POWEROFF"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));

        registry.clean();
        assert_eq!(registry.select(&[DEVICE.to_string()])[0].pending(), 0);
    }

    #[test]
    fn token_operations_on_unknown_device_fail() {
        let (registry, _) = known_registry();
        assert!(matches!(
            registry.apply(&user(), DEVICE, Command::of("POWEROFF")),
            Err(DeviceError::UnknownDevice(_))
        ));
        assert!(matches!(
            registry.execute(&UserToken::new(7, "000000"), DEVICE),
            Err(DeviceError::UnknownDevice(_))
        ));
    }

    #[test]
    fn select_last_remove_and_alarm_off() {
        let (registry, _) = known_registry();
        let (connection, _) = recorded_connection("c1");
        let alarm = Message::from_device(Packet::new(
            "3G",
            DEVICE,
            "AL",
            &["180916,025723,A,22.57,N,113.86,E,0,0,0,6,100,60,1200".to_string()],
        ));
        registry.on_message(&alarm, &connection).unwrap();

        let selected = registry.select(&[DEVICE.to_string(), "missing".to_string()]);
        assert_eq!(selected.len(), 1);
        assert!(selected[0].alarm());
        assert_eq!(registry.last(DEVICE), Some(alarm.timestamp));
        assert_eq!(registry.last("missing"), None);

        registry.alarm_off(DEVICE);
        assert!(!selected[0].alarm());
        registry.alarm_off("missing");

        assert!(registry.remove(DEVICE).is_some());
        assert!(registry.remove(DEVICE).is_none());
        assert!(!registry.is_connected(DEVICE));
    }

    #[test]
    fn numeric_tokens_have_requested_length() {
        for length in [1, 6, 12] {
            let token = numeric_token(length);
            assert_eq!(token.len(), length);
            assert!(token.bytes().all(|b| b.is_ascii_digit()));
        }
    }
}
