use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::command::{Command, UserToken};
use crate::connection::Connection;
use crate::error::{DeviceError, Result, TokenMismatch};
use crate::message::{Link, Location, Message, ALARM, LINK, LOCATION_TYPES};
use crate::temporal::Temporal;

/// Live state of one connected watch.
pub struct Device {
    id: String,
    manufacturer: String,
    connection: RwLock<Arc<Connection>>,
    state: Mutex<State>,
    /// Serializes lazy fills of the cached location and link.
    fill: Mutex<()>,
}

struct State {
    last: DateTime<Utc>,
    location: Option<Location>,
    link: Option<Link>,
    alarm: bool,
    jobs: HashMap<UserToken, Temporal<Command>>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        manufacturer: impl Into<String>,
        connection: Arc<Connection>,
    ) -> Self {
        Self {
            id: id.into(),
            manufacturer: manufacturer.into(),
            connection: RwLock::new(connection),
            state: Mutex::new(State {
                last: Utc::now(),
                location: None,
                link: None,
                alarm: false,
                jobs: HashMap::new(),
            }),
            fill: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    /// The connection commands are currently sent through.
    pub fn connection(&self) -> Arc<Connection> {
        Arc::clone(&self.connection.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Bind `connection` if it is not the current one. The superseded
    /// connection is closed.
    pub fn check(&self, connection: &Arc<Connection>) {
        let stale = {
            let mut current = self
                .connection
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if Arc::ptr_eq(&current, connection) {
                return;
            }
            std::mem::replace(&mut *current, Arc::clone(connection))
        };
        tracing::info!(
            device = %self.id,
            from = stale.id(),
            to = connection.id(),
            "device moved to new connection"
        );
        stale.close();
    }

    pub fn is_closed(&self) -> bool {
        self.connection().is_closed()
    }

    /// Send a command and return it as a platform message.
    pub fn send(&self, command: &Command) -> Result<Message> {
        let message = Message::platform(&self.manufacturer, &self.id, command);
        let connection = self.connection();
        connection.send_packet(&message.to_packet())?;
        tracing::debug!(connection = connection.id(), %message, "<<<");
        Ok(message)
    }

    /// Apply an inbound message to the cached state. Returns the reply the
    /// watch expects, if any.
    pub fn process(&self, message: &Message) -> Option<Command> {
        let kind = message.kind.as_str();

        let location = if LOCATION_TYPES.contains(&kind) {
            match Location::parse(message) {
                Ok(location) => Some(location),
                Err(err) => {
                    tracing::warn!(device = %self.id, %message, error = %err, "unparsable location");
                    None
                }
            }
        } else {
            None
        };

        let link = if kind == LINK {
            match Link::parse(message) {
                Ok(link) => Some(link),
                Err(err) => {
                    tracing::debug!(device = %self.id, error = %err, "keep-alive without counters");
                    None
                }
            }
        } else {
            None
        };

        let mut state = self.state();
        state.last = message.timestamp;
        if let Some(location) = location {
            state.location = Some(location);
        }
        if let Some(link) = link {
            state.link = Some(link);
        }
        if kind == ALARM {
            state.alarm = true;
            tracing::warn!(device = %self.id, "alarm raised");
        }
        drop(state);

        match kind {
            LINK => Some(Command::of(LINK)),
            ALARM => Some(Command::of(ALARM)),
            _ => None,
        }
    }

    /// Stage a command until `token` is presented.
    pub fn stage(&self, token: UserToken, command: Command) {
        self.state().jobs.insert(token, Temporal::new(command));
    }

    /// Take the command staged for `token`, if it is still valid.
    ///
    /// Both a successful redeem and an expired token remove the entry.
    pub fn redeem(&self, token: &UserToken, ttl: Duration) -> Result<Command> {
        let mut state = self.state();
        let expired = state.jobs.get(token).map(|job| job.is_expired(ttl));
        match expired {
            Some(false) => state
                .jobs
                .remove(token)
                .map(Temporal::into_value)
                .ok_or_else(|| self.invalid(TokenMismatch::Unknown)),
            Some(true) => {
                state.jobs.remove(token);
                tracing::info!(device = %self.id, %token, "expired token presented, job removed");
                Err(DeviceError::ExpiredToken(self.id.clone()))
            }
            None => {
                let mismatch = if state.jobs.keys().any(|k| k.token == token.token) {
                    TokenMismatch::OtherUser
                } else {
                    TokenMismatch::Unknown
                };
                tracing::warn!(device = %self.id, %token, %mismatch, "token rejected");
                Err(self.invalid(mismatch))
            }
        }
    }

    /// Drop staged commands older than `ttl` and return their tokens.
    pub fn clean(&self, ttl: Duration) -> Vec<UserToken> {
        let mut state = self.state();
        let expired: Vec<UserToken> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.is_expired(ttl))
            .map(|(token, _)| token.clone())
            .collect();
        for token in &expired {
            state.jobs.remove(token);
        }
        expired
    }

    /// Number of commands waiting for a token.
    pub fn pending(&self) -> usize {
        self.state().jobs.len()
    }

    /// Last time the watch was heard from.
    pub fn last(&self) -> DateTime<Utc> {
        self.state().last
    }

    pub fn location(&self) -> Option<Location> {
        self.state().location.clone()
    }

    pub fn link(&self) -> Option<Link> {
        self.state().link.clone()
    }

    pub fn alarm(&self) -> bool {
        self.state().alarm
    }

    pub fn alarm_off(&self) {
        self.state().alarm = false;
        tracing::info!(device = %self.id, "alarm cleared");
    }

    /// Cached location, or the result of `fetch` when nothing is cached yet.
    ///
    /// Concurrent callers fetch at most once; a live update that lands while
    /// fetching wins over the fetched value.
    pub fn location_or_fetch(&self, fetch: impl FnOnce() -> Option<Location>) -> Option<Location> {
        self.fill_with(|state| &mut state.location, fetch)
    }

    /// Cached link, or the result of `fetch` when nothing is cached yet.
    pub fn link_or_fetch(&self, fetch: impl FnOnce() -> Option<Link>) -> Option<Link> {
        self.fill_with(|state| &mut state.link, fetch)
    }

    fn fill_with<T: Clone>(
        &self,
        field: fn(&mut State) -> &mut Option<T>,
        fetch: impl FnOnce() -> Option<T>,
    ) -> Option<T> {
        if let Some(value) = field(&mut self.state()).clone() {
            return Some(value);
        }
        let _fill = self.fill.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = field(&mut self.state()).clone() {
            return Some(value);
        }
        let fetched = fetch()?;
        let mut state = self.state();
        Some(field(&mut state).get_or_insert(fetched).clone())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalid(&self, mismatch: TokenMismatch) -> DeviceError {
        DeviceError::InvalidToken {
            device_id: self.id.clone(),
            mismatch,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("manufacturer", &self.manufacturer)
            .field("connection", &self.connection().id().to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kidtracker_frame::Packet;

    use super::*;
    use crate::testing::recorded_connection;

    const UD_PAYLOAD: &str =
        "180916,025723,A,22.570733,N,113.8626083,E,0.00,249.5,0.0,6,100,60,1200,0,00000010";

    fn inbound(kind: &str, payload: &str) -> Message {
        let params = if payload.is_empty() {
            Vec::new()
        } else {
            vec![payload.to_string()]
        };
        Message::from_device(Packet::new("3G", "dev", kind, &params))
    }

    fn device() -> (Device, crate::testing::RecordingOutbound) {
        let (connection, outbound) = recorded_connection("c1");
        (Device::new("dev", "3G", connection), outbound)
    }

    #[test]
    fn send_writes_packet_and_returns_platform_message() {
        let (device, outbound) = device();
        let message = device
            .send(&Command::new("UPLOAD", vec!["600".to_string()]))
            .unwrap();
        assert_eq!(message.source, crate::message::Source::Platform);
        assert_eq!(outbound.text(), "[3G*dev*000A*UPLOAD,600]");
    }

    #[test]
    fn keepalive_updates_link_and_asks_for_reply() {
        let (device, _) = device();
        let reply = device.process(&inbound(LINK, "50,100,90"));
        assert_eq!(reply, Some(Command::of(LINK)));
        assert_eq!(device.link().unwrap().battery, 90);
    }

    #[test]
    fn bare_keepalive_keeps_previous_link() {
        let (device, _) = device();
        device.process(&inbound(LINK, "50,100,90"));
        let reply = device.process(&inbound(LINK, ""));
        assert_eq!(reply, Some(Command::of(LINK)));
        assert_eq!(device.link().unwrap().pedometer, 50);
    }

    #[test]
    fn alarm_sets_flag_and_location() {
        let (device, _) = device();
        let reply = device.process(&inbound(ALARM, UD_PAYLOAD));
        assert_eq!(reply, Some(Command::of(ALARM)));
        assert!(device.alarm());
        assert!(device.location().is_some());

        device.alarm_off();
        assert!(!device.alarm());
    }

    #[test]
    fn location_update_has_no_reply() {
        let (device, _) = device();
        let message = inbound("UD", UD_PAYLOAD);
        assert_eq!(device.process(&message), None);
        assert_eq!(device.location().unwrap().pedometer, 1200);
        assert_eq!(device.last(), message.timestamp);
    }

    #[test]
    fn malformed_location_is_ignored() {
        let (device, _) = device();
        assert_eq!(device.process(&inbound("UD", "garbage")), None);
        assert!(device.location().is_none());
    }

    #[test]
    fn check_rebinds_and_closes_stale_connection() {
        let (first, first_out) = recorded_connection("c1");
        let device = Device::new("dev", "3G", Arc::clone(&first));

        device.check(&first);
        assert!(!first.is_closed());

        let (second, second_out) = recorded_connection("c2");
        device.check(&second);
        assert!(first.is_closed());
        assert_eq!(first_out.shutdowns(), 1);
        assert_eq!(device.connection().id(), "c2");

        device.send(&Command::of("CR")).unwrap();
        assert!(first_out.text().is_empty());
        assert_eq!(second_out.contents(), vec!["CR"]);
    }

    #[test]
    fn redeem_consumes_staged_command_once() {
        let (device, _) = device();
        let token = UserToken::new(1, "123456");
        device.stage(token.clone(), Command::of("POWEROFF"));

        let command = device.redeem(&token, Duration::from_secs(60)).unwrap();
        assert_eq!(command, Command::of("POWEROFF"));
        assert_eq!(device.pending(), 0);

        let err = device.redeem(&token, Duration::from_secs(60)).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidToken {
                mismatch: TokenMismatch::Unknown,
                ..
            }
        ));
    }

    #[test]
    fn redeem_by_other_user_is_rejected() {
        let (device, _) = device();
        device.stage(UserToken::new(1, "123456"), Command::of("POWEROFF"));

        let err = device
            .redeem(&UserToken::new(2, "123456"), Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidToken {
                mismatch: TokenMismatch::OtherUser,
                ..
            }
        ));
        assert_eq!(device.pending(), 1);
    }

    #[test]
    fn expired_token_is_purged_on_redeem() {
        let (device, _) = device();
        let token = UserToken::new(1, "123456");
        device.stage(token.clone(), Command::of("POWEROFF"));
        std::thread::sleep(Duration::from_millis(20));

        let err = device.redeem(&token, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, DeviceError::ExpiredToken(ref id) if id == "dev"));
        assert_eq!(device.pending(), 0);
    }

    #[test]
    fn clean_returns_expired_tokens() {
        let (device, _) = device();
        device.stage(UserToken::new(1, "111111"), Command::of("A"));
        std::thread::sleep(Duration::from_millis(20));
        device.stage(UserToken::new(2, "222222"), Command::of("B"));

        let removed = device.clean(Duration::from_millis(10));
        assert_eq!(removed, vec![UserToken::new(1, "111111")]);
        assert_eq!(device.pending(), 1);
    }

    #[test]
    fn fetch_runs_only_when_cache_is_empty() {
        let (device, _) = device();
        let calls = AtomicUsize::new(0);
        let fetch = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Location::parse(&inbound("UD", UD_PAYLOAD)).ok()
        };

        assert!(device.location_or_fetch(fetch).is_some());
        assert!(device.location_or_fetch(fetch).is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_readers_share_one_fetch() {
        const READERS: usize = 8;
        let (device, _) = device();
        let calls = AtomicUsize::new(0);
        let start = std::sync::Barrier::new(READERS);

        let found = std::thread::scope(|scope| {
            let readers: Vec<_> = (0..READERS)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        device.location_or_fetch(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Location::parse(&inbound("UD", UD_PAYLOAD)).ok()
                        })
                    })
                })
                .collect();
            readers
                .into_iter()
                .map(|reader| reader.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(found.iter().all(|location| location.as_ref().map(|l| l.pedometer) == Some(1200)));
    }

    #[test]
    fn failed_fetch_leaves_cache_empty() {
        let (device, _) = device();
        assert!(device.link_or_fetch(|| None).is_none());
        assert!(device.link().is_none());
    }
}
