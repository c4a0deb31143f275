//! Per-controller session state machine.
//!
//! A [`ControllerSession`] owns the online/offline state of one logical
//! controller, the tables of requests awaiting results, and the dispatch of
//! inbound messages to its observer. Transport is delegated to a
//! [`ConnectionSupervisor`](crate::supervisor::ConnectionSupervisor) task
//! started by [`ControllerSession::start`].

use async_trait::async_trait;
use dashmap::DashMap;
use prost::Message;
use spcore_wire::{
    ConfigChange, ConfigChangeResult, DeviceActionRequest, DeviceActionResult, Event,
    EventFlow, EventFlowControl, Identification, MessageKind, ProtocolCapabilities,
    SpCoreMessage, MAX_BODY_LENGTH,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, SessionTimings};
use crate::handle::{HandleCell, SessionHandle};
use crate::io::{Outbound, SessionLink};
use crate::observer::{ControllerState, SessionObserver};
use crate::signal::{StopSignal, StopTrigger};
use crate::supervisor::ConnectionSupervisor;
use crate::transport::TlsContext;
use crate::SessionError;

/// Body limit assumed until the peer identifies
pub const INITIAL_MAX_BODY_LENGTH: u32 = 0x0003_ffff;

/// Protocol version announced in this side's Identification
pub const PROTOCOL_VERSION: &str = "0.1";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn prefix_for(id: u64, config: &ControllerConfig) -> String {
    format!("[{}] [{}] ", id, config.display_name())
}

/// Settings shared by every session of a fleet
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    /// TLS context for handshakes
    pub tls: TlsContext,
    /// Timing knobs
    pub timings: SessionTimings,
    /// Reject inbound controllers that omit a configured password
    pub strict_identity: bool,
}

/// Socket accepted by the fleet listener for an inbound session
pub(crate) struct AcceptedSocket {
    pub stream: TcpStream,
    pub host: String,
}

#[derive(Default)]
struct Lifecycle {
    online: bool,
    observer: Option<Arc<dyn SessionObserver>>,
}

struct SessionInner {
    id: u64,
    log_prefix: RwLock<String>,
    outgoing: bool,
    settings: SessionSettings,
    config: RwLock<ControllerConfig>,

    stopping: AtomicBool,
    closed: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    identification: RwLock<Option<Identification>>,
    max_body_length: AtomicU32,
    last_error: Mutex<Option<String>>,

    next_config_change_id: AtomicI64,
    next_device_action_id: AtomicI64,
    pending_config_changes: DashMap<i64, ConfigChange>,
    pending_device_actions: DashMap<i64, DeviceActionRequest>,

    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    handle: Mutex<Option<Weak<HandleCell>>>,
    sockets_tx: mpsc::Sender<AcceptedSocket>,
    sockets_rx: Mutex<Option<mpsc::Receiver<AcceptedSocket>>>,
    stop: StopTrigger,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// One logical controller and its (re)connecting transport
#[derive(Clone)]
pub struct ControllerSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ControllerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerSession")
            .field("id", &self.inner.id)
            .field("outgoing", &self.inner.outgoing)
            .field("online", &self.is_online())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

impl ControllerSession {
    /// Create a session; nothing happens on the network until [`start`](Self::start)
    pub fn new(id: u64, config: ControllerConfig, settings: SessionSettings) -> Self {
        let (sockets_tx, sockets_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(SessionInner {
                id,
                log_prefix: RwLock::new(prefix_for(id, &config)),
                outgoing: config.dials_out,
                settings,
                config: RwLock::new(config),
                stopping: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::default()),
                identification: RwLock::new(None),
                max_body_length: AtomicU32::new(INITIAL_MAX_BODY_LENGTH),
                last_error: Mutex::new(None),
                next_config_change_id: AtomicI64::new(1),
                next_device_action_id: AtomicI64::new(1),
                pending_config_changes: DashMap::new(),
                pending_device_actions: DashMap::new(),
                outbound: Mutex::new(None),
                handle: Mutex::new(None),
                sockets_tx,
                sockets_rx: Mutex::new(Some(sockets_rx)),
                stop: StopTrigger::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Fleet-unique id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Prefix used on every log line for this session
    pub fn log_prefix(&self) -> String {
        read(&self.inner.log_prefix).clone()
    }

    /// Whether this side dials the controller
    pub fn is_outgoing(&self) -> bool {
        self.inner.outgoing
    }

    /// Current controller configuration
    pub fn config(&self) -> ControllerConfig {
        read(&self.inner.config).clone()
    }

    /// Whether the controller has identified on the current connection
    pub fn is_online(&self) -> bool {
        lock(&self.inner.lifecycle).online
    }

    /// Whether [`stop`](Self::stop) has been called
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Whether the supervisor has exited; inbound sessions close after one connection
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Identification received on the current connection
    pub fn identification(&self) -> Option<Identification> {
        read(&self.inner.identification).clone()
    }

    /// Body limit negotiated with the peer
    pub fn max_body_length(&self) -> u32 {
        self.inner.max_body_length.load(Ordering::SeqCst)
    }

    /// Text of the fault that ended the most recent connection
    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    /// Number of config changes awaiting a result
    pub fn pending_config_changes(&self) -> usize {
        self.inner.pending_config_changes.len()
    }

    /// Number of device actions awaiting a result
    pub fn pending_device_actions(&self) -> usize {
        self.inner.pending_device_actions.len()
    }

    /// Replace the observer
    pub fn set_observer(&self, observer: Option<Arc<dyn SessionObserver>>) {
        lock(&self.inner.lifecycle).observer = observer;
    }

    /// Spawn the connection supervisor. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<(), SessionError> {
        if self.is_stopping() {
            return Err(SessionError::Stopped);
        }
        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor.is_some() {
            return Ok(());
        }
        let Some(sockets) = lock(&self.inner.sockets_rx).take() else {
            return Ok(());
        };
        let task = ConnectionSupervisor::new(self.clone(), sockets);
        *supervisor = Some(tokio::spawn(task.run()));
        info!(
            "{}Start: {}",
            self.log_prefix(),
            if self.inner.outgoing {
                "dialing controller"
            } else {
                "awaiting inbound connection"
            }
        );
        Ok(())
    }

    /// Stop the session and wait (bounded) for its connection to close.
    ///
    /// No observer callbacks fire once this has been called.
    pub async fn stop(&self) {
        if !self.inner.stopping.swap(true, Ordering::SeqCst) {
            info!("{}Stop", self.log_prefix());
        }
        self.inner.stop.trigger();

        let task = lock(&self.inner.supervisor).take();
        if let Some(mut task) = task {
            let limit = self.inner.settings.timings.stop_timeout;
            if tokio::time::timeout(limit, &mut task).await.is_err() {
                warn!(
                    "{}Stop: supervisor did not exit within {:?}, aborting",
                    self.log_prefix(), limit
                );
                task.abort();
            }
        }

        self.detach_outbound();
        let mut lifecycle = lock(&self.inner.lifecycle);
        lifecycle.online = false;
        lifecycle.observer = None;
    }

    /// Send a configuration change; the result arrives through the observer.
    ///
    /// Assigns the next request id when the change has none and returns the id used.
    pub fn send_config_change(&self, mut change: ConfigChange) -> Result<i64, SessionError> {
        self.ensure_running()?;
        let request_id = *change.request_id.get_or_insert_with(|| {
            self.inner
                .next_config_change_id
                .fetch_add(1, Ordering::SeqCst)
        });

        let message = SpCoreMessage::config_change(change.clone());
        self.check_size(&message)?;

        self.inner.pending_config_changes.insert(request_id, change);
        if let Err(e) = self.enqueue(Outbound::Message(message)) {
            self.inner.pending_config_changes.remove(&request_id);
            return Err(e);
        }
        debug!(
            "{}SendConfigChange: request {} queued",
            self.log_prefix(), request_id
        );
        Ok(request_id)
    }

    /// Send a device action; the result arrives through the observer.
    ///
    /// Both `action_type` and `device_id` must be set.
    pub fn send_device_action(&self, mut action: DeviceActionRequest) -> Result<i64, SessionError> {
        self.ensure_running()?;
        if action.action_type.is_none() {
            return Err(SessionError::MissingField("action_type"));
        }
        if action.device_id.is_none() {
            return Err(SessionError::MissingField("device_id"));
        }
        let request_id = *action.request_id.get_or_insert_with(|| {
            self.inner
                .next_device_action_id
                .fetch_add(1, Ordering::SeqCst)
        });

        let message = SpCoreMessage::device_action(action.clone());
        self.check_size(&message)?;

        self.inner.pending_device_actions.insert(request_id, action);
        if let Err(e) = self.enqueue(Outbound::Message(message)) {
            self.inner.pending_device_actions.remove(&request_id);
            return Err(e);
        }
        debug!(
            "{}SendDeviceAction: request {} queued",
            self.log_prefix(), request_id
        );
        Ok(request_id)
    }

    /// Ask the controller to deliver events continuously
    pub fn start_event_stream(&self) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.enqueue(Outbound::Message(SpCoreMessage::event_flow_control(
            EventFlowControl {
                flow: Some(EventFlow::StartContinuous as i32),
                consume: Vec::new(),
            },
        )))
    }

    /// Tell the controller which events have been consumed
    pub fn acknowledge_events(&self, ids: &HashSet<i64>) -> Result<(), SessionError> {
        self.ensure_running()?;
        let mut consume: Vec<i64> = ids.iter().copied().collect();
        consume.sort_unstable();
        let message = SpCoreMessage::event_flow_control(EventFlowControl {
            flow: None,
            consume,
        });
        self.check_size(&message)?;
        self.enqueue(Outbound::Message(message))
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.is_stopping() {
            return Err(SessionError::Stopped);
        }
        Ok(())
    }

    fn check_size(&self, message: &SpCoreMessage) -> Result<(), SessionError> {
        let size = message.encoded_len();
        let max = self.max_body_length().min(MAX_BODY_LENGTH);
        if size > max as usize {
            return Err(SessionError::Oversize { size, max });
        }
        Ok(())
    }

    fn enqueue(&self, item: Outbound) -> Result<(), SessionError> {
        let outbound = lock(&self.inner.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(SessionError::NotConnected);
        };
        tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::QueueFull,
            TrySendError::Closed(_) => SessionError::NotConnected,
        })
    }

    /// Observer, but only while online and not stopping
    fn active_observer(&self) -> Option<Arc<dyn SessionObserver>> {
        let lifecycle = lock(&self.inner.lifecycle);
        if !lifecycle.online || self.is_stopping() {
            return None;
        }
        lifecycle.observer.clone()
    }

    /// Run `f` with the value observers should see: the handle when one fronts this session
    fn with_facade(&self, f: impl FnOnce(&dyn ControllerState)) {
        let handle = lock(&self.inner.handle)
            .as_ref()
            .and_then(Weak::upgrade)
            .map(SessionHandle::from_cell);
        match handle {
            Some(handle) => f(&handle),
            None => f(self),
        }
    }

    fn dispatch_message(&self, message: SpCoreMessage) -> Result<(), SessionError> {
        if self.is_stopping() {
            return Ok(());
        }

        let kind = message.kind();
        match kind {
            MessageKind::Ping => return Ok(()),
            MessageKind::Terminate => {
                return Err(SessionError::Terminated {
                    reason: message.termination_reason(),
                })
            }
            MessageKind::Identification => {
                self.on_identification(message.identification.unwrap_or_default());
                return Ok(());
            }
            _ => {}
        }

        let mut handled = false;
        if let Some(result) = &message.config_change_result {
            self.on_config_change_result(result);
            handled = true;
        }
        if let Some(result) = &message.device_action_result {
            self.on_device_action_result(result);
            handled = true;
        }
        if !message.events.is_empty() {
            self.on_events(&message.events);
            handled = true;
        } else if kind == MessageKind::EventBatch {
            handled = true;
        }

        if !handled {
            debug!("{}Read: unhandled {:?}", self.log_prefix(), kind);
            if let Some(observer) = self.active_observer() {
                self.with_facade(|session| observer.on_unhandled_message(session, &message));
            }
        }
        Ok(())
    }

    fn on_identification(&self, identification: Identification) {
        info!(
            "{}Read: Identification id='{}' software={} protocol={} max_body_length={}",
            self.log_prefix(),
            identification.id(),
            identification.software_version(),
            identification.protocol_version(),
            identification.max_body_length()
        );
        if let Some(max) = identification.max_body_length.filter(|max| *max > 0) {
            self.inner.max_body_length.store(max, Ordering::SeqCst);
        }
        *write(&self.inner.identification) = Some(identification);

        let observer = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if self.is_stopping() || lifecycle.online {
                return;
            }
            lifecycle.online = true;
            lifecycle.observer.clone()
        };
        if let Some(observer) = observer {
            self.with_facade(|session| observer.on_online(session));
        }
    }

    fn on_config_change_result(&self, result: &ConfigChangeResult) {
        let Some((_, change)) = self.inner.pending_config_changes.remove(&result.request_id) else {
            warn!(
                "{}Read: no pending config change for request {}",
                self.log_prefix(), result.request_id
            );
            return;
        };
        debug!(
            "{}Read: config change {} {}",
            self.log_prefix(),
            result.request_id,
            if result.is_success() { "succeeded" } else { "failed" }
        );
        if let Some(observer) = self.active_observer() {
            self.with_facade(|session| observer.on_config_change_result(session, &change, result));
        }
    }

    fn on_device_action_result(&self, result: &DeviceActionResult) {
        let Some((_, action)) = self.inner.pending_device_actions.remove(&result.request_id) else {
            warn!(
                "{}Read: no pending device action for request {}",
                self.log_prefix(), result.request_id
            );
            return;
        };
        if let Some(observer) = self.active_observer() {
            self.with_facade(|session| observer.on_device_action_result(session, &action, result));
        }
    }

    fn on_events(&self, events: &[Event]) {
        debug!("{}Read: {} events", self.log_prefix(), events.len());
        if let Some(observer) = self.active_observer() {
            self.with_facade(|session| observer.on_events(session, events));
        }
    }

    /// Online to offline transition; fires `on_offline` at most once per connection
    fn go_offline(&self, reason: &str) {
        let observer = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            if !lifecycle.online {
                return;
            }
            lifecycle.online = false;
            if self.is_stopping() {
                None
            } else {
                lifecycle.observer.clone()
            }
        };
        *write(&self.inner.identification) = None;
        info!("{}Offline: {}", self.log_prefix(), reason);
        if let Some(observer) = observer {
            self.with_facade(|session| observer.on_offline(session));
        }
    }

    // Supervisor and fleet hooks

    pub(crate) fn timings(&self) -> &SessionTimings {
        &self.inner.settings.timings
    }

    pub(crate) fn tls(&self) -> &TlsContext {
        &self.inner.settings.tls
    }

    pub(crate) fn stop_signal(&self) -> StopSignal {
        self.inner.stop.signal()
    }

    pub(crate) fn attach_outbound(&self, tx: mpsc::Sender<Outbound>) {
        *lock(&self.inner.outbound) = Some(tx);
    }

    pub(crate) fn detach_outbound(&self) {
        lock(&self.inner.outbound).take();
    }

    pub(crate) fn on_connection_closed(&self, fault: Option<SessionError>) {
        self.detach_outbound();
        let reason = match fault {
            Some(fault) => {
                let text = fault.to_string();
                *lock(&self.inner.last_error) = Some(text.clone());
                text
            }
            None => "connection closed".to_string(),
        };
        self.go_offline(&reason);
    }

    pub(crate) fn on_connect_timeout(&self, err: &SessionError) {
        warn!(
            "{}Run: no connection established within {:?}: {}",
            self.log_prefix(), self.inner.settings.timings.offline_after, err
        );
        *lock(&self.inner.last_error) = Some(err.to_string());
        self.go_offline("connect timeout");
    }

    pub(crate) fn on_supervisor_stopped(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.go_offline("supervisor stopped");
        debug!("{}Run: supervisor exited", self.log_prefix());
    }

    /// Hand an accepted socket to an inbound session's supervisor
    pub(crate) fn deliver_socket(&self, stream: TcpStream, host: String) -> Result<(), SessionError> {
        if self.inner.outgoing {
            return Err(SessionError::Config(
                "outgoing session cannot take an accepted socket".into(),
            ));
        }
        self.inner
            .sockets_tx
            .try_send(AcceptedSocket { stream, host })
            .map_err(|e| match e {
                TrySendError::Full(_) => SessionError::QueueFull,
                TrySendError::Closed(_) => SessionError::Stopped,
            })
    }

    /// Queue this side's Identification on the current connection
    pub(crate) fn send_identification(&self) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.enqueue(Outbound::Identification)
    }

    pub(crate) fn attach_handle(&self, handle: &SessionHandle) {
        *lock(&self.inner.handle) = Some(handle.downgrade());
    }

    /// Take the configuration of the session this one replaces
    /// Take over a configured controller's settings and log name
    pub(crate) fn adopt_config(&self, config: ControllerConfig) {
        *write(&self.inner.log_prefix) = prefix_for(self.inner.id, &config);
        *write(&self.inner.config) = config;
    }

    /// Remove the observer; returns it and whether the session was online
    pub(crate) fn take_observer(&self) -> (Option<Arc<dyn SessionObserver>>, bool) {
        let mut lifecycle = lock(&self.inner.lifecycle);
        let was_online = std::mem::take(&mut lifecycle.online);
        (lifecycle.observer.take(), was_online)
    }

    /// Validate the received Identification's password (inbound sessions only)
    pub(crate) fn check_identification(&self) -> Result<(), SessionError> {
        if self.inner.outgoing {
            return Ok(());
        }
        let prefix = self.log_prefix();
        let received = self
            .identification()
            .and_then(|identification| identification.password)
            .filter(|password| !password.is_empty());
        let expected = self.config().password.filter(|password| !password.is_empty());

        match (expected, received) {
            (None, _) => {
                warn!("{}Identification: no password configured for this controller", prefix);
                Ok(())
            }
            (Some(_), None) if self.inner.settings.strict_identity => Err(SessionError::Identity(
                "controller sent no password".into(),
            )),
            (Some(_), None) => {
                warn!("{}Identification: controller sent no password, accepting", prefix);
                Ok(())
            }
            (Some(expected), Some(received)) if expected == received => {
                info!("{}Identification: password verified", prefix);
                Ok(())
            }
            (Some(_), Some(_)) => Err(SessionError::Identity("incorrect password".into())),
        }
    }

    #[cfg(test)]
    pub(crate) fn observer_for_test(&self) -> Option<Arc<dyn SessionObserver>> {
        lock(&self.inner.lifecycle).observer.clone()
    }
}

impl SessionLink for ControllerSession {
    fn log_prefix(&self) -> String {
        ControllerSession::log_prefix(self)
    }

    fn dispatch(&self, message: SpCoreMessage) -> Result<(), SessionError> {
        self.dispatch_message(message)
    }

    fn local_identification(&self) -> SpCoreMessage {
        let password = read(&self.inner.config).password.clone();
        SpCoreMessage::identification(Identification {
            id: Some(String::new()),
            software_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
            max_body_length: Some(MAX_BODY_LENGTH),
            password,
            capabilities: Some(ProtocolCapabilities {
                supports_identification_password: Some(true),
                supports_identification_password_upstream: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ControllerState for ControllerSession {
    fn is_online(&self) -> bool {
        ControllerSession::is_online(self)
    }

    fn is_stopping(&self) -> bool {
        ControllerSession::is_stopping(self)
    }

    fn log_prefix(&self) -> String {
        ControllerSession::log_prefix(self)
    }

    fn identification(&self) -> Option<Identification> {
        ControllerSession::identification(self)
    }

    fn send_config_change(&self, change: ConfigChange) -> Result<i64, SessionError> {
        ControllerSession::send_config_change(self, change)
    }

    fn send_device_action(&self, action: DeviceActionRequest) -> Result<i64, SessionError> {
        ControllerSession::send_device_action(self, action)
    }

    fn start_event_stream(&self) -> Result<(), SessionError> {
        ControllerSession::start_event_stream(self)
    }

    fn acknowledge_events(&self, ids: &HashSet<i64>) -> Result<(), SessionError> {
        ControllerSession::acknowledge_events(self, ids)
    }

    async fn stop(&self) {
        ControllerSession::stop(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spcore_wire::{ConfigRecord, DeviceActionType, TerminationReason};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SessionObserver for Recorder {
        fn on_online(&self, _session: &dyn ControllerState) {
            self.calls.lock().unwrap().push("online".into());
        }

        fn on_offline(&self, _session: &dyn ControllerState) {
            self.calls.lock().unwrap().push("offline".into());
        }

        fn on_config_change_result(
            &self,
            _session: &dyn ControllerState,
            change: &ConfigChange,
            result: &ConfigChangeResult,
        ) {
            self.calls.lock().unwrap().push(format!(
                "config {} {} {}",
                result.request_id,
                change.schedules.first().map(|s| s.name()).unwrap_or(""),
                result.is_success()
            ));
        }

        fn on_device_action_result(
            &self,
            _session: &dyn ControllerState,
            action: &DeviceActionRequest,
            result: &DeviceActionResult,
        ) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("action {} {}", result.request_id, action.device_id()));
        }

        fn on_events(&self, _session: &dyn ControllerState, events: &[Event]) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("events {}", events.len()));
        }

        fn on_unhandled_message(&self, _session: &dyn ControllerState, message: &SpCoreMessage) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("unhandled {:?}", message.kind()));
        }
    }

    /// Session with a live outbound queue but no supervisor
    fn connected(config: ControllerConfig) -> (ControllerSession, Arc<Recorder>, mpsc::Receiver<Outbound>) {
        let session = ControllerSession::new(1, config, SessionSettings::default());
        let recorder = Arc::new(Recorder::default());
        session.set_observer(Some(recorder.clone()));
        let (tx, rx) = mpsc::channel(16);
        session.attach_outbound(tx);
        (session, recorder, rx)
    }

    fn identify(session: &ControllerSession, max_body_length: u32, password: Option<&str>) {
        session
            .dispatch_message(SpCoreMessage::identification(Identification {
                id: Some("AA:BB:CC:DD:EE:FF".into()),
                protocol_version: Some("0.1".into()),
                max_body_length: Some(max_body_length),
                password: password.map(str::to_string),
                ..Default::default()
            }))
            .unwrap();
    }

    fn schedule_change(name: &str) -> ConfigChange {
        ConfigChange {
            schedules: vec![ConfigRecord::named(1, name)],
            ..Default::default()
        }
    }

    #[test]
    fn test_identification_brings_session_online_once() {
        let (session, recorder, _rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));
        assert_eq!(session.max_body_length(), INITIAL_MAX_BODY_LENGTH);

        identify(&session, 4096, None);
        identify(&session, 4096, None);

        assert!(session.is_online());
        assert_eq!(session.max_body_length(), 4096);
        assert_eq!(recorder.calls(), vec!["online"]);
        assert_eq!(session.identification().unwrap().id(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_results_match_by_request_id_in_any_order() {
        let (session, recorder, mut rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));
        identify(&session, MAX_BODY_LENGTH, None);

        let first = session.send_config_change(schedule_change("first")).unwrap();
        let second = session.send_config_change(schedule_change("second")).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(session.pending_config_changes(), 2);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Message(_))));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Message(_))));

        session
            .dispatch_message(SpCoreMessage::config_change_result(second, None))
            .unwrap();
        session
            .dispatch_message(SpCoreMessage::config_change_result(
                first,
                Some("rejected".into()),
            ))
            .unwrap();

        assert_eq!(
            recorder.calls(),
            vec!["online", "config 2 second true", "config 1 first false"]
        );
        assert_eq!(session.pending_config_changes(), 0);
    }

    #[test]
    fn test_duplicate_result_is_dropped() {
        let (session, recorder, _rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));
        identify(&session, MAX_BODY_LENGTH, None);

        let id = session.send_config_change(schedule_change("only")).unwrap();
        for _ in 0..2 {
            session
                .dispatch_message(SpCoreMessage::config_change_result(id, None))
                .unwrap();
        }
        assert_eq!(recorder.calls(), vec!["online", "config 1 only true"]);
    }

    #[test]
    fn test_oversize_change_never_queued() {
        let (session, _recorder, mut rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));
        identify(&session, 64, None);

        let result = session.send_config_change(schedule_change(&"x".repeat(200)));
        assert!(matches!(result, Err(SessionError::Oversize { max: 64, .. })));
        assert_eq!(session.pending_config_changes(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_change_above_frame_limit_rejected_despite_larger_peer_limit() {
        let (session, recorder, mut rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));
        identify(&session, INITIAL_MAX_BODY_LENGTH, None);
        assert_eq!(session.max_body_length(), INITIAL_MAX_BODY_LENGTH);

        let result = session.send_config_change(schedule_change(&"x".repeat(150_000)));
        assert!(matches!(
            result,
            Err(SessionError::Oversize { max, .. }) if max == MAX_BODY_LENGTH
        ));
        assert_eq!(session.pending_config_changes(), 0);
        assert!(rx.try_recv().is_err());
        assert!(session.is_online());
        assert_eq!(recorder.calls(), vec!["online"]);
    }

    #[test]
    fn test_adopted_config_renames_log_prefix() {
        let session = ControllerSession::new(
            9,
            ControllerConfig {
                name: Some("pending 10.0.0.5:50123".into()),
                ..Default::default()
            },
            SessionSettings::default(),
        );
        assert_eq!(session.log_prefix(), "[9] [pending 10.0.0.5:50123] ");

        session.adopt_config(ControllerConfig::inbound("AA:BB:CC:DD:EE:FF").with_name("front-door"));
        assert_eq!(session.log_prefix(), "[9] [front-door] ");
        assert_eq!(session.config().display_name(), "front-door");
    }

    #[test]
    fn test_device_action_requires_type_and_device() {
        let (session, recorder, _rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));
        identify(&session, MAX_BODY_LENGTH, None);

        let missing_type = DeviceActionRequest {
            device_id: Some(5),
            ..Default::default()
        };
        assert!(matches!(
            session.send_device_action(missing_type),
            Err(SessionError::MissingField("action_type"))
        ));
        let missing_device = DeviceActionRequest {
            action_type: Some(DeviceActionType::DoorMomentaryUnlock as i32),
            ..Default::default()
        };
        assert!(matches!(
            session.send_device_action(missing_device),
            Err(SessionError::MissingField("device_id"))
        ));

        let id = session
            .send_device_action(DeviceActionRequest {
                action_type: Some(DeviceActionType::DoorMomentaryUnlock as i32),
                device_id: Some(5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(id, 1);
        session
            .dispatch_message(SpCoreMessage::device_action_result(id, None))
            .unwrap();
        assert_eq!(recorder.calls(), vec!["online", "action 1 5"]);
    }

    #[test]
    fn test_events_and_passthrough() {
        let (session, recorder, _rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));

        // Not online yet: no callbacks.
        session
            .dispatch_message(SpCoreMessage::event_batch(vec![Event::default()]))
            .unwrap();
        identify(&session, MAX_BODY_LENGTH, None);

        session
            .dispatch_message(SpCoreMessage::event_batch(Vec::new()))
            .unwrap();
        session
            .dispatch_message(SpCoreMessage::event_batch(vec![
                Event::default(),
                Event::default(),
            ]))
            .unwrap();
        session
            .dispatch_message(SpCoreMessage::of_kind(MessageKind::DeviceStateRecord))
            .unwrap();

        assert_eq!(
            recorder.calls(),
            vec!["online", "events 2", "unhandled DeviceStateRecord"]
        );
    }

    #[test]
    fn test_terminate_is_a_fault() {
        let (session, _recorder, _rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));
        let result = session.dispatch_message(SpCoreMessage::terminate(
            TerminationReason::IdentificationRejected,
        ));
        assert!(matches!(
            result,
            Err(SessionError::Terminated {
                reason: TerminationReason::IdentificationRejected
            })
        ));
    }

    #[test]
    fn test_offline_fires_once_per_connection() {
        let (session, recorder, _rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));
        session.on_connection_closed(None);
        identify(&session, MAX_BODY_LENGTH, None);
        session.on_connection_closed(Some(SessionError::IdleTimeout(
            std::time::Duration::from_secs(20),
        )));
        session.on_connect_timeout(&SessionError::NotConnected);
        session.on_supervisor_stopped();

        assert_eq!(recorder.calls(), vec!["online", "offline"]);
        assert!(session.last_error().is_some());
        assert!(session.identification().is_none());
    }

    #[tokio::test]
    async fn test_stopped_session_rejects_requests_and_stays_silent() {
        let (session, recorder, _rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));
        identify(&session, MAX_BODY_LENGTH, None);
        session.stop().await;

        assert!(matches!(
            session.send_config_change(schedule_change("late")),
            Err(SessionError::Stopped)
        ));
        assert!(matches!(
            session.start_event_stream(),
            Err(SessionError::Stopped)
        ));
        session
            .dispatch_message(SpCoreMessage::event_batch(vec![Event::default()]))
            .unwrap();
        assert_eq!(recorder.calls(), vec!["online"]);
        assert!(session.observer_for_test().is_none());
        assert!(session.start().is_err());
    }

    #[test]
    fn test_not_connected_without_queue() {
        let session = ControllerSession::new(
            1,
            ControllerConfig::outgoing("10.0.0.1", 9730),
            SessionSettings::default(),
        );
        assert!(matches!(
            session.send_config_change(schedule_change("a")),
            Err(SessionError::NotConnected)
        ));
        assert_eq!(session.pending_config_changes(), 0);
    }

    #[test]
    fn test_event_acknowledgement() {
        let (session, _recorder, mut rx) = connected(ControllerConfig::outgoing("10.0.0.1", 9730));
        session.start_event_stream().unwrap();
        session
            .acknowledge_events(&HashSet::from([3, 1, 2]))
            .unwrap();

        let Ok(Outbound::Message(start)) = rx.try_recv() else {
            panic!("expected start message");
        };
        assert_eq!(
            start.event_flow_control.unwrap().flow(),
            EventFlow::StartContinuous
        );
        let Ok(Outbound::Message(ack)) = rx.try_recv() else {
            panic!("expected acknowledgement");
        };
        assert_eq!(ack.event_flow_control.unwrap().consume, vec![1, 2, 3]);
    }

    #[test]
    fn test_password_checks() {
        let inbound = ControllerConfig::inbound("AA:BB:CC:DD:EE:FF").with_password("secret");

        let (session, _, _rx) = connected(inbound.clone());
        identify(&session, MAX_BODY_LENGTH, Some("secret"));
        assert!(session.check_identification().is_ok());

        let (session, _, _rx) = connected(inbound.clone());
        identify(&session, MAX_BODY_LENGTH, Some("wrong"));
        assert!(matches!(
            session.check_identification(),
            Err(SessionError::Identity(_))
        ));

        let (session, _, _rx) = connected(inbound.clone());
        identify(&session, MAX_BODY_LENGTH, None);
        assert!(session.check_identification().is_ok());

        let strict = ControllerSession::new(
            2,
            inbound,
            SessionSettings {
                strict_identity: true,
                ..Default::default()
            },
        );
        identify(&strict, MAX_BODY_LENGTH, None);
        assert!(strict.check_identification().is_err());

        let (unprotected, _, _rx) = connected(ControllerConfig::inbound("AA:BB:CC:DD:EE:FF"));
        identify(&unprotected, MAX_BODY_LENGTH, Some("anything"));
        assert!(unprotected.check_identification().is_ok());
    }

    #[test]
    fn test_local_identification_carries_password() {
        let session = ControllerSession::new(
            1,
            ControllerConfig::outgoing("10.0.0.1", 9730).with_password("pw"),
            SessionSettings::default(),
        );
        let message = SessionLink::local_identification(&session);
        let identification = message.identification.unwrap();
        assert_eq!(identification.id(), "");
        assert_eq!(identification.protocol_version(), PROTOCOL_VERSION);
        assert_eq!(identification.max_body_length(), MAX_BODY_LENGTH);
        assert_eq!(identification.password(), "pw");
    }
}
