//! Fleet manager: owns every controller session, the inbound listener, and
//! the takeover of configured inbound controllers by freshly accepted
//! connections.
//!
//! An accepted socket becomes a *pending* session. Once the peer identifies,
//! the pending session either replaces the stale session behind the matching
//! configured [`SessionHandle`] or is rejected.

use dashmap::DashMap;
use futures::future::{join, join_all};
use spcore_wire::Identification;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfig, FleetConfig};
use crate::controller::{lock, ControllerSession, SessionSettings};
use crate::handle::SessionHandle;
use crate::observer::{ControllerState, FleetObserver, SessionObserver};
use crate::signal::{StopSignal, StopTrigger};
use crate::transport::{listen_tcp, TlsContext};
use crate::SessionError;

const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Source of fleet-unique session ids; clones share the counter
#[derive(Debug, Clone, Default)]
pub struct SessionIds(Arc<AtomicU64>);

impl SessionIds {
    /// Counter starting at 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// A registered controller
#[derive(Debug, Clone)]
pub enum FleetEntry {
    /// Outgoing controller, held directly
    Direct(ControllerSession),
    /// Inbound controller, behind a handle the fleet retargets on reconnect
    Proxied(SessionHandle),
}

impl FleetEntry {
    /// Caller-facing view of the controller
    pub fn state(&self) -> Arc<dyn ControllerState> {
        match self {
            FleetEntry::Direct(session) => Arc::new(session.clone()),
            FleetEntry::Proxied(handle) => Arc::new(handle.clone()),
        }
    }

    /// Session currently serving the controller
    pub fn session(&self) -> Option<ControllerSession> {
        match self {
            FleetEntry::Direct(session) => Some(session.clone()),
            FleetEntry::Proxied(handle) => handle.target(),
        }
    }

    fn is_stopping(&self) -> bool {
        match self {
            FleetEntry::Direct(session) => session.is_stopping(),
            FleetEntry::Proxied(handle) => handle.is_stopping(),
        }
    }

    async fn stop(&self) {
        match self {
            FleetEntry::Direct(session) => session.stop().await,
            FleetEntry::Proxied(handle) => handle.stop().await,
        }
    }
}

struct FleetInner {
    config: FleetConfig,
    settings: SessionSettings,
    ids: SessionIds,
    observer: Option<Arc<dyn FleetObserver>>,
    sessions: DashMap<u64, FleetEntry>,
    pending: DashMap<u64, ControllerSession>,
    local_addr: Option<SocketAddr>,
    shutdown: StopTrigger,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Manages a fleet of controller sessions
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<FleetInner>,
}

impl FleetManager {
    /// Build the TLS context, bind the listener (if configured) and start accepting
    pub async fn start(
        config: FleetConfig,
        observer: Option<Arc<dyn FleetObserver>>,
    ) -> Result<Self, SessionError> {
        Self::start_with_ids(config, observer, SessionIds::new()).await
    }

    /// Like [`start`](Self::start), drawing session ids from a shared counter
    pub async fn start_with_ids(
        config: FleetConfig,
        observer: Option<Arc<dyn FleetObserver>>,
        ids: SessionIds,
    ) -> Result<Self, SessionError> {
        let tls = TlsContext::from_settings(&config.tls, config.server_identity.as_ref())
            .map_err(|e| SessionError::Tls(format!("{:#}", e)))?;
        let settings = SessionSettings {
            tls,
            timings: config.timings.clone(),
            strict_identity: config.strict_identity,
        };

        let listener = match config.listen {
            Some(addr) => Some(listen_tcp(addr).await?),
            None => None,
        };
        let local_addr = listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        if let Some(host) = &config.callback_host {
            match &config.callback_host_secondary {
                Some(secondary) => info!("Fleet: controllers call back to {} (secondary {})", host, secondary),
                None => info!("Fleet: controllers call back to {}", host),
            }
        }

        let inner = Arc::new(FleetInner {
            config,
            settings,
            ids,
            observer,
            sessions: DashMap::new(),
            pending: DashMap::new(),
            local_addr,
            shutdown: StopTrigger::new(),
            listener: Mutex::new(None),
        });

        if let Some(listener) = listener {
            let task = tokio::spawn(accept_loop(inner.clone(), listener, inner.shutdown.signal()));
            *lock(&inner.listener) = Some(task);
        }
        Ok(Self { inner })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Register a controller and start its session.
    ///
    /// Outgoing controllers are dialed immediately. Inbound controllers are
    /// returned as a handle that follows whichever connection currently
    /// serves the controller.
    pub fn add(
        &self,
        config: ControllerConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Arc<dyn ControllerState>, SessionError> {
        if self.inner.shutdown.is_set() {
            return Err(SessionError::Stopped);
        }
        if config.dials_out && config.address.as_deref().map_or(true, str::is_empty) {
            return Err(SessionError::Config("outgoing controller needs an address".into()));
        }
        if !config.dials_out && config.mac_address.as_deref().map_or(true, str::is_empty) {
            return Err(SessionError::Config("inbound controller needs a MAC address".into()));
        }

        self.inner.sweep();
        self.inner.warn_duplicates(&config);

        let id = self.inner.ids.next();
        let session = ControllerSession::new(id, config, self.inner.settings.clone());
        session.set_observer(Some(observer));
        let entry = if session.is_outgoing() {
            FleetEntry::Direct(session.clone())
        } else {
            let handle = SessionHandle::new(id, session.clone());
            session.attach_handle(&handle);
            FleetEntry::Proxied(handle)
        };

        session.start()?;
        self.inner.sessions.insert(id, entry.clone());
        info!("{}Add: registered", session.log_prefix());
        Ok(entry.state())
    }

    /// Snapshot of registered controllers
    pub fn sessions(&self) -> Vec<FleetEntry> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of registered controllers
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether no controllers are registered
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Accepted connections that have not yet been matched to a controller
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stop every session, registered or pending
    pub async fn stop_all(&self) {
        let entries = self.sessions();
        let pending: Vec<ControllerSession> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.pending.clear();

        join(
            join_all(entries.iter().map(|entry| entry.stop())),
            join_all(pending.iter().map(|session| session.stop())),
        )
        .await;
        self.inner.sweep();
    }

    /// Close the listener, then stop every session
    pub async fn shutdown(&self) {
        info!("Fleet: shutting down");
        self.inner.shutdown.trigger();
        let task = lock(&self.inner.listener).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Fleet: listener task failed: {}", e);
            }
        }
        self.stop_all().await;
        info!("Fleet: shutdown complete");
    }
}

impl FleetInner {
    /// Drop registrations whose controller has been stopped
    fn sweep(&self) {
        self.sessions.retain(|id, entry| {
            let keep = !entry.is_stopping();
            if !keep {
                debug!("Fleet: removing stopped controller {}", id);
            }
            keep
        });
    }

    /// Drop pending sessions whose connection ended before identifying
    fn sweep_pending(&self) {
        self.pending.retain(|_, session| !session.is_closed());
    }

    fn warn_duplicates(&self, config: &ControllerConfig) {
        for entry in self.sessions.iter() {
            let Some(existing) = entry.session() else {
                continue;
            };
            if existing.is_stopping() {
                continue;
            }
            let other = existing.config();
            if config.dials_out
                && other.dials_out
                && config.address == other.address
                && config.port_or_default() == other.port_or_default()
            {
                warn!(
                    "{}Add: {} uses the same address as this controller",
                    existing.log_prefix(),
                    config.display_name()
                );
            }
            if let (Some(mac), Some(other_mac)) = (&config.mac_address, &other.mac_address) {
                if mac.eq_ignore_ascii_case(other_mac) {
                    warn!(
                        "{}Add: {} uses the same MAC address as this controller",
                        existing.log_prefix(),
                        config.display_name()
                    );
                }
            }
        }
    }

    /// Wrap an accepted socket in a pending session
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        self.sweep_pending();

        let id = self.ids.next();
        let host = peer.ip().to_string();
        let config = ControllerConfig {
            name: Some(format!("pending {}", peer)),
            address: Some(host.clone()),
            port: Some(peer.port()),
            dials_out: false,
            ..Default::default()
        };
        let session = ControllerSession::new(id, config, self.settings.clone());
        session.set_observer(Some(Arc::new(PendingObserver {
            fleet: Arc::downgrade(self),
            session_id: id,
        })));

        self.pending.insert(id, session.clone());
        match session.start().and_then(|_| session.deliver_socket(stream, host)) {
            Ok(()) => info!("{}Listen: accepted connection from {}", session.log_prefix(), peer),
            Err(e) => {
                warn!("{}Listen: could not start session: {}", session.log_prefix(), e);
                self.pending.remove(&id);
                spawn_stop(session);
            }
        }
    }

    /// Match an identified pending session to a configured inbound controller
    fn promote(&self, pending: ControllerSession) {
        let identification = pending.identification().unwrap_or_default();
        if self.shutdown.is_set() {
            spawn_stop(pending);
            return;
        }

        let Some((handle, stale)) = self.find_inbound(identification.id()) else {
            self.reject(pending, &identification);
            return;
        };

        if self.config.no_takeover && stale.is_online() {
            warn!(
                "{}Takeover: controller already connected, refusing connection {}",
                stale.log_prefix(),
                pending.id()
            );
            spawn_stop(pending);
            return;
        }

        pending.adopt_config(stale.config());
        if let Err(e) = pending.check_identification() {
            warn!("{}Takeover: {}", stale.log_prefix(), e);
            spawn_stop(pending);
            return;
        }

        let (observer, was_online) = stale.take_observer();
        handle.retarget(pending.clone());
        pending.attach_handle(&handle);
        info!(
            "{}Takeover: connection {} replaces session {}",
            stale.log_prefix(),
            pending.id(),
            stale.id()
        );

        if was_online {
            if let Some(observer) = &observer {
                observer.on_offline(&handle);
            }
        }
        pending.set_observer(observer.clone());
        spawn_stop(stale);

        if let Err(e) = pending.send_identification() {
            warn!("{}Takeover: could not send identification: {}", pending.log_prefix(), e);
        }
        if let Some(observer) = observer {
            if pending.is_online() {
                observer.on_online(&handle);
            }
        }
    }

    fn find_inbound(&self, id: &str) -> Option<(SessionHandle, ControllerSession)> {
        self.sessions.iter().find_map(|entry| {
            let FleetEntry::Proxied(handle) = entry.value() else {
                return None;
            };
            let target = handle.target()?;
            (!target.is_outgoing() && !target.is_stopping() && target.config().matches_identity(id))
                .then(|| (handle.clone(), target))
        })
    }

    fn reject(&self, pending: ControllerSession, identification: &Identification) {
        info!(
            "{}Takeover: no configured controller matches '{}', rejecting",
            pending.log_prefix(),
            identification.id()
        );
        if let Some(observer) = &self.observer {
            observer.on_unknown_controller_rejected(identification);
        }
        spawn_stop(pending);
    }
}

/// Observer installed on a pending session until it is promoted or rejected
struct PendingObserver {
    fleet: Weak<FleetInner>,
    session_id: u64,
}

impl SessionObserver for PendingObserver {
    fn on_online(&self, _session: &dyn ControllerState) {
        let Some(fleet) = self.fleet.upgrade() else {
            return;
        };
        let Some((_, pending)) = fleet.pending.remove(&self.session_id) else {
            return;
        };
        fleet.promote(pending);
    }
}

fn spawn_stop(session: ControllerSession) {
    tokio::spawn(async move { session.stop().await });
}

async fn accept_loop(fleet: Arc<FleetInner>, listener: TcpListener, mut shutdown: StopSignal) {
    let addr = fleet
        .local_addr
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    info!("Listen: accepting controller connections on {}", addr);

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if shutdown.is_set() {
                    break;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Listen: could not set TCP_NODELAY for {}: {}", peer, e);
                }
                fleet.admit(stream, peer);
            }
            Err(e) => {
                error!("Listen: accept failed: {}", e);
                if shutdown.sleep(ACCEPT_RETRY).await {
                    break;
                }
            }
        }
    }
    info!("Listen: {} closed", addr);
}
