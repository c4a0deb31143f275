//! Simulated controller and recording observers shared by the integration tests.

#![allow(dead_code)]

use spcore_session::{
    ControllerState, FleetConfig, FleetObserver, SessionObserver, SessionTimings,
};
use spcore_wire::{
    ConfigChange, ConfigChangeResult, DeviceActionRequest, DeviceActionResult, Event,
    Identification, MessageKind, MessageReader, MessageWriter, SpCoreMessage,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const MAC: &str = "AA:BB:CC:DD:EE:FF";
pub const WAIT: Duration = Duration::from_secs(5);

/// Timings short enough for loopback tests
pub fn fast_timings() -> SessionTimings {
    SessionTimings {
        ping_interval: Duration::from_millis(200),
        retry_interval: Duration::from_millis(50),
        offline_after: Duration::from_millis(300),
        connect_timeout: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(3),
        write_timeout: Duration::from_secs(1),
        stop_timeout: Duration::from_secs(2),
        queue_capacity: 64,
    }
}

pub fn fleet_config(listen: bool) -> FleetConfig {
    FleetConfig {
        listen: listen.then(|| "127.0.0.1:0".parse().unwrap()),
        timings: fast_timings(),
        ..Default::default()
    }
}

/// What an observer saw
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Online,
    Offline,
    ConfigResult { request_id: i64, success: bool },
    ActionResult { request_id: i64, device_id: i64 },
    Events(Vec<i64>),
    Unhandled(MessageKind),
    Rejected(String),
}

pub struct Recorder {
    tx: mpsc::UnboundedSender<Seen>,
}

pub fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

impl SessionObserver for Recorder {
    fn on_online(&self, _session: &dyn ControllerState) {
        let _ = self.tx.send(Seen::Online);
    }

    fn on_offline(&self, _session: &dyn ControllerState) {
        let _ = self.tx.send(Seen::Offline);
    }

    fn on_config_change_result(
        &self,
        _session: &dyn ControllerState,
        _change: &ConfigChange,
        result: &ConfigChangeResult,
    ) {
        let _ = self.tx.send(Seen::ConfigResult {
            request_id: result.request_id,
            success: result.is_success(),
        });
    }

    fn on_device_action_result(
        &self,
        _session: &dyn ControllerState,
        action: &DeviceActionRequest,
        result: &DeviceActionResult,
    ) {
        let _ = self.tx.send(Seen::ActionResult {
            request_id: result.request_id,
            device_id: action.device_id(),
        });
    }

    fn on_events(&self, _session: &dyn ControllerState, events: &[Event]) {
        let _ = self
            .tx
            .send(Seen::Events(events.iter().map(|e| e.unid()).collect()));
    }

    fn on_unhandled_message(&self, _session: &dyn ControllerState, message: &SpCoreMessage) {
        let _ = self.tx.send(Seen::Unhandled(message.kind()));
    }
}

impl FleetObserver for Recorder {
    fn on_unknown_controller_rejected(&self, identification: &Identification) {
        let _ = self
            .tx
            .send(Seen::Rejected(identification.id().to_string()));
    }
}

/// Next observation, failing the test after [`WAIT`]
pub async fn next_seen(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for observer")
        .expect("observer channel closed")
}

/// Assert nothing is observed for `quiet`
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Seen>, quiet: Duration) {
    if let Ok(Some(seen)) = tokio::time::timeout(quiet, rx.recv()).await {
        panic!("unexpected observation: {:?}", seen);
    }
}

type SimReader = MessageReader<Box<dyn AsyncRead + Send + Unpin>>;
type SimWriter = MessageWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Wait for the bridge to open a TCP connection
pub async fn accept_tcp(listener: &TcpListener) -> TcpStream {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("timed out waiting for bridge")
        .expect("accept");
    stream
}

/// Controller end of a connection, plain or TLS
pub struct SimController {
    reader: SimReader,
    writer: SimWriter,
}

impl SimController {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: MessageReader::new(Box::new(read_half)),
            writer: MessageWriter::new(Box::new(write_half)),
        }
    }

    /// Dial the bridge, as an inbound controller does
    pub async fn dial(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.expect("dial bridge"))
    }

    /// Wait for the bridge to dial in
    pub async fn accept(listener: &TcpListener) -> Self {
        Self::new(accept_tcp(listener).await)
    }

    pub async fn send(&mut self, message: SpCoreMessage) {
        self.writer.write(&message).await.expect("send to bridge");
    }

    pub async fn identify(&mut self, id: &str, password: Option<&str>, max_body_length: u32) {
        self.send(SpCoreMessage::identification(Identification {
            id: Some(id.to_string()),
            software_version: Some("sim-1.0".into()),
            protocol_version: Some("0.1".into()),
            max_body_length: Some(max_body_length),
            password: password.map(str::to_string),
            ..Default::default()
        }))
        .await;
    }

    /// Next message that is not a ping
    pub async fn next(&mut self) -> SpCoreMessage {
        loop {
            let message = tokio::time::timeout(WAIT, self.reader.read())
                .await
                .expect("timed out waiting for bridge")
                .expect("read from bridge");
            if message.kind() != MessageKind::Ping {
                return message;
            }
        }
    }

    /// Wait until the bridge closes the connection
    pub async fn expect_closed(&mut self) {
        let closed = tokio::time::timeout(WAIT, async {
            while self.reader.read().await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok(), "bridge kept the connection open");
    }
}
