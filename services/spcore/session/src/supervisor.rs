//! Connection supervisor: one task per session that establishes the transport,
//! runs the reader and writer loops for it, tears it down, and reconnects.

use spcore_wire::{MessageReader, MessageWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SessionTimings;
use crate::controller::{AcceptedSocket, ControllerSession};
use crate::io::{run_reader, run_writer, SessionLink, WriterOptions};
use crate::signal::{FaultSlot, StopSignal, StopTrigger};
use crate::transport::{connect_tcp, IoStream};
use crate::SessionError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct ConnectionSupervisor {
    session: ControllerSession,
    sockets: mpsc::Receiver<AcceptedSocket>,
    stop: StopSignal,
    timings: SessionTimings,
}

impl ConnectionSupervisor {
    pub(crate) fn new(session: ControllerSession, sockets: mpsc::Receiver<AcceptedSocket>) -> Self {
        Self {
            stop: session.stop_signal(),
            timings: session.timings().clone(),
            session,
            sockets,
        }
    }

    /// Supervise connections until the session stops.
    ///
    /// Inbound sessions serve exactly one accepted socket.
    pub(crate) async fn run(mut self) {
        let outgoing = self.session.is_outgoing();
        let mut reconnecting = false;

        loop {
            if self.stop.is_set() {
                break;
            }
            if reconnecting && self.stop.sleep(self.timings.retry_interval).await {
                break;
            }
            reconnecting = true;

            let established = if outgoing {
                self.dial().await
            } else {
                self.await_socket().await
            };
            let Some((tcp, host)) = established else {
                break;
            };

            let fault = match self.handshake(tcp, &host, outgoing).await {
                Some(Ok(stream)) => self.run_active(stream, outgoing).await,
                Some(Err(e)) => {
                    warn!("{}Run: handshake with {} failed: {}", self.session.log_prefix(), host, e);
                    Some(e)
                }
                None => None,
            };
            self.session.on_connection_closed(fault);

            if !outgoing {
                break;
            }
        }

        self.session.on_supervisor_stopped();
    }

    /// Dial until connected or stopped; declares the session offline once
    /// `offline_after` passes without a connection.
    async fn dial(&mut self) -> Option<(TcpStream, String)> {
        let config = self.session.config();
        let Some(host) = config.address.clone() else {
            error!("{}Run: no address configured", self.session.log_prefix());
            self.stop.wait().await;
            return None;
        };
        let port = config.port_or_default();
        let started = Instant::now();
        let mut reported = false;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.stop.wait() => return None,
                attempt = connect_tcp(&host, port, self.timings.connect_timeout) => attempt,
            };
            match attempt {
                Ok(stream) => {
                    info!("{}Run: connected to {}:{}", self.session.log_prefix(), host, port);
                    return Some((stream, host));
                }
                Err(e) => {
                    debug!("{}Run: connect to {}:{} failed: {}", self.session.log_prefix(), host, port, e);
                    if !reported && started.elapsed() >= self.timings.offline_after {
                        reported = true;
                        self.session.on_connect_timeout(&e);
                    }
                }
            }
            if self.stop.sleep(self.timings.retry_interval).await {
                return None;
            }
        }
    }

    async fn await_socket(&mut self) -> Option<(TcpStream, String)> {
        tokio::select! {
            biased;
            _ = self.stop.wait() => None,
            accepted = self.sockets.recv() => accepted.map(|socket| {
                debug!("{}Run: took connection from {}", self.session.log_prefix(), socket.host);
                (socket.stream, socket.host)
            }),
        }
    }

    /// TLS (or plain) handshake bounded by the connect timeout; `None` when stopped
    async fn handshake(
        &mut self,
        tcp: TcpStream,
        host: &str,
        outgoing: bool,
    ) -> Option<Result<IoStream, SessionError>> {
        let tls = self.session.tls().clone();
        let limit = self.timings.connect_timeout;
        let wrap = async {
            if outgoing {
                tls.wrap_client(tcp, host).await
            } else {
                tls.wrap_server(tcp).await
            }
        };
        tokio::select! {
            biased;
            _ = self.stop.wait() => None,
            wrapped = tokio::time::timeout(limit, wrap) => Some(
                wrapped.unwrap_or_else(|_| Err(SessionError::Tls(format!("handshake timed out after {:?}", limit))))
            ),
        }
    }

    /// Run the reader and writer on one stream until a fault or stop; returns the fault
    async fn run_active(&mut self, stream: IoStream, outgoing: bool) -> Option<SessionError> {
        info!(
            "{}Run: connection active ({})",
            self.session.log_prefix(),
            if stream.is_tls() { "tls" } else { "plain" }
        );

        let fault = Arc::new(FaultSlot::default());
        let connection = StopTrigger::new();
        let (tx, rx) = mpsc::channel(self.timings.queue_capacity.max(1));
        let (read_half, write_half) = tokio::io::split(stream);
        let link: Arc<dyn SessionLink> = Arc::new(self.session.clone());
        // Must be attached before the reader dispatches anything.
        self.session.attach_outbound(tx);

        let mut reader = tokio::spawn(run_reader(
            MessageReader::new(read_half),
            link.clone(),
            fault.clone(),
            connection.signal(),
            self.timings.idle_timeout,
        ));
        let mut writer = tokio::spawn(run_writer(
            MessageWriter::new(write_half),
            rx,
            link,
            fault.clone(),
            connection.signal(),
            WriterOptions {
                identify_first: outgoing,
                ping_interval: self.timings.ping_interval,
                write_timeout: self.timings.write_timeout,
            },
        ));

        tokio::select! {
            _ = fault.raised() => {}
            _ = self.stop.wait() => {}
        }

        connection.trigger();
        self.session.detach_outbound();

        let limit = self.timings.stop_timeout;
        let read_half = join_within(&mut reader, limit, &self.session.log_prefix(), "reader").await;
        let write_half = join_within(&mut writer, limit, &self.session.log_prefix(), "writer").await;
        if let (Some(read_half), Some(write_half)) = (read_half, write_half) {
            let mut stream = read_half.unsplit(write_half);
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, stream.shutdown()).await;
        }

        let fault = fault.take();
        info!(
            "{}Run: connection closed{}",
            self.session.log_prefix(),
            fault.as_ref().map(|e| format!(": {}", e)).unwrap_or_default()
        );
        fault
    }
}

async fn join_within<T>(
    task: &mut JoinHandle<T>,
    limit: Duration,
    log_prefix: &str,
    name: &str,
) -> Option<T> {
    match tokio::time::timeout(limit, &mut *task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!("{}Run: {} task failed: {}", log_prefix, name, e);
            None
        }
        Err(_) => {
            warn!(
                "{}Run: {} did not exit within {:?}, aborting",
                log_prefix, name, limit
            );
            task.abort();
            None
        }
    }
}
