//! Reader and writer loops for one connected socket.
//!
//! The reader decodes frames and hands each message to the owning session.
//! The writer drains the outbound queue and keeps the connection alive with
//! periodic pings. Both observe a per-connection stop signal between frames
//! and report their first fault to a shared [`FaultSlot`].

use spcore_wire::{MessageReader, MessageWriter, SpCoreMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::signal::{FaultSlot, StopSignal};
use crate::SessionError;

/// What a connection's loops need from the session that owns them
pub(crate) trait SessionLink: Send + Sync + 'static {
    /// Prefix for log lines
    fn log_prefix(&self) -> String;

    /// Handle one inbound message; an error ends the connection
    fn dispatch(&self, message: SpCoreMessage) -> Result<(), SessionError>;

    /// This side's Identification
    fn local_identification(&self) -> SpCoreMessage;
}

/// Item on the outbound queue
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    /// Fully formed message
    Message(SpCoreMessage),
    /// Send this side's Identification, built when it is written
    Identification,
}

/// Writer behaviour for one connection
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriterOptions {
    /// Send Identification before anything else
    pub identify_first: bool,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
}

/// Read and dispatch messages until stopped or a fault occurs.
///
/// Returns the read half so the caller can reassemble and close the stream.
pub(crate) async fn run_reader<R>(
    mut reader: MessageReader<R>,
    link: Arc<dyn SessionLink>,
    fault: Arc<FaultSlot>,
    mut stop: StopSignal,
    idle_timeout: Duration,
) -> R
where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let result = tokio::select! {
            biased;
            _ = stop.wait() => break,
            read = tokio::time::timeout(idle_timeout, reader.read()) => match read {
                Ok(Ok(message)) => link.dispatch(message),
                Ok(Err(e)) => Err(SessionError::Wire(e)),
                Err(_) => Err(SessionError::IdleTimeout(idle_timeout)),
            },
        };

        if let Err(e) = result {
            if stop.is_set() {
                break;
            }
            match &e {
                SessionError::Terminated { .. } => info!("{}Read: {}", link.log_prefix(), e),
                SessionError::Wire(wire) if wire.is_disconnect() => {
                    warn!("{}Read: communication interrupted: {}", link.log_prefix(), e)
                }
                _ => error!("{}Read: {}", link.log_prefix(), e),
            }
            fault.report(e);
            break;
        }
    }
    debug!("{}Read: exiting", link.log_prefix());
    reader.into_inner()
}

/// Send queued messages and pings until stopped, the queue closes, or a write fails.
///
/// Returns the write half so the caller can reassemble and close the stream.
pub(crate) async fn run_writer<W>(
    mut writer: MessageWriter<W>,
    mut queue: mpsc::Receiver<Outbound>,
    link: Arc<dyn SessionLink>,
    fault: Arc<FaultSlot>,
    mut stop: StopSignal,
    options: WriterOptions,
) -> W
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let result: Result<(), SessionError> = async {
        if options.identify_first {
            send(&mut writer, &link.local_identification(), options.write_timeout).await?;
        }

        let mut next_ping = Instant::now();
        loop {
            if stop.is_set() {
                break;
            }
            if Instant::now() >= next_ping {
                send(&mut writer, &SpCoreMessage::ping(), options.write_timeout).await?;
                next_ping = Instant::now() + options.ping_interval;
                continue;
            }

            let item = tokio::select! {
                biased;
                _ = stop.wait() => break,
                item = queue.recv() => item,
                _ = tokio::time::sleep_until(next_ping) => continue,
            };
            let Some(item) = item else {
                debug!("{}Write: queue closed", link.log_prefix());
                break;
            };
            if stop.is_set() {
                break;
            }

            let message = match item {
                Outbound::Message(message) => message,
                Outbound::Identification => link.local_identification(),
            };
            debug!("{}Write: {:?}", link.log_prefix(), message.kind());
            send(&mut writer, &message, options.write_timeout).await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        if !stop.is_set() {
            match &e {
                SessionError::Wire(wire) if wire.is_disconnect() => {
                    warn!("{}Write: communication interrupted: {}", link.log_prefix(), e)
                }
                _ => error!("{}Write: {}", link.log_prefix(), e),
            }
            fault.report(e);
        }
    }
    debug!("{}Write: exiting", link.log_prefix());
    writer.into_inner()
}

async fn send<W>(
    writer: &mut MessageWriter<W>,
    message: &SpCoreMessage,
    timeout: Duration,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, writer.write(message)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(SessionError::Wire(e)),
        Err(_) => Err(SessionError::WriteTimeout(timeout)),
    }
}
