//! SpCore bridge binary.
//!
//! Runs a fleet of access-control controller sessions: dials the configured
//! outgoing controllers, accepts controllers that dial in, streams their
//! events to the log and acknowledges them.

use anyhow::{bail, Context};
use clap::Parser;
use spcore_session::{
    ControllerConfig, ControllerState, FleetManager, FleetObserver, SessionError, SessionObserver,
};
use spcore_wire::{
    ConfigChange, ConfigChangeResult, DeviceActionRequest, DeviceActionResult, Event,
    Identification, SpCoreMessage,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::BridgeConfig;
use logging::BridgeLogFormatter;

/// Controller-side SpCore protocol bridge
#[derive(Parser, Debug)]
#[command(name = "spcore-bridge", version, about = "Controller-side SpCore protocol bridge")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "spcore.yaml")]
    config: PathBuf,

    /// Accept controller connections on this address, e.g. 0.0.0.0:9731
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Dial a controller at host[:port] (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Ping interval, e.g. 1s
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Idle timeout, e.g. 20s
    #[arg(long)]
    idle_timeout: Option<humantime::Duration>,
}

/// Parse `host[:port]` into an outgoing controller
fn parse_connect(target: &str) -> anyhow::Result<ControllerConfig> {
    let target = target.trim();
    if target.is_empty() {
        bail!("empty --connect target");
    }
    let config = match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid port in --connect {}", target))?;
            ControllerConfig::outgoing(host, port)
        }
        _ => ControllerConfig {
            address: Some(target.to_string()),
            dials_out: true,
            ..Default::default()
        },
    };
    Ok(config.with_name(target))
}

/// Level a failed request is logged at: connection faults are errors, caller errors warnings
fn failure_level(error: &SessionError) -> tracing::Level {
    if error.is_caller_error() {
        tracing::Level::WARN
    } else {
        tracing::Level::ERROR
    }
}

fn report_failure(session: &dyn ControllerState, action: &str, error: &SessionError) {
    if failure_level(error) == tracing::Level::WARN {
        component_warn!("session", "{}Could not {}: {}", session.log_prefix(), action, error);
    } else {
        component_error!("session", "{}Could not {}: {}", session.log_prefix(), action, error);
    }
}

/// Logs controller activity; starts the event stream and acknowledges every batch
struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_online(&self, session: &dyn ControllerState) {
        let identification = session.identification().unwrap_or_default();
        component_info!(
            "session",
            "{}Online: id='{}' software={} protocol={}",
            session.log_prefix(),
            identification.id(),
            identification.software_version(),
            identification.protocol_version()
        );
        if let Err(e) = session.start_event_stream() {
            report_failure(session, "start event stream", &e);
        }
    }

    fn on_offline(&self, session: &dyn ControllerState) {
        component_warn!("session", "{}Offline", session.log_prefix());
    }

    fn on_config_change_result(
        &self,
        session: &dyn ControllerState,
        _change: &ConfigChange,
        result: &ConfigChangeResult,
    ) {
        match &result.exception {
            None => info!("{}Config change {} applied", session.log_prefix(), result.request_id),
            Some(exception) => warn!(
                "{}Config change {} failed: {}",
                session.log_prefix(),
                result.request_id,
                exception
            ),
        }
    }

    fn on_device_action_result(
        &self,
        session: &dyn ControllerState,
        action: &DeviceActionRequest,
        result: &DeviceActionResult,
    ) {
        match &result.exception {
            None => info!(
                "{}Device action {} on device {} done",
                session.log_prefix(),
                result.request_id,
                action.device_id()
            ),
            Some(exception) => warn!(
                "{}Device action {} on device {} failed: {}",
                session.log_prefix(),
                result.request_id,
                action.device_id(),
                exception
            ),
        }
    }

    fn on_events(&self, session: &dyn ControllerState, events: &[Event]) {
        for event in events {
            info!(
                "{}Event {}: code={} device={} credential={}",
                session.log_prefix(),
                event.unid(),
                event.code(),
                event.device_id(),
                event.credential_id()
            );
        }
        let consumed: HashSet<i64> = events.iter().filter_map(|event| event.unid).collect();
        if consumed.is_empty() {
            return;
        }
        if let Err(e) = session.acknowledge_events(&consumed) {
            report_failure(session, "acknowledge events", &e);
        }
    }

    fn on_unhandled_message(&self, session: &dyn ControllerState, message: &SpCoreMessage) {
        debug!("{}Ignoring {:?}", session.log_prefix(), message.kind());
    }
}

impl FleetObserver for LoggingObserver {
    fn on_unknown_controller_rejected(&self, identification: &Identification) {
        component_warn!(
            "fleet",
            "Rejected unknown controller '{}' (software {})",
            identification.id(),
            identification.software_version()
        );
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("spcore_bridge={}", args.log_level).parse()?)
        .add_directive(format!("spcore_session={}", args.log_level).parse()?)
        .add_directive(format!("spcore_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(BridgeLogFormatter::new("spcore"))
        .init();

    info!("Starting SpCore bridge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = BridgeConfig::load_from_file(&args.config)?;
    if let Some(listen) = args.listen {
        config.fleet.listen = Some(listen);
    }
    if let Some(ping_interval) = args.ping_interval {
        config.fleet.timings.ping_interval = ping_interval.into();
    }
    if let Some(idle_timeout) = args.idle_timeout {
        config.fleet.timings.idle_timeout = idle_timeout.into();
    }
    for target in &args.connect {
        config.controllers.push(parse_connect(target)?);
    }
    if config.controllers.is_empty() && config.fleet.listen.is_none() {
        warn!("No controllers configured and no listen address; nothing to do until shutdown");
    }

    let observer = Arc::new(LoggingObserver);
    let fleet = FleetManager::start(
        config.fleet.clone(),
        Some(observer.clone() as Arc<dyn FleetObserver>),
    )
    .await
    .context("failed to start fleet")?;
    if let Some(addr) = fleet.local_addr() {
        component_info!("fleet", "Listening for controllers on {}", addr);
    }

    for controller in config.controllers {
        let name = controller.display_name();
        if let Err(e) = fleet.add(controller, observer.clone()) {
            component_error!("fleet", "Could not register controller {}: {}", name, e);
        }
    }
    info!("{} controllers registered", fleet.len());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    fleet.shutdown().await;
    info!("SpCore bridge stopped");
    Ok(())
}
