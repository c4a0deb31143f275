//! TCP/TLS transport, reader/writer loops, reconnect supervision, controller
//! sessions and fleet takeover for SpCore.
//!
//! This crate drives connections to access-control controllers speaking the
//! SpCore protocol: establishing the transport in either direction, keeping
//! it alive, correlating requests with results, and presenting each
//! controller to the application through an observer.
//!
//! ## Features
//!
//! - **Both Directions**: dial controllers, or accept controllers that dial in
//! - **TLS**: optional client and server handshakes with a configurable certificate policy
//! - **Supervision**: automatic reconnect with a fixed retry interval
//! - **Keepalive**: periodic pings and an idle receive timeout
//! - **Correlation**: config changes and device actions matched to results by request id
//! - **Takeover**: a reconnecting inbound controller replaces its stale session behind a stable handle
//!
//! ## Example
//!
//! ```rust,no_run
//! use spcore_session::{ControllerConfig, ControllerState, FleetConfig, FleetManager, SessionObserver};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl SessionObserver for Printer {
//!     fn on_online(&self, session: &dyn ControllerState) {
//!         println!("{}online", session.log_prefix());
//!         let _ = session.start_event_stream();
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let fleet = FleetManager::start(FleetConfig::default(), None).await?;
//! let controller = fleet.add(ControllerConfig::outgoing("192.168.1.20", 9730), Arc::new(Printer))?;
//!
//! // ... later
//! controller.stop().await;
//! fleet.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod error;
pub mod fleet;
pub mod handle;
pub mod observer;
pub mod transport;

mod io;
mod signal;
mod supervisor;

pub use config::{
    ControllerConfig, FleetConfig, ServerIdentity, SessionTimings, TlsProtocol, TlsSettings,
    DEFAULT_CONTROLLER_PORT,
};
pub use controller::{ControllerSession, SessionSettings, INITIAL_MAX_BODY_LENGTH, PROTOCOL_VERSION};
pub use error::SessionError;
pub use fleet::{FleetEntry, FleetManager, SessionIds};
pub use handle::SessionHandle;
pub use observer::{ControllerState, FleetObserver, NoopObserver, SessionObserver};
pub use transport::{connect_tcp, listen_tcp, IoStream, TlsContext};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{accept_tls, connect_tls, make_client_config, make_server_config, CertificatePolicy};
