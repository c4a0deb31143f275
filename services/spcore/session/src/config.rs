//! Configuration consumed by sessions and the fleet manager.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default TCP port controllers listen on
pub const DEFAULT_CONTROLLER_PORT: u16 = 9730;

/// Connection descriptor for one logical controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Display name used in log prefixes
    pub name: Option<String>,
    /// Host or IP to dial when `dials_out` is set
    pub address: Option<String>,
    /// Port to dial, [`DEFAULT_CONTROLLER_PORT`] when unset
    pub port: Option<u16>,
    /// Identity the controller announces when it dials in
    pub mac_address: Option<String>,
    /// Whether this side opens the TCP connection
    pub dials_out: bool,
    /// Pre-shared password exchanged in Identification
    pub password: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: None,
            address: None,
            port: None,
            mac_address: None,
            dials_out: true,
            password: None,
        }
    }
}

impl ControllerConfig {
    /// Controller this side dials
    pub fn outgoing(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: Some(address.into()),
            port: Some(port),
            dials_out: true,
            ..Default::default()
        }
    }

    /// Controller that dials in and identifies with the given MAC
    pub fn inbound(mac_address: impl Into<String>) -> Self {
        Self {
            mac_address: Some(mac_address.into()),
            dials_out: false,
            ..Default::default()
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the pre-shared password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Port to dial
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_CONTROLLER_PORT)
    }

    /// Whether an announced identity refers to this controller
    pub fn matches_identity(&self, id: &str) -> bool {
        match &self.mac_address {
            Some(mac) => !id.is_empty() && mac.eq_ignore_ascii_case(id),
            None => false,
        }
    }

    /// Name shown in logs
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if self.dials_out {
            if let Some(address) = &self.address {
                return format!("{}:{}", address, self.port_or_default());
            }
        }
        self.mac_address.clone().unwrap_or_else(|| "unnamed".to_string())
    }
}

/// TLS protocol versions that may be negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsProtocol {
    /// TLS 1.2
    #[serde(rename = "tls1.2")]
    Tls12,
    /// TLS 1.3
    #[serde(rename = "tls1.3")]
    Tls13,
}

/// TLS settings shared by every session in a fleet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Wrap connections in TLS
    pub use_encryption: bool,
    /// Accept certificates with name mismatches or chain errors
    pub ignore_cert_errors: bool,
    /// Accept any server certificate without validation
    pub accept_any_certificate: bool,
    /// Host to expected certificate name, used as SNI when dialing
    pub certificate_name_map: HashMap<String, String>,
    /// Allowed protocol versions; empty means all supported
    pub enabled_protocols: Vec<TlsProtocol>,
    /// PEM bundle of trusted roots for validating controllers
    pub ca_file: Option<PathBuf>,
}

impl TlsSettings {
    /// Name to present and validate when dialing `host`
    pub fn server_name_for<'a>(&'a self, host: &'a str) -> &'a str {
        self.certificate_name_map
            .get(host)
            .map(String::as_str)
            .unwrap_or(host)
    }
}

/// Certificate and key presented when controllers dial in over TLS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// PEM certificate chain
    pub cert_file: PathBuf,
    /// PEM private key
    pub key_file: PathBuf,
}

/// Timing knobs for sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimings {
    /// Interval between keepalive pings
    pub ping_interval: Duration,
    /// Sleep between dial attempts
    pub retry_interval: Duration,
    /// Failed dialing for this long declares the controller offline
    pub offline_after: Duration,
    /// Bound on a single dial attempt
    pub connect_timeout: Duration,
    /// Connection is dead if nothing arrives for this long
    pub idle_timeout: Duration,
    /// Bound on a single frame write
    pub write_timeout: Duration,
    /// Bound on waiting for tasks to exit on stop
    pub stop_timeout: Duration,
    /// Capacity of the outbound queue
    pub queue_capacity: usize,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(1000),
            retry_interval: Duration::from_secs(1),
            offline_after: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(30),
            queue_capacity: 1024,
        }
    }
}

/// Fleet-wide configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Address to accept controller connections on; none disables listening
    pub listen: Option<SocketAddr>,
    /// Host controllers are told to call back to
    pub callback_host: Option<String>,
    /// Fallback callback host
    pub callback_host_secondary: Option<String>,
    /// TLS settings for all sessions
    pub tls: TlsSettings,
    /// Certificate for inbound TLS
    pub server_identity: Option<ServerIdentity>,
    /// Keep a live inbound connection instead of replacing it on re-identification
    pub no_takeover: bool,
    /// Reject inbound controllers that omit a configured password
    pub strict_identity: bool,
    /// Timing knobs
    #[serde(skip)]
    pub timings: SessionTimings,
}
