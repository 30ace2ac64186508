//! Configuration types for the MQTT intercepting proxy.
//!
//! Configuration is loaded from YAML files and validated before use. Every
//! section has defaults, so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};

/// Largest legal MQTT PDU: fixed header, four length bytes, 268435455 payload bytes.
pub const MAX_MQTT_PDU_SIZE: usize = 1 + 4 + 268_435_455;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// TCP listener configuration.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Upstream broker configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Session lifecycle at info and per-PDU byte counts at debug.
    #[serde(default)]
    pub verbose: bool,

    /// Console dump sink configuration.
    #[serde(default)]
    pub console: ConsoleConfig,

    /// Trace file recorder configuration.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Framing limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// TCP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Address to bind to, e.g., "0.0.0.0:1883".
    #[serde(default = "default_listen_address")]
    pub address: String,
}

/// Upstream broker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Broker address dialed once per accepted session.
    #[serde(default = "default_upstream_address")]
    pub address: String,
}

/// Console dump sink configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsoleConfig {
    /// Whether PDUs are dumped to stdout.
    #[serde(default = "default_console_enabled")]
    pub enabled: bool,
}

/// Which relay direction(s) the trace recorder captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceDirection {
    /// Client to broker traffic only.
    #[default]
    ClientToBroker,
    /// Broker to client traffic only.
    BrokerToClient,
    /// Both directions, interleaved in one file.
    Both,
}

/// Trace file recorder configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceConfig {
    /// Whether a trace file is written per session.
    #[serde(default)]
    pub enabled: bool,

    /// Directory the per-session trace files are created in.
    #[serde(default = "default_trace_directory")]
    pub directory: PathBuf,

    /// Direction(s) recorded.
    #[serde(default)]
    pub direction: TraceDirection,
}

/// Framing limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Largest PDU accepted before the session is torn down.
    #[serde(default = "default_max_pdu_size")]
    pub max_pdu_size: usize,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_listen_address() -> String {
    "0.0.0.0:1883".to_string()
}

fn default_upstream_address() -> String {
    "m2m.eclipse.org:1883".to_string()
}

fn default_console_enabled() -> bool {
    true
}

fn default_trace_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_pdu_size() -> usize {
    MAX_MQTT_PDU_SIZE
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: default_upstream_address(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: default_console_enabled(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_trace_directory(),
            direction: TraceDirection::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_pdu_size: default_max_pdu_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl TraceConfig {
    /// Whether traffic flowing client to broker is recorded.
    #[must_use]
    pub fn records_client_to_broker(&self) -> bool {
        self.enabled
            && matches!(
                self.direction,
                TraceDirection::ClientToBroker | TraceDirection::Both
            )
    }

    /// Whether traffic flowing broker to client is recorded.
    #[must_use]
    pub fn records_broker_to_client(&self) -> bool {
        self.enabled
            && matches!(
                self.direction,
                TraceDirection::BrokerToClient | TraceDirection::Both
            )
    }
}

/// Split a `host:port` string, rejecting missing hosts and non-numeric ports.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidAddress`] if the address cannot be parsed.
pub fn parse_host_port(addr: &str) -> ConfigResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))?;
    if host.is_empty() {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
    Ok((host.to_string(), port))
}

// Configuration loading and validation

impl ProxyConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        // An empty document deserializes to unit, not an empty map.
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        parse_host_port(&self.listen.address)?;
        parse_host_port(&self.upstream.address)?;

        if self.limits.max_pdu_size < 2 {
            return Err(ConfigError::MaxPduSizeTooSmall(self.limits.max_pdu_size));
        }

        Ok(())
    }
}
