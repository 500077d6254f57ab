//! Cluster configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial (or
//! missing) file is valid.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub membership: MembershipConfig,

    #[serde(default)]
    pub sender: SenderConfig,

    #[serde(default)]
    pub transmitter: TransmitterConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub receiver: ReceiverConfig,
}

impl ClusterConfig {
    /// Load configuration from a JSON file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.membership;
        if m.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "membership.heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if m.expiration_ms < m.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "membership.expiration_ms ({}) is shorter than the heartbeat interval ({})",
                m.expiration_ms, m.heartbeat_interval_ms
            )));
        }
        if !m.address.is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "membership.address {} is not a multicast group",
                m.address
            )));
        }
        if m.recovery_threshold == 0 {
            return Err(ConfigError::Invalid(
                "membership.recovery_threshold must be > 0".into(),
            ));
        }
        if self.sender.connect_timeout_ms == 0 || self.sender.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sender timeouts must be > 0".into(),
            ));
        }
        if self.transmitter.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "transmitter.keepalive_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Multicast group
    #[serde(default = "default_address")]
    pub address: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Local interface to send and join on
    #[serde(default)]
    pub bind: Option<IpAddr>,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// A member not heard from for this long is dropped
    #[serde(default = "default_expiration")]
    pub expiration_ms: u64,

    #[serde(default)]
    pub ttl: Option<u32>,

    /// Receive timeout; defaults to the heartbeat interval
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,

    #[serde(default = "default_true")]
    pub recovery_enabled: bool,

    /// Consecutive socket errors before the socket is rebuilt
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,

    #[serde(default = "default_recovery_sleep")]
    pub recovery_sleep_ms: u64,

    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Only members with the same domain are tracked
    #[serde(default)]
    pub domain: Option<String>,

    /// Host advertised to peers for the data channel
    #[serde(default = "default_local_host")]
    pub local_host: String,

    /// Data port advertised to peers; defaults to the receiver's port
    #[serde(default)]
    pub local_port: Option<u16>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            bind: None,
            heartbeat_interval_ms: default_heartbeat_interval(),
            expiration_ms: default_expiration(),
            ttl: None,
            read_timeout_ms: None,
            recovery_enabled: true,
            recovery_threshold: default_recovery_threshold(),
            recovery_sleep_ms: default_recovery_sleep(),
            max_packet_size: default_max_packet_size(),
            domain: None,
            local_host: default_local_host(),
            local_port: None,
        }
    }
}

impl MembershipConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.unwrap_or(self.heartbeat_interval_ms))
    }

    pub fn recovery_sleep(&self) -> Duration {
        Duration::from_millis(self.recovery_sleep_ms)
    }

    pub fn group(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn domain_bytes(&self) -> Vec<u8> {
        self.domain
            .as_deref()
            .map(|d| d.as_bytes().to_vec())
            .unwrap_or_default()
    }
}

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(228, 0, 0, 4))
}

fn default_port() -> u16 {
    45564
}

fn default_heartbeat_interval() -> u64 {
    500
}

fn default_expiration() -> u64 {
    3000
}

fn default_recovery_threshold() -> u32 {
    10
}

fn default_recovery_sleep() -> u64 {
    5000
}

fn default_max_packet_size() -> usize {
    8192
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

/// Options for one point-to-point sender. Cloned into every sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(default)]
    pub send_buffer_size: Option<u32>,

    #[serde(default)]
    pub receive_buffer_size: Option<u32>,

    #[serde(default = "default_true")]
    pub tcp_no_delay: bool,

    /// SO_LINGER in seconds
    #[serde(default)]
    pub so_linger: Option<u64>,

    #[serde(default)]
    pub so_keepalive: bool,

    /// IP traffic class (TOS), IPv4 only
    #[serde(default)]
    pub traffic_class: Option<u32>,

    /// Retries after the first attempt, each on a fresh connection
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_timeout")]
    pub connect_timeout_ms: u64,

    /// How long to wait for an ack frame
    #[serde(default = "default_timeout")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub wait_for_ack: bool,

    /// Treat a nack as a delivery failure
    #[serde(default = "default_true")]
    pub throw_on_failed_ack: bool,

    /// Reconnect after this many messages (0 = unlimited)
    #[serde(default)]
    pub keepalive_max_requests: u64,

    /// Reconnect after the connection sat idle this long
    #[serde(default)]
    pub keepalive_idle_ms: Option<u64>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: None,
            receive_buffer_size: None,
            tcp_no_delay: true,
            so_linger: None,
            so_keepalive: false,
            traffic_class: None,
            max_retry_attempts: default_max_retry_attempts(),
            connect_timeout_ms: default_timeout(),
            read_timeout_ms: default_timeout(),
            wait_for_ack: true,
            throw_on_failed_ack: true,
            keepalive_max_requests: 0,
            keepalive_idle_ms: None,
        }
    }
}

impl SenderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn keepalive_idle(&self) -> Option<Duration> {
        self.keepalive_idle_ms.map(Duration::from_millis)
    }
}

fn default_max_retry_attempts() -> u32 {
    1
}

fn default_timeout() -> u64 {
    3000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanOut {
    /// One destination after another
    #[default]
    Sequential,
    /// All destinations concurrently, joined before returning
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmitterConfig {
    #[serde(default)]
    pub fan_out: FanOut,

    /// How often idle or exhausted connections are swept
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            fan_out: FanOut::default(),
            keepalive_interval_ms: default_keepalive_interval(),
        }
    }
}

impl TransmitterConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

fn default_keepalive_interval() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Send through the handoff queue instead of on the caller's task
    #[serde(default)]
    pub enabled: bool,

    /// 0 = unbounded
    #[serde(default)]
    pub max_len: usize,

    #[serde(default = "default_remove_timeout")]
    pub remove_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_len: 0,
            remove_timeout_ms: default_remove_timeout(),
        }
    }
}

impl QueueConfig {
    pub fn remove_timeout(&self) -> Duration {
        Duration::from_millis(self.remove_timeout_ms)
    }
}

fn default_remove_timeout() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4000))
}
