use serde::Deserialize;

use crate::error::{Error, Result};
use crate::wire::{
    MAXIMUM_CHANNEL_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID, MINIMUM_CHANNEL_COUNT, MINIMUM_MTU,
};

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_MTU: u32 = 1392;
pub const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 256 * 1024;
pub const DEFAULT_PEER_COUNT: usize = 64;

pub const DEFAULT_PING_INTERVAL: u32 = 500;
pub const DEFAULT_TIMEOUT_LIMIT: u32 = 32;
pub const DEFAULT_TIMEOUT_MINIMUM: u32 = 5000;
pub const DEFAULT_TIMEOUT_MAXIMUM: u32 = 30000;

// ─── Input (TOML) ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfigInput {
    pub version: u32,
    pub host: HostSectionInput,
    pub peer: PeerConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostSectionInput {
    pub peer_count: Option<usize>,
    pub channel_limit: Option<usize>,
    pub incoming_bandwidth: Option<u32>,
    pub outgoing_bandwidth: Option<u32>,
    pub mtu: Option<u32>,
    pub maximum_packet_size: Option<usize>,
    pub maximum_waiting_data: Option<usize>,
    pub duplicate_peers: Option<usize>,
    pub receive_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    pub random_seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerConfigInput {
    pub ping_interval_ms: Option<u32>,
    pub timeout_limit: Option<u32>,
    pub timeout_minimum_ms: Option<u32>,
    pub timeout_maximum_ms: Option<u32>,
    pub throttle_interval_ms: Option<u32>,
    pub throttle_acceleration: Option<u32>,
    pub throttle_deceleration: Option<u32>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

/// Defaults applied to every peer slot on reset. All times in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConfig {
    pub ping_interval: u32,
    pub timeout_limit: u32,
    pub timeout_minimum: u32,
    pub timeout_maximum: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            timeout_limit: DEFAULT_TIMEOUT_LIMIT,
            timeout_minimum: DEFAULT_TIMEOUT_MINIMUM,
            timeout_maximum: DEFAULT_TIMEOUT_MAXIMUM,
            packet_throttle_interval: crate::congestion::PACKET_THROTTLE_INTERVAL,
            packet_throttle_acceleration: crate::congestion::PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: crate::congestion::PACKET_THROTTLE_DECELERATION,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    /// Number of peer slots.
    pub peer_count: usize,
    /// Maximum channels per connection.
    pub channel_limit: usize,
    /// Bytes/second; 0 = unlimited.
    pub incoming_bandwidth: u32,
    /// Bytes/second; 0 = unlimited.
    pub outgoing_bandwidth: u32,
    pub mtu: u32,
    pub maximum_packet_size: usize,
    /// Per-peer cap on received bytes not yet taken by the application.
    pub maximum_waiting_data: usize,
    /// Peers allowed from a single IP address.
    pub duplicate_peers: usize,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Seed for connect ids; drawn from the OS when `None`.
    pub random_seed: Option<u64>,
    pub peer: PeerConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_count: DEFAULT_PEER_COUNT,
            channel_limit: MAXIMUM_CHANNEL_COUNT,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            mtu: DEFAULT_MTU,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
            duplicate_peers: MAXIMUM_PEER_ID as usize,
            receive_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            send_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            random_seed: None,
            peer: PeerConfig::default(),
        }
    }
}

impl HostConfigInput {
    pub fn resolve(self) -> Result<HostConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(Error::InvalidConfig(format!(
                "unsupported config version {}",
                version
            )));
        }

        let defaults = HostConfig::default();
        let host = self.host;
        let peer = self.peer;
        let config = HostConfig {
            peer_count: host.peer_count.unwrap_or(defaults.peer_count),
            channel_limit: host.channel_limit.unwrap_or(defaults.channel_limit),
            incoming_bandwidth: host.incoming_bandwidth.unwrap_or(0),
            outgoing_bandwidth: host.outgoing_bandwidth.unwrap_or(0),
            mtu: host.mtu.unwrap_or(defaults.mtu),
            maximum_packet_size: host
                .maximum_packet_size
                .unwrap_or(defaults.maximum_packet_size),
            maximum_waiting_data: host
                .maximum_waiting_data
                .unwrap_or(defaults.maximum_waiting_data),
            duplicate_peers: host.duplicate_peers.unwrap_or(defaults.duplicate_peers),
            receive_buffer_size: host
                .receive_buffer_size
                .unwrap_or(defaults.receive_buffer_size),
            send_buffer_size: host.send_buffer_size.unwrap_or(defaults.send_buffer_size),
            random_seed: host.random_seed,
            peer: PeerConfig {
                ping_interval: peer.ping_interval_ms.unwrap_or(DEFAULT_PING_INTERVAL),
                timeout_limit: peer.timeout_limit.unwrap_or(DEFAULT_TIMEOUT_LIMIT),
                timeout_minimum: peer.timeout_minimum_ms.unwrap_or(DEFAULT_TIMEOUT_MINIMUM),
                timeout_maximum: peer.timeout_maximum_ms.unwrap_or(DEFAULT_TIMEOUT_MAXIMUM),
                packet_throttle_interval: peer
                    .throttle_interval_ms
                    .unwrap_or(defaults.peer.packet_throttle_interval),
                packet_throttle_acceleration: peer
                    .throttle_acceleration
                    .unwrap_or(defaults.peer.packet_throttle_acceleration),
                packet_throttle_deceleration: peer
                    .throttle_deceleration
                    .unwrap_or(defaults.peer.packet_throttle_deceleration),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

impl HostConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(HostConfig::default());
        }
        let parsed: HostConfigInput = toml::from_str(input)
            .map_err(|e| Error::InvalidConfig(format!("invalid config TOML: {}", e)))?;
        parsed.resolve()
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAXIMUM_PEER_ID as usize).contains(&self.peer_count) {
            return Err(Error::InvalidConfig(format!(
                "peer_count {} outside [1, {}]",
                self.peer_count, MAXIMUM_PEER_ID
            )));
        }
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&self.channel_limit) {
            return Err(Error::InvalidChannelCount(self.channel_limit));
        }
        if !(MINIMUM_MTU..=MAXIMUM_MTU).contains(&self.mtu) {
            return Err(Error::InvalidConfig(format!(
                "mtu {} outside [{}, {}]",
                self.mtu, MINIMUM_MTU, MAXIMUM_MTU
            )));
        }
        if self.maximum_packet_size == 0 || self.maximum_waiting_data == 0 {
            return Err(Error::InvalidConfig(
                "packet and waiting data limits must be non-zero".into(),
            ));
        }
        if self.peer.timeout_minimum > self.peer.timeout_maximum {
            return Err(Error::InvalidConfig(format!(
                "timeout_minimum {} exceeds timeout_maximum {}",
                self.peer.timeout_minimum, self.peer.timeout_maximum
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_default() {
        let cfg = HostConfig::from_toml_str("  ").unwrap();
        assert_eq!(cfg, HostConfig::default());
        assert_eq!(cfg.mtu, 1392);
        assert_eq!(cfg.peer.timeout_maximum, 30000);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [host]
            peer_count = 8
            channel_limit = 2
            outgoing_bandwidth = 57600
            mtu = 576
            random_seed = 7

            [peer]
            ping_interval_ms = 250
            timeout_maximum_ms = 10000
            throttle_acceleration = 4
        "#;
        let cfg = HostConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.peer_count, 8);
        assert_eq!(cfg.channel_limit, 2);
        assert_eq!(cfg.outgoing_bandwidth, 57600);
        assert_eq!(cfg.incoming_bandwidth, 0);
        assert_eq!(cfg.mtu, 576);
        assert_eq!(cfg.random_seed, Some(7));
        assert_eq!(cfg.peer.ping_interval, 250);
        assert_eq!(cfg.peer.timeout_maximum, 10000);
        assert_eq!(cfg.peer.timeout_minimum, DEFAULT_TIMEOUT_MINIMUM);
        assert_eq!(cfg.peer.packet_throttle_acceleration, 4);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(HostConfig::from_toml_str("[host]\nmtu = 100").is_err());
        assert!(matches!(
            HostConfig::from_toml_str("[host]\nchannel_limit = 0"),
            Err(Error::InvalidChannelCount(0))
        ));
        assert!(HostConfig::from_toml_str("[host]\npeer_count = 0").is_err());
        assert!(HostConfig::from_toml_str("[host]\nmaximum_packet_size = 0").is_err());
        assert!(HostConfig::from_toml_str("version = 9").is_err());
        assert!(HostConfig::from_toml_str("[peer]\ntimeout_minimum_ms = 40000").is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = HostConfig::from_toml_str("[host\nmtu = 1").unwrap_err();
        assert!(err.to_string().contains("invalid config TOML"));
    }
}
