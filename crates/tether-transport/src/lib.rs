//! # tether-transport
//!
//! Reliable, sequenced, multi-channel messaging over UDP.
//!
//! A [`Host`] owns one socket and a fixed table of peer slots. Each
//! connection carries up to 255 independent channels; packets on a channel
//! are delivered reliably in order, unreliably but sequenced, or
//! unsequenced. Large packets are fragmented and reassembled transparently.
//! The host is single-threaded and polled: every call to
//! [`Host::service`] sends, receives and reports at most one [`Event`].
//!
//! ## Crate structure
//!
//! - [`wire`]: Protocol header and command encoding
//! - [`packet`]: Reference-counted application packets
//! - [`fragment`]: Fragment slicing and reassembly
//! - [`rtt`]: Round-trip estimation
//! - [`congestion`]: Packet throttle and bandwidth windows
//! - [`peer`]: Per-connection state and sequencing
//! - [`host`]: Service loop, handshake and dispatch
//! - [`codec`]: Checksum, compression and encryption hooks
//! - [`socket`]: Datagram transport abstraction
//! - [`sim`]: Deterministic in-memory network for tests
//! - [`config`]: Host and peer configuration
//! - [`stats`]: Host and peer statistics

mod arq;
mod channel;
pub mod codec;
pub mod config;
pub mod congestion;
pub mod error;
pub mod fragment;
pub mod host;
pub mod packet;
pub mod peer;
mod receiver;
pub mod rtt;
mod sender;
pub mod sim;
pub mod socket;
pub mod stats;
pub mod time;
pub mod wire;

pub use codec::{crc32, AesGcmEncryptor, ChecksumFn, Compressor, Encryptor, Intercept, InterceptAction};
pub use config::{HostConfig, PeerConfig};
pub use error::{Error, Result};
pub use host::{Event, Host};
pub use packet::{Packet, PacketBuilder, PacketFlags};
pub use peer::{PeerId, PeerState};
pub use socket::{Socket, UdpTransport};
pub use stats::{HostStats, PeerStats};

/// Protocol version: major 6, minor 1, patch 0.
pub const VERSION: u32 = (6 << 16) | (1 << 8);
