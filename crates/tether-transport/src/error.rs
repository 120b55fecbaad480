//! # Errors
//!
//! Failures surfaced to the caller. Faults caused by remote input (malformed
//! datagrams, out-of-window sequence numbers, codec rejections) never show up
//! here: the offending frame is dropped and logged instead.

use crate::peer::PeerId;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel count {0} outside [1, 255]")]
    InvalidChannelCount(usize),

    #[error("channel {channel} not open on peer {peer} ({channel_count} channels)")]
    InvalidChannel {
        peer: PeerId,
        channel: u8,
        channel_count: usize,
    },

    #[error("no free peer slot")]
    NoAvailablePeers,

    #[error("packet of {size} bytes exceeds the {limit} byte limit")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("packet needs {0} fragments, more than the protocol allows")]
    TooManyFragments(usize),

    #[error("peer {0} is not connected")]
    PeerNotConnected(PeerId),

    #[error("peer {0} does not exist")]
    InvalidPeer(PeerId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("intercept callback reported an error")]
    Intercept,
}
