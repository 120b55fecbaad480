//! # Transport Statistics
//!
//! Point-in-time snapshots of host and peer counters, serializable to JSON
//! for logging or export.

use std::net::SocketAddr;

use serde::Serialize;

use crate::peer::{PeerId, PeerState};

/// Packet loss is reported as a fraction of this scale.
pub const PACKET_LOSS_SCALE: u32 = 1 << 16;

// ─── Host Stats ─────────────────────────────────────────────────────────────

/// Host-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    /// Datagrams written to the socket.
    pub total_sent_packets: u64,
    /// Bytes written to the socket (after compression and encryption).
    pub total_sent_data: u64,
    /// Datagrams read from the socket.
    pub total_received_packets: u64,
    pub total_received_data: u64,
    pub peer_count: usize,
    pub connected_peers: usize,
    pub bandwidth_limited_peers: usize,
    pub channel_limit: usize,
    pub mtu: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
}

// ─── Peer Stats ─────────────────────────────────────────────────────────────

/// Snapshot of one peer slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    pub id: PeerId,
    pub state: PeerState,
    pub address: Option<SocketAddr>,
    pub connect_id: u32,
    pub channel_count: usize,
    pub mtu: u32,
    pub window_size: u32,
    /// Smoothed round-trip time in ms.
    pub round_trip_time: u32,
    pub round_trip_time_variance: u32,
    pub last_round_trip_time: u32,
    /// Service time (ms) of the last datagram sent to the peer.
    pub last_send_time: u32,
    /// Service time (ms) of the last datagram accepted from the peer.
    pub last_receive_time: u32,
    /// Smoothed packet loss, scaled by [`PACKET_LOSS_SCALE`].
    pub packet_loss: u32,
    pub packet_loss_variance: u32,
    pub packet_throttle: u32,
    pub packet_throttle_limit: u32,
    pub packets_sent: u32,
    pub packets_lost: u32,
    pub reliable_data_in_transit: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub queued_acknowledgements: usize,
    pub queued_outgoing: usize,
    pub sent_unacknowledged: usize,
    /// Received bytes waiting for the application.
    pub waiting_data: usize,
}

impl PeerStats {
    /// Packet loss as a fraction in `[0, 1]`.
    pub fn loss_rate(&self) -> f64 {
        self.packet_loss as f64 / PACKET_LOSS_SCALE as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_rate_scales() {
        let stats = PeerStats {
            id: PeerId(0),
            state: PeerState::Connected,
            address: None,
            connect_id: 0,
            channel_count: 1,
            mtu: 1392,
            window_size: 65536,
            round_trip_time: 50,
            round_trip_time_variance: 5,
            last_round_trip_time: 50,
            last_send_time: 1200,
            last_receive_time: 1150,
            packet_loss: PACKET_LOSS_SCALE / 4,
            packet_loss_variance: 0,
            packet_throttle: 32,
            packet_throttle_limit: 32,
            packets_sent: 0,
            packets_lost: 0,
            reliable_data_in_transit: 0,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            queued_acknowledgements: 0,
            queued_outgoing: 0,
            sent_unacknowledged: 0,
            waiting_data: 0,
        };
        assert!((stats.loss_rate() - 0.25).abs() < f64::EPSILON);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "Connected");
        assert_eq!(json["round_trip_time"], 50);
        assert_eq!(json["last_receive_time"], 1150);
    }

    #[test]
    fn host_stats_serialize() {
        let stats = HostStats {
            total_sent_packets: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"total_sent_packets\":3"));
    }
}
