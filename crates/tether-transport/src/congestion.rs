//! # Congestion Control
//!
//! Two mechanisms share this module.
//!
//! **Packet throttle.** Each peer carries a throttle value in
//! `[0, PACKET_THROTTLE_SCALE]`. Unreliable commands are admitted with
//! probability `value / SCALE` using a deterministic rotating counter, and
//! the value moves with every acknowledged RTT sample:
//!
//! ```text
//!   last_rtt <= last_var          ──▶ value = limit
//!   rtt <= last_rtt               ──▶ value += acceleration  (capped at limit)
//!   rtt >  last_rtt + 2·last_var  ──▶ value -= deceleration  (floored at 0)
//! ```
//!
//! **Bandwidth limiting.** Once per second the host splits its configured
//! outgoing bandwidth across connected peers (lowering each peer's throttle
//! limit), and when asked to recalculate, splits its incoming bandwidth and
//! tells every peer its share with a BANDWIDTH_LIMIT command.

use crate::host::Host;
use crate::socket::Socket;
use crate::time::time_difference;
use crate::wire::{
    Command, CommandBody, CommandHeader, CONTROL_CHANNEL, MAXIMUM_WINDOW_SIZE, MINIMUM_WINDOW_SIZE,
};

// ─── Constants ──────────────────────────────────────────────────────────────

pub const PACKET_THROTTLE_SCALE: u32 = 32;
pub const DEFAULT_PACKET_THROTTLE: u32 = 32;
pub const PACKET_THROTTLE_COUNTER: u32 = 7;
pub const PACKET_THROTTLE_ACCELERATION: u32 = 2;
pub const PACKET_THROTTLE_DECELERATION: u32 = 2;
pub const PACKET_THROTTLE_INTERVAL: u32 = 5000;

pub const WINDOW_SIZE_SCALE: u32 = 64 * 1024;
pub const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;

// ─── Packet Throttle ────────────────────────────────────────────────────────

/// Outcome of one throttle adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAdjustment {
    Reset,
    Accelerated,
    Decelerated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketThrottle {
    pub value: u32,
    pub limit: u32,
    counter: u32,
    pub interval: u32,
    pub acceleration: u32,
    pub deceleration: u32,
}

impl Default for PacketThrottle {
    fn default() -> Self {
        PacketThrottle::new(
            PACKET_THROTTLE_INTERVAL,
            PACKET_THROTTLE_ACCELERATION,
            PACKET_THROTTLE_DECELERATION,
        )
    }
}

impl PacketThrottle {
    pub fn new(interval: u32, acceleration: u32, deceleration: u32) -> Self {
        PacketThrottle {
            value: DEFAULT_PACKET_THROTTLE,
            limit: PACKET_THROTTLE_SCALE,
            counter: 0,
            interval,
            acceleration,
            deceleration,
        }
    }

    /// React to one RTT sample against the previous interval's reference.
    pub fn adjust(&mut self, rtt: u32, last_rtt: u32, last_variance: u32) -> ThrottleAdjustment {
        if last_rtt <= last_variance {
            self.value = self.limit;
            ThrottleAdjustment::Reset
        } else if rtt <= last_rtt {
            self.value = self.value.saturating_add(self.acceleration).min(self.limit);
            ThrottleAdjustment::Accelerated
        } else if rtt > last_rtt.saturating_add(last_variance.saturating_mul(2)) {
            self.value = self.value.saturating_sub(self.deceleration);
            ThrottleAdjustment::Decelerated
        } else {
            ThrottleAdjustment::Unchanged
        }
    }

    /// Decide whether the next unreliable command goes out.
    pub fn admit(&mut self) -> bool {
        self.counter = (self.counter + PACKET_THROTTLE_COUNTER) % PACKET_THROTTLE_SCALE;
        self.counter <= self.value
    }

    /// Lower (or raise) the ceiling, pulling the current value under it.
    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit.min(PACKET_THROTTLE_SCALE);
        self.value = self.value.min(self.limit);
    }
}

/// Reliable window size implied by two bandwidth figures (0 = unlimited).
pub fn window_size(a: u32, b: u32) -> u32 {
    let bandwidth = match (a, b) {
        (0, 0) => return MAXIMUM_WINDOW_SIZE,
        (0, x) | (x, 0) => x,
        (x, y) => x.min(y),
    };
    ((bandwidth / WINDOW_SIZE_SCALE).saturating_mul(MINIMUM_WINDOW_SIZE))
        .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}

// ─── Bandwidth Throttle ─────────────────────────────────────────────────────

impl<S: Socket> Host<S> {
    /// Redistribute bandwidth across connected peers. Runs at most once per
    /// [`BANDWIDTH_THROTTLE_INTERVAL`].
    pub(crate) fn bandwidth_throttle(&mut self) {
        let now = self.service_time;
        let elapsed = time_difference(now, self.bandwidth_throttle_epoch);
        if elapsed < BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }
        self.bandwidth_throttle_epoch = now;

        let mut peers_remaining = self.connected_peers as u64;
        if peers_remaining == 0 {
            return;
        }
        let elapsed = elapsed as u64;
        let scale = PACKET_THROTTLE_SCALE as u64;

        let mut data_total = u64::MAX;
        let mut bandwidth = u64::MAX;
        if self.config.outgoing_bandwidth != 0 {
            data_total = self
                .peers
                .iter()
                .filter(|p| p.state.is_connected())
                .map(|p| p.outgoing_data_total as u64)
                .sum();
            bandwidth = self.config.outgoing_bandwidth as u64 * elapsed / 1000;
        }

        let mut needs_adjustment = self.bandwidth_limited_peers > 0;
        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;
            let throttle = if data_total <= bandwidth {
                scale
            } else {
                bandwidth * scale / data_total
            };

            for peer in self.peers.iter_mut() {
                if !peer.state.is_connected()
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == now
                {
                    continue;
                }
                let peer_bandwidth = peer.incoming_bandwidth as u64 * elapsed / 1000;
                let outgoing = peer.outgoing_data_total as u64;
                if throttle * outgoing / scale <= peer_bandwidth {
                    continue;
                }

                let limit = (peer_bandwidth * scale / outgoing).max(1);
                peer.throttle.set_limit(limit as u32);
                peer.outgoing_bandwidth_throttle_epoch = now;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;

                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            let throttle = if data_total <= bandwidth {
                scale
            } else {
                bandwidth * scale / data_total
            };
            for peer in self.peers.iter_mut() {
                if !peer.state.is_connected() || peer.outgoing_bandwidth_throttle_epoch == now {
                    continue;
                }
                peer.throttle.set_limit(throttle as u32);
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;
            self.recalculate_bandwidth_limits_now(now);
        }
    }

    fn recalculate_bandwidth_limits_now(&mut self, now: u32) {
        let mut peers_remaining = self.connected_peers as u32;
        let mut bandwidth = self.config.incoming_bandwidth;
        let mut bandwidth_limit = 0;

        if bandwidth != 0 {
            let mut needs_adjustment = true;
            while peers_remaining > 0 && needs_adjustment {
                needs_adjustment = false;
                bandwidth_limit = bandwidth / peers_remaining;
                for peer in self.peers.iter_mut() {
                    if !peer.state.is_connected() || peer.incoming_bandwidth_throttle_epoch == now {
                        continue;
                    }
                    if peer.outgoing_bandwidth > 0 && peer.outgoing_bandwidth >= bandwidth_limit {
                        continue;
                    }
                    peer.incoming_bandwidth_throttle_epoch = now;
                    needs_adjustment = true;
                    peers_remaining -= 1;
                    bandwidth = bandwidth.saturating_sub(peer.outgoing_bandwidth);
                }
            }
        }

        let outgoing_bandwidth = self.config.outgoing_bandwidth;
        for peer in self.peers.iter_mut() {
            if !peer.state.is_connected() {
                continue;
            }
            let incoming_bandwidth = if peer.incoming_bandwidth_throttle_epoch == now {
                peer.outgoing_bandwidth
            } else {
                bandwidth_limit
            };
            let command = Command::new(
                CommandHeader::new(CONTROL_CHANNEL).acknowledged(),
                CommandBody::BandwidthLimit {
                    incoming_bandwidth,
                    outgoing_bandwidth,
                },
            );
            peer.queue_outgoing_command(command, None, 0, 0);
        }
        tracing::debug!(
            peers = self.connected_peers,
            bandwidth_limit,
            "recalculated bandwidth limits"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Throttle Tests ─────────────────────────────────────────────────

    #[test]
    fn resets_to_limit_when_reference_is_noisy() {
        let mut throttle = PacketThrottle::default();
        throttle.value = 3;
        assert_eq!(throttle.adjust(100, 10, 10), ThrottleAdjustment::Reset);
        assert_eq!(throttle.value, PACKET_THROTTLE_SCALE);
    }

    #[test]
    fn accelerates_and_decelerates() {
        let mut throttle = PacketThrottle::default();
        throttle.value = 10;
        assert_eq!(throttle.adjust(40, 50, 5), ThrottleAdjustment::Accelerated);
        assert_eq!(throttle.value, 12);
        assert_eq!(throttle.adjust(70, 50, 5), ThrottleAdjustment::Decelerated);
        assert_eq!(throttle.value, 10);
        assert_eq!(throttle.adjust(55, 50, 5), ThrottleAdjustment::Unchanged);
        assert_eq!(throttle.value, 10);
    }

    #[test]
    fn value_stays_in_bounds() {
        let mut throttle = PacketThrottle::new(5000, 7, 9);
        for _ in 0..20 {
            throttle.adjust(10, 50, 1);
        }
        assert_eq!(throttle.value, throttle.limit);
        for _ in 0..20 {
            throttle.adjust(500, 50, 1);
        }
        assert_eq!(throttle.value, 0);
    }

    #[test]
    fn set_limit_clamps_value() {
        let mut throttle = PacketThrottle::default();
        throttle.set_limit(5);
        assert_eq!(throttle.value, 5);
        throttle.adjust(1, 50, 1);
        assert_eq!(throttle.value, 5);
    }

    #[test]
    fn admission_matches_throttle_ratio() {
        let mut throttle = PacketThrottle::default();
        throttle.value = 16;
        let admitted = (0..3200).filter(|_| throttle.admit()).count();
        // The counter visits every residue mod 32 once per 32 steps.
        assert_eq!(admitted, 1700);

        throttle.value = PACKET_THROTTLE_SCALE;
        assert!((0..64).all(|_| throttle.admit()));
    }

    // ─── Window Size Tests ──────────────────────────────────────────────

    #[test]
    fn window_size_from_bandwidth() {
        assert_eq!(window_size(0, 0), MAXIMUM_WINDOW_SIZE);
        assert_eq!(window_size(0, 1000), MINIMUM_WINDOW_SIZE);
        assert_eq!(window_size(8 * WINDOW_SIZE_SCALE, 0), 8 * MINIMUM_WINDOW_SIZE);
        assert_eq!(
            window_size(8 * WINDOW_SIZE_SCALE, 2 * WINDOW_SIZE_SCALE),
            2 * MINIMUM_WINDOW_SIZE
        );
        assert_eq!(window_size(u32::MAX, u32::MAX), MAXIMUM_WINDOW_SIZE);
    }
}
