//! Property-based tests for delivery guarantees and the control loops
//! behind them.
//!
//! - Reliable packets arrive exactly once and in order per channel over a
//!   lossy, duplicating, reordering simulated network.
//! - The RTT estimator converges on a steady sample.
//! - The packet throttle never leaves `[0, limit]` and admits in proportion
//!   to its value.

use std::net::SocketAddr;
use std::time::Duration;

use proptest::prelude::*;
use tether_transport::congestion::{PacketThrottle, PACKET_THROTTLE_SCALE};
use tether_transport::rtt::RttEstimator;
use tether_transport::sim::{ImpairmentConfig, SimNetwork, SimSocket};
use tether_transport::{Event, Host, HostConfig, Packet, PacketFlags, PeerId};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn host(net: &SimNetwork, at: &str, seed: u64) -> Host<SimSocket> {
    let addr: SocketAddr = at.parse().unwrap();
    let config = HostConfig {
        peer_count: 2,
        mtu: 576,
        random_seed: Some(seed),
        ..HostConfig::default()
    };
    Host::with_socket(net.bind(addr).unwrap(), config, net.clock()).unwrap()
}

fn pump(net: &SimNetwork, a: &mut Host<SimSocket>, b: &mut Host<SimSocket>, log: &mut Vec<Event>) {
    while a.service(Duration::ZERO).unwrap().is_some() {}
    while let Some(event) = b.service(Duration::ZERO).unwrap() {
        log.push(event);
    }
    net.advance(Duration::from_millis(1));
}

/// Connect A to B over a clean network; returns A's and B's peer handles.
fn connected_pair(
    net: &SimNetwork,
    a: &mut Host<SimSocket>,
    b: &mut Host<SimSocket>,
) -> (PeerId, PeerId) {
    let peer = a.connect("10.0.0.2:2000".parse().unwrap(), 3, 0).unwrap();
    let mut log = Vec::new();
    for _ in 0..2_000 {
        pump(net, a, b, &mut log);
        if let Some(Event::Connect { peer: remote, .. }) = log.first() {
            return (peer, *remote);
        }
    }
    panic!("handshake did not complete");
}

fn impairment() -> impl Strategy<Value = ImpairmentConfig> {
    (0u32..30, 0u32..10, 0f32..10.0, 0f32..10.0, 0f32..20.0).prop_map(
        |(delay_ms, jitter_ms, loss_percent, duplicate_percent, reorder_percent)| {
            ImpairmentConfig {
                delay_ms,
                jitter_ms,
                loss_percent,
                duplicate_percent,
                reorder_percent,
            }
        },
    )
}

// ─── Reliable Delivery ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn reliable_delivery_is_ordered_and_exactly_once(
        seed in any::<u64>(),
        impairment in impairment(),
        messages in prop::collection::vec((0u8..3, 1usize..2000), 1..30),
    ) {
        let net = SimNetwork::new(seed);
        let mut a = host(&net, "10.0.0.1:1000", seed);
        let mut b = host(&net, "10.0.0.2:2000", seed.wrapping_add(1));
        let (peer, remote) = connected_pair(&net, &mut a, &mut b);
        // Generous timeouts: this property is about ordering, not liveness.
        a.set_timeout(peer, 1 << 20, 60_000, 120_000).unwrap();
        b.set_timeout(remote, 1 << 20, 60_000, 120_000).unwrap();
        net.set_impairment(impairment);

        for (i, (channel, size)) in messages.iter().enumerate() {
            let mut body = (i as u32).to_be_bytes().to_vec();
            body.resize(*size.max(&4), i as u8);
            a.send(peer, *channel, Packet::new(&body, PacketFlags::RELIABLE)).unwrap();
        }

        let mut log = Vec::new();
        for _ in 0..60_000 {
            pump(&net, &mut a, &mut b, &mut log);
            let received = log.iter().filter(|e| matches!(e, Event::Receive { .. })).count();
            if received >= messages.len() {
                break;
            }
        }
        // Let stray duplicates land.
        for _ in 0..200 {
            pump(&net, &mut a, &mut b, &mut log);
        }

        for channel in 0..3u8 {
            let got: Vec<u32> = log
                .iter()
                .filter_map(|e| match e {
                    Event::Receive { channel_id, packet, .. } if *channel_id == channel => {
                        Some(u32::from_be_bytes(packet.data()[..4].try_into().unwrap()))
                    }
                    _ => None,
                })
                .collect();
            let expected: Vec<u32> = messages
                .iter()
                .enumerate()
                .filter(|(_, (c, _))| *c == channel)
                .map(|(i, _)| i as u32)
                .collect();
            prop_assert_eq!(got, expected);
        }
        let all_receive = log.iter().all(|e| matches!(e, Event::Receive { .. }));
        prop_assert!(all_receive);
    }
}

// ─── RTT Estimation ─────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn rtt_converges_on_steady_sample(first in 1u32..10_000, steady in 1u32..10_000) {
        let mut rtt = RttEstimator::new();
        rtt.update(first, true);
        for _ in 0..300 {
            rtt.update(steady, false);
        }
        prop_assert!(rtt.round_trip_time.abs_diff(steady) < 8);
        prop_assert!(rtt.round_trip_time_variance < 8);
        prop_assert!(rtt.retransmit_timeout() >= rtt.round_trip_time);
    }
}

// ─── Throttle Bounds ────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn throttle_stays_within_limit(
        steps in prop::collection::vec(
            (0u32..500, 0u32..500, 0u32..200, prop::option::of(0u32..40)),
            1..200,
        ),
        acceleration in 0u32..8,
        deceleration in 0u32..8,
    ) {
        let mut throttle = PacketThrottle::new(5000, acceleration, deceleration);
        for (rtt, last_rtt, variance, limit) in steps {
            if let Some(limit) = limit {
                throttle.set_limit(limit);
            }
            throttle.adjust(rtt, last_rtt, variance);
            prop_assert!(throttle.limit <= PACKET_THROTTLE_SCALE);
            prop_assert!(throttle.value <= throttle.limit);
        }
    }

    #[test]
    fn throttle_admits_in_proportion(value in 0u32..=PACKET_THROTTLE_SCALE) {
        let mut throttle = PacketThrottle::default();
        throttle.value = value;
        let admitted = (0..PACKET_THROTTLE_SCALE).filter(|_| throttle.admit()).count() as u32;
        prop_assert_eq!(admitted, (value + 1).min(PACKET_THROTTLE_SCALE));
    }
}
