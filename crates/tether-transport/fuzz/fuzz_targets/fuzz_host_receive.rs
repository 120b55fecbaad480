#![no_main]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tether_transport::sim::SimNetwork;
use tether_transport::wire::{
    Command, CommandBody, CommandHeader, Connect, ProtocolHeader, CONTROL_CHANNEL,
    MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE,
};
use tether_transport::{Host, HostConfig, Socket};

/// Socket that replays a fixed list of datagrams and discards sends.
struct Replay {
    local: SocketAddr,
    inbound: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl Socket for Replay {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn send_to(&mut self, data: &[u8], _addr: SocketAddr) -> io::Result<usize> {
        Ok(data.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((data, from)) = self.inbound.pop_front() else {
            return Ok(None);
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(Some((n, from)))
    }

    fn wait(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(!self.inbound.is_empty())
    }
}

fn connect_datagram() -> Vec<u8> {
    let mut buf = BytesMut::new();
    ProtocolHeader {
        peer_id: MAXIMUM_PEER_ID,
        session_id: 0,
        compressed: false,
        encrypted: false,
        sent_time: Some(1),
    }
    .encode(&mut buf);
    Command::new(
        CommandHeader::new(CONTROL_CHANNEL).acknowledged(),
        CommandBody::Connect(Connect {
            outgoing_peer_id: 0,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            mtu: 1392,
            window_size: MAXIMUM_WINDOW_SIZE,
            channel_count: 4,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            packet_throttle_interval: 5000,
            packet_throttle_acceleration: 2,
            packet_throttle_deceleration: 2,
            connect_id: 1,
            data: 0,
        }),
    )
    .encode(&mut buf);
    buf.to_vec()
}

/// Fuzz the host receive path with a connected peer.
///
/// A valid CONNECT opens slot 0; the input is then split into datagrams on
/// 0xFF 0xFF markers and delivered from the same address, each behind a
/// header addressed to slot 0. The host must never panic or return an
/// error for remote input.
fuzz_target!(|data: &[u8]| {
    let remote: SocketAddr = "10.0.0.1:1000".parse().unwrap();
    let mut inbound = VecDeque::new();
    inbound.push_back((connect_datagram(), remote));

    let mut header = BytesMut::new();
    ProtocolHeader {
        peer_id: 0,
        session_id: 0,
        compressed: false,
        encrypted: false,
        sent_time: Some(2),
    }
    .encode(&mut header);
    let mut start = 0;
    for end in (1..data.len()).filter(|&i| data[i - 1] == 0xFF && data[i] == 0xFF) {
        if end > start {
            let mut datagram = header.to_vec();
            datagram.extend_from_slice(&data[start..end - 1]);
            inbound.push_back((datagram, remote));
        }
        start = end + 1;
    }
    if start < data.len() {
        let mut datagram = header.to_vec();
        datagram.extend_from_slice(&data[start..]);
        inbound.push_back((datagram, remote));
    }

    let socket = Replay {
        local: "10.0.0.2:2000".parse().unwrap(),
        inbound,
    };
    let config = HostConfig {
        peer_count: 2,
        random_seed: Some(0),
        ..HostConfig::default()
    };
    let net = SimNetwork::new(0);
    let mut host = Host::with_socket(socket, config, net.clock()).unwrap();
    for _ in 0..8 {
        while host.service(Duration::ZERO).unwrap().is_some() {}
    }
});
