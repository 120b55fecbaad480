//! Hot-path benchmarks for tether-transport.
//!
//! Measures:
//! - Command encode/decode for a full datagram
//! - Fragment reassembly of a large packet
//! - CRC-32 over an MTU-sized datagram
//! - End-to-end reliable transfer between two hosts on the simulated network
//!
//! Run with: cargo bench --package tether-transport

use std::hint::black_box;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use tether_transport::fragment::{split, Reassembly};
use tether_transport::sim::{SimNetwork, SimSocket};
use tether_transport::wire::{
    decode_commands, Command, CommandBody, CommandHeader, MAXIMUM_PACKET_COMMANDS,
};
use tether_transport::{crc32, Event, Host, HostConfig, Packet, PacketFlags, PeerId};

// ─── Wire ────────────────────────────────────────────────────────────────

fn full_datagram() -> Bytes {
    let mut buf = BytesMut::new();
    for sequence in 0..MAXIMUM_PACKET_COMMANDS as u16 {
        let mut header = CommandHeader::new(0).acknowledged();
        header.reliable_sequence_number = sequence;
        Command::new(header, CommandBody::SendReliable { data_length: 32 }).encode(&mut buf);
        buf.extend_from_slice(&[0xAB; 32]);
    }
    buf.freeze()
}

fn bench_wire(c: &mut Criterion) {
    let datagram = full_datagram();
    let mut group = c.benchmark_group("wire");
    group.throughput(Throughput::Bytes(datagram.len() as u64));

    group.bench_function("decode_32_commands", |b| {
        b.iter(|| black_box(decode_commands(black_box(datagram.clone()))));
    });

    group.bench_function("encode_32_commands", |b| {
        let command = Command::new(
            CommandHeader::new(0).acknowledged(),
            CommandBody::SendReliable { data_length: 32 },
        );
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(1400);
            for _ in 0..MAXIMUM_PACKET_COMMANDS {
                black_box(command).encode(&mut buf);
                buf.extend_from_slice(&[0xAB; 32]);
            }
            black_box(buf);
        });
    });

    group.bench_function("crc32_1392B", |b| {
        let data = vec![0x5Au8; 1392];
        b.iter(|| black_box(crc32(&[black_box(&data[..])])));
    });

    group.finish();
}

// ─── Fragmentation ───────────────────────────────────────────────────────

fn bench_reassembly(c: &mut Criterion) {
    let data = vec![0xCDu8; 64 * 1024];
    let slices = split(data.len(), 1363).unwrap_or_default();

    let mut group = c.benchmark_group("fragment");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("reassemble_64KiB", |b| {
        b.iter(|| {
            let mut reassembly = Reassembly::new(data.len() as u32, slices.len() as u32);
            for slice in slices.iter().rev() {
                let start = slice.offset as usize;
                reassembly.insert(
                    slice.number,
                    slice.offset,
                    &data[start..start + slice.length as usize],
                );
            }
            black_box(reassembly.take());
        });
    });
    group.finish();
}

// ─── Host ────────────────────────────────────────────────────────────────

fn connected_pair() -> (SimNetwork, Host<SimSocket>, Host<SimSocket>, PeerId) {
    let net = SimNetwork::new(1);
    let config = HostConfig {
        peer_count: 1,
        random_seed: Some(1),
        ..HostConfig::default()
    };
    let mut a = Host::with_socket(
        net.bind("10.0.0.1:1000".parse().unwrap()).unwrap(),
        config.clone(),
        net.clock(),
    )
    .unwrap();
    let mut b = Host::with_socket(
        net.bind("10.0.0.2:2000".parse().unwrap()).unwrap(),
        config,
        net.clock(),
    )
    .unwrap();
    let peer = a.connect("10.0.0.2:2000".parse().unwrap(), 1, 0).unwrap();

    let mut a_ready = false;
    let mut b_ready = false;
    while !(a_ready && b_ready) {
        while let Some(event) = a.service(Duration::ZERO).unwrap() {
            a_ready |= matches!(event, Event::Connect { .. });
        }
        while let Some(event) = b.service(Duration::ZERO).unwrap() {
            b_ready |= matches!(event, Event::Connect { .. });
        }
        net.advance(Duration::from_millis(1));
    }
    (net, a, b, peer)
}

fn bench_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("host");
    let payload = Bytes::from(vec![0xEFu8; 1000]);
    group.throughput(Throughput::Elements(100));

    group.bench_function("reliable_100x1000B", |bench| {
        let (net, mut a, mut b, peer) = connected_pair();
        bench.iter(|| {
            for _ in 0..100 {
                a.send(peer, 0, Packet::from_bytes(payload.clone(), PacketFlags::RELIABLE))
                    .unwrap();
            }
            let mut delivered = 0;
            while delivered < 100 {
                while a.service(Duration::ZERO).unwrap().is_some() {}
                while let Some(event) = b.service(Duration::ZERO).unwrap() {
                    if matches!(event, Event::Receive { .. }) {
                        delivered += 1;
                    }
                }
                net.advance(Duration::from_millis(1));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_wire, bench_reassembly, bench_transfer);
criterion_main!(benches);
