//! # Outbound Path
//!
//! Builds and transmits datagrams for every live peer. One send pass per
//! peer assembles, in order:
//!
//! 1. Queued acknowledgements.
//! 2. Outgoing commands, merged from the reliable-data queue and the
//!    everything-else queue in enqueue order, subject to the reliable
//!    window, the in-transit byte budget and the unreliable throttle.
//! 3. A keep-alive ping when the peer has been quiet for `ping_interval`.
//!
//! A peer that filled its datagram is marked `continue_sending` and gets
//! another pass, so a burst drains across several datagrams in one flush.
//!
//! Datagram layout: protocol header, optional checksum, then the command
//! bytes (compressed when that helps). Encryption covers everything after
//! the header.

use bytes::{BufMut, BytesMut};
use tracing::{trace, warn};

use crate::arq::OutgoingCommand;
use crate::channel::{Channel, FREE_RELIABLE_WINDOWS, RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE};
use crate::congestion::PACKET_THROTTLE_SCALE;
use crate::host::Host;
use crate::packet::Packet;
use crate::peer::{PeerId, PeerState};
use crate::socket::Socket;
use crate::stats::PACKET_LOSS_SCALE;
use crate::time::{time_difference, time_greater_equal, time_less};
use crate::wire::{
    Command, CommandBody, CommandHeader, CommandType, ProtocolHeader, CHECKSUM_SIZE,
    MAXIMUM_PACKET_COMMANDS, MAXIMUM_PEER_ID, MAX_HEADER_SIZE,
};

/// Interval between packet-loss estimate updates, in ms.
pub const PACKET_LOSS_INTERVAL: u32 = 10_000;

// ─── Datagram ───────────────────────────────────────────────────────────────

/// Commands gathered for one outgoing datagram.
pub(crate) struct Datagram {
    commands: BytesMut,
    command_count: usize,
    /// Projected wire size including header, checksum and cipher overhead.
    size: usize,
    /// Set once a reliable command is included; the header then carries
    /// the send timestamp for RTT sampling.
    sent_time: bool,
    packets: Vec<Packet>,
}

impl Datagram {
    fn new(overhead: usize) -> Self {
        Datagram {
            commands: BytesMut::new(),
            command_count: 0,
            size: overhead,
            sent_time: false,
            packets: Vec::new(),
        }
    }

    #[inline]
    fn room(&self, mtu: u32) -> usize {
        (mtu as usize).saturating_sub(self.size)
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.command_count >= MAXIMUM_PACKET_COMMANDS
    }

    fn push_command(&mut self, command: &Command) {
        command.encode(&mut self.commands);
        self.size += command.size();
        self.command_count += 1;
    }

    fn push_outgoing(&mut self, outgoing: &OutgoingCommand) {
        self.push_command(&outgoing.command);
        if let Some(payload) = outgoing.payload() {
            self.size += payload.len();
            self.commands.extend_from_slice(&payload);
        }
        if let Some(packet) = &outgoing.packet {
            self.packets.push(packet.clone());
        }
    }
}

// ─── Send Loop ──────────────────────────────────────────────────────────────

impl<S: Socket> Host<S> {
    /// Run send passes over all peers until none has more to send.
    ///
    /// With `check_for_timeouts`, overdue reliable commands are requeued
    /// and peers past their timeout budget are reported.
    pub(crate) fn send_outgoing_commands(&mut self, check_for_timeouts: bool) {
        let mut pass = 0;
        let mut last_pass = 0;
        while pass <= last_pass {
            for index in 0..self.peers.len() {
                let peer = &self.peers[index];
                if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie)
                    || (pass > 0 && !peer.continue_sending)
                {
                    continue;
                }
                self.peers[index].continue_sending = false;
                let sent = self.send_peer(index, check_for_timeouts);
                if sent && self.peers[index].continue_sending {
                    last_pass = pass + 1;
                }
            }
            pass += 1;
        }
    }

    fn datagram_overhead(&self) -> usize {
        let checksum = if self.checksum.is_some() { CHECKSUM_SIZE } else { 0 };
        let cipher = self.encryptor.as_ref().map_or(0, |e| e.overhead());
        MAX_HEADER_SIZE + checksum + cipher
    }

    /// Assemble and transmit one datagram for `index`. Returns whether
    /// anything went out.
    fn send_peer(&mut self, index: usize, check_for_timeouts: bool) -> bool {
        let now = self.service_time;
        let mut datagram = Datagram::new(self.datagram_overhead());

        if !self.peers[index].acknowledgements.is_empty() {
            self.send_acknowledgements(index, &mut datagram);
        }

        let peer = &mut self.peers[index];
        if check_for_timeouts
            && !peer.sent_reliable_commands.is_empty()
            && time_greater_equal(now, peer.next_timeout)
            && peer.check_timeouts(now)
        {
            self.notify_disconnect_timeout(index);
            return false;
        }

        let peer = &self.peers[index];
        let idle =
            peer.outgoing_commands.is_empty() && peer.outgoing_send_reliable_commands.is_empty();
        let can_ping = idle || self.check_outgoing_commands(index, &mut datagram);

        let peer = &self.peers[index];
        if can_ping
            && peer.sent_reliable_commands.is_empty()
            && time_difference(now, peer.last_receive_time) >= peer.ping_interval
            && datagram.room(peer.mtu) >= CommandType::Ping.size()
        {
            self.peers[index].ping();
            self.check_outgoing_commands(index, &mut datagram);
        }

        if datagram.command_count == 0 {
            return false;
        }

        self.update_packet_loss(index);
        self.transmit(index, datagram);
        true
    }

    // ─── Command Selection ──────────────────────────────────────────────

    fn send_acknowledgements(&mut self, index: usize, datagram: &mut Datagram) {
        let mut disconnect_acknowledged = false;
        let peer = &mut self.peers[index];

        while let Some(ack) = peer.acknowledgements.front().copied() {
            if datagram.is_full() || datagram.room(peer.mtu) < CommandType::Acknowledge.size() {
                peer.continue_sending = true;
                break;
            }
            peer.acknowledgements.pop_front();

            let mut header = CommandHeader::new(ack.channel_id);
            header.reliable_sequence_number = ack.reliable_sequence_number;
            datagram.push_command(&Command::new(
                header,
                CommandBody::Acknowledge {
                    received_reliable_sequence_number: ack.reliable_sequence_number,
                    received_sent_time: ack.sent_time,
                },
            ));
            if ack.kind == CommandType::Disconnect {
                disconnect_acknowledged = true;
            }
        }

        if disconnect_acknowledged {
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    /// Move as many queued commands into `datagram` as fit. Returns `false`
    /// if a reliable command went out, in which case no ping is needed.
    fn check_outgoing_commands(&mut self, index: usize, datagram: &mut Datagram) -> bool {
        let now = self.service_time;
        let peer = &mut self.peers[index];
        let mut can_ping = true;
        let mut window_wrap = false;
        let mut reliable_blocked = false;
        // Cursors into outgoing_commands and outgoing_send_reliable_commands.
        let mut plain = 0;
        let mut reliable = 0;

        loop {
            let reliable_ready =
                !reliable_blocked && reliable < peer.outgoing_send_reliable_commands.len();
            let from_reliable = match peer.outgoing_commands.get(plain) {
                Some(other) => {
                    reliable_ready
                        && time_less(
                            peer.outgoing_send_reliable_commands[reliable].queue_time,
                            other.queue_time,
                        )
                }
                None if reliable_ready => true,
                None => break,
            };
            let candidate = if from_reliable {
                &peer.outgoing_send_reliable_commands[reliable]
            } else {
                &peer.outgoing_commands[plain]
            };

            let channel_id = candidate.command.header.channel_id;
            let sequence = candidate.reliable_sequence_number;
            let window = sequence / RELIABLE_WINDOW_SIZE;
            let needs_ack = candidate.needs_ack();
            let has_packet = candidate.packet.is_some();
            let first_send = candidate.send_attempts < 1;
            let fragment_length = candidate.fragment_length as usize;
            let command_size = candidate.command.size();
            let on_channel = (channel_id as usize) < peer.channels.len();

            if needs_ack {
                if on_channel {
                    let blocked = window_wrap
                        || (first_send
                            && sequence % RELIABLE_WINDOW_SIZE == 0
                            && reliable_window_blocked(&peer.channels[channel_id as usize], window));
                    if blocked {
                        window_wrap = true;
                        reliable_blocked = true;
                        if from_reliable {
                            reliable += 1;
                        } else {
                            plain += 1;
                        }
                        continue;
                    }
                }
                if has_packet {
                    let window_limit = (peer.throttle.value.saturating_mul(peer.window_size)
                        / PACKET_THROTTLE_SCALE)
                        .max(peer.mtu);
                    if peer.reliable_data_in_transit + fragment_length as u32 > window_limit {
                        reliable_blocked = true;
                        if from_reliable {
                            reliable += 1;
                        } else {
                            plain += 1;
                        }
                        continue;
                    }
                }
                can_ping = false;
            }

            let room = datagram.room(peer.mtu);
            if datagram.is_full()
                || room < command_size
                || (has_packet && room < command_size + fragment_length)
            {
                peer.continue_sending = true;
                break;
            }

            let taken = if from_reliable {
                peer.outgoing_send_reliable_commands.remove(reliable)
            } else {
                peer.outgoing_commands.remove(plain)
            };
            let Some(mut outgoing) = taken else {
                break;
            };

            if needs_ack {
                if on_channel && first_send {
                    let channel = &mut peer.channels[channel_id as usize];
                    channel.used_reliable_windows |= 1 << window;
                    channel.reliable_windows[window as usize] =
                        channel.reliable_windows[window as usize].saturating_add(1);
                }
                outgoing.send_attempts = outgoing.send_attempts.saturating_add(1);
                if outgoing.round_trip_timeout == 0 {
                    outgoing.round_trip_timeout = peer.rtt.retransmit_timeout();
                }
                if peer.sent_reliable_commands.is_empty() {
                    peer.next_timeout = now.wrapping_add(outgoing.round_trip_timeout);
                }
                outgoing.sent_time = now;
                datagram.sent_time = true;
                peer.reliable_data_in_transit += fragment_length as u32;
                datagram.push_outgoing(&outgoing);
                peer.sent_reliable_commands.push_back(outgoing);
            } else {
                if has_packet && outgoing.fragment_offset == 0 && !peer.throttle.admit() {
                    // The rest of a throttled message goes with it.
                    let key = (
                        outgoing.reliable_sequence_number,
                        outgoing.unreliable_sequence_number,
                    );
                    while peer.outgoing_commands.get(plain).is_some_and(|c| {
                        (c.reliable_sequence_number, c.unreliable_sequence_number) == key
                    }) {
                        peer.outgoing_commands.remove(plain);
                    }
                    trace!(peer = index, throttle = peer.throttle.value, "throttled unreliable packet");
                    continue;
                }
                datagram.push_outgoing(&outgoing);
            }
            peer.packets_sent = peer.packets_sent.wrapping_add(1);
        }

        if peer.state == PeerState::DisconnectLater && !peer.has_outgoing_commands() {
            let data = peer.event_data;
            self.disconnect_slot(index, data);
        }
        can_ping
    }

    // ─── Transmission ───────────────────────────────────────────────────

    /// Fold the last interval's send/loss counters into the smoothed
    /// packet-loss estimate.
    pub(crate) fn update_packet_loss(&mut self, index: usize) {
        let now = self.service_time;
        let peer = &mut self.peers[index];
        if peer.packet_loss_epoch == 0 {
            peer.packet_loss_epoch = now;
            return;
        }
        if time_difference(now, peer.packet_loss_epoch) < PACKET_LOSS_INTERVAL
            || peer.packets_sent == 0
        {
            return;
        }

        let loss = (peer.packets_lost as u64 * PACKET_LOSS_SCALE as u64
            / peer.packets_sent as u64)
            .min(u32::MAX as u64) as u32;
        peer.packet_loss_variance = ((peer.packet_loss_variance as u64 * 3
            + loss.abs_diff(peer.packet_loss) as u64)
            / 4) as u32;
        peer.packet_loss = ((peer.packet_loss as u64 * 7 + loss as u64) / 8) as u32;
        trace!(
            peer = index,
            sent = peer.packets_sent,
            lost = peer.packets_lost,
            packet_loss = peer.packet_loss,
            "packet loss epoch"
        );
        peer.packet_loss_epoch = now;
        peer.packets_sent = 0;
        peer.packets_lost = 0;
    }

    fn transmit(&mut self, index: usize, datagram: Datagram) {
        let now = self.service_time;
        let peer = &self.peers[index];
        let Some(address) = peer.address else {
            return;
        };
        let bound = peer.outgoing_peer_id < MAXIMUM_PEER_ID;

        let plain = datagram.commands.freeze();
        let compressed = match self.compressor.as_mut() {
            Some(compressor) => compressor
                .compress(&plain, plain.len())
                .filter(|out| !out.is_empty() && out.len() < plain.len()),
            None => None,
        };

        let header = ProtocolHeader {
            peer_id: peer.outgoing_peer_id,
            session_id: if bound { peer.outgoing_session_id } else { 0 },
            compressed: compressed.is_some(),
            encrypted: self.encryptor.is_some(),
            sent_time: datagram.sent_time.then_some(now as u16),
        };

        let mut out = BytesMut::with_capacity(MAX_HEADER_SIZE + CHECKSUM_SIZE + plain.len());
        header.encode(&mut out);
        let header_length = out.len();

        if let Some(checksum) = self.checksum {
            let seed = if bound { peer.connect_id } else { 0 };
            let value = checksum(&[&out[..], &seed.to_be_bytes()[..], &plain[..]]);
            out.put_u32(value);
        }
        out.extend_from_slice(compressed.as_deref().unwrap_or(&plain[..]));

        if let Some(encryptor) = self.encryptor.as_mut() {
            let Some(sealed) = encryptor.encrypt(PeerId(index as u16), &out[header_length..])
            else {
                warn!(peer = index, "encryption failed, dropping datagram");
                return;
            };
            out.truncate(header_length);
            out.extend_from_slice(&sealed);
        }

        self.peers[index].last_send_time = now;
        match self.socket.send_to(&out, address) {
            Ok(sent) => {
                self.total_sent_data += sent as u64;
                self.total_sent_packets += 1;
                for packet in &datagram.packets {
                    packet.mark_sent();
                }
                trace!(
                    peer = index,
                    bytes = sent,
                    commands = datagram.command_count,
                    compressed = header.compressed,
                    "sent datagram"
                );
            }
            Err(e) => warn!(peer = index, %address, error = %e, "send failed"),
        }
    }
}

// ─── Internal Helpers ───────────────────────────────────────────────────────

/// Whether starting reliable window `window` would overrun the receiver:
/// the previous window is still full, or any of the windows the receiver
/// treats as "not yet" is still in use.
fn reliable_window_blocked(channel: &Channel, window: u16) -> bool {
    let previous = ((window + RELIABLE_WINDOWS - 1) % RELIABLE_WINDOWS) as usize;
    if channel.reliable_windows[previous] >= RELIABLE_WINDOW_SIZE {
        return true;
    }
    let span: u32 = (1 << (FREE_RELIABLE_WINDOWS + 2)) - 1;
    let mask = (span << window) | (span >> (RELIABLE_WINDOWS - window));
    channel.used_reliable_windows as u32 & mask != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::crc32;
    use crate::config::HostConfig;
    use crate::arq::Acknowledgement;
    use crate::packet::PacketFlags;
    use crate::sim::{SimNetwork, SimSocket};
    use crate::wire::{decode_commands, CONTROL_CHANNEL};
    use bytes::{Buf, Bytes};
    use std::time::Duration;

    const REMOTE: &str = "10.0.0.2:2000";

    fn host(net: &SimNetwork) -> Host<SimSocket> {
        let socket = net.bind("10.0.0.1:1000".parse().unwrap()).unwrap();
        let config = HostConfig {
            peer_count: 2,
            random_seed: Some(5),
            ..HostConfig::default()
        };
        Host::with_socket(socket, config, net.clock()).unwrap()
    }

    /// Wire slot 0 straight to a raw socket, skipping the handshake.
    fn connect_slot(a: &mut Host<SimSocket>, channels: usize) {
        let peer = &mut a.peers[0];
        peer.address = Some(REMOTE.parse().unwrap());
        peer.outgoing_peer_id = 0;
        peer.outgoing_session_id = 0;
        peer.channels = (0..channels).map(|_| Channel::default()).collect();
        a.change_state(0, PeerState::Connected);
    }

    fn drain(raw: &mut SimSocket) -> Vec<Bytes> {
        let mut buf = [0u8; 4096];
        let mut out = Vec::new();
        while let Some((n, _)) = raw.recv_from(&mut buf).unwrap() {
            out.push(Bytes::copy_from_slice(&buf[..n]));
        }
        out
    }

    fn commands(mut datagram: Bytes) -> Vec<(Command, Bytes)> {
        ProtocolHeader::decode(&mut datagram).unwrap();
        decode_commands(datagram).unwrap()
    }

    // ─── Send Loop Tests ────────────────────────────────────────────────

    #[test]
    fn burst_spreads_over_several_datagrams() {
        let net = SimNetwork::new(1);
        let mut raw = net.bind(REMOTE.parse().unwrap()).unwrap();
        let mut a = host(&net);
        connect_slot(&mut a, 1);

        for _ in 0..40 {
            a.send(PeerId(0), 0, Packet::new(&[9u8; 100], PacketFlags::RELIABLE))
                .unwrap();
        }
        a.flush();

        let datagrams = drain(&mut raw);
        assert!(datagrams.len() >= 4);
        assert_eq!(a.total_sent_packets(), datagrams.len() as u64);
        let mut sequences = Vec::new();
        for datagram in datagrams {
            assert!(datagram.len() <= a.peers[0].mtu as usize);
            for (command, payload) in commands(datagram) {
                assert_eq!(command.kind(), CommandType::SendReliable);
                assert_eq!(payload.len(), 100);
                sequences.push(command.header.reliable_sequence_number);
            }
        }
        assert_eq!(sequences, (1..=40).collect::<Vec<u16>>());

        let peer = &a.peers[0];
        assert_eq!(peer.sent_reliable_commands.len(), 40);
        assert_eq!(peer.reliable_data_in_transit, 4000);
        assert!(!peer.continue_sending);
    }

    #[test]
    fn disconnect_acknowledgement_zombifies_peer() {
        let net = SimNetwork::new(1);
        let mut raw = net.bind(REMOTE.parse().unwrap()).unwrap();
        let mut a = host(&net);
        connect_slot(&mut a, 1);
        a.change_state(0, PeerState::AcknowledgingDisconnect);
        a.peers[0].acknowledgements.push_back(Acknowledgement {
            sent_time: 9,
            reliable_sequence_number: 3,
            channel_id: CONTROL_CHANNEL,
            kind: CommandType::Disconnect,
        });

        a.flush();
        assert_eq!(a.peers[0].state, PeerState::Zombie);

        let datagrams = drain(&mut raw);
        assert_eq!(datagrams.len(), 1);
        let mut datagram = datagrams[0].clone();
        let header = ProtocolHeader::decode(&mut datagram).unwrap();
        assert_eq!(header.sent_time, None);
        let decoded = decode_commands(datagram).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(
            decoded[0].0.body,
            CommandBody::Acknowledge {
                received_reliable_sequence_number: 3,
                received_sent_time: 9,
            }
        );
    }

    #[test]
    fn throttled_unreliable_packets_are_dropped() {
        let net = SimNetwork::new(1);
        let mut raw = net.bind(REMOTE.parse().unwrap()).unwrap();
        let mut a = host(&net);
        connect_slot(&mut a, 1);
        a.peers[0].throttle.value = 0;

        for _ in 0..3 {
            a.send(PeerId(0), 0, Packet::new(b"u", PacketFlags::empty()))
                .unwrap();
        }
        a.flush();

        assert!(a.peers[0].outgoing_commands.is_empty());
        assert_eq!(a.peers[0].packets_sent, 0);
        assert!(drain(&mut raw).is_empty());
    }

    #[test]
    fn quiet_peer_is_pinged() {
        let net = SimNetwork::new(1);
        let mut raw = net.bind(REMOTE.parse().unwrap()).unwrap();
        let mut a = host(&net);
        connect_slot(&mut a, 1);
        a.peers[0].ping_interval = 500;
        a.peers[0].last_receive_time = 1;

        a.flush();
        assert!(drain(&mut raw).is_empty());

        net.advance(Duration::from_millis(600));
        a.flush();
        let datagrams = drain(&mut raw);
        assert_eq!(datagrams.len(), 1);
        let decoded = commands(datagrams[0].clone());
        assert_eq!(decoded[0].0.kind(), CommandType::Ping);
        assert_eq!(a.peers[0].sent_reliable_commands.len(), 1);
    }

    #[test]
    fn disconnect_later_fires_once_queue_drains() {
        let net = SimNetwork::new(1);
        let mut raw = net.bind(REMOTE.parse().unwrap()).unwrap();
        let mut a = host(&net);
        connect_slot(&mut a, 1);
        a.send(PeerId(0), 0, Packet::new(b"last", PacketFlags::empty()))
            .unwrap();
        a.disconnect_later(PeerId(0), 4).unwrap();
        assert_eq!(a.peers[0].state, PeerState::DisconnectLater);

        a.flush();
        assert_eq!(a.peers[0].state, PeerState::Disconnecting);
        let kinds: Vec<CommandType> = drain(&mut raw)
            .into_iter()
            .flat_map(commands)
            .map(|(command, _)| command.kind())
            .collect();
        assert!(kinds.contains(&CommandType::SendUnreliable));
    }

    // ─── Transmission Tests ─────────────────────────────────────────────

    #[test]
    fn checksum_covers_header_and_connect_id() {
        let net = SimNetwork::new(1);
        let mut raw = net.bind(REMOTE.parse().unwrap()).unwrap();
        let mut a = host(&net);
        connect_slot(&mut a, 1);
        a.peers[0].connect_id = 0xABCD_1234;
        a.set_checksum(Some(crc32));

        a.send(PeerId(0), 0, Packet::new(b"sum", PacketFlags::RELIABLE))
            .unwrap();
        a.flush();

        let datagrams = drain(&mut raw);
        assert_eq!(datagrams.len(), 1);
        let datagram = &datagrams[0];
        let mut rest = datagram.clone();
        let header = ProtocolHeader::decode(&mut rest).unwrap();
        assert!(header.sent_time.is_some());
        let header_length = datagram.len() - rest.len();
        let stored = rest.get_u32();
        let expected = crc32(&[
            &datagram[..header_length],
            &0xABCD_1234u32.to_be_bytes()[..],
            &rest[..],
        ]);
        assert_eq!(stored, expected);
    }

    #[test]
    fn packet_loss_folds_in_per_interval() {
        let net = SimNetwork::new(1);
        let mut a = host(&net);
        a.service_time = 1;
        a.update_packet_loss(0);
        assert_eq!(a.peers[0].packet_loss_epoch, 1);

        a.peers[0].packets_sent = 100;
        a.peers[0].packets_lost = 10;
        a.service_time = 5_000;
        a.update_packet_loss(0);
        assert_eq!(a.peers[0].packets_sent, 100, "interval not yet over");

        a.service_time = 10_001;
        a.update_packet_loss(0);
        let peer = &a.peers[0];
        assert_eq!(peer.packet_loss, 6553 / 8);
        assert_eq!(peer.packet_loss_variance, 6553 / 4);
        assert_eq!(peer.packet_loss_epoch, 10_001);
        assert_eq!((peer.packets_sent, peer.packets_lost), (0, 0));
    }

    #[test]
    fn reliable_window_blocking() {
        let mut channel = Channel::default();
        assert!(!reliable_window_blocked(&channel, 1));

        channel.reliable_windows[0] = RELIABLE_WINDOW_SIZE;
        assert!(reliable_window_blocked(&channel, 1));
        channel.reliable_windows[0] = 0;

        channel.used_reliable_windows = 1 << 5;
        assert!(reliable_window_blocked(&channel, 1));
        channel.used_reliable_windows = 1 << 12;
        assert!(!reliable_window_blocked(&channel, 1));

        // Span wraps past window 15.
        channel.used_reliable_windows = 1 << 3;
        assert!(reliable_window_blocked(&channel, 10));
        assert!(!reliable_window_blocked(&channel, 4));
    }
}
