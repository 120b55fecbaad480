//! # Inbound Path
//!
//! Datagrams are read from the socket, run through the codec stack in
//! reverse (intercept, decrypt, decompress, checksum), routed to a peer slot
//! by the header's peer id, and then every command is handled in order.
//!
//! A command that violates the protocol for the peer's current state stops
//! processing of the rest of that datagram. Nothing here returns an error to
//! the caller except the intercept hook and socket failures.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, Payload};
use crate::codec::InterceptAction;
use crate::congestion::window_size;
use crate::error::{Error, Result};
use crate::fragment::{self, Reassembly};
use crate::host::Host;
use crate::packet::{Packet, PacketFlags};
use crate::peer::{PeerId, PeerState, Queued};
use crate::socket::Socket;
use crate::time::time_less;
use crate::wire::{
    decode_commands, Command, CommandBody, CommandHeader, CommandType, ProtocolHeader,
    SendFragment, VerifyConnect, CHECKSUM_SIZE, CONTROL_CHANNEL, MAXIMUM_CHANNEL_COUNT,
    MAXIMUM_MTU, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT, MINIMUM_MTU,
    MINIMUM_WINDOW_SIZE,
};

/// Datagrams read per service pass before yielding to the send path.
const MAXIMUM_DATAGRAMS_PER_PASS: usize = 256;

/// Session ids occupy two header bits.
const SESSION_ID_MASK: u8 = 0x03;

/// Why a command was rejected. Stops processing of its datagram; never
/// surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ProtocolFault {
    #[error("command not allowed in state {0:?}")]
    InvalidState(PeerState),
    #[error("unexpected {0:?} command")]
    UnexpectedCommand(CommandType),
    #[error("channel {0} is not open")]
    InvalidChannel(u8),
    #[error("connect refused")]
    ConnectRefused,
    #[error("verify connect does not match the connect request")]
    VerifyMismatch,
    #[error("acknowledgement of an unexpected command")]
    UnexpectedAcknowledgement,
    #[error("malformed fragment")]
    MalformedFragment,
    #[error("fragment does not match its set")]
    FragmentMismatch,
    #[error("fragment set discarded")]
    FragmentDiscarded,
    #[error("waiting data limit exceeded")]
    WaitingDataExceeded,
}

type Handled = std::result::Result<(), ProtocolFault>;

impl<S: Socket> Host<S> {
    /// Read and process up to [`MAXIMUM_DATAGRAMS_PER_PASS`] datagrams.
    pub(crate) fn receive_incoming_commands(&mut self) -> Result<()> {
        for _ in 0..MAXIMUM_DATAGRAMS_PER_PASS {
            let Some((length, from)) = self.socket.recv_from(&mut self.receive_buffer)? else {
                return Ok(());
            };
            self.total_received_data += length as u64;
            self.total_received_packets += 1;

            if let Some(intercept) = self.intercept.as_mut() {
                match intercept(&self.receive_buffer[..length], from) {
                    InterceptAction::Pass => {}
                    InterceptAction::Consumed => continue,
                    InterceptAction::Error => return Err(Error::Intercept),
                }
            }

            let datagram = Bytes::copy_from_slice(&self.receive_buffer[..length]);
            self.handle_datagram(datagram, from);
        }
        Ok(())
    }

    /// Decode, verify and dispatch one datagram.
    pub(crate) fn handle_datagram(&mut self, datagram: Bytes, from: SocketAddr) {
        let mut cursor = datagram.clone();
        let Some(header) = ProtocolHeader::decode(&mut cursor) else {
            trace!(%from, len = datagram.len(), "dropping datagram with bad header");
            return;
        };
        let header_length = datagram.len() - cursor.len();

        let peer_index = if header.peer_id == MAXIMUM_PEER_ID {
            None
        } else {
            let index = header.peer_id as usize;
            let Some(peer) = self.peers.get(index) else {
                trace!(%from, peer_id = header.peer_id, "dropping datagram for unknown peer");
                return;
            };
            if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie)
                || peer.address != Some(from)
                || (peer.outgoing_peer_id < MAXIMUM_PEER_ID
                    && header.session_id != peer.incoming_session_id)
            {
                trace!(%from, peer = index, "dropping datagram from stale session");
                return;
            }
            Some(index)
        };

        let body = match (header.encrypted, self.encryptor.as_mut()) {
            (true, Some(encryptor)) => {
                match encryptor.decrypt(peer_index.map(|i| PeerId(i as u16)), &cursor) {
                    Some(plain) => Bytes::from(plain),
                    None => {
                        warn!(%from, "dropping datagram that failed to decrypt");
                        return;
                    }
                }
            }
            (false, None) => cursor,
            (encrypted, _) => {
                warn!(%from, encrypted, "dropping datagram with mismatched encryption");
                return;
            }
        };

        let (expected_checksum, mut commands) = match self.checksum {
            Some(_) if body.len() < CHECKSUM_SIZE => {
                trace!(%from, "dropping datagram too short for its checksum");
                return;
            }
            Some(_) => {
                let mut body = body;
                let checksum = body.split_to(CHECKSUM_SIZE);
                (
                    Some(u32::from_be_bytes([
                        checksum[0],
                        checksum[1],
                        checksum[2],
                        checksum[3],
                    ])),
                    body,
                )
            }
            None => (None, body),
        };

        if header.compressed {
            let Some(compressor) = self.compressor.as_mut() else {
                warn!(%from, "dropping compressed datagram, no compressor installed");
                return;
            };
            match compressor.decompress(&commands, MAXIMUM_MTU as usize) {
                Some(plain) => commands = Bytes::from(plain),
                None => {
                    warn!(%from, "dropping datagram that failed to decompress");
                    return;
                }
            }
        }

        if let (Some(checksum), Some(expected)) = (self.checksum, expected_checksum) {
            let seed = peer_index.map_or(0, |i| self.peers[i].connect_id);
            let actual = checksum(&[
                &datagram[..header_length],
                &seed.to_be_bytes()[..],
                &commands[..],
            ]);
            if actual != expected {
                warn!(%from, expected, actual, "dropping datagram with bad checksum");
                return;
            }
        }

        let Some(decoded) = decode_commands(commands) else {
            warn!(%from, "dropping malformed datagram");
            return;
        };

        if let Some(index) = peer_index {
            let peer = &mut self.peers[index];
            peer.incoming_data_total =
                peer.incoming_data_total.wrapping_add(datagram.len() as u32);
        }

        let mut peer_index = peer_index;
        for (command, payload) in decoded {
            let kind = command.kind();
            let outcome = match (peer_index, kind) {
                (None, CommandType::Connect) => match self.handle_connect(&command, from) {
                    Ok(index) => {
                        peer_index = Some(index);
                        Ok(())
                    }
                    Err(fault) => Err(fault),
                },
                (None, _) | (Some(_), CommandType::Connect) => {
                    Err(ProtocolFault::UnexpectedCommand(kind))
                }
                (Some(index), _) => self.handle_command(index, &command, payload),
            };
            if let Err(fault) = outcome {
                debug!(%from, ?kind, %fault, "stopping datagram");
                break;
            }

            let Some(index) = peer_index else { break };
            if !command.header.needs_ack() {
                continue;
            }
            let Some(sent_time) = header.sent_time else {
                break;
            };
            let peer = &mut self.peers[index];
            match peer.state {
                PeerState::Disconnecting
                | PeerState::AcknowledgingConnect
                | PeerState::Disconnected
                | PeerState::Zombie => {}
                PeerState::AcknowledgingDisconnect => {
                    if kind == CommandType::Disconnect {
                        peer.queue_acknowledgement(&command, sent_time);
                    }
                }
                _ => {
                    peer.queue_acknowledgement(&command, sent_time);
                }
            }
        }
    }

    fn handle_command(&mut self, index: usize, command: &Command, payload: Bytes) -> Handled {
        match command.body {
            CommandBody::Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => self.handle_acknowledge(
                index,
                command.header.channel_id,
                received_reliable_sequence_number,
                received_sent_time,
            ),
            CommandBody::VerifyConnect(verify) => self.handle_verify_connect(index, &verify),
            CommandBody::Disconnect { data } => {
                self.handle_disconnect(index, command, data);
                Ok(())
            }
            CommandBody::Ping => self.require_connected(index),
            CommandBody::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => self.handle_bandwidth_limit(index, incoming_bandwidth, outgoing_bandwidth),
            CommandBody::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                self.require_connected(index)?;
                let throttle = &mut self.peers[index].throttle;
                throttle.interval = packet_throttle_interval;
                throttle.acceleration = packet_throttle_acceleration;
                throttle.deceleration = packet_throttle_deceleration;
                Ok(())
            }
            CommandBody::SendReliable { .. } => {
                self.handle_send(index, command, payload, PacketFlags::RELIABLE)
            }
            CommandBody::SendUnreliable { .. } => {
                self.handle_send(index, command, payload, PacketFlags::empty())
            }
            CommandBody::SendUnsequenced {
                unsequenced_group, ..
            } => self.handle_send_unsequenced(index, command, unsequenced_group, payload),
            CommandBody::SendFragment(fragment) => {
                self.handle_send_fragment(index, command, &fragment, &payload)
            }
            CommandBody::SendUnreliableFragment(fragment) => {
                self.handle_send_unreliable_fragment(index, command, &fragment, &payload)
            }
            CommandBody::Connect(_) => Err(ProtocolFault::UnexpectedCommand(CommandType::Connect)),
        }
    }

    fn require_connected(&self, index: usize) -> Handled {
        let state = self.peers[index].state;
        if state.is_connected() {
            Ok(())
        } else {
            Err(ProtocolFault::InvalidState(state))
        }
    }

    fn require_channel(&self, index: usize, channel_id: u8) -> Handled {
        self.require_connected(index)?;
        if (channel_id as usize) < self.peers[index].channels.len() {
            Ok(())
        } else {
            Err(ProtocolFault::InvalidChannel(channel_id))
        }
    }

    // ─── Acknowledgements ───────────────────────────────────────────────

    fn handle_acknowledge(
        &mut self,
        index: usize,
        channel_id: u8,
        sequence: u16,
        sent_time: u16,
    ) -> Handled {
        let state = self.peers[index].state;
        if matches!(state, PeerState::Disconnected | PeerState::Zombie) {
            return Ok(());
        }

        let now = self.service_time;
        let mut sent = (now & 0xFFFF_0000) | sent_time as u32;
        if (sent & 0x8000) > (now & 0x8000) {
            sent = sent.wrapping_sub(0x10000);
        }
        if time_less(now, sent) {
            return Ok(());
        }
        let round_trip_time = now.wrapping_sub(sent).max(1);

        let peer = &mut self.peers[index];
        if peer.last_receive_time > 0 {
            peer.throttle.adjust(
                round_trip_time,
                peer.rtt.last_round_trip_time,
                peer.rtt.last_round_trip_time_variance,
            );
            peer.rtt.update(round_trip_time, false);
        } else {
            peer.rtt.update(round_trip_time, true);
        }
        peer.rtt.roll_epoch(now, peer.throttle.interval);
        peer.last_receive_time = now.max(1);
        peer.earliest_timeout = 0;

        let acknowledged = peer.remove_sent_reliable_command(sequence, channel_id);
        trace!(peer = index, sequence, channel_id, round_trip_time, "acknowledged");

        match peer.state {
            PeerState::AcknowledgingConnect => {
                if acknowledged != Some(CommandType::VerifyConnect) {
                    return Err(ProtocolFault::UnexpectedAcknowledgement);
                }
                self.notify_connect(index);
            }
            PeerState::Disconnecting => {
                if acknowledged != Some(CommandType::Disconnect) {
                    return Err(ProtocolFault::UnexpectedAcknowledgement);
                }
                self.notify_disconnect(index);
            }
            PeerState::DisconnectLater => {
                if !peer.has_outgoing_commands() {
                    let data = peer.event_data;
                    self.disconnect_slot(index, data);
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    /// Accept an inbound CONNECT into a free slot and queue VERIFY_CONNECT.
    fn handle_connect(
        &mut self,
        command: &Command,
        from: SocketAddr,
    ) -> std::result::Result<usize, ProtocolFault> {
        let CommandBody::Connect(connect) = command.body else {
            return Err(ProtocolFault::ConnectRefused);
        };
        let requested = connect.channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&requested) {
            return Err(ProtocolFault::ConnectRefused);
        }

        let mut free = None;
        let mut duplicates = 0;
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                free.get_or_insert(index);
                continue;
            }
            if peer.state == PeerState::Connecting {
                continue;
            }
            let Some(address) = peer.address else { continue };
            if address.ip() != from.ip() {
                continue;
            }
            if address.port() == from.port() && peer.connect_id == connect.connect_id {
                trace!(%from, connect_id = connect.connect_id, "retransmitted connect");
                return Err(ProtocolFault::ConnectRefused);
            }
            duplicates += 1;
        }
        let Some(index) = free else {
            debug!(%from, "refusing connect, no free peer slot");
            return Err(ProtocolFault::ConnectRefused);
        };
        if duplicates >= self.config.duplicate_peers {
            debug!(%from, duplicates, "refusing connect, too many peers from one address");
            return Err(ProtocolFault::ConnectRefused);
        }

        let channel_count = requested.min(self.config.channel_limit);
        let host_incoming = self.config.incoming_bandwidth;
        let host_outgoing = self.config.outgoing_bandwidth;

        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::default()).collect();
        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = connect.connect_id;
        peer.address = Some(from);
        peer.mtu = peer.host_mtu;
        peer.outgoing_peer_id = connect.outgoing_peer_id;
        peer.incoming_bandwidth = connect.incoming_bandwidth;
        peer.outgoing_bandwidth = connect.outgoing_bandwidth;
        peer.throttle.interval = connect.packet_throttle_interval;
        peer.throttle.acceleration = connect.packet_throttle_acceleration;
        peer.throttle.deceleration = connect.packet_throttle_deceleration;
        peer.event_data = connect.data;

        let incoming_session_id = next_session_id(
            connect.incoming_session_id,
            peer.outgoing_session_id,
        );
        peer.outgoing_session_id = incoming_session_id;
        let outgoing_session_id = next_session_id(
            connect.outgoing_session_id,
            peer.incoming_session_id,
        );
        peer.incoming_session_id = outgoing_session_id;

        let mtu = connect.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        peer.mtu = peer.mtu.min(mtu);
        peer.window_size = window_size(host_outgoing, peer.incoming_bandwidth);

        let verify_window = window_size(host_incoming, 0)
            .min(connect.window_size)
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        let verify = VerifyConnect {
            outgoing_peer_id: peer.incoming_peer_id,
            incoming_session_id,
            outgoing_session_id,
            mtu: peer.mtu,
            window_size: verify_window,
            channel_count: channel_count as u32,
            incoming_bandwidth: host_incoming,
            outgoing_bandwidth: host_outgoing,
            packet_throttle_interval: peer.throttle.interval,
            packet_throttle_acceleration: peer.throttle.acceleration,
            packet_throttle_deceleration: peer.throttle.deceleration,
            connect_id: peer.connect_id,
        };
        peer.queue_outgoing_command(
            Command::new(
                CommandHeader::new(CONTROL_CHANNEL).acknowledged(),
                CommandBody::VerifyConnect(verify),
            ),
            None,
            0,
            0,
        );

        debug!(peer = index, %from, channel_count, mtu = peer.mtu, "accepted connect");
        Ok(index)
    }

    fn handle_verify_connect(&mut self, index: usize, verify: &VerifyConnect) -> Handled {
        let peer = &mut self.peers[index];
        if peer.state != PeerState::Connecting {
            return Ok(());
        }

        let channel_count = verify.channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count)
            || verify.packet_throttle_interval != peer.throttle.interval
            || verify.packet_throttle_acceleration != peer.throttle.acceleration
            || verify.packet_throttle_deceleration != peer.throttle.deceleration
            || verify.connect_id != peer.connect_id
        {
            debug!(peer = index, "verify connect mismatch, abandoning connection");
            peer.event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
            return Err(ProtocolFault::VerifyMismatch);
        }

        peer.remove_sent_reliable_command(1, CONTROL_CHANNEL);
        peer.channels.truncate(channel_count);
        peer.outgoing_peer_id = verify.outgoing_peer_id;
        peer.incoming_session_id = verify.incoming_session_id;
        peer.outgoing_session_id = verify.outgoing_session_id;
        peer.mtu = peer.mtu.min(verify.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU));
        peer.window_size = peer
            .window_size
            .min(verify.window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE));
        peer.incoming_bandwidth = verify.incoming_bandwidth;
        peer.outgoing_bandwidth = verify.outgoing_bandwidth;

        debug!(peer = index, mtu = peer.mtu, window = peer.window_size, "verified connect");
        self.notify_connect(index);
        Ok(())
    }

    fn handle_disconnect(&mut self, index: usize, command: &Command, data: u32) {
        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return;
        }

        self.reset_slot_queues(index);
        match state {
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting => {
                self.dispatch_state(index, PeerState::Zombie);
            }
            _ if !state.is_connected() => {
                if state == PeerState::ConnectionPending {
                    self.recalculate_bandwidth_limits = true;
                }
                self.reset_slot(index);
            }
            _ if command.header.needs_ack() => {
                self.change_state(index, PeerState::AcknowledgingDisconnect);
            }
            _ => self.dispatch_state(index, PeerState::Zombie),
        }

        if self.peers[index].state != PeerState::Disconnected {
            self.peers[index].event_data = data;
        }
        debug!(peer = index, ?state, data, "remote disconnected");
    }

    fn handle_bandwidth_limit(&mut self, index: usize, incoming: u32, outgoing: u32) -> Handled {
        self.require_connected(index)?;
        let host_outgoing = self.config.outgoing_bandwidth;
        if self.peers[index].incoming_bandwidth != 0 {
            self.bandwidth_limited_peers = self.bandwidth_limited_peers.saturating_sub(1);
        }
        let peer = &mut self.peers[index];
        peer.incoming_bandwidth = incoming;
        peer.outgoing_bandwidth = outgoing;
        peer.window_size = window_size(incoming, host_outgoing);
        if incoming != 0 {
            self.bandwidth_limited_peers += 1;
        }
        Ok(())
    }

    // ─── Payload Commands ───────────────────────────────────────────────

    fn handle_send(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
        flags: PacketFlags,
    ) -> Handled {
        let channel_id = command.header.channel_id;
        self.require_channel(index, channel_id)?;
        let maximum_waiting_data = self.config.maximum_waiting_data;

        let packet = Packet::builder(payload).flags(flags).build();
        let peer = &mut self.peers[index];
        let queued = peer.queue_incoming_command(
            command,
            Payload::Complete(packet),
            flags,
            maximum_waiting_data,
        )?;
        if queued == Queued::Discarded {
            return Ok(());
        }
        let delivered = if flags.contains(PacketFlags::RELIABLE) {
            peer.dispatch_incoming_reliable(channel_id)
        } else {
            peer.dispatch_incoming_unreliable(channel_id)
        };
        if delivered {
            self.mark_dispatch(index);
        }
        Ok(())
    }

    fn handle_send_unsequenced(
        &mut self,
        index: usize,
        command: &Command,
        group: u16,
        payload: Bytes,
    ) -> Handled {
        let channel_id = command.header.channel_id;
        self.require_channel(index, channel_id)?;
        let maximum_waiting_data = self.config.maximum_waiting_data;

        let peer = &mut self.peers[index];
        if !peer.admit_unsequenced_group(group) {
            trace!(peer = index, group, "dropping duplicate unsequenced packet");
            return Ok(());
        }
        let pending = peer.dispatched_commands.len();
        peer.queue_unsequenced(channel_id, payload, maximum_waiting_data)?;
        if peer.dispatched_commands.len() > pending {
            self.mark_dispatch(index);
        }
        Ok(())
    }

    fn handle_send_fragment(
        &mut self,
        index: usize,
        command: &Command,
        fragment: &SendFragment,
        payload: &Bytes,
    ) -> Handled {
        let channel_id = command.header.channel_id;
        self.require_channel(index, channel_id)?;
        let maximum_packet_size = self.config.maximum_packet_size;
        let maximum_waiting_data = self.config.maximum_waiting_data;

        let peer = &mut self.peers[index];
        let start = fragment.start_sequence_number;
        if !peer.channels[channel_id as usize].accepts(start) {
            return Ok(());
        }
        if !fragment::validate(fragment, payload.len(), maximum_packet_size) {
            return Err(ProtocolFault::MalformedFragment);
        }

        let channel = &peer.channels[channel_id as usize];
        let position = match channel.find_reliable_fragment(start) {
            Some(position) => {
                let existing = &channel.incoming_reliable_commands[position];
                if !matches_fragment_set(
                    &existing.payload,
                    existing.kind,
                    CommandType::SendFragment,
                    fragment,
                ) {
                    return Err(ProtocolFault::FragmentMismatch);
                }
                position
            }
            None => {
                let mut start_command = *command;
                start_command.header.reliable_sequence_number = start;
                let queued = peer.queue_incoming_command(
                    &start_command,
                    Payload::Assembling(Reassembly::new(
                        fragment.total_length,
                        fragment.fragment_count,
                    )),
                    PacketFlags::RELIABLE,
                    maximum_waiting_data,
                )?;
                match queued {
                    Queued::Inserted(position) => position,
                    Queued::Discarded => return Err(ProtocolFault::FragmentDiscarded),
                }
            }
        };

        let incoming =
            &mut peer.channels[channel_id as usize].incoming_reliable_commands[position];
        let complete = match &mut incoming.payload {
            Payload::Assembling(reassembly) => {
                reassembly.insert(fragment.fragment_number, fragment.fragment_offset, payload)
                    && reassembly.is_complete()
            }
            Payload::Complete(_) => false,
        };
        if complete && peer.dispatch_incoming_reliable(channel_id) {
            self.mark_dispatch(index);
        }
        Ok(())
    }

    fn handle_send_unreliable_fragment(
        &mut self,
        index: usize,
        command: &Command,
        fragment: &SendFragment,
        payload: &Bytes,
    ) -> Handled {
        let channel_id = command.header.channel_id;
        self.require_channel(index, channel_id)?;
        let maximum_packet_size = self.config.maximum_packet_size;
        let maximum_waiting_data = self.config.maximum_waiting_data;

        let peer = &mut self.peers[index];
        let reliable = command.header.reliable_sequence_number;
        let start = fragment.start_sequence_number;
        let channel = &peer.channels[channel_id as usize];
        if !channel.accepts(reliable) {
            return Ok(());
        }
        if reliable == channel.incoming_reliable_sequence_number
            && start <= channel.incoming_unreliable_sequence_number
        {
            return Ok(());
        }
        if !fragment::validate(fragment, payload.len(), maximum_packet_size) {
            return Err(ProtocolFault::MalformedFragment);
        }

        let position = match channel.find_unreliable_fragment(reliable, start) {
            Some(position) => {
                let existing = &channel.incoming_unreliable_commands[position];
                if !matches_fragment_set(
                    &existing.payload,
                    existing.kind,
                    CommandType::SendUnreliableFragment,
                    fragment,
                ) {
                    return Err(ProtocolFault::FragmentMismatch);
                }
                position
            }
            None => {
                let queued = peer.queue_incoming_command(
                    command,
                    Payload::Assembling(Reassembly::new(
                        fragment.total_length,
                        fragment.fragment_count,
                    )),
                    PacketFlags::UNRELIABLE_FRAGMENT,
                    maximum_waiting_data,
                )?;
                match queued {
                    Queued::Inserted(position) => position,
                    Queued::Discarded => return Err(ProtocolFault::FragmentDiscarded),
                }
            }
        };

        let incoming =
            &mut peer.channels[channel_id as usize].incoming_unreliable_commands[position];
        let complete = match &mut incoming.payload {
            Payload::Assembling(reassembly) => {
                reassembly.insert(fragment.fragment_number, fragment.fragment_offset, payload)
                    && reassembly.is_complete()
            }
            Payload::Complete(_) => false,
        };
        if complete && peer.dispatch_incoming_unreliable(channel_id) {
            self.mark_dispatch(index);
        }
        Ok(())
    }
}

/// Bump a session id proposed by the remote (0xFF = "pick one"), avoiding the
/// id the slot used last time.
fn next_session_id(proposed: u8, previous: u8) -> u8 {
    let base = if proposed == 0xFF { previous } else { proposed };
    let mut id = base.wrapping_add(1) & SESSION_ID_MASK;
    if id == previous {
        id = id.wrapping_add(1) & SESSION_ID_MASK;
    }
    id
}

/// Whether a buffered command is the fragment set `fragment` belongs to.
fn matches_fragment_set(
    payload: &Payload,
    kind: CommandType,
    expected: CommandType,
    fragment: &SendFragment,
) -> bool {
    match payload {
        Payload::Assembling(reassembly) => {
            kind == expected
                && reassembly.total_length() == fragment.total_length as usize
                && reassembly.fragment_count() == fragment.fragment_count
        }
        Payload::Complete(_) => false,
    }
}
