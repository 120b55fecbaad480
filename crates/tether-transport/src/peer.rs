//! # Peers
//!
//! One [`Peer`] slot per potential connection, owned by the host and
//! addressed by [`PeerId`]. The lifecycle is:
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──VERIFY──────────────▶ ConnectionSucceeded ─┐
//!       │                                                                               ▼
//!       └──CONNECT──▶ AcknowledgingConnect ──ack of VERIFY──▶ ConnectionPending ──▶ Connected
//!                                                                                      │
//!         ┌──────────────── disconnect_later() ◀──────────────────────────────────────┤
//!         ▼                                                                            ▼
//!   DisconnectLater ──queues drained──▶ Disconnecting ◀──────────────── disconnect() ──┘
//!                                           │
//!                          ack / DISCONNECT │      DISCONNECT with ack requested
//!                                           ▼                  │
//!                                        Zombie ◀── AcknowledgingDisconnect
//!                                           │
//!                                  swept by the host
//!                                           ▼
//!                                      Disconnected
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::Serialize;

use crate::arq::{Acknowledgement, OutgoingCommand};
use crate::channel::{in_receive_window, Channel, IncomingCommand, Payload};
use crate::config::PeerConfig;
use crate::congestion::PacketThrottle;
use crate::packet::{Packet, PacketFlags};
use crate::receiver::ProtocolFault;
use crate::rtt::RttEstimator;
use crate::stats::PeerStats;
use crate::wire::{
    Command, CommandBody, CommandHeader, CommandType, CONTROL_CHANNEL, MAXIMUM_PEER_ID,
    MAXIMUM_WINDOW_SIZE,
};

pub const UNSEQUENCED_WINDOW_SIZE: u16 = 1024;
pub const UNSEQUENCED_WINDOWS: u32 = 64;
pub const FREE_UNSEQUENCED_WINDOWS: u32 = 32;

// ─── Identity ───────────────────────────────────────────────────────────────

/// Index of a peer slot within its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeerId(pub u16);

impl PeerId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PeerState {
    /// Free slot.
    Disconnected,
    /// CONNECT sent, waiting for VERIFY_CONNECT.
    Connecting,
    /// CONNECT received, VERIFY_CONNECT sent and awaiting acknowledgement.
    AcknowledgingConnect,
    /// Inbound handshake done; the Connect event has not been delivered yet.
    ConnectionPending,
    /// Outbound handshake done; the Connect event has not been delivered yet.
    ConnectionSucceeded,
    Connected,
    /// Disconnect once every queued outgoing command is acknowledged.
    DisconnectLater,
    /// DISCONNECT sent, waiting for its acknowledgement.
    Disconnecting,
    /// Remote DISCONNECT received; its acknowledgement is still to be sent.
    AcknowledgingDisconnect,
    /// Terminated; awaiting the Disconnect event and slot reclamation.
    Zombie,
}

impl PeerState {
    /// States that count toward the host's connected peers.
    #[inline]
    pub fn is_connected(self) -> bool {
        matches!(self, PeerState::Connected | PeerState::DisconnectLater)
    }
}

/// Result of offering an incoming send command to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Queued {
    /// Buffered at this index of the channel's reorder queue.
    Inserted(usize),
    /// Duplicate or out of window; dropped without error.
    Discarded,
}

// ─── Peer ───────────────────────────────────────────────────────────────────

pub(crate) struct Peer {
    pub incoming_peer_id: u16,
    pub outgoing_peer_id: u16,
    pub connect_id: u32,
    pub outgoing_session_id: u8,
    pub incoming_session_id: u8,
    pub address: Option<SocketAddr>,
    pub state: PeerState,
    pub channels: Vec<Channel>,

    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub incoming_bandwidth_throttle_epoch: u32,
    pub outgoing_bandwidth_throttle_epoch: u32,
    pub incoming_data_total: u32,
    pub outgoing_data_total: u32,

    pub last_send_time: u32,
    pub last_receive_time: u32,
    pub next_timeout: u32,
    pub earliest_timeout: u32,

    pub packet_loss_epoch: u32,
    pub packets_sent: u32,
    pub packets_lost: u32,
    pub packet_loss: u32,
    pub packet_loss_variance: u32,

    pub throttle: PacketThrottle,
    pub rtt: RttEstimator,

    pub host_mtu: u32,
    pub mtu: u32,
    pub window_size: u32,
    pub reliable_data_in_transit: u32,
    pub outgoing_reliable_sequence_number: u16,
    pub incoming_unsequenced_group: u16,
    pub outgoing_unsequenced_group: u16,
    pub unsequenced_window: [u32; (UNSEQUENCED_WINDOW_SIZE / 32) as usize],

    pub defaults: PeerConfig,
    pub ping_interval: u32,
    pub timeout_limit: u32,
    pub timeout_minimum: u32,
    pub timeout_maximum: u32,

    pub event_data: u32,
    /// Application value attached to the slot; cleared on reset.
    pub user_data: Option<u64>,
    pub total_waiting_data: usize,
    pub total_queued: u32,
    pub needs_dispatch: bool,
    pub continue_sending: bool,
    pub timed_out: bool,

    pub acknowledgements: VecDeque<Acknowledgement>,
    pub sent_reliable_commands: VecDeque<OutgoingCommand>,
    pub outgoing_send_reliable_commands: VecDeque<OutgoingCommand>,
    pub outgoing_commands: VecDeque<OutgoingCommand>,
    pub dispatched_commands: VecDeque<(u8, Packet)>,
}

impl Peer {
    pub fn new(index: u16, host_mtu: u32, defaults: PeerConfig) -> Self {
        let mut peer = Peer {
            incoming_peer_id: index,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            connect_id: 0,
            outgoing_session_id: 0xFF,
            incoming_session_id: 0xFF,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_loss_epoch: 0,
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,
            throttle: PacketThrottle::default(),
            rtt: RttEstimator::default(),
            host_mtu,
            mtu: host_mtu,
            window_size: MAXIMUM_WINDOW_SIZE,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize],
            defaults,
            ping_interval: defaults.ping_interval,
            timeout_limit: defaults.timeout_limit,
            timeout_minimum: defaults.timeout_minimum,
            timeout_maximum: defaults.timeout_maximum,
            event_data: 0,
            user_data: None,
            total_waiting_data: 0,
            total_queued: 0,
            needs_dispatch: false,
            continue_sending: false,
            timed_out: false,
            acknowledgements: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            outgoing_send_reliable_commands: VecDeque::new(),
            outgoing_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
        };
        peer.reset();
        peer
    }

    #[inline]
    pub fn id(&self) -> PeerId {
        PeerId(self.incoming_peer_id)
    }

    /// Drop every queued command and close all channels. The caller is
    /// responsible for removing the peer from the host dispatch queue.
    pub fn reset_queues(&mut self) {
        self.needs_dispatch = false;
        self.acknowledgements.clear();
        self.sent_reliable_commands.clear();
        self.outgoing_send_reliable_commands.clear();
        self.outgoing_commands.clear();
        self.dispatched_commands.clear();
        self.channels.clear();
        self.total_waiting_data = 0;
    }

    /// Return the slot to its pristine state. Session ids survive so the next
    /// connection on this slot picks fresh ones.
    pub fn reset(&mut self) {
        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.connect_id = 0;
        self.state = PeerState::Disconnected;
        self.address = None;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_loss_epoch = 0;
        self.packets_sent = 0;
        self.packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.throttle = PacketThrottle::new(
            self.defaults.packet_throttle_interval,
            self.defaults.packet_throttle_acceleration,
            self.defaults.packet_throttle_deceleration,
        );
        self.rtt = RttEstimator::default();
        self.ping_interval = self.defaults.ping_interval;
        self.timeout_limit = self.defaults.timeout_limit;
        self.timeout_minimum = self.defaults.timeout_minimum;
        self.timeout_maximum = self.defaults.timeout_maximum;
        self.mtu = self.host_mtu;
        self.window_size = MAXIMUM_WINDOW_SIZE;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.unsequenced_window = [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize];
        self.event_data = 0;
        self.user_data = None;
        self.total_queued = 0;
        self.continue_sending = false;
        self.timed_out = false;
        self.reset_queues();
    }

    /// Whether anything is queued or awaiting acknowledgement.
    pub fn has_outgoing_commands(&self) -> bool {
        !self.outgoing_commands.is_empty()
            || !self.outgoing_send_reliable_commands.is_empty()
            || !self.sent_reliable_commands.is_empty()
    }

    // ─── Outgoing ───────────────────────────────────────────────────────

    pub fn queue_outgoing_command(
        &mut self,
        command: Command,
        packet: Option<Packet>,
        fragment_offset: u32,
        fragment_length: u16,
    ) {
        self.setup_outgoing_command(OutgoingCommand::new(
            command,
            packet,
            fragment_offset,
            fragment_length,
        ));
    }

    /// Assign sequence numbers and place the command on an outgoing queue.
    pub fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) {
        self.outgoing_data_total = self
            .outgoing_data_total
            .wrapping_add((outgoing.command.size() + outgoing.fragment_length as usize) as u32);

        let header = outgoing.command.header;
        let channel_id = header.channel_id;
        if channel_id == CONTROL_CHANNEL {
            self.outgoing_reliable_sequence_number =
                self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else if header.needs_ack() {
            if let Some(channel) = self.channels.get_mut(channel_id as usize) {
                channel.outgoing_reliable_sequence_number =
                    channel.outgoing_reliable_sequence_number.wrapping_add(1);
                channel.outgoing_unreliable_sequence_number = 0;
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
            }
            outgoing.unreliable_sequence_number = 0;
        } else if header.is_unsequenced() {
            self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
            outgoing.reliable_sequence_number = 0;
            outgoing.unreliable_sequence_number = 0;
        } else if let Some(channel) = self.channels.get_mut(channel_id as usize) {
            if outgoing.fragment_offset == 0 {
                channel.outgoing_unreliable_sequence_number =
                    channel.outgoing_unreliable_sequence_number.wrapping_add(1);
            }
            outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.command.header.reliable_sequence_number = outgoing.reliable_sequence_number;
        self.total_queued = self.total_queued.wrapping_add(1);
        outgoing.queue_time = self.total_queued;

        match &mut outgoing.command.body {
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => *unreliable_sequence_number = outgoing.unreliable_sequence_number,
            CommandBody::SendUnsequenced {
                unsequenced_group, ..
            } => *unsequenced_group = self.outgoing_unsequenced_group,
            _ => {}
        }

        match &outgoing.packet {
            Some(packet) if header.needs_ack() => {
                packet.add_pending_ack();
                self.outgoing_send_reliable_commands.push_back(outgoing);
            }
            _ => self.outgoing_commands.push_back(outgoing),
        }
    }

    /// Queue an acknowledgement for a received command. Returns `false` if
    /// the command lies in the far-future windows the sender cannot be using.
    pub fn queue_acknowledgement(&mut self, command: &Command, sent_time: u16) -> bool {
        let sequence = command.header.reliable_sequence_number;
        if let Some(channel) = self.channels.get(command.header.channel_id as usize) {
            let window = crate::channel::RELIABLE_WINDOW_SIZE;
            let mut reliable_window = sequence / window;
            let current_window = channel.incoming_reliable_sequence_number / window;
            if sequence < channel.incoming_reliable_sequence_number {
                reliable_window += crate::channel::RELIABLE_WINDOWS;
            }
            let free = crate::channel::FREE_RELIABLE_WINDOWS;
            if reliable_window >= current_window + free - 1 && reliable_window <= current_window + free
            {
                return false;
            }
        }

        self.outgoing_data_total = self
            .outgoing_data_total
            .wrapping_add(CommandType::Acknowledge.size() as u32);
        self.acknowledgements.push_back(Acknowledgement {
            sent_time,
            reliable_sequence_number: sequence,
            channel_id: command.header.channel_id,
            kind: command.kind(),
        });
        true
    }

    pub fn ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }
        self.queue_outgoing_command(
            Command::new(CommandHeader::new(CONTROL_CHANNEL).acknowledged(), CommandBody::Ping),
            None,
            0,
            0,
        );
    }

    /// Apply new throttle parameters locally and announce them to the remote.
    pub fn throttle_configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.throttle.interval = interval;
        self.throttle.acceleration = acceleration;
        self.throttle.deceleration = deceleration;
        self.queue_outgoing_command(
            Command::new(
                CommandHeader::new(CONTROL_CHANNEL).acknowledged(),
                CommandBody::ThrottleConfigure {
                    packet_throttle_interval: interval,
                    packet_throttle_acceleration: acceleration,
                    packet_throttle_deceleration: deceleration,
                },
            ),
            None,
            0,
            0,
        );
    }

    /// 0 restores the configured default.
    pub fn set_ping_interval(&mut self, interval: u32) {
        self.ping_interval = if interval == 0 {
            self.defaults.ping_interval
        } else {
            interval
        };
    }

    /// 0 restores the configured default for each value.
    pub fn set_timeout(&mut self, limit: u32, minimum: u32, maximum: u32) {
        let pick = |value: u32, default: u32| if value == 0 { default } else { value };
        self.timeout_limit = pick(limit, self.defaults.timeout_limit);
        self.timeout_minimum = pick(minimum, self.defaults.timeout_minimum);
        self.timeout_maximum = pick(maximum, self.defaults.timeout_maximum);
    }

    // ─── Incoming ───────────────────────────────────────────────────────

    /// Offer a received send command to its channel's reorder buffer.
    ///
    /// The caller has validated the channel id. Fragment sets arrive as an
    /// empty [`Payload::Assembling`] for the first fragment seen.
    pub fn queue_incoming_command(
        &mut self,
        command: &Command,
        payload: Payload,
        flags: PacketFlags,
        maximum_waiting_data: usize,
    ) -> Result<Queued, ProtocolFault> {
        let fragment_count = match &payload {
            Payload::Assembling(r) => r.fragment_count(),
            Payload::Complete(_) => 0,
        };
        let discard = || {
            if fragment_count > 0 {
                Err(ProtocolFault::FragmentDiscarded)
            } else {
                Ok(Queued::Discarded)
            }
        };

        if self.state == PeerState::DisconnectLater {
            return discard();
        }
        let Some(channel) = self.channels.get(command.header.channel_id as usize) else {
            return discard();
        };

        let kind = command.kind();
        let reliable = command.header.reliable_sequence_number;
        if !channel.accepts(reliable) {
            return discard();
        }

        let (unreliable, position) = match command.body {
            CommandBody::SendReliable { .. } | CommandBody::SendFragment(_) => {
                if reliable == channel.incoming_reliable_sequence_number {
                    return discard();
                }
                (0, channel.reliable_insert_position(reliable))
            }
            CommandBody::SendUnreliable {
                unreliable_sequence_number: unreliable,
                ..
            }
            | CommandBody::SendUnreliableFragment(crate::wire::SendFragment {
                start_sequence_number: unreliable,
                ..
            }) => {
                if reliable == channel.incoming_reliable_sequence_number
                    && unreliable <= channel.incoming_unreliable_sequence_number
                {
                    return discard();
                }
                (unreliable, channel.unreliable_insert_position(reliable, unreliable))
            }
            _ => return discard(),
        };
        let Some(position) = position else {
            return discard();
        };

        if self.total_waiting_data >= maximum_waiting_data {
            return Err(ProtocolFault::WaitingDataExceeded);
        }

        let incoming = IncomingCommand {
            reliable_sequence_number: reliable,
            unreliable_sequence_number: unreliable,
            kind,
            fragment_count,
            flags,
            payload,
        };
        self.total_waiting_data += incoming.size();

        let channel = &mut self.channels[command.header.channel_id as usize];
        let queue = match kind {
            CommandType::SendReliable | CommandType::SendFragment => {
                &mut channel.incoming_reliable_commands
            }
            _ => &mut channel.incoming_unreliable_commands,
        };
        queue.insert(position, incoming);
        Ok(Queued::Inserted(position))
    }

    /// Deliver an unsequenced packet straight to the dispatch queue.
    pub fn queue_unsequenced(
        &mut self,
        channel_id: u8,
        data: Bytes,
        maximum_waiting_data: usize,
    ) -> Result<(), ProtocolFault> {
        if self.state == PeerState::DisconnectLater {
            return Ok(());
        }
        if self.total_waiting_data >= maximum_waiting_data {
            return Err(ProtocolFault::WaitingDataExceeded);
        }
        self.total_waiting_data += data.len();
        let packet = Packet::builder(data)
            .flags(PacketFlags::UNSEQUENCED)
            .build();
        self.dispatched_commands.push_back((channel_id, packet));
        Ok(())
    }

    /// Check an unsequenced group against the duplicate window and mark it
    /// seen. Returns `false` if it must be dropped.
    pub fn admit_unsequenced_group(&mut self, group: u16) -> bool {
        let index = (group % UNSEQUENCED_WINDOW_SIZE) as usize;
        let mut group = group as u32;
        if group < self.incoming_unsequenced_group as u32 {
            group += 0x10000;
        }
        let base = self.incoming_unsequenced_group as u32;
        if group >= base + FREE_UNSEQUENCED_WINDOWS * UNSEQUENCED_WINDOW_SIZE as u32 {
            return false;
        }

        let group = (group & 0xFFFF) as u16;
        let window_base = group - group % UNSEQUENCED_WINDOW_SIZE;
        if window_base != self.incoming_unsequenced_group {
            self.incoming_unsequenced_group = window_base;
            self.unsequenced_window = [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize];
        } else if self.unsequenced_window[index / 32] & (1 << (index % 32)) != 0 {
            return false;
        }
        self.unsequenced_window[index / 32] |= 1 << (index % 32);
        true
    }

    pub fn dispatch_incoming_reliable(&mut self, channel_id: u8) -> bool {
        let Some(channel) = self.channels.get_mut(channel_id as usize) else {
            return false;
        };
        let (delivered, released) =
            channel.dispatch_reliable(channel_id, &mut self.dispatched_commands);
        self.total_waiting_data = self.total_waiting_data.saturating_sub(released);
        delivered
    }

    pub fn dispatch_incoming_unreliable(&mut self, channel_id: u8) -> bool {
        let Some(channel) = self.channels.get_mut(channel_id as usize) else {
            return false;
        };
        let (delivered, released) =
            channel.dispatch_unreliable(channel_id, &mut self.dispatched_commands);
        self.total_waiting_data = self.total_waiting_data.saturating_sub(released);
        delivered
    }

    /// Pop the next delivered packet.
    pub fn receive(&mut self) -> Option<(u8, Packet)> {
        let (channel_id, packet) = self.dispatched_commands.pop_front()?;
        self.total_waiting_data = self.total_waiting_data.saturating_sub(packet.len());
        Some((channel_id, packet))
    }

    /// Whether `sequence` on `channel_id` is inside the receive window.
    pub fn in_window(&self, channel_id: u8, sequence: u16) -> bool {
        self.channels
            .get(channel_id as usize)
            .is_some_and(|c| in_receive_window(sequence, c.incoming_reliable_sequence_number))
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            id: self.id(),
            state: self.state,
            address: self.address,
            connect_id: self.connect_id,
            channel_count: self.channels.len(),
            mtu: self.mtu,
            window_size: self.window_size,
            round_trip_time: self.rtt.round_trip_time,
            round_trip_time_variance: self.rtt.round_trip_time_variance,
            last_round_trip_time: self.rtt.last_round_trip_time,
            last_send_time: self.last_send_time,
            last_receive_time: self.last_receive_time,
            packet_loss: self.packet_loss,
            packet_loss_variance: self.packet_loss_variance,
            packet_throttle: self.throttle.value,
            packet_throttle_limit: self.throttle.limit,
            packets_sent: self.packets_sent,
            packets_lost: self.packets_lost,
            reliable_data_in_transit: self.reliable_data_in_transit,
            incoming_bandwidth: self.incoming_bandwidth,
            outgoing_bandwidth: self.outgoing_bandwidth,
            queued_acknowledgements: self.acknowledgements.len(),
            queued_outgoing: self.outgoing_commands.len()
                + self.outgoing_send_reliable_commands.len(),
            sent_unacknowledged: self.sent_reliable_commands.len(),
            waiting_data: self.total_waiting_data,
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.incoming_peer_id)
            .field("state", &self.state)
            .field("address", &self.address)
            .field("connect_id", &self.connect_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::Reassembly;

    fn connected_peer(channels: usize) -> Peer {
        let mut peer = Peer::new(0, 1392, PeerConfig::default());
        peer.state = PeerState::Connected;
        peer.channels = (0..channels).map(|_| Channel::default()).collect();
        peer
    }

    fn reliable(channel: u8, sequence: u16, data: &'static [u8]) -> (Command, Payload) {
        let mut header = CommandHeader::new(channel).acknowledged();
        header.reliable_sequence_number = sequence;
        (
            Command::new(
                header,
                CommandBody::SendReliable {
                    data_length: data.len() as u16,
                },
            ),
            Payload::Complete(Packet::new(data, PacketFlags::RELIABLE)),
        )
    }

    // ─── Outgoing Tests ─────────────────────────────────────────────────

    #[test]
    fn sequence_assignment_by_command_class() {
        let mut peer = connected_peer(2);

        peer.ping();
        assert_eq!(peer.outgoing_commands[0].reliable_sequence_number, 1);

        let packet = Packet::new(b"r", PacketFlags::RELIABLE);
        peer.queue_outgoing_command(
            Command::new(
                CommandHeader::new(1).acknowledged(),
                CommandBody::SendReliable { data_length: 1 },
            ),
            Some(packet.clone()),
            0,
            1,
        );
        let sent = &peer.outgoing_send_reliable_commands[0];
        assert_eq!(sent.reliable_sequence_number, 1);
        assert_eq!(sent.command.header.reliable_sequence_number, 1);

        for _ in 0..2 {
            peer.queue_outgoing_command(
                Command::new(
                    CommandHeader::new(1),
                    CommandBody::SendUnreliable {
                        unreliable_sequence_number: 0,
                        data_length: 1,
                    },
                ),
                Some(packet.clone()),
                0,
                1,
            );
        }
        let last = peer.outgoing_commands.back().unwrap();
        assert_eq!(last.reliable_sequence_number, 1);
        assert_eq!(last.unreliable_sequence_number, 2);
        assert!(matches!(
            last.command.body,
            CommandBody::SendUnreliable {
                unreliable_sequence_number: 2,
                ..
            }
        ));

        peer.queue_outgoing_command(
            Command::new(
                CommandHeader::new(0).unsequenced(),
                CommandBody::SendUnsequenced {
                    unsequenced_group: 0,
                    data_length: 1,
                },
            ),
            Some(packet),
            0,
            1,
        );
        assert_eq!(peer.outgoing_unsequenced_group, 1);
        let queue_times: Vec<u32> = peer.outgoing_commands.iter().map(|c| c.queue_time).collect();
        assert_eq!(queue_times, vec![1, 3, 4, 5]);
    }

    #[test]
    fn reset_preserves_session_ids() {
        let mut peer = connected_peer(1);
        peer.incoming_session_id = 2;
        peer.outgoing_session_id = 1;
        peer.connect_id = 99;
        peer.ping();
        peer.reset();
        assert_eq!(peer.state, PeerState::Disconnected);
        assert_eq!(peer.connect_id, 0);
        assert!(peer.channels.is_empty());
        assert!(!peer.has_outgoing_commands());
        assert_eq!((peer.incoming_session_id, peer.outgoing_session_id), (2, 1));
    }

    #[test]
    fn zero_restores_defaults() {
        let mut peer = connected_peer(1);
        peer.set_ping_interval(100);
        peer.set_timeout(4, 100, 200);
        assert_eq!(peer.ping_interval, 100);
        peer.set_ping_interval(0);
        peer.set_timeout(0, 0, 1000);
        assert_eq!(peer.ping_interval, 500);
        assert_eq!(peer.timeout_limit, 32);
        assert_eq!(peer.timeout_minimum, 5000);
        assert_eq!(peer.timeout_maximum, 1000);
    }

    // ─── Incoming Tests ─────────────────────────────────────────────────

    #[test]
    fn duplicate_reliable_discarded() {
        let mut peer = connected_peer(1);
        let (command, payload) = reliable(0, 2, b"two");
        assert_eq!(
            peer.queue_incoming_command(&command, payload, PacketFlags::RELIABLE, 1 << 20),
            Ok(Queued::Inserted(0))
        );
        let (command, payload) = reliable(0, 2, b"two");
        assert_eq!(
            peer.queue_incoming_command(&command, payload, PacketFlags::RELIABLE, 1 << 20),
            Ok(Queued::Discarded)
        );
        assert_eq!(peer.total_waiting_data, 3);

        let (command, payload) = reliable(0, 1, b"one");
        peer.queue_incoming_command(&command, payload, PacketFlags::RELIABLE, 1 << 20)
            .unwrap();
        assert!(peer.dispatch_incoming_reliable(0));
        assert_eq!(&peer.receive().unwrap().1.data()[..], b"one");
        assert_eq!(&peer.receive().unwrap().1.data()[..], b"two");
        assert!(peer.receive().is_none());
        assert_eq!(peer.total_waiting_data, 0);

        // Already delivered.
        let (command, payload) = reliable(0, 2, b"two");
        assert_eq!(
            peer.queue_incoming_command(&command, payload, PacketFlags::RELIABLE, 1 << 20),
            Ok(Queued::Discarded)
        );
    }

    #[test]
    fn waiting_data_cap_is_a_fault() {
        let mut peer = connected_peer(1);
        let (command, payload) = reliable(0, 1, b"abcd");
        peer.queue_incoming_command(&command, payload, PacketFlags::RELIABLE, 4)
            .unwrap();
        let (command, payload) = reliable(0, 2, b"e");
        assert_eq!(
            peer.queue_incoming_command(&command, payload, PacketFlags::RELIABLE, 4),
            Err(ProtocolFault::WaitingDataExceeded)
        );
    }

    #[test]
    fn stale_fragment_start_is_a_fault() {
        let mut peer = connected_peer(1);
        peer.channels[0].incoming_reliable_sequence_number = 5;
        let mut header = CommandHeader::new(0).acknowledged();
        header.reliable_sequence_number = 5;
        let command = Command::new(
            header,
            CommandBody::SendFragment(crate::wire::SendFragment {
                start_sequence_number: 5,
                data_length: 1,
                fragment_count: 2,
                fragment_number: 0,
                total_length: 2,
                fragment_offset: 0,
            }),
        );
        assert_eq!(
            peer.queue_incoming_command(
                &command,
                Payload::Assembling(Reassembly::new(2, 2)),
                PacketFlags::RELIABLE,
                1 << 20
            ),
            Err(ProtocolFault::FragmentDiscarded)
        );
    }

    #[test]
    fn disconnect_later_discards_incoming() {
        let mut peer = connected_peer(1);
        peer.state = PeerState::DisconnectLater;
        let (command, payload) = reliable(0, 1, b"x");
        assert_eq!(
            peer.queue_incoming_command(&command, payload, PacketFlags::RELIABLE, 1 << 20),
            Ok(Queued::Discarded)
        );
    }

    #[test]
    fn far_future_acknowledgement_refused() {
        let mut peer = connected_peer(1);
        let (mut command, _) = reliable(0, 1, b"x");
        assert!(peer.queue_acknowledgement(&command, 10));
        command.header.reliable_sequence_number = 7 * 4096;
        assert!(!peer.queue_acknowledgement(&command, 10));
        command.header.reliable_sequence_number = 8 * 4096 + 5;
        assert!(!peer.queue_acknowledgement(&command, 10));
        command.header.reliable_sequence_number = 9 * 4096;
        assert!(peer.queue_acknowledgement(&command, 10));
    }

    // ─── Unsequenced Tests ──────────────────────────────────────────────

    #[test]
    fn unsequenced_duplicates_suppressed() {
        let mut peer = connected_peer(1);
        assert!(peer.admit_unsequenced_group(1));
        assert!(peer.admit_unsequenced_group(3));
        assert!(!peer.admit_unsequenced_group(1));
        // Moving to a new window clears the bitmap.
        assert!(peer.admit_unsequenced_group(1024 + 1));
        assert_eq!(peer.incoming_unsequenced_group, 1024);
        // Too far ahead.
        assert!(!peer.admit_unsequenced_group(1024 + 32 * 1024));
    }

    #[test]
    fn unsequenced_window_wraps() {
        let mut peer = connected_peer(1);
        peer.incoming_unsequenced_group = 0xFC00;
        assert!(peer.admit_unsequenced_group(0xFC05));
        assert!(peer.admit_unsequenced_group(3));
        assert_eq!(peer.incoming_unsequenced_group, 0);
    }
}
