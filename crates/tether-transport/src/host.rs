//! # Host
//!
//! A [`Host`] owns one socket and a fixed table of peer slots. Everything
//! happens inside [`Host::service`]: it flushes outgoing commands, reads
//! datagrams, runs retransmission and throttling, and hands back at most one
//! [`Event`] per call.
//!
//! ```text
//!  service(timeout)
//!    ├─ dispatch queued events ──────────────▶ return Some(event)
//!    └─ loop
//!        ├─ bandwidth throttle (1 s)
//!        ├─ send acks / timeouts / commands
//!        ├─ receive up to 256 datagrams
//!        ├─ send again
//!        ├─ dispatch ────────────────────────▶ return Some(event)
//!        └─ wait on socket until deadline ────▶ return None
//! ```
//!
//! Peers are addressed by [`PeerId`], the index of their slot. A slot is only
//! reused after its previous occupant has been fully reclaimed.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};
use tracing::debug;

use crate::channel::Channel;
use crate::codec::{ChecksumFn, Compressor, Encryptor, Intercept};
use crate::config::HostConfig;
use crate::congestion::{window_size, BANDWIDTH_THROTTLE_INTERVAL};
use crate::error::{Error, Result};
use crate::fragment;
use crate::packet::{Packet, PacketFlags};
use crate::peer::{Peer, PeerId, PeerState};
use crate::socket::{Socket, UdpTransport};
use crate::stats::{HostStats, PeerStats};
use crate::time::{time_difference, time_greater_equal, ServiceClock};
use crate::wire::{
    Command, CommandBody, CommandHeader, Connect, SendFragment, CONTROL_CHANNEL,
    MAXIMUM_CHANNEL_COUNT, MAXIMUM_MTU, MINIMUM_CHANNEL_COUNT,
};

// ─── Events ─────────────────────────────────────────────────────────────────

/// Something the application needs to know about.
#[derive(Debug)]
pub enum Event {
    /// A connection completed, in either direction. `data` is the value the
    /// remote passed to `connect` (0 for outbound connections).
    Connect { peer: PeerId, data: u32 },
    /// The remote disconnected, or a local `disconnect` completed.
    Disconnect { peer: PeerId, data: u32 },
    /// The peer stopped acknowledging and was dropped.
    DisconnectTimeout { peer: PeerId, data: u32 },
    Receive {
        peer: PeerId,
        channel_id: u8,
        packet: Packet,
    },
}

impl Event {
    pub fn peer(&self) -> PeerId {
        match *self {
            Event::Connect { peer, .. }
            | Event::Disconnect { peer, .. }
            | Event::DisconnectTimeout { peer, .. }
            | Event::Receive { peer, .. } => peer,
        }
    }
}

// ─── Host ───────────────────────────────────────────────────────────────────

pub struct Host<S: Socket = UdpTransport> {
    pub(crate) socket: S,
    pub(crate) address: SocketAddr,
    pub(crate) config: HostConfig,
    pub(crate) peers: Vec<Peer>,
    pub(crate) clock: ServiceClock,
    pub(crate) rng: StdRng,
    pub(crate) service_time: u32,
    pub(crate) bandwidth_throttle_epoch: u32,
    pub(crate) recalculate_bandwidth_limits: bool,
    pub(crate) connected_peers: usize,
    pub(crate) bandwidth_limited_peers: usize,
    pub(crate) dispatch_queue: VecDeque<usize>,
    pub(crate) checksum: Option<ChecksumFn>,
    pub(crate) compressor: Option<Box<dyn Compressor>>,
    pub(crate) encryptor: Option<Box<dyn Encryptor>>,
    pub(crate) intercept: Option<Intercept>,
    pub(crate) total_sent_data: u64,
    pub(crate) total_sent_packets: u64,
    pub(crate) total_received_data: u64,
    pub(crate) total_received_packets: u64,
    pub(crate) receive_buffer: Vec<u8>,
}

impl Host<UdpTransport> {
    /// Bind a UDP host. Use `0.0.0.0:0` for a client that only connects out.
    pub fn bind(addr: SocketAddr, config: HostConfig) -> Result<Self> {
        let socket =
            UdpTransport::bind(addr, config.receive_buffer_size, config.send_buffer_size)?;
        Host::with_socket(socket, config, quanta::Clock::new())
    }
}

impl<S: Socket> Host<S> {
    /// Build a host over any [`Socket`], reading time from `clock`.
    pub fn with_socket(socket: S, config: HostConfig, clock: quanta::Clock) -> Result<Self> {
        config.validate()?;
        let address = socket.local_addr()?;
        let seed = config
            .random_seed
            .unwrap_or_else(|| rand::rng().random::<u64>());
        let peers = (0..config.peer_count)
            .map(|index| Peer::new(index as u16, config.mtu, config.peer))
            .collect();

        debug!(
            %address,
            peers = config.peer_count,
            channel_limit = config.channel_limit,
            mtu = config.mtu,
            "host created"
        );

        Ok(Host {
            socket,
            address,
            config,
            peers,
            clock: ServiceClock::new(clock),
            rng: StdRng::seed_from_u64(seed),
            service_time: 0,
            bandwidth_throttle_epoch: 0,
            recalculate_bandwidth_limits: false,
            connected_peers: 0,
            bandwidth_limited_peers: 0,
            dispatch_queue: VecDeque::new(),
            checksum: None,
            compressor: None,
            encryptor: None,
            intercept: None,
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
            receive_buffer: vec![0; MAXIMUM_MTU as usize],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    // ─── Service ────────────────────────────────────────────────────────

    /// Drive the protocol for up to `timeout` and return the first event.
    ///
    /// A zero timeout polls once without blocking. `Ok(None)` means the
    /// timeout elapsed with nothing to report.
    pub fn service(&mut self, timeout: Duration) -> Result<Option<Event>> {
        if let Some(event) = self.dispatch_incoming_commands() {
            return Ok(Some(event));
        }

        self.service_time = self.clock.now_ms();
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128 / 4) as u32;
        let deadline = self.service_time.wrapping_add(timeout_ms);

        loop {
            if time_difference(self.service_time, self.bandwidth_throttle_epoch)
                >= BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            self.send_outgoing_commands(true);
            self.receive_incoming_commands()?;
            self.send_outgoing_commands(true);

            if let Some(event) = self.dispatch_incoming_commands() {
                return Ok(Some(event));
            }
            if time_greater_equal(self.service_time, deadline) {
                return Ok(None);
            }

            self.service_time = self.clock.now_ms();
            if time_greater_equal(self.service_time, deadline) {
                return Ok(None);
            }
            let wait = time_difference(deadline, self.service_time);
            let readable = self.socket.wait(Duration::from_millis(wait as u64))?;
            self.service_time = self.clock.now_ms();
            if !readable {
                return Ok(None);
            }
        }
    }

    /// Return the next already-queued event without touching the socket.
    pub fn check_events(&mut self) -> Option<Event> {
        self.dispatch_incoming_commands()
    }

    /// Send everything queued right now, without receiving.
    pub fn flush(&mut self) {
        self.service_time = self.clock.now_ms();
        self.send_outgoing_commands(false);
    }

    // ─── Host Operations ────────────────────────────────────────────────

    /// Start connecting to `address` with `channel_count` channels. The
    /// connection is usable once [`Event::Connect`] arrives for the returned
    /// peer.
    pub fn connect(
        &mut self,
        address: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId> {
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count) {
            return Err(Error::InvalidChannelCount(channel_count));
        }
        let index = self
            .peers
            .iter()
            .position(|p| p.state == PeerState::Disconnected)
            .ok_or(Error::NoAvailablePeers)?;

        let connect_id = self.rng.random::<u32>();
        let window = window_size(self.config.outgoing_bandwidth, 0);
        let (incoming_bandwidth, outgoing_bandwidth) =
            (self.config.incoming_bandwidth, self.config.outgoing_bandwidth);

        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::default()).collect();
        peer.state = PeerState::Connecting;
        peer.address = Some(address);
        peer.connect_id = connect_id;
        peer.window_size = window;

        let command = Command::new(
            CommandHeader::new(CONTROL_CHANNEL).acknowledged(),
            CommandBody::Connect(Connect {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id: peer.incoming_session_id,
                outgoing_session_id: peer.outgoing_session_id,
                mtu: peer.mtu,
                window_size: window,
                channel_count: channel_count as u32,
                incoming_bandwidth,
                outgoing_bandwidth,
                packet_throttle_interval: peer.throttle.interval,
                packet_throttle_acceleration: peer.throttle.acceleration,
                packet_throttle_deceleration: peer.throttle.deceleration,
                connect_id,
                data,
            }),
        );
        peer.queue_outgoing_command(command, None, 0, 0);

        let id = peer.id();
        debug!(peer = %id, %address, channel_count, "connecting");
        Ok(id)
    }

    /// Queue `packet` on `channel_id` of every connected peer. The payload is
    /// shared, not copied.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        for index in 0..self.peers.len() {
            if self.peers[index].state != PeerState::Connected {
                continue;
            }
            if let Err(e) = self.send_to_slot(index, channel_id, packet.clone()) {
                debug!(peer = index, error = %e, "broadcast send skipped");
            }
        }
    }

    /// Cap the channel count accepted from inbound connections. 0 means the
    /// protocol maximum.
    pub fn set_channel_limit(&mut self, limit: usize) {
        self.config.channel_limit = if limit == 0 || limit > MAXIMUM_CHANNEL_COUNT {
            MAXIMUM_CHANNEL_COUNT
        } else {
            limit.max(MINIMUM_CHANNEL_COUNT)
        };
    }

    /// Set host bandwidth in bytes per second (0 = unlimited). Peers are told
    /// their new share at the next throttle pass.
    pub fn set_bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.config.incoming_bandwidth = incoming;
        self.config.outgoing_bandwidth = outgoing;
        self.recalculate_bandwidth_limits = true;
    }

    pub fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.checksum = checksum;
    }

    pub fn set_compressor(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    pub fn set_encryptor(&mut self, encryptor: Option<Box<dyn Encryptor>>) {
        self.encryptor = encryptor;
    }

    pub fn set_intercept(&mut self, intercept: Option<Intercept>) {
        self.intercept = intercept;
    }

    /// Maximum number of peers accepted from one IP address.
    pub fn set_max_duplicate_peers(&mut self, limit: usize) {
        self.config.duplicate_peers = limit.max(1);
    }

    // ─── Host Getters ───────────────────────────────────────────────────

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peers(&self) -> usize {
        self.connected_peers
    }

    pub fn channel_limit(&self) -> usize {
        self.config.channel_limit
    }

    pub fn mtu(&self) -> u32 {
        self.config.mtu
    }

    pub fn total_sent_data(&self) -> u64 {
        self.total_sent_data
    }

    pub fn total_sent_packets(&self) -> u64 {
        self.total_sent_packets
    }

    pub fn total_received_data(&self) -> u64 {
        self.total_received_data
    }

    pub fn total_received_packets(&self) -> u64 {
        self.total_received_packets
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            total_sent_packets: self.total_sent_packets,
            total_sent_data: self.total_sent_data,
            total_received_packets: self.total_received_packets,
            total_received_data: self.total_received_data,
            peer_count: self.peers.len(),
            connected_peers: self.connected_peers,
            bandwidth_limited_peers: self.bandwidth_limited_peers,
            channel_limit: self.config.channel_limit,
            mtu: self.config.mtu,
            incoming_bandwidth: self.config.incoming_bandwidth,
            outgoing_bandwidth: self.config.outgoing_bandwidth,
        }
    }

    /// Ids of every peer that is not in a free slot.
    pub fn active_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers
            .iter()
            .filter(|p| p.state != PeerState::Disconnected)
            .map(Peer::id)
    }

    // ─── Peer Operations ────────────────────────────────────────────────

    /// Queue `packet` for delivery on `channel_id`.
    ///
    /// Packets larger than one datagram are fragmented. Fails if the peer is
    /// not connected, the channel is not open, or the packet exceeds the
    /// host's maximum packet size.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> Result<()> {
        let index = self.slot(peer)?;
        self.send_to_slot(index, channel_id, packet)
    }

    /// Pop the next delivered packet without going through [`Host::service`].
    pub fn receive(&mut self, peer: PeerId) -> Result<Option<(u8, Packet)>> {
        let index = self.slot(peer)?;
        Ok(self.peers[index].receive())
    }

    /// Queue a PING. Pings are also sent automatically when a peer is idle.
    pub fn ping(&mut self, peer: PeerId) -> Result<()> {
        let index = self.slot(peer)?;
        self.peers[index].ping();
        Ok(())
    }

    /// Idle interval in ms before an automatic ping. 0 restores the default.
    pub fn set_ping_interval(&mut self, peer: PeerId, interval: u32) -> Result<()> {
        let index = self.slot(peer)?;
        self.peers[index].set_ping_interval(interval);
        Ok(())
    }

    /// Set the retransmission timeout policy. 0 restores each default.
    pub fn set_timeout(
        &mut self,
        peer: PeerId,
        limit: u32,
        minimum: u32,
        maximum: u32,
    ) -> Result<()> {
        let index = self.slot(peer)?;
        self.peers[index].set_timeout(limit, minimum, maximum);
        Ok(())
    }

    /// Change the packet throttle parameters on both ends of the connection.
    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) -> Result<()> {
        let index = self.slot(peer)?;
        self.peers[index].throttle_configure(interval, acceleration, deceleration);
        Ok(())
    }

    /// Forcefully free the slot. The remote is not notified and no event is
    /// generated.
    pub fn reset_peer(&mut self, peer: PeerId) -> Result<()> {
        let index = self.slot(peer)?;
        self.reset_slot(index);
        Ok(())
    }

    /// Request a graceful disconnect. [`Event::Disconnect`] follows once the
    /// remote acknowledges.
    pub fn disconnect(&mut self, peer: PeerId, data: u32) -> Result<()> {
        let index = self.slot(peer)?;
        self.disconnect_slot(index, data);
        Ok(())
    }

    /// Send a DISCONNECT and free the slot at once. No event is generated.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) -> Result<()> {
        let index = self.slot(peer)?;
        let state = self.peers[index].state;
        if state == PeerState::Disconnected {
            return Ok(());
        }
        if state != PeerState::Zombie && state != PeerState::Disconnecting {
            self.reset_slot_queues(index);
            self.peers[index].queue_outgoing_command(
                Command::new(
                    CommandHeader::new(CONTROL_CHANNEL).unsequenced(),
                    CommandBody::Disconnect { data },
                ),
                None,
                0,
                0,
            );
            self.flush();
        }
        debug!(%peer, "disconnected immediately");
        self.reset_slot(index);
        Ok(())
    }

    /// Disconnect once every queued outgoing packet has been acknowledged.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) -> Result<()> {
        let index = self.slot(peer)?;
        let p = &mut self.peers[index];
        if p.state.is_connected() && p.has_outgoing_commands() {
            p.state = PeerState::DisconnectLater;
            p.event_data = data;
        } else {
            self.disconnect_slot(index, data);
        }
        Ok(())
    }

    // ─── Peer Getters ───────────────────────────────────────────────────

    pub fn peer_state(&self, peer: PeerId) -> Option<PeerState> {
        self.peers.get(peer.index()).map(|p| p.state)
    }

    pub fn peer_address(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.get(peer.index()).and_then(|p| p.address)
    }

    /// Value previously attached with [`Host::set_peer_data`].
    pub fn peer_data(&self, peer: PeerId) -> Option<u64> {
        self.peers.get(peer.index()).and_then(|p| p.user_data)
    }

    /// Attach an application value to the slot. It lives until the slot is
    /// reset, so a reused slot never carries a previous connection's value.
    pub fn set_peer_data(&mut self, peer: PeerId, data: Option<u64>) -> Result<()> {
        let index = self.slot(peer)?;
        self.peers[index].user_data = data;
        Ok(())
    }

    /// Snapshot of the peer's RTT, loss, throttle and queue statistics.
    pub fn peer_stats(&self, peer: PeerId) -> Option<PeerStats> {
        self.peers.get(peer.index()).map(Peer::stats)
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn slot(&self, peer: PeerId) -> Result<usize> {
        if peer.index() < self.peers.len() {
            Ok(peer.index())
        } else {
            Err(Error::InvalidPeer(peer))
        }
    }

    pub(crate) fn send_to_slot(
        &mut self,
        index: usize,
        channel_id: u8,
        packet: Packet,
    ) -> Result<()> {
        let overhead = self.encryptor.as_ref().map_or(0, |e| e.overhead());
        let has_checksum = self.checksum.is_some();
        let maximum_packet_size = self.config.maximum_packet_size;

        let peer = &mut self.peers[index];
        let id = peer.id();
        if peer.state != PeerState::Connected {
            return Err(Error::PeerNotConnected(id));
        }
        let Some(channel) = peer.channels.get(channel_id as usize) else {
            return Err(Error::InvalidChannel {
                peer: id,
                channel: channel_id,
                channel_count: peer.channels.len(),
            });
        };
        let length = packet.len();
        if length > maximum_packet_size {
            return Err(Error::PacketTooLarge {
                size: length,
                limit: maximum_packet_size,
            });
        }

        let flags = packet.flags();
        let fragment_length = fragment::fragment_length(peer.mtu, has_checksum, overhead);
        if length > fragment_length {
            let slices = fragment::split(length, fragment_length)
                .ok_or(Error::TooManyFragments(length.div_ceil(fragment_length)))?;
            let unreliable = flags
                .intersection(PacketFlags::RELIABLE | PacketFlags::UNRELIABLE_FRAGMENT)
                == PacketFlags::UNRELIABLE_FRAGMENT
                && channel.outgoing_unreliable_sequence_number < 0xFFFF;
            let start_sequence_number = if unreliable {
                channel.outgoing_unreliable_sequence_number.wrapping_add(1)
            } else {
                channel.outgoing_reliable_sequence_number.wrapping_add(1)
            };
            let fragment_count = slices.len() as u32;

            for slice in slices {
                let fragment = SendFragment {
                    start_sequence_number,
                    data_length: slice.length,
                    fragment_count,
                    fragment_number: slice.number,
                    total_length: length as u32,
                    fragment_offset: slice.offset,
                };
                let command = if unreliable {
                    Command::new(
                        CommandHeader::new(channel_id),
                        CommandBody::SendUnreliableFragment(fragment),
                    )
                } else {
                    Command::new(
                        CommandHeader::new(channel_id).acknowledged(),
                        CommandBody::SendFragment(fragment),
                    )
                };
                peer.queue_outgoing_command(
                    command,
                    Some(packet.clone()),
                    slice.offset,
                    slice.length,
                );
            }
            return Ok(());
        }

        let data_length = length as u16;
        let command = if flags.intersection(PacketFlags::RELIABLE | PacketFlags::UNSEQUENCED)
            == PacketFlags::UNSEQUENCED
        {
            Command::new(
                CommandHeader::new(channel_id).unsequenced(),
                CommandBody::SendUnsequenced {
                    unsequenced_group: 0,
                    data_length,
                },
            )
        } else if flags.contains(PacketFlags::RELIABLE)
            || channel.outgoing_unreliable_sequence_number >= 0xFFFF
        {
            Command::new(
                CommandHeader::new(channel_id).acknowledged(),
                CommandBody::SendReliable { data_length },
            )
        } else {
            Command::new(
                CommandHeader::new(channel_id),
                CommandBody::SendUnreliable {
                    unreliable_sequence_number: 0,
                    data_length,
                },
            )
        };
        peer.queue_outgoing_command(command, Some(packet), 0, data_length);
        Ok(())
    }

    /// Graceful disconnect of slot `index`.
    pub(crate) fn disconnect_slot(&mut self, index: usize, data: u32) {
        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return;
        }

        self.reset_slot_queues(index);
        let header = if state.is_connected() {
            CommandHeader::new(CONTROL_CHANNEL).acknowledged()
        } else {
            CommandHeader::new(CONTROL_CHANNEL).unsequenced()
        };
        self.peers[index].queue_outgoing_command(
            Command::new(header, CommandBody::Disconnect { data }),
            None,
            0,
            0,
        );

        debug!(peer = index, ?state, data, "disconnecting");
        if state.is_connected() {
            self.on_disconnect(index);
            self.peers[index].state = PeerState::Disconnecting;
        } else {
            self.flush();
            self.reset_slot(index);
        }
    }

    /// Free slot `index`, fixing up the host counters and dispatch queue.
    pub(crate) fn reset_slot(&mut self, index: usize) {
        self.on_disconnect(index);
        self.unmark_dispatch(index);
        self.peers[index].reset();
    }

    pub(crate) fn reset_slot_queues(&mut self, index: usize) {
        self.unmark_dispatch(index);
        self.peers[index].reset_queues();
    }

    // ─── State Transitions ──────────────────────────────────────────────

    pub(crate) fn change_state(&mut self, index: usize, state: PeerState) {
        if state.is_connected() {
            self.on_connect(index);
        } else {
            self.on_disconnect(index);
        }
        self.peers[index].state = state;
    }

    /// Change state and schedule the peer for the dispatch sweep.
    pub(crate) fn dispatch_state(&mut self, index: usize, state: PeerState) {
        self.change_state(index, state);
        self.mark_dispatch(index);
    }

    pub(crate) fn mark_dispatch(&mut self, index: usize) {
        let peer = &mut self.peers[index];
        if !peer.needs_dispatch {
            peer.needs_dispatch = true;
            self.dispatch_queue.push_back(index);
        }
    }

    fn unmark_dispatch(&mut self, index: usize) {
        if self.peers[index].needs_dispatch {
            self.peers[index].needs_dispatch = false;
            self.dispatch_queue.retain(|&queued| queued != index);
        }
    }

    fn on_connect(&mut self, index: usize) {
        let peer = &self.peers[index];
        if !peer.state.is_connected() {
            if peer.incoming_bandwidth != 0 {
                self.bandwidth_limited_peers += 1;
            }
            self.connected_peers += 1;
        }
    }

    fn on_disconnect(&mut self, index: usize) {
        let peer = &self.peers[index];
        if peer.state.is_connected() {
            if peer.incoming_bandwidth != 0 {
                self.bandwidth_limited_peers = self.bandwidth_limited_peers.saturating_sub(1);
            }
            self.connected_peers = self.connected_peers.saturating_sub(1);
        }
    }

    /// Handshake finished; the Connect event is delivered by the sweep.
    pub(crate) fn notify_connect(&mut self, index: usize) {
        self.recalculate_bandwidth_limits = true;
        let next = if self.peers[index].state == PeerState::Connecting {
            PeerState::ConnectionSucceeded
        } else {
            PeerState::ConnectionPending
        };
        self.dispatch_state(index, next);
    }

    pub(crate) fn notify_disconnect(&mut self, index: usize) {
        let state = self.peers[index].state;
        if state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }
        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            self.reset_slot(index);
        } else {
            self.peers[index].event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    /// Like [`Host::notify_disconnect`] but reports a timeout and keeps the
    /// last event data.
    pub(crate) fn notify_disconnect_timeout(&mut self, index: usize) {
        let state = self.peers[index].state;
        if state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }
        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            self.reset_slot(index);
        } else {
            self.peers[index].timed_out = true;
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    /// Pop the dispatch queue until one peer yields an event.
    pub(crate) fn dispatch_incoming_commands(&mut self) -> Option<Event> {
        while let Some(index) = self.dispatch_queue.pop_front() {
            self.peers[index].needs_dispatch = false;
            let peer = self.peers[index].id();

            match self.peers[index].state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.change_state(index, PeerState::Connected);
                    let data = self.peers[index].event_data;
                    debug!(%peer, address = ?self.peers[index].address, "connected");
                    return Some(Event::Connect { peer, data });
                }
                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;
                    let data = self.peers[index].event_data;
                    let timed_out = self.peers[index].timed_out;
                    self.reset_slot(index);
                    debug!(%peer, data, timed_out, "peer reclaimed");
                    return Some(if timed_out {
                        Event::DisconnectTimeout { peer, data }
                    } else {
                        Event::Disconnect { peer, data }
                    });
                }
                PeerState::Connected => {
                    let Some((channel_id, packet)) = self.peers[index].receive() else {
                        continue;
                    };
                    if !self.peers[index].dispatched_commands.is_empty() {
                        self.mark_dispatch(index);
                    }
                    return Some(Event::Receive {
                        peer,
                        channel_id,
                        packet,
                    });
                }
                _ => {}
            }
        }
        None
    }
}
