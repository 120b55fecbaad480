//! # Channels
//!
//! Each peer owns `channel_count` independent channels. A channel assigns
//! outgoing sequence numbers and holds two reorder buffers for incoming
//! commands that arrived ahead of the delivery point.
//!
//! Reliable sequence space is split into 16 windows of 4096 numbers. The
//! receiver accepts commands in the current window and the next six; the
//! sender refuses to start a new window while the one eight ahead of it is
//! still occupied.

use std::collections::VecDeque;

use crate::fragment::Reassembly;
use crate::packet::{Packet, PacketFlags};
use crate::wire::CommandType;

// ─── Window Constants ───────────────────────────────────────────────────────

pub const RELIABLE_WINDOW_SIZE: u16 = 0x1000;
pub const RELIABLE_WINDOWS: u16 = 16;
pub const FREE_RELIABLE_WINDOWS: u16 = 8;

/// Whether `sequence` falls inside the receive window anchored at `incoming`.
#[inline]
pub(crate) fn in_receive_window(sequence: u16, incoming: u16) -> bool {
    let mut window = sequence / RELIABLE_WINDOW_SIZE;
    let current = incoming / RELIABLE_WINDOW_SIZE;
    if sequence < incoming {
        window += RELIABLE_WINDOWS;
    }
    window >= current && window < current + FREE_RELIABLE_WINDOWS - 1
}

// ─── Incoming Command ───────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum Payload {
    Complete(Packet),
    Assembling(Reassembly),
}

/// A received send command waiting in a reorder buffer.
#[derive(Debug)]
pub(crate) struct IncomingCommand {
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub kind: CommandType,
    /// Zero for unfragmented commands.
    pub fragment_count: u32,
    pub flags: PacketFlags,
    pub payload: Payload,
}

impl IncomingCommand {
    pub fn is_complete(&self) -> bool {
        match &self.payload {
            Payload::Complete(_) => true,
            Payload::Assembling(r) => r.is_complete(),
        }
    }

    /// Bytes counted against the peer's waiting-data budget.
    pub fn size(&self) -> usize {
        match &self.payload {
            Payload::Complete(p) => p.len(),
            Payload::Assembling(r) => r.total_length(),
        }
    }

    /// Turn a finished reassembly into a deliverable packet.
    pub fn seal(&mut self) {
        if let Payload::Assembling(reassembly) = &mut self.payload {
            if reassembly.is_complete() {
                let data = reassembly.take();
                self.payload = Payload::Complete(Packet::builder(data).flags(self.flags).build());
            }
        }
    }

    pub fn into_packet(self) -> Option<Packet> {
        match self.payload {
            Payload::Complete(p) => Some(p),
            Payload::Assembling(_) => None,
        }
    }
}

// ─── Channel ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct Channel {
    pub outgoing_reliable_sequence_number: u16,
    pub outgoing_unreliable_sequence_number: u16,
    /// Bit `w` set while window `w` has unacknowledged commands.
    pub used_reliable_windows: u16,
    /// Unacknowledged command count per window.
    pub reliable_windows: [u16; RELIABLE_WINDOWS as usize],
    pub incoming_reliable_sequence_number: u16,
    pub incoming_unreliable_sequence_number: u16,
    pub incoming_reliable_commands: VecDeque<IncomingCommand>,
    pub incoming_unreliable_commands: VecDeque<IncomingCommand>,
}

impl Channel {
    /// Whether a reliable sequence number is inside the acceptable window.
    #[inline]
    pub fn accepts(&self, reliable_sequence_number: u16) -> bool {
        in_receive_window(reliable_sequence_number, self.incoming_reliable_sequence_number)
    }

    /// Sequence numbers are compared relative to the delivery point: those
    /// behind it have wrapped and sort after those ahead of it.
    #[inline]
    fn wrapped(&self, sequence: u16) -> bool {
        sequence < self.incoming_reliable_sequence_number
    }

    /// Insert position for a reliable command, or `None` if it duplicates a
    /// buffered one.
    pub fn reliable_insert_position(&self, sequence: u16) -> Option<usize> {
        let queue = &self.incoming_reliable_commands;
        let mut index = queue.len();
        while index > 0 {
            let existing = queue[index - 1].reliable_sequence_number;
            if !self.wrapped(sequence) {
                if self.wrapped(existing) {
                    index -= 1;
                    continue;
                }
            } else if !self.wrapped(existing) {
                break;
            }
            if existing <= sequence {
                if existing < sequence {
                    break;
                }
                return None;
            }
            index -= 1;
        }
        Some(index)
    }

    /// Insert position for an unreliable command keyed by its enclosing
    /// reliable sequence and its own unreliable sequence.
    pub fn unreliable_insert_position(&self, reliable: u16, unreliable: u16) -> Option<usize> {
        let queue = &self.incoming_unreliable_commands;
        let mut index = queue.len();
        while index > 0 {
            let existing = &queue[index - 1];
            let existing_reliable = existing.reliable_sequence_number;
            if !self.wrapped(reliable) {
                if self.wrapped(existing_reliable) {
                    index -= 1;
                    continue;
                }
            } else if !self.wrapped(existing_reliable) {
                break;
            }
            if existing_reliable < reliable {
                break;
            }
            if existing_reliable > reliable {
                index -= 1;
                continue;
            }
            if existing.unreliable_sequence_number <= unreliable {
                if existing.unreliable_sequence_number < unreliable {
                    break;
                }
                return None;
            }
            index -= 1;
        }
        Some(index)
    }

    /// Locate a buffered reliable fragment set by start sequence.
    pub fn find_reliable_fragment(&self, start: u16) -> Option<usize> {
        let queue = &self.incoming_reliable_commands;
        for index in (0..queue.len()).rev() {
            let existing = queue[index].reliable_sequence_number;
            if !self.wrapped(start) {
                if self.wrapped(existing) {
                    continue;
                }
            } else if !self.wrapped(existing) {
                return None;
            }
            if existing <= start {
                return (existing == start).then_some(index);
            }
        }
        None
    }

    /// Locate a buffered unreliable fragment set by enclosing reliable
    /// sequence and start (unreliable) sequence.
    pub fn find_unreliable_fragment(&self, reliable: u16, start: u16) -> Option<usize> {
        let queue = &self.incoming_unreliable_commands;
        for index in (0..queue.len()).rev() {
            let existing = &queue[index];
            let existing_reliable = existing.reliable_sequence_number;
            if !self.wrapped(reliable) {
                if self.wrapped(existing_reliable) {
                    continue;
                }
            } else if !self.wrapped(existing_reliable) {
                return None;
            }
            if existing_reliable < reliable {
                return None;
            }
            if existing_reliable > reliable {
                continue;
            }
            if existing.unreliable_sequence_number <= start {
                return (existing.unreliable_sequence_number == start).then_some(index);
            }
        }
        None
    }

    /// Move every in-order, complete reliable command to `dispatched`, then
    /// release unreliable commands that were waiting on them.
    ///
    /// Returns `(delivered, released)`: whether anything was dispatched and
    /// how many waiting bytes were dropped as stale.
    pub fn dispatch_reliable(
        &mut self,
        channel_id: u8,
        dispatched: &mut VecDeque<(u8, Packet)>,
    ) -> (bool, usize) {
        let mut delivered = 0usize;
        for command in &self.incoming_reliable_commands {
            if !command.is_complete()
                || command.reliable_sequence_number
                    != self.incoming_reliable_sequence_number.wrapping_add(1)
            {
                break;
            }
            self.incoming_reliable_sequence_number = command.reliable_sequence_number;
            if command.fragment_count > 0 {
                self.incoming_reliable_sequence_number = self
                    .incoming_reliable_sequence_number
                    .wrapping_add((command.fragment_count - 1) as u16);
            }
            delivered += 1;
        }
        if delivered == 0 {
            return (false, 0);
        }

        self.incoming_unreliable_sequence_number = 0;
        for mut command in self.incoming_reliable_commands.drain(..delivered) {
            command.seal();
            if let Some(packet) = command.into_packet() {
                dispatched.push_back((channel_id, packet));
            }
        }

        let (_, released) = self.dispatch_unreliable(channel_id, dispatched);
        (true, released)
    }

    /// Deliver unreliable commands belonging to the current reliable
    /// sequence. Incomplete fragment sets are held until a newer command is
    /// delivered past them; commands from stale windows are dropped.
    pub fn dispatch_unreliable(
        &mut self,
        channel_id: u8,
        dispatched: &mut VecDeque<(u8, Packet)>,
    ) -> (bool, usize) {
        let mut delivered = false;
        let mut released = 0usize;
        let mut held: VecDeque<IncomingCommand> = VecDeque::new();

        while let Some(mut command) = self.incoming_unreliable_commands.pop_front() {
            if command.reliable_sequence_number == self.incoming_reliable_sequence_number {
                if command.is_complete() {
                    self.incoming_unreliable_sequence_number = command.unreliable_sequence_number;
                    released += held.drain(..).map(|c| c.size()).sum::<usize>();
                    command.seal();
                    if let Some(packet) = command.into_packet() {
                        dispatched.push_back((channel_id, packet));
                        delivered = true;
                    }
                } else {
                    held.push_back(command);
                }
            } else if self.accepts(command.reliable_sequence_number) {
                self.incoming_unreliable_commands.push_front(command);
                break;
            } else {
                released += command.size();
            }
        }

        while let Some(command) = held.pop_back() {
            self.incoming_unreliable_commands.push_front(command);
        }
        (delivered, released)
    }

    pub fn clear(&mut self) {
        *self = Channel::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reliable(sequence: u16) -> IncomingCommand {
        IncomingCommand {
            reliable_sequence_number: sequence,
            unreliable_sequence_number: 0,
            kind: CommandType::SendReliable,
            fragment_count: 0,
            flags: PacketFlags::RELIABLE,
            payload: Payload::Complete(Packet::new(&sequence.to_be_bytes(), PacketFlags::RELIABLE)),
        }
    }

    fn unreliable(reliable: u16, unreliable: u16) -> IncomingCommand {
        IncomingCommand {
            reliable_sequence_number: reliable,
            unreliable_sequence_number: unreliable,
            kind: CommandType::SendUnreliable,
            fragment_count: 0,
            flags: PacketFlags::empty(),
            payload: Payload::Complete(Packet::new(&unreliable.to_be_bytes(), PacketFlags::empty())),
        }
    }

    fn insert_reliable(channel: &mut Channel, sequence: u16) -> bool {
        match channel.reliable_insert_position(sequence) {
            Some(index) => {
                channel.incoming_reliable_commands.insert(index, reliable(sequence));
                true
            }
            None => false,
        }
    }

    fn delivered_sequences(dispatched: &VecDeque<(u8, Packet)>) -> Vec<u16> {
        dispatched
            .iter()
            .map(|(_, p)| u16::from_be_bytes([p.data()[0], p.data()[1]]))
            .collect()
    }

    // ─── Window Tests ───────────────────────────────────────────────────

    #[test]
    fn receive_window_bounds() {
        assert!(in_receive_window(1, 0));
        assert!(in_receive_window(6 * 4096 + 4095, 0));
        assert!(!in_receive_window(7 * 4096, 0));
        // Behind the delivery point wraps to the far end.
        assert!(!in_receive_window(10, 100));
        // Near the top of the space, the low windows are ahead.
        assert!(in_receive_window(5, 0xF000));
    }

    // ─── Reliable Tests ─────────────────────────────────────────────────

    #[test]
    fn reliable_reorders_and_rejects_duplicates() {
        let mut channel = Channel::default();
        assert!(insert_reliable(&mut channel, 3));
        assert!(insert_reliable(&mut channel, 1));
        assert!(insert_reliable(&mut channel, 2));
        assert!(!insert_reliable(&mut channel, 2));

        let order: Vec<u16> = channel
            .incoming_reliable_commands
            .iter()
            .map(|c| c.reliable_sequence_number)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn reliable_dispatch_stops_at_gap() {
        let mut channel = Channel::default();
        insert_reliable(&mut channel, 1);
        insert_reliable(&mut channel, 3);
        let mut dispatched = VecDeque::new();

        let (delivered, _) = channel.dispatch_reliable(0, &mut dispatched);
        assert!(delivered);
        assert_eq!(delivered_sequences(&dispatched), vec![1]);
        assert_eq!(channel.incoming_reliable_sequence_number, 1);

        insert_reliable(&mut channel, 2);
        channel.dispatch_reliable(0, &mut dispatched);
        assert_eq!(delivered_sequences(&dispatched), vec![1, 2, 3]);
    }

    #[test]
    fn reliable_wraps_around_sequence_space() {
        let mut channel = Channel {
            incoming_reliable_sequence_number: 0xFFFE,
            ..Default::default()
        };
        insert_reliable(&mut channel, 0);
        insert_reliable(&mut channel, 0xFFFF);
        let mut dispatched = VecDeque::new();
        channel.dispatch_reliable(0, &mut dispatched);
        assert_eq!(delivered_sequences(&dispatched), vec![0xFFFF, 0]);
        assert_eq!(channel.incoming_reliable_sequence_number, 0);
    }

    #[test]
    fn incomplete_fragment_blocks_reliable_dispatch() {
        let mut channel = Channel::default();
        channel.incoming_reliable_commands.push_back(IncomingCommand {
            reliable_sequence_number: 1,
            unreliable_sequence_number: 0,
            kind: CommandType::SendFragment,
            fragment_count: 2,
            flags: PacketFlags::RELIABLE,
            payload: Payload::Assembling(Reassembly::new(4, 2)),
        });
        let mut dispatched = VecDeque::new();
        assert!(!channel.dispatch_reliable(0, &mut dispatched).0);
        assert_eq!(channel.find_reliable_fragment(1), Some(0));

        if let Payload::Assembling(r) = &mut channel.incoming_reliable_commands[0].payload {
            r.insert(0, 0, &[1, 2]);
            r.insert(1, 2, &[3, 4]);
        }
        assert!(channel.dispatch_reliable(0, &mut dispatched).0);
        assert_eq!(&dispatched[0].1.data()[..], &[1, 2, 3, 4]);
        // Fragment sequence numbers 1 and 2 are both consumed.
        assert_eq!(channel.incoming_reliable_sequence_number, 2);
    }

    // ─── Unreliable Tests ───────────────────────────────────────────────

    #[test]
    fn unreliable_delivers_without_waiting_for_gaps() {
        let mut channel = Channel::default();
        for u in [1u16, 2, 5, 9] {
            let index = channel.unreliable_insert_position(0, u).unwrap();
            channel.incoming_unreliable_commands.insert(index, unreliable(0, u));
        }
        assert!(channel.unreliable_insert_position(0, 5).is_none());

        let mut dispatched = VecDeque::new();
        let (delivered, released) = channel.dispatch_unreliable(0, &mut dispatched);
        assert!(delivered);
        assert_eq!(released, 0);
        assert_eq!(delivered_sequences(&dispatched), vec![1, 2, 5, 9]);
        assert_eq!(channel.incoming_unreliable_sequence_number, 9);
    }

    #[test]
    fn unreliable_waits_for_its_reliable_sequence() {
        let mut channel = Channel::default();
        channel.incoming_unreliable_commands.push_back(unreliable(1, 1));
        let mut dispatched = VecDeque::new();
        assert!(!channel.dispatch_unreliable(0, &mut dispatched).0);
        assert_eq!(channel.incoming_unreliable_commands.len(), 1);

        insert_reliable(&mut channel, 1);
        channel.dispatch_reliable(0, &mut dispatched);
        assert_eq!(dispatched.len(), 2);
    }

    #[test]
    fn stale_unreliable_dropped() {
        let mut channel = Channel {
            incoming_reliable_sequence_number: 50,
            ..Default::default()
        };
        channel.incoming_unreliable_commands.push_back(unreliable(10, 1));
        let mut dispatched = VecDeque::new();
        let (delivered, released) = channel.dispatch_unreliable(0, &mut dispatched);
        assert!(!delivered);
        assert_eq!(released, 2);
        assert!(channel.incoming_unreliable_commands.is_empty());
    }

    #[test]
    fn newer_unreliable_drops_held_fragment() {
        let mut channel = Channel::default();
        channel.incoming_unreliable_commands.push_back(IncomingCommand {
            reliable_sequence_number: 0,
            unreliable_sequence_number: 1,
            kind: CommandType::SendUnreliableFragment,
            fragment_count: 3,
            flags: PacketFlags::empty(),
            payload: Payload::Assembling(Reassembly::new(30, 3)),
        });
        let mut dispatched = VecDeque::new();
        channel.dispatch_unreliable(0, &mut dispatched);
        assert_eq!(channel.find_unreliable_fragment(0, 1), Some(0));

        channel.incoming_unreliable_commands.push_back(unreliable(0, 2));
        let (_, released) = channel.dispatch_unreliable(0, &mut dispatched);
        assert_eq!(released, 30);
        assert_eq!(delivered_sequences(&dispatched), vec![2]);
        assert!(channel.incoming_unreliable_commands.is_empty());
    }
}
