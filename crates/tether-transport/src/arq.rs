//! # ARQ: Acknowledgement and Retransmission
//!
//! Reliable commands move through three per-peer queues:
//!
//! ```text
//!  outgoing_send_reliable_commands ──send──▶ sent_reliable_commands ──ack──▶ (released)
//!              ▲                                      │
//!              └────────────── timeout ◀──────────────┘
//! ```
//!
//! Packet-less reliable commands (ping, connect, disconnect...) travel on
//! `outgoing_commands` instead but follow the same cycle.
//!
//! - Every sent reliable command carries a retransmission timeout seeded
//!   from the RTT estimator and doubled on each expiry.
//! - A peer is declared dead when the oldest unacknowledged command has
//!   waited `timeout_maximum` ms, or when it has been retried past
//!   `timeout_limit` and waited at least `timeout_minimum` ms.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::channel::RELIABLE_WINDOW_SIZE;
use crate::packet::Packet;
use crate::peer::Peer;
use crate::time::{time_difference, time_less};
use crate::wire::{Command, CommandType};

// ─── Outgoing Command ───────────────────────────────────────────────────────

/// A command queued for transmission, with its retransmission bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct OutgoingCommand {
    pub command: Command,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    /// Service time of the latest transmission.
    pub sent_time: u32,
    /// Current retransmission timeout in ms; 0 until first sent.
    pub round_trip_timeout: u32,
    /// Monotonic enqueue order, used to interleave the two outgoing queues.
    pub queue_time: u32,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub send_attempts: u16,
    pub packet: Option<Packet>,
}

impl OutgoingCommand {
    pub fn new(
        command: Command,
        packet: Option<Packet>,
        fragment_offset: u32,
        fragment_length: u16,
    ) -> Self {
        OutgoingCommand {
            command,
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            queue_time: 0,
            fragment_offset,
            fragment_length,
            send_attempts: 0,
            packet,
        }
    }

    /// Payload bytes this command carries on the wire.
    pub fn payload(&self) -> Option<Bytes> {
        let packet = self.packet.as_ref()?;
        let start = (self.fragment_offset as usize).min(packet.len());
        let end = (start + self.fragment_length as usize).min(packet.len());
        Some(packet.data().slice(start..end))
    }

    /// Bytes this command occupies in a datagram.
    #[inline]
    pub fn wire_size(&self) -> usize {
        self.command.size() + self.fragment_length as usize
    }

    #[inline]
    pub fn needs_ack(&self) -> bool {
        self.command.header.needs_ack()
    }
}

/// A received command awaiting acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Acknowledgement {
    /// Low 16 bits of the sender's timestamp, echoed back for RTT sampling.
    pub sent_time: u16,
    pub reliable_sequence_number: u16,
    pub channel_id: u8,
    pub kind: CommandType,
}

// ─── Acknowledgement Processing ─────────────────────────────────────────────

impl Peer {
    /// Release the reliable command acknowledged by `(sequence, channel_id)`.
    ///
    /// Returns the kind of the released command, or `None` if nothing
    /// matched (duplicate or stale acknowledgement).
    pub fn remove_sent_reliable_command(
        &mut self,
        sequence: u16,
        channel_id: u8,
    ) -> Option<CommandType> {
        let matches = |c: &OutgoingCommand| {
            c.reliable_sequence_number == sequence && c.command.header.channel_id == channel_id
        };

        let (removed, was_sent) = match self.sent_reliable_commands.iter().position(matches) {
            Some(index) => (self.sent_reliable_commands.remove(index)?, true),
            None => {
                // Timed out and requeued, but the first transmission still got through.
                let removed = take_requeued(&mut self.outgoing_send_reliable_commands, matches)
                    .or_else(|| take_requeued(&mut self.outgoing_commands, matches))?;
                (removed, false)
            }
        };

        if let Some(channel) = self.channels.get_mut(channel_id as usize) {
            let window = (sequence / RELIABLE_WINDOW_SIZE) as usize;
            if channel.reliable_windows[window] > 0 {
                channel.reliable_windows[window] -= 1;
                if channel.reliable_windows[window] == 0 {
                    channel.used_reliable_windows &= !(1 << window);
                }
            }
        }

        if let Some(packet) = &removed.packet {
            if was_sent {
                self.reliable_data_in_transit = self
                    .reliable_data_in_transit
                    .saturating_sub(removed.fragment_length as u32);
            }
            packet.acknowledge();
        }

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }
        Some(removed.command.kind())
    }

    // ─── Timeouts ───────────────────────────────────────────────────────

    /// Requeue every sent reliable command whose timeout expired.
    ///
    /// Returns `true` if the peer has exceeded its timeout budget and must be
    /// disconnected; the caller delivers the timeout event.
    pub fn check_timeouts(&mut self, now: u32) -> bool {
        let mut requeue_reliable = Vec::new();
        let mut requeue_other = Vec::new();
        let mut index = 0;

        while index < self.sent_reliable_commands.len() {
            let command = &self.sent_reliable_commands[index];
            if time_difference(now, command.sent_time) < command.round_trip_timeout {
                index += 1;
                continue;
            }

            if self.earliest_timeout == 0 || time_less(command.sent_time, self.earliest_timeout) {
                self.earliest_timeout = command.sent_time;
            }
            let waited = time_difference(now, self.earliest_timeout);
            let backoff = 1u32
                .checked_shl(command.send_attempts.saturating_sub(1) as u32)
                .unwrap_or(u32::MAX);
            if self.earliest_timeout != 0
                && (waited >= self.timeout_maximum
                    || (backoff >= self.timeout_limit && waited >= self.timeout_minimum))
            {
                tracing::debug!(
                    peer = %self.id(),
                    waited,
                    attempts = command.send_attempts,
                    "peer timed out"
                );
                return true;
            }

            let Some(mut command) = self.sent_reliable_commands.remove(index) else {
                break;
            };
            self.packets_lost = self.packets_lost.wrapping_add(1);
            command.round_trip_timeout = command.round_trip_timeout.saturating_mul(2);
            if command.packet.is_some() {
                self.reliable_data_in_transit = self
                    .reliable_data_in_transit
                    .saturating_sub(command.fragment_length as u32);
                requeue_reliable.push(command);
            } else {
                requeue_other.push(command);
            }

            if index == 0 {
                if let Some(front) = self.sent_reliable_commands.front() {
                    self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
                }
            }
        }

        prepend(&mut self.outgoing_send_reliable_commands, requeue_reliable);
        prepend(&mut self.outgoing_commands, requeue_other);
        false
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Remove a previously sent (and since requeued) reliable command. Requeued
/// commands sit at the front of the queue, so the scan stops at the first
/// reliable command that has never been sent.
fn take_requeued(
    queue: &mut VecDeque<OutgoingCommand>,
    matches: impl Fn(&OutgoingCommand) -> bool,
) -> Option<OutgoingCommand> {
    let mut found = None;
    for (index, command) in queue.iter().enumerate() {
        if !command.needs_ack() {
            continue;
        }
        if command.send_attempts < 1 {
            break;
        }
        if matches(command) {
            found = Some(index);
            break;
        }
    }
    queue.remove(found?)
}

/// Push `commands` onto the front of `queue`, keeping their order.
fn prepend(queue: &mut VecDeque<OutgoingCommand>, commands: Vec<OutgoingCommand>) {
    for command in commands.into_iter().rev() {
        queue.push_front(command);
    }
}
