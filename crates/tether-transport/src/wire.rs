//! # Tether Wire Format
//!
//! Every datagram is a protocol header followed by up to 32 packed commands.
//! All multi-byte fields are big-endian.
//!
//! ## Protocol Header (3 or 5 bytes)
//!
//! ```text
//!  0                   1                   2
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |T|C|SES|     Peer ID (low 12)  |Rsv|E|PID hi |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Sent Time (16, if T)     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! T = sent time present, C = compressed, SES = session id, E = encrypted.
//! A 32-bit checksum follows the header when the host has one installed.
//!
//! ## Command Header (4 bytes)
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |A|U|Rsv| Type  |  Channel ID   |  Reliable Sequence Number     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! A = acknowledge requested, U = unsequenced. The fixed command body
//! follows; send commands carry `dataLength` payload bytes after it.

use bytes::{Buf, BufMut, Bytes};

// ─── Protocol Limits ────────────────────────────────────────────────────────

pub const MINIMUM_MTU: u32 = 576;
pub const MAXIMUM_MTU: u32 = 4096;
pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
pub const MINIMUM_CHANNEL_COUNT: usize = 1;
pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
/// Peer id carried by datagrams that do not address a known peer (CONNECT).
pub const MAXIMUM_PEER_ID: u16 = 0xFFFF;
pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

/// Channel id used by connection-management commands.
pub const CONTROL_CHANNEL: u8 = 0xFF;

// ─── Flags ──────────────────────────────────────────────────────────────────

pub const COMMAND_MASK: u8 = 0x0F;
pub const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
pub const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;
const COMMAND_RESERVED_BITS: u8 = 0x30;

pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
pub const HEADER_FLAG_MASK: u16 = HEADER_FLAG_COMPRESSED | HEADER_FLAG_SENT_TIME;
pub const HEADER_SESSION_MASK: u16 = 3 << 12;
pub const HEADER_SESSION_SHIFT: u16 = 12;
const HEADER_PEER_ID_MASK: u16 = 0x0FFF;

pub const EXTENDED_FLAG_ENCRYPTED: u8 = 1 << 4;
const EXTENDED_PEER_ID_MASK: u8 = 0x0F;
const EXTENDED_RESERVED_BITS: u8 = 0xE0;

// ─── Sizes ──────────────────────────────────────────────────────────────────

/// Header without a sent time: peer id (2) + extended flags (1).
pub const MIN_HEADER_SIZE: usize = 3;
/// Header with a sent time.
pub const MAX_HEADER_SIZE: usize = 5;
pub const CHECKSUM_SIZE: usize = 4;
pub const COMMAND_HEADER_SIZE: usize = 4;

// ─── Command Type ───────────────────────────────────────────────────────────

/// Command taxonomy (low 4 bits of the command byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    Acknowledge = 1,
    Connect = 2,
    VerifyConnect = 3,
    Disconnect = 4,
    Ping = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    SendFragment = 8,
    SendUnsequenced = 9,
    BandwidthLimit = 10,
    ThrottleConfigure = 11,
    SendUnreliableFragment = 12,
}

impl CommandType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(CommandType::Acknowledge),
            2 => Some(CommandType::Connect),
            3 => Some(CommandType::VerifyConnect),
            4 => Some(CommandType::Disconnect),
            5 => Some(CommandType::Ping),
            6 => Some(CommandType::SendReliable),
            7 => Some(CommandType::SendUnreliable),
            8 => Some(CommandType::SendFragment),
            9 => Some(CommandType::SendUnsequenced),
            10 => Some(CommandType::BandwidthLimit),
            11 => Some(CommandType::ThrottleConfigure),
            12 => Some(CommandType::SendUnreliableFragment),
            _ => None,
        }
    }

    /// Encoded size of the command header plus fixed body, excluding payload.
    pub const fn size(self) -> usize {
        match self {
            CommandType::Acknowledge => 8,
            CommandType::Connect => 48,
            CommandType::VerifyConnect => 44,
            CommandType::Disconnect => 8,
            CommandType::Ping => 4,
            CommandType::SendReliable => 6,
            CommandType::SendUnreliable => 8,
            CommandType::SendFragment => 24,
            CommandType::SendUnsequenced => 8,
            CommandType::BandwidthLimit => 12,
            CommandType::ThrottleConfigure => 16,
            CommandType::SendUnreliableFragment => 24,
        }
    }
}

// ─── Protocol Header ────────────────────────────────────────────────────────

/// Per-datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// Addressed peer id, or [`MAXIMUM_PEER_ID`] when none is assigned yet.
    pub peer_id: u16,
    /// 2-bit session id of the addressed connection.
    pub session_id: u8,
    pub compressed: bool,
    pub encrypted: bool,
    /// Low 16 bits of the sender's service time, present when any command
    /// in the datagram requests an acknowledgement.
    pub sent_time: Option<u16>,
}

impl ProtocolHeader {
    pub fn encoded_len(&self) -> usize {
        if self.sent_time.is_some() {
            MAX_HEADER_SIZE
        } else {
            MIN_HEADER_SIZE
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut word = self.peer_id & HEADER_PEER_ID_MASK;
        word |= ((self.session_id as u16) << HEADER_SESSION_SHIFT) & HEADER_SESSION_MASK;
        if self.compressed {
            word |= HEADER_FLAG_COMPRESSED;
        }
        if self.sent_time.is_some() {
            word |= HEADER_FLAG_SENT_TIME;
        }
        let mut extended = ((self.peer_id >> 12) as u8) & EXTENDED_PEER_ID_MASK;
        if self.encrypted {
            extended |= EXTENDED_FLAG_ENCRYPTED;
        }
        buf.put_u16(word);
        buf.put_u8(extended);
        if let Some(sent_time) = self.sent_time {
            buf.put_u16(sent_time);
        }
    }

    /// Decode from a buffer. Returns `None` on a short buffer or reserved bits.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < MIN_HEADER_SIZE {
            return None;
        }
        let word = buf.get_u16();
        let extended = buf.get_u8();
        if extended & EXTENDED_RESERVED_BITS != 0 {
            return None;
        }
        let sent_time = if word & HEADER_FLAG_SENT_TIME != 0 {
            if buf.remaining() < 2 {
                return None;
            }
            Some(buf.get_u16())
        } else {
            None
        };
        Some(ProtocolHeader {
            peer_id: (word & HEADER_PEER_ID_MASK)
                | (((extended & EXTENDED_PEER_ID_MASK) as u16) << 12),
            session_id: ((word & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8,
            compressed: word & HEADER_FLAG_COMPRESSED != 0,
            encrypted: extended & EXTENDED_FLAG_ENCRYPTED != 0,
            sent_time,
        })
    }
}

// ─── Command Header ─────────────────────────────────────────────────────────

/// The 4-byte header shared by every command, minus the type (which is
/// derived from the body).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// `COMMAND_FLAG_ACKNOWLEDGE` and/or `COMMAND_FLAG_UNSEQUENCED`.
    pub flags: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
}

impl CommandHeader {
    pub fn new(channel_id: u8) -> Self {
        CommandHeader {
            flags: 0,
            channel_id,
            reliable_sequence_number: 0,
        }
    }

    pub fn acknowledged(mut self) -> Self {
        self.flags |= COMMAND_FLAG_ACKNOWLEDGE;
        self
    }

    pub fn unsequenced(mut self) -> Self {
        self.flags |= COMMAND_FLAG_UNSEQUENCED;
        self
    }

    #[inline]
    pub fn needs_ack(&self) -> bool {
        self.flags & COMMAND_FLAG_ACKNOWLEDGE != 0
    }

    #[inline]
    pub fn is_unsequenced(&self) -> bool {
        self.flags & COMMAND_FLAG_UNSEQUENCED != 0
    }
}

// ─── Command Bodies ─────────────────────────────────────────────────────────

/// CONNECT body: the initiator's view of the connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
    pub data: u32,
}

/// VERIFY_CONNECT body: the acceptor's answer to a CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyConnect {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
}

/// Body shared by reliable and unreliable fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendFragment {
    pub start_sequence_number: u16,
    pub data_length: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBody {
    Acknowledge {
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
    },
    Connect(Connect),
    VerifyConnect(VerifyConnect),
    Disconnect {
        data: u32,
    },
    Ping,
    SendReliable {
        data_length: u16,
    },
    SendUnreliable {
        unreliable_sequence_number: u16,
        data_length: u16,
    },
    SendFragment(SendFragment),
    SendUnsequenced {
        unsequenced_group: u16,
        data_length: u16,
    },
    BandwidthLimit {
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    ThrottleConfigure {
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
    },
    SendUnreliableFragment(SendFragment),
}

impl CommandBody {
    pub fn kind(&self) -> CommandType {
        match self {
            CommandBody::Acknowledge { .. } => CommandType::Acknowledge,
            CommandBody::Connect(_) => CommandType::Connect,
            CommandBody::VerifyConnect(_) => CommandType::VerifyConnect,
            CommandBody::Disconnect { .. } => CommandType::Disconnect,
            CommandBody::Ping => CommandType::Ping,
            CommandBody::SendReliable { .. } => CommandType::SendReliable,
            CommandBody::SendUnreliable { .. } => CommandType::SendUnreliable,
            CommandBody::SendFragment(_) => CommandType::SendFragment,
            CommandBody::SendUnsequenced { .. } => CommandType::SendUnsequenced,
            CommandBody::BandwidthLimit { .. } => CommandType::BandwidthLimit,
            CommandBody::ThrottleConfigure { .. } => CommandType::ThrottleConfigure,
            CommandBody::SendUnreliableFragment(_) => CommandType::SendUnreliableFragment,
        }
    }

    /// Number of payload bytes that follow the fixed body.
    pub fn data_length(&self) -> usize {
        match *self {
            CommandBody::SendReliable { data_length }
            | CommandBody::SendUnreliable { data_length, .. }
            | CommandBody::SendUnsequenced { data_length, .. } => data_length as usize,
            CommandBody::SendFragment(f) | CommandBody::SendUnreliableFragment(f) => {
                f.data_length as usize
            }
            _ => 0,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        match *self {
            CommandBody::Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => {
                buf.put_u16(received_reliable_sequence_number);
                buf.put_u16(received_sent_time);
            }
            CommandBody::Connect(c) => {
                buf.put_u16(c.outgoing_peer_id);
                buf.put_u8(c.incoming_session_id);
                buf.put_u8(c.outgoing_session_id);
                buf.put_u32(c.mtu);
                buf.put_u32(c.window_size);
                buf.put_u32(c.channel_count);
                buf.put_u32(c.incoming_bandwidth);
                buf.put_u32(c.outgoing_bandwidth);
                buf.put_u32(c.packet_throttle_interval);
                buf.put_u32(c.packet_throttle_acceleration);
                buf.put_u32(c.packet_throttle_deceleration);
                buf.put_u32(c.connect_id);
                buf.put_u32(c.data);
            }
            CommandBody::VerifyConnect(v) => {
                buf.put_u16(v.outgoing_peer_id);
                buf.put_u8(v.incoming_session_id);
                buf.put_u8(v.outgoing_session_id);
                buf.put_u32(v.mtu);
                buf.put_u32(v.window_size);
                buf.put_u32(v.channel_count);
                buf.put_u32(v.incoming_bandwidth);
                buf.put_u32(v.outgoing_bandwidth);
                buf.put_u32(v.packet_throttle_interval);
                buf.put_u32(v.packet_throttle_acceleration);
                buf.put_u32(v.packet_throttle_deceleration);
                buf.put_u32(v.connect_id);
            }
            CommandBody::Disconnect { data } => buf.put_u32(data),
            CommandBody::Ping => {}
            CommandBody::SendReliable { data_length } => buf.put_u16(data_length),
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                data_length,
            } => {
                buf.put_u16(unreliable_sequence_number);
                buf.put_u16(data_length);
            }
            CommandBody::SendUnsequenced {
                unsequenced_group,
                data_length,
            } => {
                buf.put_u16(unsequenced_group);
                buf.put_u16(data_length);
            }
            CommandBody::SendFragment(f) | CommandBody::SendUnreliableFragment(f) => {
                buf.put_u16(f.start_sequence_number);
                buf.put_u16(f.data_length);
                buf.put_u32(f.fragment_count);
                buf.put_u32(f.fragment_number);
                buf.put_u32(f.total_length);
                buf.put_u32(f.fragment_offset);
            }
            CommandBody::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                buf.put_u32(incoming_bandwidth);
                buf.put_u32(outgoing_bandwidth);
            }
            CommandBody::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                buf.put_u32(packet_throttle_interval);
                buf.put_u32(packet_throttle_acceleration);
                buf.put_u32(packet_throttle_deceleration);
            }
        }
    }

    /// Decode the fixed body of `kind`. The caller has checked that
    /// `kind.size() - COMMAND_HEADER_SIZE` bytes remain.
    fn decode(kind: CommandType, buf: &mut impl Buf) -> Self {
        match kind {
            CommandType::Acknowledge => CommandBody::Acknowledge {
                received_reliable_sequence_number: buf.get_u16(),
                received_sent_time: buf.get_u16(),
            },
            CommandType::Connect => CommandBody::Connect(Connect {
                outgoing_peer_id: buf.get_u16(),
                incoming_session_id: buf.get_u8(),
                outgoing_session_id: buf.get_u8(),
                mtu: buf.get_u32(),
                window_size: buf.get_u32(),
                channel_count: buf.get_u32(),
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
                packet_throttle_interval: buf.get_u32(),
                packet_throttle_acceleration: buf.get_u32(),
                packet_throttle_deceleration: buf.get_u32(),
                connect_id: buf.get_u32(),
                data: buf.get_u32(),
            }),
            CommandType::VerifyConnect => CommandBody::VerifyConnect(VerifyConnect {
                outgoing_peer_id: buf.get_u16(),
                incoming_session_id: buf.get_u8(),
                outgoing_session_id: buf.get_u8(),
                mtu: buf.get_u32(),
                window_size: buf.get_u32(),
                channel_count: buf.get_u32(),
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
                packet_throttle_interval: buf.get_u32(),
                packet_throttle_acceleration: buf.get_u32(),
                packet_throttle_deceleration: buf.get_u32(),
                connect_id: buf.get_u32(),
            }),
            CommandType::Disconnect => CommandBody::Disconnect {
                data: buf.get_u32(),
            },
            CommandType::Ping => CommandBody::Ping,
            CommandType::SendReliable => CommandBody::SendReliable {
                data_length: buf.get_u16(),
            },
            CommandType::SendUnreliable => CommandBody::SendUnreliable {
                unreliable_sequence_number: buf.get_u16(),
                data_length: buf.get_u16(),
            },
            CommandType::SendUnsequenced => CommandBody::SendUnsequenced {
                unsequenced_group: buf.get_u16(),
                data_length: buf.get_u16(),
            },
            CommandType::SendFragment => CommandBody::SendFragment(decode_fragment(buf)),
            CommandType::SendUnreliableFragment => {
                CommandBody::SendUnreliableFragment(decode_fragment(buf))
            }
            CommandType::BandwidthLimit => CommandBody::BandwidthLimit {
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
            },
            CommandType::ThrottleConfigure => CommandBody::ThrottleConfigure {
                packet_throttle_interval: buf.get_u32(),
                packet_throttle_acceleration: buf.get_u32(),
                packet_throttle_deceleration: buf.get_u32(),
            },
        }
    }
}

fn decode_fragment(buf: &mut impl Buf) -> SendFragment {
    SendFragment {
        start_sequence_number: buf.get_u16(),
        data_length: buf.get_u16(),
        fragment_count: buf.get_u32(),
        fragment_number: buf.get_u32(),
        total_length: buf.get_u32(),
        fragment_offset: buf.get_u32(),
    }
}

// ─── Command ────────────────────────────────────────────────────────────────

/// One protocol command: header plus typed body. Payload bytes travel
/// alongside, never inside, this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub header: CommandHeader,
    pub body: CommandBody,
}

impl Command {
    pub fn new(header: CommandHeader, body: CommandBody) -> Self {
        Command { header, body }
    }

    #[inline]
    pub fn kind(&self) -> CommandType {
        self.body.kind()
    }

    /// Encoded size without payload.
    #[inline]
    pub fn size(&self) -> usize {
        self.kind().size()
    }

    /// Serialize header and body. The caller appends any payload.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind() as u8 | self.header.flags);
        buf.put_u8(self.header.channel_id);
        buf.put_u16(self.header.reliable_sequence_number);
        self.body.encode(buf);
    }

    /// Decode one command and split off its payload.
    ///
    /// Returns `None` if the buffer is truncated, the type is unknown, or
    /// reserved bits are set.
    pub fn decode(buf: &mut Bytes) -> Option<(Command, Bytes)> {
        if buf.remaining() < COMMAND_HEADER_SIZE {
            return None;
        }
        let raw = buf.chunk()[0];
        if raw & COMMAND_RESERVED_BITS != 0 {
            return None;
        }
        let kind = CommandType::from_byte(raw & COMMAND_MASK)?;
        if buf.remaining() < kind.size() {
            return None;
        }
        buf.advance(1);
        let header = CommandHeader {
            flags: raw & (COMMAND_FLAG_ACKNOWLEDGE | COMMAND_FLAG_UNSEQUENCED),
            channel_id: buf.get_u8(),
            reliable_sequence_number: buf.get_u16(),
        };
        let body = CommandBody::decode(kind, buf);
        let data_length = body.data_length();
        if buf.remaining() < data_length {
            return None;
        }
        let payload = buf.split_to(data_length);
        Some((Command { header, body }, payload))
    }
}

/// Decode every command in a datagram body.
///
/// The whole datagram is rejected if any command is malformed or more than
/// [`MAXIMUM_PACKET_COMMANDS`] are present.
pub fn decode_commands(mut buf: Bytes) -> Option<Vec<(Command, Bytes)>> {
    let mut commands = Vec::new();
    while buf.has_remaining() {
        if commands.len() == MAXIMUM_PACKET_COMMANDS {
            return None;
        }
        commands.push(Command::decode(&mut buf)?);
    }
    Some(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode_with_payload(cmd: &Command, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        buf.put_slice(payload);
        buf
    }

    // ─── Header Tests ───────────────────────────────────────────────────

    #[test]
    fn header_without_sent_time() {
        let header = ProtocolHeader {
            peer_id: 0x123,
            session_id: 2,
            compressed: false,
            encrypted: false,
            sent_time: None,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), MIN_HEADER_SIZE);
        assert_eq!(&buf[..], &[0x21, 0x23, 0x00]);

        let decoded = ProtocolHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_carries_high_peer_id_bits_and_flags() {
        let header = ProtocolHeader {
            peer_id: 0xABCD,
            session_id: 3,
            compressed: true,
            encrypted: true,
            sent_time: Some(0xBEEF),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), MAX_HEADER_SIZE);
        let decoded = ProtocolHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn no_peer_id_survives_encoding() {
        let header = ProtocolHeader {
            peer_id: MAXIMUM_PEER_ID,
            session_id: 0,
            compressed: false,
            encrypted: false,
            sent_time: Some(7),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let decoded = ProtocolHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.peer_id, MAXIMUM_PEER_ID);
    }

    #[test]
    fn header_rejects_reserved_bits_and_truncation() {
        assert!(ProtocolHeader::decode(&mut &[0x00, 0x01][..]).is_none());
        assert!(ProtocolHeader::decode(&mut &[0x00, 0x01, 0x80][..]).is_none());
        // Sent-time flag set but no sent time.
        assert!(ProtocolHeader::decode(&mut &[0x80, 0x01, 0x00, 0x01][..]).is_none());
    }

    // ─── Command Tests ──────────────────────────────────────────────────

    #[test]
    fn sizes_match_encoding() {
        let commands = [
            CommandBody::Acknowledge {
                received_reliable_sequence_number: 1,
                received_sent_time: 2,
            },
            CommandBody::Connect(Connect {
                outgoing_peer_id: 1,
                incoming_session_id: 0xFF,
                outgoing_session_id: 0xFF,
                mtu: 1392,
                window_size: 65536,
                channel_count: 2,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 0,
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
                connect_id: 0xDEAD_BEEF,
                data: 42,
            }),
            CommandBody::Disconnect { data: 9 },
            CommandBody::Ping,
            CommandBody::BandwidthLimit {
                incoming_bandwidth: 1,
                outgoing_bandwidth: 2,
            },
            CommandBody::ThrottleConfigure {
                packet_throttle_interval: 1,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 3,
            },
        ];
        for body in commands {
            let cmd = Command::new(CommandHeader::new(CONTROL_CHANNEL).acknowledged(), body);
            let mut buf = BytesMut::new();
            cmd.encode(&mut buf);
            assert_eq!(buf.len(), cmd.size(), "{:?}", cmd.kind());
        }
    }

    #[test]
    fn reliable_command_with_payload() {
        let mut header = CommandHeader::new(1).acknowledged();
        header.reliable_sequence_number = 513;
        let cmd = Command::new(header, CommandBody::SendReliable { data_length: 5 });
        let buf = encode_with_payload(&cmd, b"hello");

        let mut bytes = buf.freeze();
        let (decoded, payload) = Command::decode(&mut bytes).unwrap();
        assert_eq!(decoded, cmd);
        assert!(decoded.header.needs_ack());
        assert_eq!(payload, &b"hello"[..]);
        assert!(bytes.is_empty());
    }

    #[test]
    fn fragment_fields_survive() {
        let frag = SendFragment {
            start_sequence_number: 77,
            data_length: 3,
            fragment_count: 10,
            fragment_number: 9,
            total_length: 5000,
            fragment_offset: 4923,
        };
        let cmd = Command::new(
            CommandHeader::new(0).acknowledged(),
            CommandBody::SendFragment(frag),
        );
        let buf = encode_with_payload(&cmd, b"xyz");
        let (decoded, payload) = Command::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.body, CommandBody::SendFragment(frag));
        assert_eq!(payload.len(), 3);
    }

    #[test]
    fn truncated_payload_rejected() {
        let cmd = Command::new(
            CommandHeader::new(0),
            CommandBody::SendUnreliable {
                unreliable_sequence_number: 1,
                data_length: 10,
            },
        );
        let buf = encode_with_payload(&cmd, b"short");
        assert!(Command::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn unknown_type_rejected() {
        for raw in [0u8, 13, 15] {
            let mut bytes = Bytes::from(vec![raw, 0, 0, 0, 0, 0, 0, 0]);
            assert!(Command::decode(&mut bytes).is_none(), "type {raw}");
        }
    }

    #[test]
    fn reserved_command_bits_rejected() {
        let mut bytes = Bytes::from(vec![CommandType::Ping as u8 | 0x10, 0xFF, 0, 1]);
        assert!(Command::decode(&mut bytes).is_none());
    }

    // ─── Datagram Tests ─────────────────────────────────────────────────

    #[test]
    fn datagram_with_mixed_commands() {
        let mut buf = BytesMut::new();
        Command::new(
            CommandHeader::new(0),
            CommandBody::Acknowledge {
                received_reliable_sequence_number: 4,
                received_sent_time: 100,
            },
        )
        .encode(&mut buf);
        buf.extend_from_slice(&encode_with_payload(
            &Command::new(
                CommandHeader::new(0).unsequenced(),
                CommandBody::SendUnsequenced {
                    unsequenced_group: 3,
                    data_length: 2,
                },
            ),
            b"ok",
        ));
        Command::new(CommandHeader::new(CONTROL_CHANNEL).acknowledged(), CommandBody::Ping)
            .encode(&mut buf);

        let commands = decode_commands(buf.freeze()).unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].0.kind(), CommandType::Acknowledge);
        assert_eq!(commands[1].1, &b"ok"[..]);
        assert!(commands[1].0.header.is_unsequenced());
        assert_eq!(commands[2].0.kind(), CommandType::Ping);
    }

    #[test]
    fn datagram_command_cap() {
        let mut buf = BytesMut::new();
        for _ in 0..MAXIMUM_PACKET_COMMANDS {
            Command::new(CommandHeader::new(CONTROL_CHANNEL), CommandBody::Ping).encode(&mut buf);
        }
        assert_eq!(decode_commands(buf.clone().freeze()).unwrap().len(), 32);

        Command::new(CommandHeader::new(CONTROL_CHANNEL), CommandBody::Ping).encode(&mut buf);
        assert!(decode_commands(buf.freeze()).is_none());
    }

    #[test]
    fn trailing_garbage_rejects_whole_datagram() {
        let mut buf = BytesMut::new();
        Command::new(CommandHeader::new(CONTROL_CHANNEL), CommandBody::Ping).encode(&mut buf);
        buf.put_u8(CommandType::Disconnect as u8);
        assert!(decode_commands(buf.freeze()).is_none());
    }
}
