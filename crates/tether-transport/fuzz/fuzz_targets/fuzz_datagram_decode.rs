#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tether_transport::wire::{decode_commands, ProtocolHeader};

/// Fuzz the datagram decoder: protocol header followed by commands.
///
/// Decoding must never panic, and any accepted command list must account
/// for every byte after the header.
fuzz_target!(|data: &[u8]| {
    let mut buf = Bytes::copy_from_slice(data);
    if ProtocolHeader::decode(&mut buf).is_none() {
        return;
    }
    let body_len = buf.len();
    if let Some(commands) = decode_commands(buf) {
        let consumed: usize = commands
            .iter()
            .map(|(command, payload)| command.size() + payload.len())
            .sum();
        assert_eq!(consumed, body_len);
    }
});
