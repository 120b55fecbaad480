//! # Datagram Codecs
//!
//! Optional per-host transforms applied to whole datagrams:
//!
//! - **Checksum**: a 32-bit digest over the header and plaintext commands,
//!   seeded with the peer's connect id. [`crc32`] is the stock choice.
//! - **Compression**: [`Compressor`] over the command bytes; the compressed
//!   form is kept only when it is strictly smaller.
//! - **Encryption**: [`Encryptor`] over everything after the protocol
//!   header. [`AesGcmEncryptor`] is provided.
//! - **Intercept**: a raw-datagram hook that runs before any parsing.
//!
//! Send order is checksum, compress, encrypt; receive reverses it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{Aead, KeyInit, Nonce};
use aes_gcm::{Aes256Gcm, Key};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::peer::PeerId;

// ─── Checksum ───────────────────────────────────────────────────────────────

/// Checksum over a list of buffers, hashed in order as one stream.
pub type ChecksumFn = fn(&[&[u8]]) -> u32;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Reflected CRC-32 (polynomial 0xEDB88320), the checksum used by zlib.
pub fn crc32(buffers: &[&[u8]]) -> u32 {
    let mut digest = CRC32.digest();
    for buffer in buffers {
        digest.update(buffer);
    }
    digest.finalize()
}

// ─── Compression ────────────────────────────────────────────────────────────

/// Datagram compressor. Returning `None` means "send uncompressed" on the
/// way out and "drop the datagram" on the way in.
pub trait Compressor: Send {
    /// Compress `input` into at most `limit` bytes.
    fn compress(&mut self, input: &[u8], limit: usize) -> Option<Vec<u8>>;

    /// Decompress `input`; the output must not exceed `limit` bytes.
    fn decompress(&mut self, input: &[u8], limit: usize) -> Option<Vec<u8>>;
}

// ─── Encryption ─────────────────────────────────────────────────────────────

/// Datagram encryptor. A `None` result drops the datagram.
pub trait Encryptor: Send {
    /// Bytes added to each datagram; subtracted from the fragment budget.
    fn overhead(&self) -> usize;

    fn encrypt(&mut self, peer: PeerId, plaintext: &[u8]) -> Option<Vec<u8>>;

    /// `peer` is `None` for datagrams not yet bound to a peer (CONNECT).
    fn decrypt(&mut self, peer: Option<PeerId>, ciphertext: &[u8]) -> Option<Vec<u8>>;
}

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM with a shared key. Each datagram carries its own 96-bit
/// nonce: a random per-host prefix followed by a counter.
pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_counter: AtomicU64,
}

impl AesGcmEncryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        AesGcmEncryptor {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce_fixed: rand::random::<u32>(),
            nonce_counter: AtomicU64::new(0),
        }
    }

    fn next_nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        let counter = self.nonce_counter.fetch_add(1, Ordering::AcqRel);
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}

impl Encryptor for AesGcmEncryptor {
    fn overhead(&self) -> usize {
        NONCE_LEN + TAG_LEN
    }

    fn encrypt(&mut self, _peer: PeerId, plaintext: &[u8]) -> Option<Vec<u8>> {
        let nonce = self.next_nonce();
        let sealed = self
            .cipher
            .encrypt(Nonce::<Aes256Gcm>::from_slice(&nonce), plaintext)
            .ok()?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Some(out)
    }

    fn decrypt(&mut self, _peer: Option<PeerId>, ciphertext: &[u8]) -> Option<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::<Aes256Gcm>::from_slice(nonce), sealed)
            .ok()
    }
}

// ─── Intercept ──────────────────────────────────────────────────────────────

/// Verdict of an intercept hook on a raw datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptAction {
    /// Continue with normal protocol processing.
    Pass,
    /// The hook handled the datagram; skip it.
    Consumed,
    /// Abort the service call with [`Error::Intercept`](crate::Error::Intercept).
    Error,
}

pub type Intercept = Box<dyn FnMut(&[u8], SocketAddr) -> InterceptAction + Send>;
