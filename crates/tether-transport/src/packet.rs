//! # Packets
//!
//! A [`Packet`] is an immutable, reference-counted application message. One
//! packet may sit in several outgoing queues at once (broadcast, fragments)
//! without being copied; the buffer and the optional free callback are
//! released when the last handle drops.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};

bitflags! {
    /// Delivery flags carried by a packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u32 {
        /// Must be acknowledged and retransmitted until it is.
        const RELIABLE = 1 << 0;
        /// Delivered without ordering; duplicates suppressed by group.
        const UNSEQUENCED = 1 << 1;
        /// The buffer is shared with the caller rather than copied.
        const NO_ALLOCATE = 1 << 2;
        /// Oversized unreliable packets are fragmented unreliably instead
        /// of being promoted to reliable fragments.
        const UNRELIABLE_FRAGMENT = 1 << 3;
        /// Set once the packet has been written to the socket.
        const SENT = 1 << 8;
    }
}

type Callback = Box<dyn Fn(&Bytes) + Send + Sync>;

struct PacketInner {
    data: Bytes,
    flags: PacketFlags,
    sent: AtomicBool,
    /// Reliable commands carrying this packet that are still unacknowledged.
    pending_acks: AtomicU32,
    user_data: Option<u64>,
    on_acknowledged: Option<Callback>,
    on_free: Option<Callback>,
}

impl Drop for PacketInner {
    fn drop(&mut self) {
        if let Some(on_free) = self.on_free.take() {
            on_free(&self.data);
        }
    }
}

/// Reference-counted application message.
#[derive(Clone)]
pub struct Packet {
    inner: Arc<PacketInner>,
}

impl Packet {
    /// Copy `data` into a new packet.
    pub fn new(data: &[u8], flags: PacketFlags) -> Self {
        Self::builder(Bytes::copy_from_slice(data))
            .flags(flags - PacketFlags::NO_ALLOCATE - PacketFlags::SENT)
            .build()
    }

    /// Wrap an existing buffer without copying it.
    pub fn from_bytes(data: Bytes, flags: PacketFlags) -> Self {
        Self::builder(data)
            .flags((flags | PacketFlags::NO_ALLOCATE) - PacketFlags::SENT)
            .build()
    }

    pub fn builder(data: impl Into<Bytes>) -> PacketBuilder {
        PacketBuilder {
            data: data.into(),
            flags: PacketFlags::empty(),
            user_data: None,
            on_acknowledged: None,
            on_free: None,
        }
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.inner.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    pub fn flags(&self) -> PacketFlags {
        let mut flags = self.inner.flags;
        if self.inner.sent.load(Ordering::Relaxed) {
            flags |= PacketFlags::SENT;
        }
        flags
    }

    #[inline]
    pub fn is_reliable(&self) -> bool {
        self.inner.flags.contains(PacketFlags::RELIABLE)
    }

    /// Local application value; never sent on the wire.
    pub fn user_data(&self) -> Option<u64> {
        self.inner.user_data
    }

    /// Number of live handles, including those held by outgoing queues.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Truncate or zero-extend the payload.
    ///
    /// Only possible while this is the sole handle; returns `false` when the
    /// packet is shared (for example while it waits in an outgoing queue).
    pub fn resize(&mut self, len: usize) -> bool {
        let Some(inner) = Arc::get_mut(&mut self.inner) else {
            return false;
        };
        if len <= inner.data.len() {
            inner.data.truncate(len);
        } else {
            let mut grown = BytesMut::with_capacity(len);
            grown.extend_from_slice(&inner.data);
            grown.resize(len, 0);
            inner.data = grown.freeze();
        }
        true
    }

    pub(crate) fn mark_sent(&self) {
        self.inner.sent.store(true, Ordering::Relaxed);
    }

    pub(crate) fn add_pending_ack(&self) {
        self.inner.pending_acks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the acknowledgement of one reliable command carrying this
    /// packet. The callback fires when the last one is acknowledged.
    pub(crate) fn acknowledge(&self) {
        let previous = self
            .inner
            .pending_acks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            if let Some(on_acknowledged) = &self.inner.on_acknowledged {
                on_acknowledged(&self.inner.data);
            }
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("flags", &self.flags())
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.inner.data == other.inner.data
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

pub struct PacketBuilder {
    data: Bytes,
    flags: PacketFlags,
    user_data: Option<u64>,
    on_acknowledged: Option<Callback>,
    on_free: Option<Callback>,
}

impl PacketBuilder {
    pub fn flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn reliable(mut self) -> Self {
        self.flags |= PacketFlags::RELIABLE;
        self
    }

    pub fn unsequenced(mut self) -> Self {
        self.flags |= PacketFlags::UNSEQUENCED;
        self
    }

    pub fn unreliable_fragment(mut self) -> Self {
        self.flags |= PacketFlags::UNRELIABLE_FRAGMENT;
        self
    }

    pub fn user_data(mut self, data: u64) -> Self {
        self.user_data = Some(data);
        self
    }

    /// Called once every reliable command carrying the packet is acknowledged.
    pub fn on_acknowledged(mut self, f: impl Fn(&Bytes) + Send + Sync + 'static) -> Self {
        self.on_acknowledged = Some(Box::new(f));
        self
    }

    /// Called when the last handle to the packet is dropped.
    pub fn on_free(mut self, f: impl Fn(&Bytes) + Send + Sync + 'static) -> Self {
        self.on_free = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Packet {
        Packet {
            inner: Arc::new(PacketInner {
                data: self.data,
                flags: self.flags - PacketFlags::SENT,
                sent: AtomicBool::new(false),
                pending_acks: AtomicU32::new(0),
                user_data: self.user_data,
                on_acknowledged: self.on_acknowledged,
                on_free: self.on_free,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn new_copies_and_from_bytes_shares() {
        let copied = Packet::new(b"abc", PacketFlags::RELIABLE);
        assert!(copied.is_reliable());
        assert!(!copied.flags().contains(PacketFlags::NO_ALLOCATE));

        let shared = Packet::from_bytes(Bytes::from_static(b"xyz"), PacketFlags::empty());
        assert!(shared.flags().contains(PacketFlags::NO_ALLOCATE));
        assert_eq!(shared.data(), &Bytes::from_static(b"xyz"));
    }

    #[test]
    fn user_data_stays_local() {
        let tagged = Packet::builder(vec![1u8]).reliable().user_data(42).build();
        assert_eq!(tagged.user_data(), Some(42));
        assert_eq!(tagged.clone().user_data(), Some(42));
        assert_eq!(Packet::new(b"x", PacketFlags::empty()).user_data(), None);
    }

    #[test]
    fn sent_flag_observable() {
        let packet = Packet::new(b"abc", PacketFlags::empty());
        assert!(!packet.flags().contains(PacketFlags::SENT));
        let queued = packet.clone();
        queued.mark_sent();
        assert!(packet.flags().contains(PacketFlags::SENT));
    }

    #[test]
    fn free_callback_runs_on_last_drop() {
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = freed.clone();
        let packet = Packet::builder(vec![1u8, 2, 3])
            .on_free(move |data| {
                assert_eq!(data.len(), 3);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let clone = packet.clone();
        drop(packet);
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ack_callback_waits_for_every_command() {
        let acked = Arc::new(AtomicUsize::new(0));
        let counter = acked.clone();
        let packet = Packet::builder(vec![0u8; 10])
            .reliable()
            .on_acknowledged(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        packet.add_pending_ack();
        packet.add_pending_ack();
        packet.acknowledge();
        assert_eq!(acked.load(Ordering::SeqCst), 0);
        packet.acknowledge();
        assert_eq!(acked.load(Ordering::SeqCst), 1);
        // A stray extra acknowledgement does not fire again.
        packet.acknowledge();
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resize_only_when_unique() {
        let mut packet = Packet::new(b"hello", PacketFlags::empty());
        assert!(packet.resize(2));
        assert_eq!(&packet.data()[..], b"he");
        assert!(packet.resize(4));
        assert_eq!(&packet.data()[..], b"he\0\0");

        let held = packet.clone();
        assert!(!packet.resize(1));
        drop(held);
        assert!(packet.resize(1));
    }
}
