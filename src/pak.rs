// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Packet representation and pool, per `spec.md` §3 ("Packet (`Pak`)") and
//! the re-architecture guidance in §9: "model as an owning pool of packet
//! slots (arena) + explicit counts", not `Rc`/`Arc`-refcounted pointers.
//!
//! Each live packet lives in one [`PakPool`] slot. Callers hold a [`PakRef`]
//! (index + generation, Copy, no destructor) and borrow the pool to read or
//! mutate the packet's buffer. Reference counting is explicit
//! (`PakPool::retain`/`release`), matching the C source's manual
//! `vqec_pak_ref`/`vqec_pak_free` pairing — there is deliberately no `Drop`
//! impl that decrements a refcount implicitly, since a `PakRef` is a bare
//! handle, not an owning smart pointer.

use std::net::{IpAddr, Ipv4Addr};

use bytes::BytesMut;

use crate::extseq::ExtSeq;
use crate::time::Time;

/// One Ethernet-safe MTU; every pool buffer is allocated with at least this
/// capacity (`spec.md` §3: "capacity ≥ one MTU").
pub const MTU: usize = 1500;

/// A dataplane packet carries exactly 7 TS packets of 188 bytes (`spec.md`
/// §6 "Wire").
pub const NUM_TSPKTS_PER_DP_PAK: usize = 7;
pub const TS_PACKET_LEN: usize = 188;
pub const DP_PAK_PAYLOAD_LEN: usize = NUM_TSPKTS_PER_DP_PAK * TS_PACKET_LEN; // 1316

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PakKind {
    Primary,
    Repair,
    Fec,
    Udp,
    App,
}

/// Packet flag bits (`spec.md` §3: "flag bits (e.g., after-error-correction)").
///
/// Hand-rolled rather than pulling in the `bitflags` crate: the teacher
/// pack doesn't carry it, and two bits don't earn a new dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PakFlags(u8);

impl PakFlags {
    pub const AFTER_ERROR_CORRECTION: PakFlags = PakFlags(0b0000_0001);
    pub const FROM_HOLD_QUEUE: PakFlags = PakFlags(0b0000_0010);

    pub const fn empty() -> Self {
        PakFlags(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// The packet payload and metadata living in one pool slot.
pub struct PakData {
    buf: BytesMut,
    /// Start of logical content within `buf`.
    head_offset: usize,
    /// Length of logical content starting at `head_offset`.
    content_len: usize,
    pub rx_ts: Time,
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub ext_seq: Option<ExtSeq>,
    pub mpeg_payload_offset: usize,
    pub kind: PakKind,
    pub flags: PakFlags,
    refcount: u32,
}

impl PakData {
    fn new(capacity: usize, kind: PakKind) -> Self {
        let mut buf = BytesMut::with_capacity(capacity);
        buf.resize(capacity, 0);
        PakData {
            buf,
            head_offset: 0,
            content_len: 0,
            rx_ts: Time::ZERO,
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            ext_seq: None,
            mpeg_payload_offset: 0,
            kind,
            flags: PakFlags::empty(),
            refcount: 1,
        }
    }

    pub fn content_len(&self) -> usize {
        self.content_len
    }

    pub fn head(&self) -> &[u8] {
        &self.buf[self.head_offset..self.head_offset + self.content_len]
    }

    pub fn head_mut(&mut self) -> &mut [u8] {
        let end = self.head_offset + self.content_len;
        &mut self.buf[self.head_offset..end]
    }

    /// Overwrites the logical content with `data`, growing the backing
    /// buffer if needed. Resets the head offset to the front of the buffer.
    pub fn set_content(&mut self, data: &[u8]) {
        self.set_content_with_prefix_room(data, 0);
    }

    /// Like [`PakData::set_content`], but reserves `prefix` bytes of room
    /// before the head pointer so a later [`PakData::retreat_head`] can
    /// prepend a header in place without a relocating copy — used when
    /// chunking an APP buffer that will later host a synthetic RTP header
    /// (`spec.md` §4.9).
    pub fn set_content_with_prefix_room(&mut self, data: &[u8], prefix: usize) {
        let needed = prefix + data.len();
        if needed > self.buf.len() {
            self.buf.resize(needed, 0);
        }
        self.head_offset = prefix;
        self.content_len = data.len();
        self.buf[prefix..prefix + data.len()].copy_from_slice(data);
    }

    /// Advances the head pointer forward by `n` bytes, shrinking the
    /// logical content by `n` — used for the repair stream's OSN-strip
    /// (`spec.md` §4.4 step 9: "shift the RTP header forward by 2 bytes
    /// (overwriting the OSN), advance the head pointer").
    ///
    /// # Panics
    /// If `n > content_len`.
    pub fn advance_head(&mut self, n: usize) {
        assert!(n <= self.content_len, "advance past content end");
        self.head_offset += n;
        self.content_len -= n;
    }

    /// Moves the head pointer backward by `n` bytes, growing the logical
    /// content by `n` bytes of now-exposed prefix — used when constructing a
    /// synthetic RTP header over a TS-APP packet (`spec.md` §4.9: "shift
    /// payload right by 12 bytes").
    ///
    /// # Panics
    /// If there isn't `n` bytes of room before `head_offset`.
    pub fn retreat_head(&mut self, n: usize) {
        assert!(n <= self.head_offset, "no room to retreat head");
        self.head_offset -= n;
        self.content_len += n;
    }

    /// True if the buffer has at least `n` spare bytes before the head
    /// pointer, i.e. `retreat_head(n)` would succeed.
    pub fn room_before(&self, n: usize) -> bool {
        self.head_offset >= n
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }
}

/// A handle to a packet held in a [`PakPool`]. `Copy`, carries no
/// destructor: refcounting is explicit via [`PakPool::retain`]/[`PakPool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PakRef {
    index: u32,
    generation: u32,
}

struct Slot {
    data: Option<PakData>,
    generation: u32,
}

/// A fixed-capacity pool of packet slots. Pool exhaustion is a first-class
/// error (`spec.md` §5: "Pool exhaustion is a first-class error, not a
/// panic"), surfaced as `None` from [`PakPool::alloc`].
pub struct PakPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl PakPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in (0..capacity).rev() {
            slots.push(Slot {
                data: None,
                generation: 0,
            });
            free.push(i as u32);
        }
        PakPool { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Allocates a new packet with refcount 1. Returns `None` if the pool is
    /// exhausted.
    pub fn alloc(&mut self, capacity: usize, kind: PakKind) -> Option<PakRef> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.data = Some(PakData::new(capacity.max(MTU), kind));
        Some(PakRef {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, r: PakRef) -> &Slot {
        &self.slots[r.index as usize]
    }

    fn slot_mut(&mut self, r: PakRef) -> &mut Slot {
        &mut self.slots[r.index as usize]
    }

    pub fn get(&self, r: PakRef) -> Option<&PakData> {
        let slot = self.slot(r);
        if slot.generation != r.generation {
            return None;
        }
        slot.data.as_ref()
    }

    pub fn get_mut(&mut self, r: PakRef) -> Option<&mut PakData> {
        let slot = self.slot_mut(r);
        if slot.generation != r.generation {
            return None;
        }
        slot.data.as_mut()
    }

    /// Increments the refcount — call when a packet is shared into a second
    /// queue (hold queue, `app_paks`, failover queue).
    pub fn retain(&mut self, r: PakRef) {
        if let Some(data) = self.get_mut(r) {
            data.refcount += 1;
        }
    }

    /// Decrements the refcount, freeing the slot (and bumping its
    /// generation so stale `PakRef`s are detected) when it reaches zero.
    pub fn release(&mut self, r: PakRef) {
        let free_now = {
            let slot = self.slot_mut(r);
            if slot.generation != r.generation {
                return;
            }
            match slot.data.as_mut() {
                Some(data) => {
                    data.refcount = data.refcount.saturating_sub(1);
                    data.refcount == 0
                }
                None => false,
            }
        };
        if free_now {
            let slot = self.slot_mut(r);
            slot.data = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(r.index);
        }
    }

    /// True only while refcount == 1, i.e. mutation is exclusive (`spec.md`
    /// §3: "Exclusive mutation only while refcount = 1").
    pub fn is_exclusive(&self, r: PakRef) -> bool {
        self.get(r).map(|d| d.refcount == 1).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_exhaustion() {
        let mut pool = PakPool::new(2);
        let a = pool.alloc(MTU, PakKind::Primary).unwrap();
        let b = pool.alloc(MTU, PakKind::Primary).unwrap();
        assert!(pool.alloc(MTU, PakKind::Primary).is_none());
        pool.release(a);
        assert!(pool.alloc(MTU, PakKind::Primary).is_some());
        pool.release(b);
    }

    #[test]
    fn refcount_lifecycle() {
        let mut pool = PakPool::new(1);
        let r = pool.alloc(MTU, PakKind::Repair).unwrap();
        assert!(pool.is_exclusive(r));
        pool.retain(r);
        assert!(!pool.is_exclusive(r));
        pool.release(r);
        assert!(pool.get(r).is_some());
        pool.release(r);
        assert!(pool.get(r).is_none());
    }

    #[test]
    fn stale_ref_after_free_and_realloc() {
        let mut pool = PakPool::new(1);
        let r1 = pool.alloc(MTU, PakKind::Primary).unwrap();
        pool.release(r1);
        let r2 = pool.alloc(MTU, PakKind::Primary).unwrap();
        assert_ne!(r1, r2);
        assert!(pool.get(r1).is_none());
        assert!(pool.get(r2).is_some());
    }

    #[test]
    fn advance_and_retreat_head() {
        let mut pool = PakPool::new(1);
        let r = pool.alloc(MTU, PakKind::Repair).unwrap();
        let data = pool.get_mut(r).unwrap();
        data.set_content(&[1, 2, 3, 4, 5]);
        data.advance_head(2);
        assert_eq!(data.head(), &[3, 4, 5]);
        data.retreat_head(2);
        assert_eq!(data.head(), &[1, 2, 3, 4, 5]);
    }
}
