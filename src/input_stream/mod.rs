// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Input stream variants — Primary (§4.3), Repair (§4.4), FEC (§4.5).
//!
//! All three share the channel-facing callback contract in [`IsHost`]: the
//! gating decision the RCC state machine makes about each packet
//! (`pak_event`, §4.9), channel-level first-primary bookkeeping, STUN
//! ejection, and upcall emission. Modeled as a trait rather than a back
//! reference to [`crate::channel::Channel`], same rationale as
//! [`crate::sm::RccHooks`].
//!
//! PCM access is also mediated through `IsHost` rather than passed as a
//! separate `&mut Pcm` parameter alongside `host`: `Channel` owns both the
//! state machine and the PCM, and a second, independent `&mut Pcm` borrow
//! taken at the same call site as `&mut dyn IsHost` (itself backed by the
//! same `Channel`) would alias. Routing every PCM touch through a host
//! method keeps `receive_vec`/`receive_one` borrowing only `pool` and
//! `host`, which `Channel` can satisfy with disjoint fields.

pub mod fec;
pub mod primary;
pub mod repair;

use std::net::IpAddr;

use crate::extseq::ExtSeq;
use crate::irq::{Device, Reason};
use crate::pak::{PakKind, PakPool, PakRef};
use crate::pcm::PcmAdmit;
use crate::time::Time;

/// Per-packet RCC admission verdict (`spec.md` §4.9 `pak_event`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakAdmission {
    Accept,
    Drop,
    Queue,
}

/// Encapsulation state of the primary stream (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encap {
    Unknown,
    Udp,
    Rtp,
}

/// Channel-facing hooks needed by the input streams.
pub trait IsHost {
    /// `spec.md` §4.9 `pak_event`: RCC admission gate run before an IS
    /// inserts a packet into PCM. Takes `pool` because the `Init`-state
    /// `FirstRepair`/`FirstPrimary` transitions this may trigger can fail
    /// the channel's queued-APP-into-PCM insert, which needs it.
    fn pak_event(&mut self, pool: &mut PakPool, kind: PakKind, now: Time) -> PakAdmission;

    /// `spec.md` §4.3 "First-primary recording": stamps `first_primary_ts`
    /// etc., bumps the join-delay histogram, and posts `FirstPrimary` to the
    /// state machine if RCC is active and not yet finalised.
    fn note_first_primary(&mut self, rx_ts: Time, ext_seq: ExtSeq);

    /// Ejects a STUN-looking packet to the control-plane packet-eject
    /// channel (`spec.md` §4.3 step 2, §4.4 step 1, §6).
    fn eject_stun(&mut self, pool: &mut PakPool, pak: PakRef, src_addr: IpAddr, src_port: u16);

    /// Forwards a UDP-tagged packet directly to the output shim's connected
    /// input streams, bypassing PCM (`spec.md` §4.3 step 3 "UDP").
    fn forward_udp(&mut self, pool: &mut PakPool, pak: PakRef);

    /// Raises an upcall for `dev` (`spec.md` §4.9 `tx_upcall_ev`).
    fn tx_upcall(&mut self, dev: Device, reason: Reason);

    /// Constructs the synthetic RTP header over the channel's queued
    /// APP-derived TS packets using `first_repair_header` as a template, and
    /// inserts them into PCM (`spec.md` §4.4 step 4, §4.9
    /// `construct_rtp_hdr_over_ts_app`).
    fn construct_rtp_hdr_and_flush_app(&mut self, pool: &mut PakPool, first_repair_header: &[u8; 12]);

    /// Whether ER (error-repair / post-burst) has been enabled, needed to
    /// stamp the after-error-correction flag (`spec.md` §4.4 step 9).
    fn er_enabled(&self) -> bool;

    /// `session_rtp_seq_num_offset` recorded at `process_app` time,
    /// combined with a repair packet's OSN to compute its extended sequence
    /// (`spec.md` §4.4 step 9).
    fn session_rtp_seq_num_offset(&self) -> u32;

    /// Records a repair packet's arrival for the RCC activity timer
    /// (`spec.md` §4.8 "Activity timer handler").
    fn note_repair_activity(&mut self, now: Time);

    /// PCM's last-received extended sequence (`spec.md` §4.4 step 9), used
    /// to resolve a repair packet's rollover-ambiguous OSN.
    fn pcm_last_rx_seq(&self) -> Option<ExtSeq>;

    /// Inserts an already-ordered batch (primary RTP, or APP-derived) into
    /// PCM. Returns the accepted count.
    fn pcm_insert_batch(&mut self, pool: &mut PakPool, batch: &[(ExtSeq, PakRef)], is_repair: bool) -> usize;

    /// PCM's admission verdict for one re-homed repair packet, without
    /// mutating PCM (`spec.md` §4.4 step 10).
    fn pcm_classify_repair(&self, seq: ExtSeq) -> PcmAdmit;

    /// Inserts one already-classified-acceptable packet into PCM
    /// (`spec.md` §4.4 step 11). Returns whether it was accepted.
    fn pcm_insert_one(&mut self, pool: &mut PakPool, seq: ExtSeq, pak: PakRef, is_repair: bool) -> bool;
}
