// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Packet Cache Module — the per-channel ordered jitter buffer, `spec.md` §4.6.
//!
//! Grounded on `vqec_dp_rtp_input_stream.c`'s PCM client calls and
//! `vqec_dpchan.c`'s channel-level PCM wiring. The ordered set is a
//! `BTreeMap<u32, PakRef>` keyed by extended sequence — the map's own key
//! uniqueness gives invariant I1 ("no two packets with identical extended
//! sequence coexist") for free, so there's no separate dedup set to keep in
//! sync.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::extseq::ExtSeq;
use crate::pak::{PakPool, PakRef};
use crate::stats::{DropReason, GapEvent, GapLog};
use crate::time::Time;

/// Outcome of a single packet's admission into the PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmAdmit {
    Accepted,
    Late,
    Duplicate,
    PostAbortRejected,
}

pub struct Pcm {
    /// Ordered set of live packets, keyed by extended sequence.
    entries: BTreeMap<u32, PakRef>,
    /// Lowest undispensed sequence; `None` until the first packet is
    /// inserted (the head is then pinned to that packet's sequence), and
    /// `None` again once the map fully drains.
    head: Option<ExtSeq>,
    /// Highest sequence ever dispensed by [`Pcm::dequeue`]. Unlike `head`,
    /// this never resets to `None` once set — it's the low-water mark
    /// `classify` falls back on once a full drain empties `head`, so a
    /// post-drain straggler is still rejected as late instead of being
    /// treated as a fresh insert (`spec.md` §4.6 invariants I2/I3).
    last_dispensed: Option<ExtSeq>,
    highest_received: Option<ExtSeq>,
    last_rx_seq: Option<ExtSeq>,
    reorder_deadline: Duration,
    jitter_delay: Duration,
    er_enabled: bool,
    post_abort_active: bool,
    /// `[overlap_start, overlap_end)` region rejected by the post-abort
    /// filter once active (`spec.md` §4.6: "rejects any repair packet whose
    /// sequence lies within the primary-overlap region").
    post_abort_overlap: Option<(u32, u32)>,
    pub gap_log: GapLog,
    pub drops: crate::stats::DropCounters,
}

impl Pcm {
    pub fn new(reorder_deadline: Duration, jitter_delay: Duration) -> Self {
        Pcm {
            entries: BTreeMap::new(),
            head: None,
            last_dispensed: None,
            highest_received: None,
            last_rx_seq: None,
            reorder_deadline,
            jitter_delay,
            er_enabled: false,
            post_abort_active: false,
            post_abort_overlap: None,
            gap_log: GapLog::new(64),
            drops: crate::stats::DropCounters::new(),
        }
    }

    pub fn head(&self) -> Option<ExtSeq> {
        self.head
    }

    pub fn highest_received(&self) -> Option<ExtSeq> {
        self.highest_received
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Signalled by the channel when ER is enabled (`spec.md` §4.6: "When ER
    /// is enabled ... late-but-within-reorder packets are acceptable only if
    /// state machine is post-ER-enable").
    pub fn set_er_enabled(&mut self, enabled: bool) {
        self.er_enabled = enabled;
    }

    pub fn er_enabled(&self) -> bool {
        self.er_enabled
    }

    /// Arms the RCC post-abort process filter over `[start, end)` extended
    /// sequence (the primary-overlap region).
    pub fn enable_post_abort_filter(&mut self, overlap: (u32, u32)) {
        self.post_abort_active = true;
        self.post_abort_overlap = Some(overlap);
    }

    pub fn disable_post_abort_filter(&mut self) {
        self.post_abort_active = false;
        self.post_abort_overlap = None;
    }

    /// Advances `last_rx_seq` monotonically (`spec.md` §4.6: "On insert,
    /// `last_rx_seq` is advanced monotonically (via nearest-RTP-seq
    /// mapping)") and tracks the overall high-water mark.
    fn advance_last_rx(&mut self, seq: ExtSeq) {
        self.last_rx_seq = Some(match self.last_rx_seq {
            None => seq,
            Some(prev) if seq > prev => seq,
            Some(prev) => prev,
        });
        self.highest_received = Some(match self.highest_received {
            None => seq,
            Some(h) => h.max(seq),
        });
    }

    pub fn last_rx_seq(&self) -> Option<ExtSeq> {
        self.last_rx_seq
    }

    /// One admission decision, without mutating the map — used by callers
    /// (repair input stream) that need to know the verdict before deciding
    /// whether to also bump other counters.
    pub fn classify(&self, seq: ExtSeq, is_repair: bool) -> PcmAdmit {
        if self.post_abort_active && is_repair {
            if let Some((start, end)) = self.post_abort_overlap {
                if seq.0 >= start && seq.0 < end {
                    return PcmAdmit::PostAbortRejected;
                }
            }
        }
        match self.head {
            Some(head) if seq < head => {
                // Late-but-within-reorder is only acceptable post-ER-enable;
                // the state machine gate for that lives in the channel /
                // caller, so PCM itself always treats sub-head as late.
                return PcmAdmit::Late;
            }
            None => {
                // Buffer is fully drained: nothing to compare against in
                // `entries`, so fall back on the low-water mark to still
                // reject a straggler behind the last packet dispensed.
                if let Some(last) = self.last_dispensed {
                    if seq <= last {
                        return PcmAdmit::Late;
                    }
                }
            }
            _ => {}
        }
        if self.entries.contains_key(&seq.0) {
            return PcmAdmit::Duplicate;
        }
        PcmAdmit::Accepted
    }

    /// Inserts one packet already classified as acceptable. Callers must
    /// have checked [`Pcm::classify`] first (or be replaying a batch that
    /// was pre-filtered, as in `insert_packets`).
    fn insert_one(&mut self, seq: ExtSeq, pak: PakRef) {
        if self.head.is_none() {
            self.head = Some(seq);
        }
        if let Some(highest) = self.highest_received {
            if seq.0 > highest.0.wrapping_add(1) {
                self.gap_log.push(GapEvent {
                    at: Time::ZERO,
                    from_seq: highest.0,
                    to_seq: seq.0,
                });
            }
        }
        self.entries.insert(seq.0, pak);
        self.advance_last_rx(seq);
    }

    /// `spec.md` §4.6: `insert_packets(paks, n, take_ref, session_stats) ->
    /// accepted_count`. `is_repair` selects whether the post-abort overlap
    /// filter applies (it never applies to primary/APP packets).
    pub fn insert_packets(
        &mut self,
        pool: &mut PakPool,
        paks: &[(ExtSeq, PakRef)],
        take_ref: bool,
        is_repair: bool,
    ) -> usize {
        let mut accepted = 0;
        for &(seq, pak) in paks {
            match self.classify(seq, is_repair) {
                PcmAdmit::Accepted => {
                    if take_ref {
                        pool.retain(pak);
                    }
                    self.insert_one(seq, pak);
                    accepted += 1;
                }
                PcmAdmit::Late => self.drops.bump(DropReason::Late),
                PcmAdmit::Duplicate => self.drops.bump(DropReason::Duplicate),
                PcmAdmit::PostAbortRejected => self.drops.bump(DropReason::PakSeq),
            }
        }
        accepted
    }

    /// Returns the packet ref at the current head without dispensing it.
    pub fn peek_head(&self) -> Option<(ExtSeq, PakRef)> {
        self.head
            .and_then(|h| self.entries.get(&h.0).map(|&r| (h, r)))
    }

    /// Dequeues the head packet unconditionally, advancing `head` to the
    /// next present sequence (not necessarily contiguous — a gap simply
    /// means the scheduler will wait on the next packet's reorder
    /// deadline). Invariant I3: dispensed strictly ascending.
    pub fn dequeue(&mut self) -> Option<(ExtSeq, PakRef)> {
        let head = self.head?;
        let pak = self.entries.remove(&head.0)?;
        self.last_dispensed = Some(head);
        self.head = self.entries.keys().next().copied().map(ExtSeq);
        Some((head, pak))
    }

    pub fn reorder_deadline(&self) -> Duration {
        self.reorder_deadline
    }

    pub fn jitter_delay(&self) -> Duration {
        self.jitter_delay
    }
}
