// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Counters and histograms shared across the core.
//!
//! Per-packet failures are "counted and the packet is freed; no upward
//! propagation" (`spec.md` §7). This module is where they're counted.

use std::collections::HashMap;

use crate::time::Time;

/// Why a packet was dropped, used for per-stream drop-reason counters
/// (`spec.md` §3: "drops by reason").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Matched a configured drop-simulation rule (§4.3 step 1, §4.4 step 7).
    SimDrop,
    /// RTP header failed to parse or was too short (§4.2, §4.4 step 2).
    RtpParse,
    /// Sequence number below PCM's head (§4.6 invariant II2).
    Late,
    /// Duplicate extended sequence already present in PCM (§4.6).
    Duplicate,
    /// Encapsulation could not be determined (§4.3 step 3, "Unknown").
    SyncDrop,
    /// The RCC state machine rejected this packet (§4.4 step 6/8, §4.5 step 3).
    StateMachine,
    /// PCM rejected insertion for a reason besides late/duplicate (e.g. the
    /// RCC post-abort filter, §4.6).
    PakSeq,
    /// FEC engine rejected insertion (§4.5 step 4).
    FecEngine,
}

/// A fixed set of per-reason drop counters.
#[derive(Debug, Default, Clone)]
pub struct DropCounters {
    counts: HashMap<DropReason, u64>,
}

impl DropCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&mut self, reason: DropReason) {
        *self.counts.entry(reason).or_insert(0) += 1;
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        *self.counts.get(&reason).unwrap_or(&0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

/// A simple fixed-bucket-range histogram (`spec.md` §6: "histogram bucket
/// ranges" as a module-init knob), used for the join-delay histogram
/// referenced in §4.3 ("bumps the join-delay histogram").
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Ascending bucket upper-bounds in nanoseconds; the last bucket is
    /// implicitly `[bounds.last(), +inf)`.
    bounds_ns: Vec<u64>,
    counts: Vec<u64>,
}

impl Histogram {
    pub fn new(bounds_ns: Vec<u64>) -> Self {
        let n = bounds_ns.len() + 1;
        Histogram {
            bounds_ns,
            counts: vec![0; n],
        }
    }

    pub fn observe_nanos(&mut self, value_ns: u64) {
        let bucket = self
            .bounds_ns
            .iter()
            .position(|&b| value_ns < b)
            .unwrap_or(self.bounds_ns.len());
        self.counts[bucket] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn clear(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }
}

/// Cumulative vs. incremental RTP session-scope counters (`spec.md` §4.2:
/// "Session-scope counters are snapshotted on demand for cumulative vs.
/// incremental reads"; §12.1 supplement for `get_rtp_stats`/`clear_rtp_stats`).
#[derive(Debug, Default, Clone, Copy)]
pub struct RtpSessionStats {
    pub input_count: u64,
    pub late: u64,
    pub duplicate: u64,
    pub parse_drops: u64,
}

impl RtpSessionStats {
    /// Returns the delta from `baseline` to `self` (incremental read), and
    /// does not mutate either side. `clear_rtp_stats` callers should instead
    /// replace the live counters with a fresh `RtpSessionStats::default()`
    /// after taking the cumulative snapshot.
    pub fn since(&self, baseline: &RtpSessionStats) -> RtpSessionStats {
        RtpSessionStats {
            input_count: self.input_count.saturating_sub(baseline.input_count),
            late: self.late.saturating_sub(baseline.late),
            duplicate: self.duplicate.saturating_sub(baseline.duplicate),
            parse_drops: self.parse_drops.saturating_sub(baseline.parse_drops),
        }
    }
}

/// A single gap-log entry (§12.2 supplement backing `get_gap_report`).
#[derive(Debug, Clone, Copy)]
pub struct GapEvent {
    pub at: Time,
    pub from_seq: u32,
    pub to_seq: u32,
}

/// Bounded ring of recent sequence gaps observed by the PCM.
#[derive(Debug, Clone)]
pub struct GapLog {
    entries: Vec<GapEvent>,
    capacity: usize,
    next: usize,
    len: usize,
}

impl GapLog {
    pub fn new(capacity: usize) -> Self {
        GapLog {
            entries: Vec::with_capacity(capacity),
            capacity,
            next: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, event: GapEvent) {
        if self.entries.len() < self.capacity {
            self.entries.push(event);
        } else {
            self.entries[self.next] = event;
        }
        self.next = (self.next + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
    }

    pub fn iter(&self) -> impl Iterator<Item = &GapEvent> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
