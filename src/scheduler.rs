// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Output Scheduler — paced egress driven by network-locked-loop clock
//! recovery, `spec.md` §4.7.
//!
//! Grounded on `vqec_oscheduler.h`'s tick/NLL contract. Downstream delivery
//! (the "attached downstream input stream" in §4.7 step 3) is abstracted as
//! the [`Sink`] trait so the scheduler has no dependency on socket I/O,
//! which `spec.md` §1 places out of scope.

use crate::extseq::ExtSeq;
use crate::pak::{PakPool, PakRef};
use crate::time::Time;

/// A downstream consumer of emitted packets — the "attached input stream"
/// the scheduler pushes into. Implemented by the packet I/O plumbing that's
/// out of scope for this core (`spec.md` §1); tests use a `Vec`-backed fake.
pub trait Sink {
    fn emit(&mut self, pak: &crate::pak::PakData);
}

/// Tracks the source clock via per-packet receive timestamps and produces a
/// synchronous emission cadence (`spec.md` §4.7: "network-locked-loop").
#[derive(Debug, Clone, Copy, Default)]
pub struct Nll {
    first_rx: Option<Time>,
    first_emit: Option<Time>,
}

impl Nll {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Maps a packet's receive timestamp to its scheduled emission time,
    /// locking the output cadence to the first packet's arrival.
    pub fn scheduled_emission(&mut self, rx_ts: Time) -> Time {
        match (self.first_rx, self.first_emit) {
            (Some(rx0), Some(emit0)) => {
                let delta = rx_ts.saturating_since(rx0);
                emit0.saturating_add(delta)
            }
            _ => {
                self.first_rx = Some(rx_ts);
                self.first_emit = Some(rx_ts);
                rx_ts
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OutputLog {
    pub first_sent: Option<Time>,
    pub first_primary_sent: Option<Time>,
}

/// Reset-on-read post-ER XR statistics (`spec.md` §4.7).
#[derive(Debug, Default, Clone, Copy)]
pub struct XrStats {
    pub lost: u64,
    pub duplicate: u64,
    pub jitter_events: u64,
}

impl XrStats {
    pub fn take(&mut self) -> XrStats {
        std::mem::take(self)
    }
}

pub struct OutputScheduler {
    started: bool,
    nll: Nll,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub outp_log: OutputLog,
    pub xr: XrStats,
    fastfill_in_progress: bool,
    fastfill_target_bytes: u64,
    fastfill_sent_bytes: u64,
}

/// Result of one scheduler tick (`spec.md` §4.7 steps 1-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not started; no-op.
    Paused,
    /// No packet was due; caller should sleep until `Time`.
    SleepUntil(Time),
    /// A packet at `ExtSeq` was emitted.
    Emitted(ExtSeq),
    /// Fastfill completed with this tick's emission.
    EmittedFastfillDone(ExtSeq),
}

impl OutputScheduler {
    pub fn new() -> Self {
        OutputScheduler {
            started: false,
            nll: Nll::new(),
            bytes_sent: 0,
            packets_sent: 0,
            packets_dropped: 0,
            outp_log: OutputLog::default(),
            xr: XrStats::default(),
            fastfill_in_progress: false,
            fastfill_target_bytes: 0,
            fastfill_sent_bytes: 0,
        }
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn pause(&mut self) {
        self.started = false;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// `spec.md` §4.7: "Scheduler may be reset (NLL reset, pending packet
    /// freed) without destroying its configuration."
    pub fn reset(&mut self, pool: &mut PakPool, pending: Option<PakRef>) {
        self.nll.reset();
        if let Some(p) = pending {
            pool.release(p);
        }
    }

    pub fn begin_fastfill(&mut self, target_bytes: u64) {
        self.fastfill_in_progress = true;
        self.fastfill_target_bytes = target_bytes;
        self.fastfill_sent_bytes = 0;
    }

    pub fn fastfill_in_progress(&self) -> bool {
        self.fastfill_in_progress
    }

    /// One scheduler tick (`spec.md` §4.7). `is_primary` marks whether the
    /// emitted packet (if any) originated from the primary stream, for
    /// `first_primary_sent` bookkeeping.
    pub fn tick(
        &mut self,
        pool: &mut PakPool,
        pcm: &mut crate::pcm::Pcm,
        sink: &mut dyn Sink,
        now: Time,
        is_primary: impl Fn(ExtSeq) -> bool,
    ) -> TickOutcome {
        if !self.started {
            return TickOutcome::Paused;
        }
        let (seq, pak_ref) = match pcm.peek_head() {
            Some(p) => p,
            None => return TickOutcome::SleepUntil(now),
        };
        let rx_ts = pool.get(pak_ref).map(|d| d.rx_ts).unwrap_or(now);
        let scheduled = self.nll.scheduled_emission(rx_ts);
        if scheduled > now {
            return TickOutcome::SleepUntil(scheduled);
        }
        let (_, emitted_ref) = match pcm.dequeue() {
            Some(p) => p,
            None => return TickOutcome::SleepUntil(now),
        };
        let byte_len = if let Some(data) = pool.get(emitted_ref) {
            sink.emit(data);
            data.content_len() as u64
        } else {
            0
        };
        self.bytes_sent += byte_len;
        self.packets_sent += 1;
        if self.outp_log.first_sent.is_none() {
            self.outp_log.first_sent = Some(now);
        }
        if is_primary(seq) && self.outp_log.first_primary_sent.is_none() {
            self.outp_log.first_primary_sent = Some(now);
        }
        pool.release(emitted_ref);

        if self.fastfill_in_progress {
            self.fastfill_sent_bytes += byte_len;
            if self.fastfill_sent_bytes >= self.fastfill_target_bytes {
                self.fastfill_in_progress = false;
                return TickOutcome::EmittedFastfillDone(seq);
            }
        }
        TickOutcome::Emitted(seq)
    }
}

impl Default for OutputScheduler {
    fn default() -> Self {
        Self::new()
    }
}
