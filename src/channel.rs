// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Channel Coordinator, `spec.md` §4.9.
//!
//! Owns every per-channel sub-component (pool, input streams, FEC engine,
//! output scheduler, RCC state machine) and wires the trait-based "virtual
//! method" contracts ([`crate::sm::RccHooks`], [`crate::input_stream::IsHost`])
//! back onto itself, per the rationale in `sm.rs`/`input_stream/mod.rs`: no
//! component holds a strong reference back to `Channel`.
//!
//! Grounded on `vqec_dpchan.c`/`vqec_dpchan.h`.
//!
//! # Why `ChannelCore`, not `Channel`, implements `IsHost`
//!
//! `IsHost` is implemented by [`ChannelCore`], a `{sm, shared}` pair, rather
//! than by `Channel` itself. The input streams' `receive_*` methods borrow
//! `&mut dyn IsHost` alongside `&mut PakPool` at the same call site; if
//! `Channel` (which also owns `primary`/`repair`/`fec_is`/`scheduler`)
//! implemented the trait, the trait object would alias those sibling fields.
//! `ChannelCore` only holds the state machine and the fields state-machine
//! hooks and input-stream callbacks can touch without reaching into
//! `Channel`'s sibling components; [`SharedCore`] is `ChannelCore`'s private
//! half holding everything except the state machine proper.
//!
//! Some `RccHooks`/`IsHost` notifications (`success`, `abort`, `enable_er`)
//! need to act on those sibling components anyway (commit the FEC bind,
//! reset the repair stream). Since the hook call happens synchronously
//! inside `StateMachine::deliver_event`, deep inside `ChannelCore`, it cannot
//! reach `Channel::repair`/`fec_engine` directly — it instead records the
//! need in [`PendingEffects`], which `Channel` drains immediately after every
//! `sm` interaction point via [`Channel::apply_pending_effects`].
//!
//! `note_first_primary`/`construct_rtp_hdr_and_flush_app` are the two
//! `IsHost` methods that themselves need to deliver a state-machine event
//! (`FirstPrimary`/`FirstRepair`) but, being plain `&mut self` trait methods
//! on `ChannelCore`, have no access to a `&mut PakPool` of their own (only
//! `construct_rtp_hdr_and_flush_app` receives one as an argument). Both
//! build a throwaway [`HooksWithPool`] to satisfy `RccHooks`; the one
//! constructed by `note_first_primary` carries `pool: None`, which is safe
//! because the guard table never transitions a `FirstPrimary` delivery into
//! a state whose entry/action needs pool access (`insert_app_queue_into_pcm`,
//! `drop_queued_app_packets`) — both are exclusive to `FirstRepair`/`Abort`
//! handling, neither reachable from `FirstPrimary`.

use std::net::IpAddr;
use std::time::Duration;

use crate::app::{self, PsiCapture};
use crate::config::{RccParams, TlvParseConfig};
use crate::error::Result;
use crate::extseq::ExtSeq;
use crate::fec::FecEngine;
use crate::input_stream::fec::FecInputStream;
use crate::input_stream::primary::PrimaryInputStream;
use crate::input_stream::repair::RepairInputStream;
use crate::input_stream::{Encap, IsHost, PakAdmission};
use crate::irq::{Device, IrqDescriptor, Reason};
use crate::pak::{PakKind, PakPool, PakRef};
use crate::pcm::{Pcm, PcmAdmit};
use crate::rtp::RTP_FIXED_HEADER_LEN;
use crate::scheduler::{OutputScheduler, Sink, TickOutcome};
use crate::sm::{RccEvent, RccHooks, RccState, RccTiming, StateMachine, TimerKind};
use crate::stats::{GapEvent, Histogram, RtpSessionStats};
use crate::time::{Deadline, Time};

fn timer_index(t: TimerKind) -> usize {
    match t {
        TimerKind::WaitFirst => 0,
        TimerKind::Join => 1,
        TimerKind::EnableEr => 2,
        TimerKind::EndBurst => 3,
    }
}

fn device_index(d: Device) -> usize {
    match d {
        Device::Primary => 0,
        Device::Repair => 1,
        Device::DpChan => 2,
    }
}

/// Timer kind → the event it delivers on expiry (`spec.md` §4.8).
const TIMER_EVENTS: [(TimerKind, RccEvent); 4] = [
    (TimerKind::WaitFirst, RccEvent::TimeFirstSeq),
    (TimerKind::Join, RccEvent::TimeToJoin),
    (TimerKind::EnableEr, RccEvent::TimeToEnableEr),
    (TimerKind::EndBurst, RccEvent::TimeEndBurst),
];

/// `spec.md` §4.9 step 3: the memory-optimized fastfill formula, clamped to
/// `[0, max_fastfill]`. Falls back to the server-supplied value when the
/// memory-optimized preconditions (`max_fastfill`, `er_holdoff_time`,
/// `act_backfill_at_join` all > 0) don't hold.
fn compute_fastfill_time(rcc: &RccParams) -> Duration {
    let memory_optimized = rcc.memory_optimized
        && rcc.max_fastfill > Duration::ZERO
        && rcc.er_holdoff_time > Duration::ZERO
        && rcc.act_backfill_at_join > Duration::ZERO;
    if !memory_optimized {
        return rcc.fast_fill_time_server;
    }
    let base = rcc.act_min_backfill.saturating_sub(rcc.min_backfill);
    let extra_nanos = base.as_nanos() * rcc.dt_earliest_join.as_nanos() / rcc.act_backfill_at_join.as_nanos();
    let total = base.saturating_add(Duration::from_nanos(extra_nanos.min(u128::from(u64::MAX)) as u64));
    total.min(rcc.max_fastfill)
}

/// Deferred actions an `RccHooks`/`IsHost` notification determined were
/// needed but couldn't perform directly — they touch `Channel`'s sibling
/// fields (`repair`, `fec_engine`), unreachable from `ChannelCore`. Drained
/// by [`Channel::apply_pending_effects`] right after the `sm`/`host`
/// interaction that set them returns.
#[derive(Debug, Default, Clone, Copy)]
struct PendingEffects {
    reset_repair: bool,
    drain_repair_holdq: bool,
    commit_fec_bind: bool,
}

/// A point-in-time view of the PCM's ordering state, captured at each RCC
/// notification (`spec.md` §4.9: "snapshot PCM").
#[derive(Debug, Clone, Copy)]
pub struct ChannelSnapshot {
    pub at: Time,
    pub head: Option<ExtSeq>,
    pub highest_received: Option<ExtSeq>,
    pub len: usize,
}

/// TR-135 sampling controls (SPEC_FULL.md §12.3 supplement).
#[derive(Debug, Clone, Copy, Default)]
pub struct Tr135Params {
    pub sample_enable: bool,
    pub sample_interval: Duration,
}

/// A TR-135 periodic sample, computed from counters already required
/// elsewhere in the core — no new counters are invented for this (SPEC_FULL.md §12.3).
#[derive(Debug, Clone)]
pub struct Tr135Sample {
    pub at: Time,
    pub primary_input_count: u64,
    pub repair_input_count: u64,
    pub loss_events: u64,
    pub join_delay_hist: Vec<u64>,
}

/// Snapshot of channel-level state for `get_status` (§6).
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub state: RccState,
    pub fail_reason: Option<&'static str>,
    pub rcc_enabled: bool,
    pub rcc_in_abort: bool,
    pub er_enabled: bool,
    pub primary_bind_committed: bool,
    pub pcm_len: usize,
    pub pcm_head: Option<ExtSeq>,
    pub primary_encap: Encap,
    pub primary_inactive: bool,
}

/// Constructor-argument struct for [`Channel::new`] — a plain struct, not a
/// deserialized document, per `config.rs`'s convention (SPEC_FULL.md §10.3).
pub struct ChannelConfig {
    pub primary_passthrough: bool,
    pub reorder_time: Duration,
    pub jitter_delay: Duration,
    pub repair_enabled: bool,
    pub fec_enabled: bool,
    pub tlv: TlvParseConfig,
    pub histogram_bounds_ns: Vec<u64>,
    pub packet_pool_capacity: usize,
}

/// Everything an `RccHooks`/`IsHost` notification can touch without
/// reaching into `Channel`'s sibling components — see the module doc for why
/// this is split out from `Channel` proper.
struct SharedCore {
    pcm: Pcm,
    irqs: [IrqDescriptor; 3],
    app_paks: Vec<(ExtSeq, PakRef)>,
    psi: PsiCapture,
    tlv: TlvParseConfig,
    rcc: RccParams,
    rcc_enabled: bool,
    rcc_in_abort: bool,
    er_enabled: bool,
    primary_bind_committed: bool,
    timers: [Option<Deadline>; 4],
    activity_armed: bool,
    first_repair_ts: Option<Time>,
    first_primary_ts: Option<Time>,
    first_primary_seq: Option<ExtSeq>,
    join_issue_time: Option<Time>,
    join_delay_hist: Histogram,
    last_gen_num_sync: Time,
    prim_inactive_signalled: bool,
    fastfill_time: Duration,
    session_rtp_seq_num_offset: u32,
    udp_paks: u64,
    eject_paks: u64,
    last_snapshot: Option<ChannelSnapshot>,
    pending: PendingEffects,
    /// The current call's timestamp, stamped by every `Channel` method
    /// before delegating into an `IsHost` call that lacks its own `now`
    /// parameter (`construct_rtp_hdr_and_flush_app`, `eject_stun`, ...).
    now: Time,
    tr135_params: Tr135Params,
}

impl SharedCore {
    fn snapshot(&mut self, at: Time) {
        self.last_snapshot = Some(ChannelSnapshot {
            at,
            head: self.pcm.head(),
            highest_received: self.pcm.highest_received(),
            len: self.pcm.len(),
        });
    }
}

/// `{state machine, everything its hooks can reach}` — see module doc.
struct ChannelCore {
    sm: StateMachine,
    shared: SharedCore,
}

impl ChannelCore {
    fn timing(&self, now: Time) -> RccTiming {
        RccTiming {
            now,
            first_repair_deadline: Deadline::at_least_now(now, now, self.shared.rcc.first_repair_deadline),
            first_repair_ts: self.shared.first_repair_ts,
            dt_earliest_join: self.shared.rcc.dt_earliest_join,
            er_holdoff_time: self.shared.rcc.er_holdoff_time,
            dt_repair_end: self.shared.rcc.dt_repair_end,
        }
    }
}

impl IsHost for ChannelCore {
    /// `spec.md` §4.9 `pak_event`. A pure read of state: the actual
    /// first-primary/first-repair transitions are posted by
    /// `note_first_primary`/`construct_rtp_hdr_and_flush_app` from their own
    /// call sites, not from here.
    fn pak_event(&mut self, _pool: &mut PakPool, kind: PakKind, _now: Time) -> PakAdmission {
        if !self.shared.rcc_enabled {
            return PakAdmission::Accept;
        }
        match self.sm.state() {
            RccState::FinSuccess | RccState::Abort => PakAdmission::Accept,
            RccState::Init => {
                if kind == PakKind::Repair {
                    PakAdmission::Queue
                } else {
                    PakAdmission::Drop
                }
            }
            _ => PakAdmission::Accept,
        }
    }

    fn note_first_primary(&mut self, rx_ts: Time, ext_seq: ExtSeq) {
        if self.shared.first_primary_ts.is_some() {
            return;
        }
        self.shared.first_primary_ts = Some(rx_ts);
        self.shared.first_primary_seq = Some(ext_seq);
        let delay = rx_ts.saturating_since(self.shared.join_issue_time.unwrap_or(rx_ts));
        self.shared.join_delay_hist.observe_nanos(delay.as_nanos());
        if self.shared.rcc_enabled && !matches!(self.sm.state(), RccState::FinSuccess | RccState::Abort) {
            let timing = self.timing(rx_ts);
            let (sm, shared) = (&mut self.sm, &mut self.shared);
            sm.deliver_event(
                RccEvent::FirstPrimary,
                timing,
                &mut HooksWithPool { shared, pool: None, now: rx_ts },
            );
        }
    }

    fn eject_stun(&mut self, pool: &mut PakPool, pak: PakRef, _src_addr: IpAddr, _src_port: u16) {
        self.shared.eject_paks += 1;
        pool.release(pak);
    }

    fn forward_udp(&mut self, pool: &mut PakPool, pak: PakRef) {
        self.shared.udp_paks += 1;
        pool.release(pak);
    }

    fn tx_upcall(&mut self, dev: Device, reason: Reason) {
        self.shared.irqs[device_index(dev)].tx_upcall_ev(reason);
    }

    fn construct_rtp_hdr_and_flush_app(&mut self, pool: &mut PakPool, first_repair_header: &[u8; RTP_FIXED_HEADER_LEN]) {
        let now = self.shared.now;
        self.shared.first_repair_ts.get_or_insert(now);
        match app::construct_rtp_hdr_over_ts_app(pool, &self.shared.app_paks, first_repair_header) {
            Ok(()) => {
                let timing = self.timing(now);
                let (sm, shared) = (&mut self.sm, &mut self.shared);
                sm.deliver_event(RccEvent::FirstRepair, timing, &mut HooksWithPool { shared, pool: Some(pool), now });
            }
            Err(e) => {
                log::error!("RCC: synthetic RTP header construction over APP queue failed: {}", e);
                let timing = self.timing(now);
                let (sm, shared) = (&mut self.sm, &mut self.shared);
                sm.deliver_event(RccEvent::InternalError, timing, &mut HooksWithPool { shared, pool: Some(pool), now });
            }
        }
    }

    fn er_enabled(&self) -> bool {
        self.shared.er_enabled
    }

    fn session_rtp_seq_num_offset(&self) -> u32 {
        self.shared.session_rtp_seq_num_offset
    }

    fn note_repair_activity(&mut self, now: Time) {
        self.sm.note_repair_activity(now);
    }

    fn pcm_last_rx_seq(&self) -> Option<ExtSeq> {
        self.shared.pcm.last_rx_seq()
    }

    fn pcm_insert_batch(&mut self, pool: &mut PakPool, batch: &[(ExtSeq, PakRef)], is_repair: bool) -> usize {
        self.shared.pcm.insert_packets(pool, batch, false, is_repair)
    }

    fn pcm_classify_repair(&self, seq: ExtSeq) -> PcmAdmit {
        self.shared.pcm.classify(seq, true)
    }

    fn pcm_insert_one(&mut self, pool: &mut PakPool, seq: ExtSeq, pak: PakRef, is_repair: bool) -> bool {
        self.shared.pcm.insert_packets(pool, &[(seq, pak)], false, is_repair) == 1
    }
}

/// The sole `RccHooks` implementor, built fresh at every `deliver_event`/
/// `abort`/`check_activity` call site — see module doc for why `pool` is
/// optional.
struct HooksWithPool<'a> {
    shared: &'a mut SharedCore,
    pool: Option<&'a mut PakPool>,
    now: Time,
}

impl<'a> RccHooks for HooksWithPool<'a> {
    fn arm_timer(&mut self, timer: TimerKind, deadline: Deadline) {
        self.shared.timers[timer_index(timer)] = Some(deadline);
    }

    fn destroy_timer(&mut self, timer: TimerKind) {
        self.shared.timers[timer_index(timer)] = None;
    }

    fn arm_activity_timer(&mut self, _period: Duration, _timeout: Duration) {
        self.shared.activity_armed = true;
    }

    fn stop_activity_timer(&mut self) {
        self.shared.activity_armed = false;
    }

    fn insert_app_queue_into_pcm(&mut self) -> bool {
        let Some(pool) = self.pool.as_deref_mut() else { return false };
        let batch = std::mem::take(&mut self.shared.app_paks);
        let accepted = self.shared.pcm.insert_packets(pool, &batch, false, false);
        accepted == batch.len()
    }

    fn notify_join(&mut self) {
        self.shared.primary_bind_committed = true;
        self.shared.join_issue_time = Some(self.now);
        self.shared.snapshot(self.now);
    }

    fn notify_enable_er(&mut self) {
        self.shared.er_enabled = true;
        self.shared.pcm.set_er_enabled(true);
        self.shared.pending.drain_repair_holdq = true;
        self.shared.pending.reset_repair = true;
        self.shared.snapshot(self.now);
    }

    fn notify_success(&mut self) {
        self.shared.pending.commit_fec_bind = true;
        self.shared.pending.reset_repair = true;
        self.shared.irqs[device_index(Device::DpChan)].tx_upcall_ev(Reason::CHAN_BURST_DONE);
        self.shared.snapshot(self.now);
    }

    fn notify_abort(&mut self) {
        self.shared.rcc_in_abort = true;
        self.shared.fastfill_time = Duration::ZERO;
        let start = self.shared.rcc.start_seq_num;
        let end = self
            .shared
            .pcm
            .highest_received()
            .map(|h| h.0.wrapping_add(1))
            .filter(|&e| e >= start)
            .unwrap_or(start);
        self.shared.pcm.enable_post_abort_filter((start, end));
        self.shared.irqs[device_index(Device::DpChan)].tx_upcall_ev(Reason::CHAN_RCC_ABORT);
        self.shared.primary_bind_committed = true;
        self.shared.pending.commit_fec_bind = true;
        self.shared.er_enabled = true;
        self.shared.pcm.set_er_enabled(true);
        self.shared.pending.reset_repair = true;
    }

    fn notify_send_ncsi(&mut self) {
        self.shared.irqs[device_index(Device::DpChan)].tx_upcall_ev(Reason::CHAN_RCC_NCSI);
        self.shared.snapshot(self.now);
    }

    fn drop_queued_app_packets(&mut self) {
        if let Some(pool) = self.pool.as_deref_mut() {
            for (_, pak) in self.shared.app_paks.drain(..) {
                pool.release(pak);
            }
        }
    }
}

/// Owns every per-channel sub-component (`spec.md` §3 "Channel").
pub struct Channel {
    pub(crate) pool: PakPool,
    pub(crate) primary: PrimaryInputStream,
    pub(crate) repair: Option<RepairInputStream>,
    pub(crate) fec_is: Option<FecInputStream>,
    pub(crate) fec_engine: Box<dyn FecEngine>,
    pub(crate) scheduler: OutputScheduler,
    core: ChannelCore,
}

impl Channel {
    pub fn new(cfg: ChannelConfig, fec_engine: Box<dyn FecEngine>) -> Self {
        let repair = cfg.repair_enabled.then(|| RepairInputStream::new(cfg.reorder_time));
        let fec_is = cfg.fec_enabled.then(|| FecInputStream::new(true));
        Channel {
            pool: PakPool::new(cfg.packet_pool_capacity),
            primary: PrimaryInputStream::new(cfg.primary_passthrough, cfg.reorder_time),
            repair,
            fec_is,
            fec_engine,
            scheduler: OutputScheduler::new(),
            core: ChannelCore {
                sm: StateMachine::new(),
                shared: SharedCore {
                    pcm: Pcm::new(cfg.reorder_time, cfg.jitter_delay),
                    irqs: [IrqDescriptor::new(); 3],
                    app_paks: Vec::new(),
                    psi: PsiCapture::default(),
                    tlv: cfg.tlv,
                    rcc: RccParams::default(),
                    rcc_enabled: false,
                    rcc_in_abort: false,
                    er_enabled: false,
                    primary_bind_committed: false,
                    timers: [None; 4],
                    activity_armed: false,
                    first_repair_ts: None,
                    first_primary_ts: None,
                    first_primary_seq: None,
                    join_issue_time: None,
                    join_delay_hist: Histogram::new(cfg.histogram_bounds_ns),
                    last_gen_num_sync: Time::ZERO,
                    prim_inactive_signalled: false,
                    fastfill_time: Duration::ZERO,
                    session_rtp_seq_num_offset: 0,
                    udp_paks: 0,
                    eject_paks: 0,
                    last_snapshot: None,
                    pending: PendingEffects::default(),
                    now: Time::ZERO,
                    tr135_params: Tr135Params::default(),
                },
            },
        }
    }

    /// Drains whatever sibling-field actions the last `sm`/`host`
    /// interaction deferred into `PendingEffects` — see module doc.
    fn apply_pending_effects(&mut self, now: Time) {
        let pending = std::mem::take(&mut self.core.shared.pending);
        if pending.reset_repair {
            if let Some(repair) = self.repair.as_mut() {
                repair.reset(&mut self.pool);
            }
        }
        if pending.drain_repair_holdq {
            if let Some(repair) = self.repair.as_mut() {
                repair.drain_held(&mut self.pool, &mut self.core, now);
            }
        }
        if pending.commit_fec_bind {
            self.fec_engine.bind_commit();
        }
    }

    /// `spec.md` §4.9 `process_app`.
    pub fn process_app(&mut self, now: Time, rcc_params: RccParams, session_rtp_seq_num_offset: u32, tsrap_bytes: &[u8]) -> Result<()> {
        let ts = app::parse_tsrap(tsrap_bytes, &self.core.shared.tlv, &mut self.core.shared.psi)?;
        self.core.shared.rcc = rcc_params;
        self.core.shared.session_rtp_seq_num_offset = session_rtp_seq_num_offset;
        self.core.shared.fastfill_time = compute_fastfill_time(&rcc_params);
        let paks = app::chunk_into_app_paks(&mut self.pool, &ts, rcc_params.start_seq_num)?;
        self.core.shared.app_paks = paks;
        self.core.shared.rcc_enabled = true;
        self.core.shared.rcc_in_abort = false;
        self.core.shared.now = now;

        let timing = self.core.timing(now);
        let (sm, shared) = (&mut self.core.sm, &mut self.core.shared);
        sm.deliver_event(
            RccEvent::StartRcc,
            timing,
            &mut HooksWithPool { shared, pool: Some(&mut self.pool), now },
        );
        self.apply_pending_effects(now);

        if self.core.sm.state() != RccState::Abort {
            if let Some(repair) = self.repair.as_mut() {
                repair.install_first_seq_filter(rcc_params.start_seq_num);
            }
        }
        Ok(())
    }

    /// `spec.md` §6 `abort_rcc`.
    pub fn abort_rcc(&mut self, now: Time) {
        self.core.shared.now = now;
        let timing = self.core.timing(now);
        let (sm, shared) = (&mut self.core.sm, &mut self.core.shared);
        sm.abort(timing, &mut HooksWithPool { shared, pool: Some(&mut self.pool), now });
        self.apply_pending_effects(now);
    }

    pub fn receive_primary(&mut self, paks: &[PakRef], now: Time) {
        self.core.shared.now = now;
        self.primary.receive_vec(&mut self.pool, &mut self.core, paks, now);
        self.apply_pending_effects(now);
    }

    pub fn receive_repair(&mut self, pak: PakRef, now: Time) {
        self.core.shared.now = now;
        match self.repair.as_mut() {
            Some(repair) => repair.receive_one(&mut self.pool, &mut self.core, pak, now),
            None => self.pool.release(pak),
        }
        self.apply_pending_effects(now);
    }

    pub fn receive_fec(&mut self, pak: PakRef, now: Time) {
        self.core.shared.now = now;
        match self.fec_is.as_mut() {
            Some(fec_is) => fec_is.receive_one(&mut self.pool, &mut self.core, self.fec_engine.as_mut(), pak, now),
            None => self.pool.release(pak),
        }
        self.apply_pending_effects(now);
    }

    /// `spec.md` §4.9 `poll_ev_handler`.
    pub fn poll_ev_handler(&mut self, now: Time, sink: &mut dyn Sink) {
        self.core.shared.now = now;

        for &(timer, event) in TIMER_EVENTS.iter() {
            let idx = timer_index(timer);
            if let Some(deadline) = self.core.shared.timers[idx] {
                if deadline.has_passed(now) {
                    self.core.shared.timers[idx] = None;
                    let timing = self.core.timing(now);
                    let (sm, shared) = (&mut self.core.sm, &mut self.core.shared);
                    sm.deliver_event(event, timing, &mut HooksWithPool { shared, pool: Some(&mut self.pool), now });
                    self.apply_pending_effects(now);
                }
            }
        }

        if self.core.shared.activity_armed {
            let (sm, shared) = (&mut self.core.sm, &mut self.core.shared);
            sm.check_activity(now, &mut HooksWithPool { shared, pool: Some(&mut self.pool), now });
            self.apply_pending_effects(now);
        }

        if !self.primary.is_inactive() {
            self.core.shared.prim_inactive_signalled = false;
        }
        if let Some(last_pak_ts) = self.primary.last_pak_ts() {
            if !self.core.shared.prim_inactive_signalled && now.saturating_since(last_pak_ts) > Duration::from_millis(500) {
                self.core.shared.prim_inactive_signalled = true;
                self.core.tx_upcall(Device::DpChan, Reason::CHAN_PRIM_INACTIVE);
            }
        }
        if now.saturating_since(self.core.shared.last_gen_num_sync) >= Duration::from_secs(10) {
            self.core.shared.last_gen_num_sync = now;
            self.core.tx_upcall(Device::DpChan, Reason::CHAN_GEN_NUM_SYNC);
        }

        let first_primary_seq = self.core.shared.first_primary_seq;
        let outcome = self.scheduler.tick(&mut self.pool, &mut self.core.shared.pcm, sink, now, |seq| {
            first_primary_seq.map_or(false, |fp| seq >= fp)
        });
        if matches!(outcome, TickOutcome::EmittedFastfillDone(_)) {
            self.core.tx_upcall(Device::DpChan, Reason::CHAN_FAST_FILL_DONE);
        }
        if self.fec_engine.take_dimensions_changed() {
            self.core.tx_upcall(Device::DpChan, Reason::CHAN_FEC_UPDATE);
        }
    }

    pub fn rcc_state(&self) -> RccState {
        self.core.sm.state()
    }

    /// Raises `PRIMARY_SOURCE_CHANGED`/`REPAIR_SOURCE_CHANGED` (`spec.md` §6
    /// `channel_update_source`). `DpChan` has no associated source-change
    /// reason and is a no-op.
    pub fn notify_source_changed(&mut self, dev: Device) {
        let reason = match dev {
            Device::Primary => Reason::PRIMARY_SOURCE_CHANGED,
            Device::Repair => Reason::REPAIR_SOURCE_CHANGED,
            Device::DpChan => return,
        };
        self.core.tx_upcall(dev, reason);
    }

    pub fn pcm(&self) -> &Pcm {
        &self.core.shared.pcm
    }

    pub fn scheduler(&self) -> &OutputScheduler {
        &self.scheduler
    }

    pub fn start_output(&mut self) {
        self.scheduler.start();
    }

    pub fn begin_fastfill(&mut self, target_bytes: u64) {
        self.scheduler.begin_fastfill(target_bytes);
    }

    pub fn fastfill_time(&self) -> Duration {
        self.core.shared.fastfill_time
    }

    pub fn last_snapshot(&self) -> Option<ChannelSnapshot> {
        self.core.shared.last_snapshot
    }

    pub fn ack_upcall_irq(&mut self, dev: Device) -> Reason {
        self.core.shared.irqs[device_index(dev)].ack_upcall_irq()
    }

    pub fn poll_upcall_irq(&mut self) -> [Reason; 3] {
        [
            self.core.shared.irqs[0].poll_ack(),
            self.core.shared.irqs[1].poll_ack(),
            self.core.shared.irqs[2].poll_ack(),
        ]
    }

    pub fn get_seqlogs(&self) -> Vec<crate::sm::LogEntryPub> {
        self.core.sm.seqlogs()
    }

    pub fn get_pat(&self) -> &[u8] {
        self.core.shared.psi.get_pat()
    }

    pub fn get_pmt(&self) -> &[u8] {
        self.core.shared.psi.get_pmt()
    }

    pub fn get_pcr(&self) -> Option<u64> {
        self.core.shared.psi.get_pcr()
    }

    pub fn get_pts(&self) -> Option<u64> {
        self.core.shared.psi.get_pts()
    }

    pub fn get_gap_report(&self) -> Vec<GapEvent> {
        self.core.shared.pcm.gap_log.iter().copied().collect()
    }

    pub fn get_status(&self) -> ChannelStatus {
        ChannelStatus {
            state: self.core.sm.state(),
            fail_reason: self.core.sm.fail_reason(),
            rcc_enabled: self.core.shared.rcc_enabled,
            rcc_in_abort: self.core.shared.rcc_in_abort,
            er_enabled: self.core.shared.er_enabled,
            primary_bind_committed: self.core.shared.primary_bind_committed,
            pcm_len: self.core.shared.pcm.len(),
            pcm_head: self.core.shared.pcm.head(),
            primary_encap: self.primary.encap(),
            primary_inactive: self.primary.is_inactive(),
        }
    }

    pub fn get_stats_tr135_sample(&self, now: Time) -> Tr135Sample {
        let repair_input_count = self.repair.as_ref().map(|r| r.rtp.stats.input_count).unwrap_or(0);
        Tr135Sample {
            at: now,
            primary_input_count: self.primary.rtp.stats.input_count,
            repair_input_count,
            loss_events: self.core.shared.pcm.gap_log.len() as u64,
            join_delay_hist: self.core.shared.join_delay_hist.counts().to_vec(),
        }
    }

    pub fn set_tr135_params(&mut self, params: Tr135Params) {
        self.core.shared.tr135_params = params;
    }

    pub fn clear_stats(&mut self) {
        self.primary.drops.clear();
        self.primary.rtp.clear_stats();
        if let Some(repair) = self.repair.as_mut() {
            repair.drops.clear();
            repair.rtp.clear_stats();
        }
        if let Some(fec_is) = self.fec_is.as_mut() {
            fec_is.drops.clear();
            fec_is.rtp.clear_stats();
        }
        self.core.shared.pcm.drops.clear();
        self.core.shared.join_delay_hist.clear();
    }

    pub fn get_rtp_stats(&self, dev: Device) -> RtpSessionStats {
        match dev {
            Device::Primary => self.primary.rtp.stats,
            Device::Repair => self.repair.as_ref().map(|r| r.rtp.stats).unwrap_or_default(),
            Device::DpChan => RtpSessionStats::default(),
        }
    }

    pub fn clear_rtp_stats(&mut self, dev: Device) -> RtpSessionStats {
        match dev {
            Device::Primary => self.primary.rtp.clear_stats(),
            Device::Repair => self.repair.as_mut().map(|r| r.rtp.clear_stats()).unwrap_or_default(),
            Device::DpChan => RtpSessionStats::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pak::{PakKind, MTU};

    struct VecSink(Vec<Vec<u8>>);
    impl Sink for VecSink {
        fn emit(&mut self, pak: &crate::pak::PakData) {
            self.0.push(pak.head().to_vec());
        }
    }

    fn tlv_entry(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![tag];
        v.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    fn sample_tsrap_one_dp_pak() -> Vec<u8> {
        let mut bytes = Vec::new();
        for i in 0..crate::pak::NUM_TSPKTS_PER_DP_PAK {
            let mut pkt = vec![0u8; crate::pak::TS_PACKET_LEN];
            pkt[0] = 0x47;
            pkt[1] = i as u8;
            bytes.extend(tlv_entry(0, &pkt));
        }
        bytes
    }

    fn test_channel() -> Channel {
        Channel::new(
            ChannelConfig {
                primary_passthrough: true,
                reorder_time: Duration::from_millis(10),
                jitter_delay: Duration::from_millis(10),
                repair_enabled: true,
                fec_enabled: false,
                tlv: TlvParseConfig::default(),
                histogram_bounds_ns: vec![1_000_000, 10_000_000, 100_000_000],
                packet_pool_capacity: 32,
            },
            Box::new(crate::fec::NullFecEngine),
        )
    }

    fn rcc_params() -> RccParams {
        RccParams {
            dt_earliest_join: Duration::from_millis(100),
            dt_repair_end: Duration::from_millis(500),
            er_holdoff_time: Duration::from_millis(50),
            first_repair_deadline: Duration::from_millis(200),
            start_seq_num: 1000,
            ..Default::default()
        }
    }

    fn repair_pak(pool: &mut PakPool, seq: u16, osn: u16) -> PakRef {
        let r = pool.alloc(MTU, PakKind::Repair).unwrap();
        let mut buf = vec![0u8; RTP_FIXED_HEADER_LEN + 2 + 4];
        buf[0] = 0x80;
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[RTP_FIXED_HEADER_LEN..RTP_FIXED_HEADER_LEN + 2].copy_from_slice(&osn.to_be_bytes());
        pool.get_mut(r).unwrap().set_content(&buf);
        r
    }

    #[test]
    fn clean_rcc_reaches_fin_success_and_emits_burst_done() {
        let mut ch = test_channel();
        ch.process_app(Time::ZERO, rcc_params(), 0, &sample_tsrap_one_dp_pak()).unwrap();
        assert_eq!(ch.rcc_state(), RccState::WaitFirstSeq);

        // start_seq_num & 0xFFFF == 1000, the installed filter osn.
        let pak = repair_pak(&mut ch.pool, 1, 1000);
        ch.receive_repair(pak, Time::from_millis(10));
        assert_eq!(ch.rcc_state(), RccState::WaitJoin);

        let mut sink = VecSink(Vec::new());
        ch.poll_ev_handler(Time::from_millis(120), &mut sink); // join deadline 110ms
        assert_eq!(ch.rcc_state(), RccState::WaitEnableEr);

        ch.poll_ev_handler(Time::from_millis(170), &mut sink); // enable_er deadline 160ms
        assert_eq!(ch.rcc_state(), RccState::WaitEndBurst);

        ch.poll_ev_handler(Time::from_millis(520), &mut sink); // end_burst deadline 510ms
        assert_eq!(ch.rcc_state(), RccState::FinSuccess);

        let cause = ch.ack_upcall_irq(Device::DpChan);
        assert!(cause.contains(Reason::CHAN_BURST_DONE));
    }

    #[test]
    fn first_repair_timeout_aborts_and_frees_app_packets() {
        let mut ch = test_channel();
        let mut params = rcc_params();
        params.first_repair_deadline = Duration::from_millis(50);
        ch.process_app(Time::ZERO, params, 0, &sample_tsrap_one_dp_pak()).unwrap();
        assert_eq!(ch.pool.in_use(), 1); // the queued APP packet

        let mut sink = VecSink(Vec::new());
        ch.poll_ev_handler(Time::from_millis(60), &mut sink);

        assert_eq!(ch.rcc_state(), RccState::Abort);
        assert_eq!(ch.pool.in_use(), 0);
        let cause = ch.ack_upcall_irq(Device::DpChan);
        assert!(cause.contains(Reason::CHAN_RCC_ABORT));
    }

    #[test]
    fn stun_repair_packet_is_ejected_not_held() {
        let mut ch = test_channel();
        ch.process_app(Time::ZERO, rcc_params(), 0, &sample_tsrap_one_dp_pak()).unwrap();

        let r = ch.pool.alloc(MTU, PakKind::Repair).unwrap();
        ch.pool.get_mut(r).unwrap().set_content(&[0x00, 0, 0, 0]);
        ch.receive_repair(r, Time::from_millis(5));

        assert_eq!(ch.core.shared.eject_paks, 1);
        assert_eq!(ch.repair.as_ref().unwrap().hold_queue_len(), 0);
    }

    #[test]
    fn abort_rcc_is_idempotent_and_freezes_state() {
        let mut ch = test_channel();
        ch.process_app(Time::ZERO, rcc_params(), 0, &sample_tsrap_one_dp_pak()).unwrap();
        ch.abort_rcc(Time::from_millis(1));
        assert_eq!(ch.rcc_state(), RccState::Abort);
        ch.abort_rcc(Time::from_millis(2));
        assert_eq!(ch.rcc_state(), RccState::Abort);
        let cause = ch.ack_upcall_irq(Device::DpChan);
        assert!(cause.contains(Reason::CHAN_RCC_ABORT));
    }
}
