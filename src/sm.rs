// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rapid-Channel-Change state machine, `spec.md` §4.8.
//!
//! Grounded on `vqec_dp_sm.c`/`vqec_dp_sm.h`. Per the re-architecture
//! guidance in `spec.md` §9, the re-entrant event queue is a fixed-size ring
//! embedded in the struct (not recursion, not task spawning), and the
//! channel-facing "virtual" notifications (`join`, `enable-ER`, `success`,
//! `abort`, `send NCSI`) are a trait (`RccHooks`) rather than a function
//! table, so the state machine never holds a strong reference back to its
//! owning channel.

use std::time::Duration;

use crate::time::{Deadline, Time};

pub const MAX_EVENTQ_DEPTH: usize = 4;
pub const LOG_CAPACITY: usize = 16;
pub const ACTIVITY_TIMER_PERIOD: Duration = Duration::from_millis(50);
pub const ACTIVITY_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RccState {
    Init,
    WaitFirstSeq,
    WaitJoin,
    WaitEnableEr,
    WaitEndBurst,
    FinSuccess,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RccEvent {
    StartRcc,
    TimeFirstSeq,
    TimeToJoin,
    TimeToEnableEr,
    TimeEndBurst,
    FirstRepair,
    FirstPrimary,
    ActivityTimeout,
    InternalError,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    WaitFirst,
    Join,
    EnableEr,
    EndBurst,
}

/// Timing inputs needed to compute entry-action deadlines (`spec.md` §4.8).
/// Supplied fresh on each `deliver_event` call since they only change when
/// `process_app` (re)configures the channel.
#[derive(Debug, Clone, Copy)]
pub struct RccTiming {
    pub now: Time,
    pub first_repair_deadline: Deadline,
    pub first_repair_ts: Option<Time>,
    pub dt_earliest_join: Duration,
    pub er_holdoff_time: Duration,
    pub dt_repair_end: Duration,
}

/// Channel-facing hooks — the "virtual methods" §9 says to encode as a
/// trait rather than a vtable. Implemented by [`crate::channel::Channel`].
pub trait RccHooks {
    /// Arms a named timer at the given absolute deadline.
    fn arm_timer(&mut self, timer: TimerKind, deadline: Deadline);
    /// Destroys a named timer (no-op if not armed); safe at any time.
    fn destroy_timer(&mut self, timer: TimerKind);
    fn arm_activity_timer(&mut self, period: Duration, timeout: Duration);
    fn stop_activity_timer(&mut self);

    /// `spec.md` §4.8 FirstRepair action: insert all channel-queued
    /// APP-derived TS packets into PCM in order. Returns `false` if any
    /// insertion failed (triggers `InternalError`).
    fn insert_app_queue_into_pcm(&mut self) -> bool;

    fn notify_join(&mut self);
    fn notify_enable_er(&mut self);
    fn notify_success(&mut self);
    fn notify_abort(&mut self);
    fn notify_send_ncsi(&mut self);
    fn drop_queued_app_packets(&mut self);
}

#[derive(Debug, Clone, Copy)]
struct LogEntry {
    log_event: u32,
    state: RccState,
    event: RccEvent,
    timestamp: Time,
}

#[derive(Debug, Clone, Copy)]
struct QueuedEvent {
    event: RccEvent,
}

pub struct StateMachine {
    state: RccState,
    queue: Vec<QueuedEvent>,
    processing: bool,
    log: Vec<LogEntry>,
    last_repair_pak_ts: Time,
    abort_reason: Option<&'static str>,
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine {
            state: RccState::Init,
            queue: Vec::with_capacity(MAX_EVENTQ_DEPTH),
            processing: false,
            log: Vec::with_capacity(LOG_CAPACITY),
            last_repair_pak_ts: Time::ZERO,
            abort_reason: None,
        }
    }

    pub fn state(&self) -> RccState {
        self.state
    }

    pub fn fail_reason(&self) -> Option<&'static str> {
        self.abort_reason
    }

    /// `get_seqlogs` (§6): a snapshot of the diagnostic ring buffer.
    pub fn seqlogs(&self) -> Vec<LogEntryPub> {
        self.log
            .iter()
            .map(|e| LogEntryPub {
                log_event: e.log_event,
                state: e.state,
                event: e.event,
                timestamp: e.timestamp,
            })
            .collect()
    }

    fn push_log(&mut self, log_event: u32, event: RccEvent, now: Time) {
        if self.log.len() == LOG_CAPACITY {
            self.log.remove(0);
        }
        self.log.push(LogEntry {
            log_event,
            state: self.state,
            event,
            timestamp: now,
        });
    }

    /// Records a repair packet's arrival for the activity timer.
    pub fn note_repair_activity(&mut self, now: Time) {
        self.last_repair_pak_ts = now;
    }

    /// Activity timer handler (`spec.md` §4.8): call periodically; posts
    /// `ActivityTimeout` if no repair packet for > 200ms.
    pub fn check_activity(&mut self, now: Time, hooks: &mut dyn RccHooks) -> bool {
        if now.saturating_since(self.last_repair_pak_ts) > ACTIVITY_TIMEOUT {
            return self.deliver_event(RccEvent::ActivityTimeout, RccTiming {
                now,
                first_repair_deadline: Deadline(now),
                first_repair_ts: None,
                dt_earliest_join: Duration::ZERO,
                er_holdoff_time: Duration::ZERO,
                dt_repair_end: Duration::ZERO,
            }, hooks);
        }
        true
    }

    fn guard(state: RccState, event: RccEvent) -> Option<RccState> {
        use RccEvent::*;
        use RccState::*;
        match (state, event) {
            (Init, StartRcc) => Some(WaitFirstSeq),
            (Init, Abort) | (Init, InternalError) => Some(Abort),

            (WaitFirstSeq, TimeFirstSeq) => Some(Abort),
            (WaitFirstSeq, FirstRepair) => Some(WaitJoin),
            (WaitFirstSeq, Abort) | (WaitFirstSeq, InternalError) => Some(Abort),

            (WaitJoin, TimeToJoin) => Some(WaitEnableEr),
            (WaitJoin, ActivityTimeout) => Some(Abort),
            (WaitJoin, Abort) | (WaitJoin, InternalError) => Some(Abort),

            (WaitEnableEr, FirstPrimary) => Some(WaitEnableEr),
            (WaitEnableEr, TimeToEnableEr) => Some(WaitEndBurst),
            (WaitEnableEr, Abort) | (WaitEnableEr, InternalError) => Some(Abort),

            (WaitEndBurst, FirstPrimary) => Some(WaitEndBurst),
            (WaitEndBurst, TimeEndBurst) => Some(FinSuccess),
            (WaitEndBurst, Abort) | (WaitEndBurst, InternalError) => Some(Abort),

            (FinSuccess, FirstPrimary) => Some(FinSuccess),

            (Abort, Abort) | (Abort, InternalError) => Some(Abort),

            _ => None,
        }
    }

    /// Entry action for a newly-entered state.
    fn on_entry(&mut self, state: RccState, timing: RccTiming, hooks: &mut dyn RccHooks) {
        match state {
            RccState::WaitFirstSeq => {
                let deadline = if timing.first_repair_deadline.has_passed(timing.now) {
                    Deadline(timing.now)
                } else {
                    timing.first_repair_deadline
                };
                hooks.arm_timer(TimerKind::WaitFirst, deadline);
            }
            RccState::WaitJoin => {
                if let Some(fr) = timing.first_repair_ts {
                    let d = Deadline::at_least_now(timing.now, fr, timing.dt_earliest_join);
                    hooks.arm_timer(TimerKind::Join, d);
                }
            }
            RccState::WaitEnableEr => {
                if let Some(fr) = timing.first_repair_ts {
                    let offset = timing.dt_earliest_join + timing.er_holdoff_time;
                    let d = Deadline::at_least_now(timing.now, fr, offset);
                    hooks.arm_timer(TimerKind::EnableEr, d);
                }
            }
            RccState::WaitEndBurst => {
                if let Some(fr) = timing.first_repair_ts {
                    let d = Deadline::at_least_now(timing.now, fr, timing.dt_repair_end);
                    hooks.arm_timer(TimerKind::EndBurst, d);
                }
            }
            RccState::FinSuccess => {
                hooks.stop_activity_timer();
                hooks.notify_success();
            }
            RccState::Abort => {
                hooks.drop_queued_app_packets();
                hooks.stop_activity_timer();
                hooks.notify_abort();
            }
            RccState::Init => {}
        }
    }

    /// Exit action: destroy this state's timer (all wait states own exactly
    /// one, per §4.8: "All wait states: on exit, destroy their timer").
    fn on_exit(&mut self, state: RccState, hooks: &mut dyn RccHooks) {
        match state {
            RccState::WaitFirstSeq => hooks.destroy_timer(TimerKind::WaitFirst),
            RccState::WaitJoin => hooks.destroy_timer(TimerKind::Join),
            RccState::WaitEnableEr => hooks.destroy_timer(TimerKind::EnableEr),
            RccState::WaitEndBurst => hooks.destroy_timer(TimerKind::EndBurst),
            _ => {}
        }
    }

    /// Per-event action that runs regardless of whether the event also
    /// causes a state transition (`spec.md` §4.8 "Actions on events").
    fn on_action(&mut self, event: RccEvent, timing: RccTiming, hooks: &mut dyn RccHooks) -> bool {
        match event {
            RccEvent::FirstRepair if self.state == RccState::WaitFirstSeq => {
                let ok = hooks.insert_app_queue_into_pcm();
                hooks.arm_activity_timer(ACTIVITY_TIMER_PERIOD, ACTIVITY_TIMEOUT);
                self.last_repair_pak_ts = timing.now;
                if !ok {
                    self.enqueue(RccEvent::InternalError);
                }
                true
            }
            RccEvent::TimeToJoin => {
                hooks.stop_activity_timer();
                hooks.notify_join();
                self.push_log(1, event, timing.now);
                true
            }
            RccEvent::FirstPrimary
                if matches!(self.state, RccState::WaitEnableEr | RccState::WaitEndBurst) =>
            {
                hooks.notify_send_ncsi();
                true
            }
            RccEvent::TimeToEnableEr => {
                hooks.notify_enable_er();
                true
            }
            _ => true,
        }
    }

    fn enqueue(&mut self, event: RccEvent) {
        assert!(
            self.queue.len() < MAX_EVENTQ_DEPTH,
            "RCC state machine event queue overflow (depth {})",
            MAX_EVENTQ_DEPTH
        );
        self.queue.push(QueuedEvent { event });
    }

    /// `spec.md` §4.8: `deliver_event`. Serialising entry point: slots the
    /// event in the ring, runs the guard, invokes the action mapper, then
    /// entry/exit handlers on an actual state change, and drains any events
    /// enqueued by those handlers before returning. Returns `false` if any
    /// drained event's action reported a resource failure.
    pub fn deliver_event(&mut self, event: RccEvent, timing: RccTiming, hooks: &mut dyn RccHooks) -> bool {
        self.enqueue(event);
        if self.processing {
            // Re-entrant call from within an action handler: the event is
            // queued; the outer drain loop will process it.
            return true;
        }
        self.processing = true;
        let mut all_ok = true;
        while !self.queue.is_empty() {
            let ev = self.queue.remove(0).event;
            let next = Self::guard(self.state, ev);
            match next {
                None => {
                    self.push_log(0, ev, timing.now);
                    log::debug!(
                        "RCC: ignoring event {:?} in state {:?} (invalid transition)",
                        ev,
                        self.state
                    );
                }
                Some(next_state) => {
                    let ok = self.on_action(ev, timing, hooks);
                    all_ok &= ok;
                    if next_state != self.state {
                        self.on_exit(self.state, hooks);
                        self.state = next_state;
                        self.on_entry(next_state, timing, hooks);
                    }
                    self.push_log(1, ev, timing.now);
                }
            }
        }
        self.processing = false;
        all_ok
    }

    pub fn abort(&mut self, timing: RccTiming, hooks: &mut dyn RccHooks) -> bool {
        self.abort_reason.get_or_insert("external abort");
        self.deliver_event(RccEvent::Abort, timing, hooks)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Public view of a log entry for `get_seqlogs` (§6).
#[derive(Debug, Clone, Copy)]
pub struct LogEntryPub {
    pub log_event: u32,
    pub state: RccState,
    pub event: RccEvent,
    pub timestamp: Time,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeHooks {
        timers_armed: Vec<TimerKind>,
        timers_destroyed: Vec<TimerKind>,
        activity_armed: bool,
        activity_stopped: bool,
        joins: u32,
        enable_ers: u32,
        successes: u32,
        aborts: u32,
        ncsis: u32,
        app_insert_ok: bool,
        app_dropped: bool,
    }

    impl RccHooks for FakeHooks {
        fn arm_timer(&mut self, timer: TimerKind, _deadline: Deadline) {
            self.timers_armed.push(timer);
        }
        fn destroy_timer(&mut self, timer: TimerKind) {
            self.timers_destroyed.push(timer);
        }
        fn arm_activity_timer(&mut self, _period: Duration, _timeout: Duration) {
            self.activity_armed = true;
        }
        fn stop_activity_timer(&mut self) {
            self.activity_stopped = true;
        }
        fn insert_app_queue_into_pcm(&mut self) -> bool {
            self.app_insert_ok
        }
        fn notify_join(&mut self) {
            self.joins += 1;
        }
        fn notify_enable_er(&mut self) {
            self.enable_ers += 1;
        }
        fn notify_success(&mut self) {
            self.successes += 1;
        }
        fn notify_abort(&mut self) {
            self.aborts += 1;
        }
        fn notify_send_ncsi(&mut self) {
            self.ncsis += 1;
        }
        fn drop_queued_app_packets(&mut self) {
            self.app_dropped = true;
        }
    }

    fn timing(now_ms: u64) -> RccTiming {
        RccTiming {
            now: Time::from_millis(now_ms),
            first_repair_deadline: Deadline(Time::from_millis(now_ms + 200)),
            first_repair_ts: Some(Time::from_millis(now_ms)),
            dt_earliest_join: Duration::from_millis(100),
            er_holdoff_time: Duration::from_millis(50),
            dt_repair_end: Duration::from_millis(500),
        }
    }

    #[test]
    fn p4_clean_sequence_reaches_fin_success() {
        let mut sm = StateMachine::new();
        let mut hooks = FakeHooks {
            app_insert_ok: true,
            ..Default::default()
        };
        let t = timing(0);
        assert!(sm.deliver_event(RccEvent::StartRcc, t, &mut hooks));
        assert_eq!(sm.state(), RccState::WaitFirstSeq);
        assert!(sm.deliver_event(RccEvent::FirstRepair, t, &mut hooks));
        assert_eq!(sm.state(), RccState::WaitJoin);
        assert!(sm.deliver_event(RccEvent::TimeToJoin, t, &mut hooks));
        assert_eq!(sm.state(), RccState::WaitEnableEr);
        assert!(sm.deliver_event(RccEvent::TimeToEnableEr, t, &mut hooks));
        assert_eq!(sm.state(), RccState::WaitEndBurst);
        assert!(sm.deliver_event(RccEvent::TimeEndBurst, t, &mut hooks));
        assert_eq!(sm.state(), RccState::FinSuccess);
        assert_eq!(hooks.successes, 1);
        assert_eq!(hooks.joins, 1);
        assert_eq!(hooks.enable_ers, 1);
    }

    #[test]
    fn p4_intervening_abort_prevents_fin_success() {
        let mut sm = StateMachine::new();
        let mut hooks = FakeHooks {
            app_insert_ok: true,
            ..Default::default()
        };
        let t = timing(0);
        sm.deliver_event(RccEvent::StartRcc, t, &mut hooks);
        sm.deliver_event(RccEvent::FirstRepair, t, &mut hooks);
        sm.deliver_event(RccEvent::Abort, t, &mut hooks);
        assert_eq!(sm.state(), RccState::Abort);
        sm.deliver_event(RccEvent::TimeToJoin, t, &mut hooks);
        assert_eq!(sm.state(), RccState::Abort);
        assert_eq!(hooks.successes, 0);
    }

    #[test]
    fn p5_double_abort_is_idempotent() {
        let mut sm = StateMachine::new();
        let mut hooks = FakeHooks::default();
        let t = timing(0);
        sm.deliver_event(RccEvent::StartRcc, t, &mut hooks);
        sm.deliver_event(RccEvent::Abort, t, &mut hooks);
        sm.deliver_event(RccEvent::Abort, t, &mut hooks);
        assert_eq!(sm.state(), RccState::Abort);
        assert_eq!(hooks.aborts, 1);
    }

    #[test]
    fn first_repair_insert_failure_posts_internal_error_and_aborts() {
        let mut sm = StateMachine::new();
        let mut hooks = FakeHooks {
            app_insert_ok: false,
            ..Default::default()
        };
        let t = timing(0);
        sm.deliver_event(RccEvent::StartRcc, t, &mut hooks);
        sm.deliver_event(RccEvent::FirstRepair, t, &mut hooks);
        assert_eq!(sm.state(), RccState::Abort);
        assert_eq!(hooks.aborts, 1);
    }

    #[test]
    fn invalid_event_in_state_is_ignored() {
        let mut sm = StateMachine::new();
        let mut hooks = FakeHooks::default();
        let t = timing(0);
        assert!(sm.deliver_event(RccEvent::TimeToJoin, t, &mut hooks));
        assert_eq!(sm.state(), RccState::Init);
    }

    #[test]
    fn activity_timeout_in_wait_join_aborts() {
        let mut sm = StateMachine::new();
        let mut hooks = FakeHooks {
            app_insert_ok: true,
            ..Default::default()
        };
        let t = timing(0);
        sm.deliver_event(RccEvent::StartRcc, t, &mut hooks);
        sm.deliver_event(RccEvent::FirstRepair, t, &mut hooks);
        assert_eq!(sm.state(), RccState::WaitJoin);
        let late = timing(1000);
        sm.note_repair_activity(Time::ZERO);
        sm.check_activity(late.now, &mut hooks);
        assert_eq!(sm.state(), RccState::Abort);
    }
}
