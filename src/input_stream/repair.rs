// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Repair Input Stream, `spec.md` §4.4.
//!
//! Grounded on `vqec_dp_rtp_input_stream.c`'s repair-stream receive path and
//! hold-queue flush filter. The OSN re-home (`spec.md` §4.4 step 9) reuses
//! [`crate::pak::PakData::advance_head`], the same prefix-shift primitive
//! `spec.md` §4.9's synthetic-RTP-header construction uses in the opposite
//! direction.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::DropSim;
use crate::extseq::ExtSeq;
use crate::input_stream::{IsHost, PakAdmission};
use crate::pak::{PakKind, PakPool, PakRef};
use crate::pcm::PcmAdmit;
use crate::rtp::{looks_like_stun, Admit, RtpReceiver, RTP_FIXED_HEADER_LEN};
use crate::stats::{DropCounters, DropReason};
use crate::time::Time;

/// `spec.md` §3: "a first-sequence filter consisting of {16-bit OSN,
/// active-flag}".
#[derive(Debug, Clone, Copy, Default)]
struct FirstSeqFilter {
    active: bool,
    osn: u16,
}

pub struct RepairInputStream {
    hold_queue: VecDeque<PakRef>,
    filter: FirstSeqFilter,
    pub rtp: RtpReceiver,
    pub drops: DropCounters,
    pub drop_sim: DropSim,
    seen: u64,
    reorder_time: Duration,
    process_first_repair: bool,
}

impl RepairInputStream {
    pub fn new(reorder_time: Duration) -> Self {
        RepairInputStream {
            hold_queue: VecDeque::new(),
            filter: FirstSeqFilter::default(),
            rtp: RtpReceiver::new(),
            drops: DropCounters::new(),
            drop_sim: DropSim::disabled(),
            seen: 0,
            reorder_time,
            process_first_repair: false,
        }
    }

    /// Installs the first-sequence filter at `start_seq_num & 0xFFFF`
    /// (`spec.md` §4.9 step 6).
    pub fn install_first_seq_filter(&mut self, start_seq_num: u32) {
        self.filter = FirstSeqFilter {
            active: true,
            osn: (start_seq_num & 0xFFFF) as u16,
        };
    }

    pub fn hold_queue_len(&self) -> usize {
        self.hold_queue.len()
    }

    /// `spec.md` §4.4 "Hold-queue flush (unconditional)": drops all held
    /// packets, used on abort.
    pub fn flush_hold_queue_unconditional(&mut self, pool: &mut PakPool) {
        for pak in self.hold_queue.drain(..) {
            pool.release(pak);
        }
        self.filter = FirstSeqFilter::default();
        self.process_first_repair = false;
    }

    /// `spec.md` §4.9 "abort" / "success": clears the filter and flushes the
    /// hold queue.
    pub fn reset(&mut self, pool: &mut PakPool) {
        self.flush_hold_queue_unconditional(pool);
    }

    /// `spec.md` §4.4 `receive_one(pak, cur_time)`.
    pub fn receive_one(&mut self, pool: &mut PakPool, host: &mut dyn IsHost, pak: PakRef, cur_time: Time) {
        self.seen += 1;

        // Step 1: validate RTP header; STUN ejection or parse-drop.
        let Some(data) = pool.get(pak) else { return };
        let head_valid = crate::rtp::validate_header(data.head()).is_some();
        if !head_valid {
            let first_byte = data.head().first().copied();
            if first_byte.map(looks_like_stun).unwrap_or(false) {
                let (addr, port) = (data.src_addr, data.src_port);
                host.eject_stun(pool, pak, addr, port);
            } else {
                self.drops.bump(DropReason::RtpParse);
                pool.release(pak);
            }
            return;
        }

        // Step 2/3: OSN from the first two octets of the RTP payload.
        let data = pool.get(pak).expect("validated above");
        if data.content_len() < RTP_FIXED_HEADER_LEN + 2 {
            self.drops.bump(DropReason::RtpParse);
            pool.release(pak);
            return;
        }
        let osn = u16::from_be_bytes([
            data.head()[RTP_FIXED_HEADER_LEN],
            data.head()[RTP_FIXED_HEADER_LEN + 1],
        ]);

        // Step 4: first-sequence filter.
        if self.filter.active {
            if osn == self.filter.osn {
                self.process_first_repair = true;
                self.filter.active = false;
                let header: [u8; RTP_FIXED_HEADER_LEN] =
                    data.head()[..RTP_FIXED_HEADER_LEN].try_into().expect("fixed len");
                host.construct_rtp_hdr_and_flush_app(pool, &header);
                self.admit_and_insert(pool, host, pak, osn, cur_time);
                self.flush_hold_queue(pool, host, cur_time);
                return;
            } else {
                // `receive_one` already owns the sole reference to `pak`
                // (the ingress shim transfers ownership on the call, it
                // doesn't keep one of its own); queuing just moves that
                // ownership into the hold queue, no additional retain.
                self.hold_queue.push_back(pak);
                return;
            }
        }

        self.admit_and_insert(pool, host, pak, osn, cur_time);
    }

    /// Steps 5-11 of `receive_one`, shared between the direct path and the
    /// hold-queue flush.
    fn admit_and_insert(&mut self, pool: &mut PakPool, host: &mut dyn IsHost, pak: PakRef, osn: u16, now: Time) {
        // Step 5: ask the state machine whether to accept, drop, or queue.
        match host.pak_event(pool, PakKind::Repair, now) {
            PakAdmission::Queue => {
                self.hold_queue.push_back(pak);
                return;
            }
            PakAdmission::Drop => {
                self.drops.bump(DropReason::StateMachine);
                pool.release(pak);
                return;
            }
            PakAdmission::Accept => {}
        }

        // Step 6: repair RTP processing (session acceptability, late/dup).
        let Some(data) = pool.get(pak) else { return };
        let (addr, port) = (data.src_addr, data.src_port);
        match self.rtp.process_repair(data, addr, port, false) {
            Admit::Dropped(reason) => {
                self.drops.bump(reason);
                pool.release(pak);
                return;
            }
            Admit::Accepted => {}
        }

        // Step 7: repair drop-simulation, gated on the packet-arrival
        // counter bumped at the top of `receive_one` (§4.4 doesn't
        // distinguish a second counter for this gate).
        if self.drop_sim.should_drop(self.seen) {
            self.drops.bump(DropReason::SimDrop);
            pool.release(pak);
            return;
        }

        // Step 8: re-ask the state machine; state may have advanced.
        match host.pak_event(pool, PakKind::Repair, now) {
            PakAdmission::Drop => {
                self.drops.bump(DropReason::StateMachine);
                pool.release(pak);
                return;
            }
            PakAdmission::Queue => {
                self.hold_queue.push_back(pak);
                return;
            }
            PakAdmission::Accept => {}
        }

        // Step 9: re-home the packet buffer. Write `osn` into the (still
        // unshifted) header's sequence field, shift the 12-byte header
        // forward by 2 bytes to overwrite the OSN, advance the head
        // pointer past the vacated prefix, then patch version and
        // payload-type on the now-current header (`vqec_dp_rtp_input_stream.c`
        // ~1107-1130).
        const MP2T_PAYLOAD_TYPE: u8 = 33;
        let ext_seq = {
            let last = host.pcm_last_rx_seq().unwrap_or(ExtSeq(u32::from(osn)));
            ExtSeq::nearest(
                last,
                osn.wrapping_add(host.session_rtp_seq_num_offset() as u16),
            )
        };
        let after_ec = host.er_enabled();
        {
            let data = pool.get_mut(pak).expect("present");
            {
                let head = data.head_mut();
                head[2..4].copy_from_slice(&osn.to_be_bytes());
                head.copy_within(0..RTP_FIXED_HEADER_LEN, 2);
            }
            data.advance_head(2);
            data.kind = PakKind::Repair;
            data.ext_seq = Some(ext_seq);
            if after_ec {
                data.flags.insert(crate::pak::PakFlags::AFTER_ERROR_CORRECTION);
            }
            let head = data.head_mut();
            head[0] = (head[0] & 0b0011_1111) | 0b1000_0000;
            head[1] = (head[1] & 0b1000_0000) | MP2T_PAYLOAD_TYPE;
        }

        // Step 10: RCC post-abort filter.
        if host.pcm_classify_repair(ext_seq) == PcmAdmit::PostAbortRejected {
            self.drops.bump(DropReason::PakSeq);
            pool.release(pak);
            return;
        }

        // Step 11: insert into PCM. Late/duplicate/post-abort rejections are
        // already counted in PCM's own drop counters; the repair IS's own
        // counters don't need a second tally for the same event.
        let accepted = host.pcm_insert_one(pool, ext_seq, pak, true);
        if !accepted {
            pool.release(pak);
        } else {
            host.note_repair_activity(now);
        }
    }

    /// `spec.md` §4.4 "Hold-queue flush filter (`filter_holdq(start_seq)`)":
    /// drains the hold queue in arrival order, re-feeding each packet
    /// through the admission path. Bad headers are dropped in place.
    ///
    /// Also reused (as [`Self::drain_held`]) when ER is enabled mid-burst:
    /// the held packets are replayed through the same admission path now
    /// that the state machine accepts them (`spec.md` §4.8 `enable_er`
    /// action "poll the repair ... IS to drain buffered packets").
    fn flush_hold_queue(&mut self, pool: &mut PakPool, host: &mut dyn IsHost, now: Time) {
        let queued: Vec<PakRef> = self.hold_queue.drain(..).collect();
        for pak in queued {
            let Some(data) = pool.get(pak) else { continue };
            if crate::rtp::validate_header(data.head()).is_none() || data.content_len() < RTP_FIXED_HEADER_LEN + 2 {
                self.drops.bump(DropReason::RtpParse);
                pool.release(pak);
                continue;
            }
            let osn = u16::from_be_bytes([
                data.head()[RTP_FIXED_HEADER_LEN],
                data.head()[RTP_FIXED_HEADER_LEN + 1],
            ]);
            self.admit_and_insert(pool, host, pak, osn, now);
        }
    }

    /// Public entry point for draining the hold queue outside the
    /// filter-match path, used by the channel coordinator's `enable_er`
    /// handling (`spec.md` §4.8).
    pub fn drain_held(&mut self, pool: &mut PakPool, host: &mut dyn IsHost, now: Time) {
        self.flush_hold_queue(pool, host, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::{Device, Reason};
    use crate::pak::MTU;
    use std::net::IpAddr;

    struct FakeHost {
        admission: PakAdmission,
        flushed_app: u32,
        er_enabled: bool,
        pcm: crate::pcm::Pcm,
    }

    impl Default for FakeHost {
        fn default() -> Self {
            FakeHost {
                admission: PakAdmission::Accept,
                flushed_app: 0,
                er_enabled: false,
                pcm: crate::pcm::Pcm::new(Duration::from_millis(10), Duration::from_millis(10)),
            }
        }
    }

    impl IsHost for FakeHost {
        fn pak_event(&mut self, _pool: &mut PakPool, _kind: PakKind, _now: Time) -> PakAdmission {
            self.admission
        }
        fn note_first_primary(&mut self, _rx_ts: Time, _ext_seq: ExtSeq) {}
        fn eject_stun(&mut self, pool: &mut PakPool, pak: PakRef, _a: IpAddr, _p: u16) {
            pool.release(pak);
        }
        fn forward_udp(&mut self, pool: &mut PakPool, pak: PakRef) {
            pool.release(pak);
        }
        fn tx_upcall(&mut self, _dev: Device, _reason: Reason) {}
        fn construct_rtp_hdr_and_flush_app(&mut self, _pool: &mut PakPool, _hdr: &[u8; 12]) {
            self.flushed_app += 1;
        }
        fn er_enabled(&self) -> bool {
            self.er_enabled
        }
        fn session_rtp_seq_num_offset(&self) -> u32 {
            0
        }
        fn note_repair_activity(&mut self, _now: Time) {}
        fn pcm_last_rx_seq(&self) -> Option<ExtSeq> {
            self.pcm.last_rx_seq()
        }
        fn pcm_insert_batch(&mut self, pool: &mut PakPool, batch: &[(ExtSeq, PakRef)], is_repair: bool) -> usize {
            self.pcm.insert_packets(pool, batch, false, is_repair)
        }
        fn pcm_classify_repair(&self, seq: ExtSeq) -> PcmAdmit {
            self.pcm.classify(seq, true)
        }
        fn pcm_insert_one(&mut self, pool: &mut PakPool, seq: ExtSeq, pak: PakRef, is_repair: bool) -> bool {
            self.pcm.insert_packets(pool, &[(seq, pak)], false, is_repair) == 1
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
    fn packet_before_filter_match_is_held() {
        let mut pool = PakPool::new(8);
        let mut is = RepairInputStream::new(Duration::from_millis(10));
        is.install_first_seq_filter(100);
        let mut host = FakeHost::default();
        let pak = repair_pak(&mut pool, 1, 50);
        is.receive_one(&mut pool, &mut host, pak, Time::ZERO);
        assert_eq!(is.hold_queue_len(), 1);
        assert_eq!(host.pcm.len(), 0);
    }

    #[test]
    fn filter_match_flushes_hold_queue_in_order() {
        let mut pool = PakPool::new(8);
        let mut is = RepairInputStream::new(Duration::from_millis(10));
        is.install_first_seq_filter(100);
        let mut host = FakeHost::default();

        // The held packet arrives out of order (OSN 101, ahead of the exact
        // start-of-burst packet the filter is waiting for).
        let held = repair_pak(&mut pool, 2, 101);
        is.receive_one(&mut pool, &mut host, held, Time::ZERO);
        assert_eq!(is.hold_queue_len(), 1);

        let matching = repair_pak(&mut pool, 1, 100);
        is.receive_one(&mut pool, &mut host, matching, Time::ZERO);

        assert_eq!(host.flushed_app, 1);
        assert_eq!(is.hold_queue_len(), 0);
        assert_eq!(host.pcm.len(), 2);
    }

    #[test]
    fn rcc_queue_verdict_holds_packet() {
        let mut pool = PakPool::new(8);
        let mut is = RepairInputStream::new(Duration::from_millis(10));
        let mut host = FakeHost {
            admission: PakAdmission::Queue,
            ..Default::default()
        };
        let pak = repair_pak(&mut pool, 1, 1);
        is.receive_one(&mut pool, &mut host, pak, Time::ZERO);
        assert_eq!(is.hold_queue_len(), 1);
        assert_eq!(host.pcm.len(), 0);
    }

    #[test]
    fn accepted_packet_strips_osn_and_enters_pcm() {
        let mut pool = PakPool::new(8);
        let mut is = RepairInputStream::new(Duration::from_millis(10));
        let mut host = FakeHost::default();
        let pak = repair_pak(&mut pool, 1, 7);
        is.receive_one(&mut pool, &mut host, pak, Time::ZERO);
        assert_eq!(host.pcm.len(), 1);
        let (seq, r) = host.pcm.peek_head().unwrap();
        assert_eq!(seq, ExtSeq(7));
        let data = pool.get(r).unwrap();
        assert_eq!(data.content_len(), RTP_FIXED_HEADER_LEN + 4);
        assert_eq!(&data.head()[2..4], &7u16.to_be_bytes());
    }
}
