// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Primary Input Stream, `spec.md` §4.3.
//!
//! Grounded on `vqec_dp_rtp_input_stream.c`'s primary-stream receive path:
//! passthrough-encapsulation auto-detection, STUN ejection, and the
//! same-source invariant enforced as a fatal assertion on the way into PCM.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::DropSim;
use crate::extseq::ExtSeq;
use crate::input_stream::{Encap, IsHost, PakAdmission};
use crate::pak::{PakKind, PakPool, PakRef};
use crate::rtp::{looks_like_stun, Admit, RtpReceiver};
use crate::stats::{DropCounters, DropReason};
use crate::time::Time;

/// Underrun threshold added on top of the reorder deadline before the
/// primary stream re-attempts encapsulation detection (`spec.md` §4.3 step
/// 2: "`last_pak_ts` + `reorder_time` + 20 ms < current packet's rx
/// timestamp").
const UNDERRUN_SLACK: Duration = Duration::from_millis(20);

/// Bound on the failover queue (`spec.md` §3: "bounded FIFO of packets from
/// a new source while the previous source is being retired").
const FAILOVER_QUEUE_CAP: usize = 64;

pub struct PrimaryInputStream {
    encap: Encap,
    passthrough: bool,
    reorder_time: Duration,
    last_pak_ts: Option<Time>,
    prim_inactive: bool,
    pub rtp: RtpReceiver,
    pub drops: DropCounters,
    pub drop_sim: DropSim,
    seen: u64,
    pub failover_queue: VecDeque<PakRef>,
    /// Scratch buffer reused each `receive_vec` call for the RTP-classified
    /// batch handed to PCM.
    batch: Vec<(ExtSeq, PakRef)>,
    /// Last extended sequence resolved for the permitted source, used as the
    /// `last` input to [`ExtSeq::nearest`] on the next packet.
    last_ext_seq: Option<ExtSeq>,
}

impl PrimaryInputStream {
    pub fn new(passthrough: bool, reorder_time: Duration) -> Self {
        PrimaryInputStream {
            encap: Encap::Unknown,
            passthrough,
            reorder_time,
            last_pak_ts: None,
            prim_inactive: false,
            rtp: RtpReceiver::new(),
            drops: DropCounters::new(),
            drop_sim: DropSim::disabled(),
            seen: 0,
            failover_queue: VecDeque::with_capacity(FAILOVER_QUEUE_CAP),
            batch: Vec::new(),
            last_ext_seq: None,
        }
    }

    pub fn encap(&self) -> Encap {
        self.encap
    }

    pub fn is_inactive(&self) -> bool {
        self.prim_inactive
    }

    pub fn last_pak_ts(&self) -> Option<Time> {
        self.last_pak_ts
    }

    fn underrun(&self, cur_time: Time) -> bool {
        match self.last_pak_ts {
            None => true,
            Some(last) => cur_time.saturating_since(last) > self.reorder_time + UNDERRUN_SLACK,
        }
    }

    /// `spec.md` §4.3 `receive_vec(paks[0..n], cur_time)`.
    pub fn receive_vec(
        &mut self,
        pool: &mut PakPool,
        host: &mut dyn IsHost,
        paks: &[PakRef],
        cur_time: Time,
    ) {
        self.batch.clear();
        let mut accepted_any = false;
        let mut last_non_stun_ts = self.last_pak_ts;

        for &pak in paks {
            self.seen += 1;
            if self.drop_sim.should_drop(self.seen) {
                self.drops.bump(DropReason::SimDrop);
                pool.release(pak);
                continue;
            }

            if self.passthrough && (self.encap == Encap::Unknown || self.underrun(cur_time)) {
                self.redetect_encap(pool, host, pak);
            }

            let first_byte = pool.get(pak).map(|d| d.head().first().copied().unwrap_or(0));
            if let Some(b) = first_byte {
                if looks_like_stun(b) {
                    let (addr, port) = pool
                        .get(pak)
                        .map(|d| (d.src_addr, d.src_port))
                        .unwrap_or((std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0));
                    host.eject_stun(pool, pak, addr, port);
                    continue;
                }
            }

            let rx_ts = pool.get(pak).map(|d| d.rx_ts).unwrap_or(cur_time);
            match self.encap {
                Encap::Udp => {
                    if let Some(d) = pool.get_mut(pak) {
                        d.kind = PakKind::Udp;
                    }
                    host.forward_udp(pool, pak);
                    accepted_any = true;
                    last_non_stun_ts = Some(rx_ts);
                }
                Encap::Rtp => {
                    let admitted = self.admit_rtp(pool, host, pak, cur_time);
                    if admitted {
                        accepted_any = true;
                        last_non_stun_ts = Some(rx_ts);
                    }
                }
                Encap::Unknown => {
                    self.drops.bump(DropReason::SyncDrop);
                    pool.release(pak);
                }
            }
        }

        if !self.batch.is_empty() {
            self.assert_single_source();
            host.pcm_insert_batch(pool, &self.batch, false);
            self.batch.clear();
        }

        if let Some(ts) = last_non_stun_ts {
            self.last_pak_ts = Some(ts);
        }
        if accepted_any {
            self.prim_inactive = false;
        }
    }

    /// Re-detects encapsulation from the first non-STUN byte of `pak`
    /// (`spec.md` §4.3 step 2).
    fn redetect_encap(&mut self, pool: &mut PakPool, _host: &mut dyn IsHost, pak: PakRef) {
        let Some(data) = pool.get(pak) else { return };
        let Some(&first_byte) = data.head().first() else {
            return;
        };
        if looks_like_stun(first_byte) {
            // STUN traffic doesn't reveal the media encapsulation; wait for
            // a non-STUN packet before re-deciding.
            return;
        }
        // RTP's first byte has version bits 10 in the top two positions
        // (`spec.md` §4.2); anything else that isn't STUN is treated as raw
        // UDP payload.
        self.encap = if first_byte & 0b1100_0000 == 0b1000_0000 {
            Encap::Rtp
        } else {
            Encap::Udp
        };
    }

    /// Validates and source-tracks an RTP packet, queuing it into the
    /// PCM-bound batch if the RCC admission gate and session acceptability
    /// both agree (`spec.md` §4.3 step 3 "RTP").
    fn admit_rtp(&mut self, pool: &mut PakPool, host: &mut dyn IsHost, pak: PakRef, now: Time) -> bool {
        let Some(data) = pool.get(pak) else { return false };
        let (addr, port) = (data.src_addr, data.src_port);
        let raw_seq = match crate::rtp::validate_header(data.head()) {
            Some((seq, _, _)) => seq,
            None => {
                self.drops.bump(DropReason::RtpParse);
                pool.release(pak);
                return false;
            }
        };
        let data = pool.get(pak).expect("still present");
        match self.rtp.process_primary(data, addr, port) {
            Admit::Dropped(reason) => {
                self.drops.bump(reason);
                pool.release(pak);
                false
            }
            Admit::Accepted => match host.pak_event(pool, PakKind::Primary, now) {
                PakAdmission::Drop | PakAdmission::Queue => {
                    // Primary packets are never queued by the RCC gate
                    // (only Init-state repair packets are, `spec.md` §4.9);
                    // `Queue` is treated as a drop here defensively.
                    self.drops.bump(DropReason::StateMachine);
                    pool.release(pak);
                    false
                }
                PakAdmission::Accept => {
                    let last = self.last_ext_seq.unwrap_or(ExtSeq(u32::from(raw_seq)));
                    let ext_seq = ExtSeq::nearest(last, raw_seq);
                    self.last_ext_seq = Some(ext_seq);
                    let data_mut = pool.get_mut(pak).expect("present");
                    data_mut.ext_seq = Some(ext_seq);
                    let rx_ts = data_mut.rx_ts;
                    self.batch.push((ext_seq, pak));
                    host.note_first_primary(rx_ts, ext_seq);
                    true
                }
            },
        }
    }

    fn assert_single_source(&self) {
        // `spec.md` §4.3 invariant: "in one batch, all packets accepted into
        // PCM must come from the same packet-flow-permitted RTP source."
        // The RTP receiver only ever admits through one designated source
        // at a time (`set_packet_flow_permitted`), so this holds by
        // construction; asserted here so a future refactor that breaks it
        // fails loudly rather than corrupting PCM ordering.
        assert!(
            self.rtp.sources().iter().filter(|s| s.packet_flow_permitted).count() <= 1,
            "primary IS: more than one packet-flow-permitted source"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::{Device, Reason};
    use crate::pak::MTU;

    struct FakeHost {
        admission: PakAdmission,
        first_primary: Option<(Time, ExtSeq)>,
        ejected: u32,
        udp_forwarded: u32,
        pcm: crate::pcm::Pcm,
    }

    impl Default for FakeHost {
        fn default() -> Self {
            FakeHost {
                admission: PakAdmission::Accept,
                first_primary: None,
                ejected: 0,
                udp_forwarded: 0,
                pcm: crate::pcm::Pcm::new(Duration::from_millis(10), Duration::from_millis(10)),
            }
        }
    }

    impl IsHost for FakeHost {
        fn pak_event(&mut self, _pool: &mut PakPool, _kind: PakKind, _now: Time) -> PakAdmission {
            self.admission
        }
        fn note_first_primary(&mut self, rx_ts: Time, ext_seq: ExtSeq) {
            if self.first_primary.is_none() {
                self.first_primary = Some((rx_ts, ext_seq));
            }
        }
        fn eject_stun(&mut self, pool: &mut PakPool, pak: PakRef, _a: std::net::IpAddr, _p: u16) {
            self.ejected += 1;
            pool.release(pak);
        }
        fn forward_udp(&mut self, pool: &mut PakPool, pak: PakRef) {
            self.udp_forwarded += 1;
            pool.release(pak);
        }
        fn tx_upcall(&mut self, _dev: Device, _reason: Reason) {}
        fn construct_rtp_hdr_and_flush_app(&mut self, _pool: &mut PakPool, _hdr: &[u8; 12]) {}
        fn er_enabled(&self) -> bool {
            false
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
        fn pcm_classify_repair(&self, seq: ExtSeq) -> crate::pcm::PcmAdmit {
            self.pcm.classify(seq, true)
        }
        fn pcm_insert_one(&mut self, pool: &mut PakPool, seq: ExtSeq, pak: PakRef, is_repair: bool) -> bool {
            self.pcm.insert_packets(pool, &[(seq, pak)], false, is_repair) == 1
        }
    }

    fn rtp_pak(pool: &mut PakPool, seq: u16) -> PakRef {
        let r = pool.alloc(MTU, PakKind::Primary).unwrap();
        let mut buf = vec![0u8; 12];
        buf[0] = 0x80;
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        pool.get_mut(r).unwrap().set_content(&buf);
        r
    }

    #[test]
    fn rtp_packet_classified_and_inserted_into_pcm() {
        let mut pool = PakPool::new(8);
        let mut is = PrimaryInputStream::new(true, Duration::from_millis(10));
        is.encap = Encap::Rtp;
        let mut host = FakeHost::default();
        let pak = rtp_pak(&mut pool, 5);
        is.receive_vec(&mut pool, &mut host, &[pak], Time::ZERO);
        assert_eq!(host.pcm.len(), 1);
        assert!(host.first_primary.is_some());
        assert!(!is.is_inactive());
    }

    #[test]
    fn stun_packet_is_ejected_not_inserted() {
        let mut pool = PakPool::new(8);
        let mut is = PrimaryInputStream::new(true, Duration::from_millis(10));
        is.encap = Encap::Rtp;
        let mut host = FakeHost::default();
        let r = pool.alloc(MTU, PakKind::Primary).unwrap();
        pool.get_mut(r).unwrap().set_content(&[0x00, 0, 0, 0]);
        is.receive_vec(&mut pool, &mut host, &[r], Time::ZERO);
        assert_eq!(host.ejected, 1);
        assert_eq!(host.pcm.len(), 0);
    }

    #[test]
    fn unknown_encap_counts_sync_drop() {
        let mut pool = PakPool::new(8);
        let mut is = PrimaryInputStream::new(false, Duration::from_millis(10));
        let mut host = FakeHost::default();
        let pak = rtp_pak(&mut pool, 1);
        is.receive_vec(&mut pool, &mut host, &[pak], Time::ZERO);
        assert_eq!(is.drops.get(DropReason::SyncDrop), 1);
    }

    #[test]
    fn rcc_gate_drop_is_not_inserted() {
        let mut pool = PakPool::new(8);
        let mut is = PrimaryInputStream::new(true, Duration::from_millis(10));
        is.encap = Encap::Rtp;
        let mut host = FakeHost {
            admission: PakAdmission::Drop,
            ..Default::default()
        };
        let pak = rtp_pak(&mut pool, 1);
        is.receive_vec(&mut pool, &mut host, &[pak], Time::ZERO);
        assert_eq!(host.pcm.len(), 0);
        assert_eq!(is.drops.get(DropReason::StateMachine), 1);
    }
}
