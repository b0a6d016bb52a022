// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! FEC Input Stream, `spec.md` §4.5.
//!
//! The reconstruction algorithm itself is the out-of-scope
//! [`crate::fec::FecEngine`] collaborator; this module is just the RTP
//! admission gate in front of it.

use crate::fec::FecEngine;
use crate::input_stream::{IsHost, PakAdmission};
use crate::pak::{PakKind, PakPool, PakRef};
use crate::rtp::{Admit, RtpReceiver};
use crate::stats::{DropCounters, DropReason};
use crate::time::Time;

pub struct FecInputStream {
    enabled: bool,
    pub rtp: RtpReceiver,
    pub drops: DropCounters,
}

impl FecInputStream {
    pub fn new(enabled: bool) -> Self {
        FecInputStream {
            enabled,
            rtp: RtpReceiver::new(),
            drops: DropCounters::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `spec.md` §4.5 `receive_one(pak, cur_time)`.
    pub fn receive_one(
        &mut self,
        pool: &mut PakPool,
        host: &mut dyn IsHost,
        fec: &mut dyn FecEngine,
        pak: PakRef,
        now: Time,
    ) {
        // Step 1: FEC globally disabled.
        if !self.enabled {
            pool.release(pak);
            return;
        }

        // Step 2: validate, apply FEC-RTP processing.
        let Some(data) = pool.get(pak) else { return };
        let (addr, port) = (data.src_addr, data.src_port);
        match self.rtp.process_fec(data, addr, port) {
            Admit::Dropped(reason) => {
                self.drops.bump(reason);
                pool.release(pak);
                return;
            }
            Admit::Accepted => {}
        }

        // Step 3: state machine admission.
        match host.pak_event(pool, PakKind::Fec, now) {
            PakAdmission::Drop | PakAdmission::Queue => {
                self.drops.bump(DropReason::StateMachine);
                pool.release(pak);
                return;
            }
            PakAdmission::Accept => {}
        }

        // Step 4: tag and hand to the FEC engine.
        if let Some(data) = pool.get_mut(pak) {
            data.kind = PakKind::Fec;
        }
        if !fec.insert(pool, pak) {
            self.drops.bump(DropReason::FecEngine);
            pool.release(pak);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::NullFecEngine;
    use crate::irq::{Device, Reason};
    use crate::pak::{PakRef, MTU};
    use std::net::IpAddr;

    struct FakeHost(PakAdmission);
    impl IsHost for FakeHost {
        fn pak_event(&mut self, _pool: &mut PakPool, _kind: PakKind, _now: Time) -> PakAdmission {
            self.0
        }
        fn note_first_primary(&mut self, _rx_ts: Time, _ext_seq: crate::extseq::ExtSeq) {}
        fn eject_stun(&mut self, pool: &mut PakPool, pak: PakRef, _a: IpAddr, _p: u16) {
            pool.release(pak);
        }
        fn forward_udp(&mut self, pool: &mut PakPool, pak: PakRef) {
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
        fn pcm_last_rx_seq(&self) -> Option<crate::extseq::ExtSeq> {
            None
        }
        fn pcm_insert_batch(
            &mut self,
            _pool: &mut PakPool,
            _batch: &[(crate::extseq::ExtSeq, PakRef)],
            _is_repair: bool,
        ) -> usize {
            0
        }
        fn pcm_classify_repair(&self, _seq: crate::extseq::ExtSeq) -> crate::pcm::PcmAdmit {
            crate::pcm::PcmAdmit::Accepted
        }
        fn pcm_insert_one(
            &mut self,
            _pool: &mut PakPool,
            _seq: crate::extseq::ExtSeq,
            _pak: PakRef,
            _is_repair: bool,
        ) -> bool {
            true
        }
    }

    fn rtp_pak(pool: &mut PakPool, seq: u16) -> PakRef {
        let r = pool.alloc(MTU, PakKind::Fec).unwrap();
        let mut buf = vec![0u8; 12];
        buf[0] = 0x80;
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        pool.get_mut(r).unwrap().set_content(&buf);
        r
    }

    #[test]
    fn disabled_stream_drops_without_processing() {
        let mut pool = PakPool::new(4);
        let mut is = FecInputStream::new(false);
        let mut host = FakeHost(PakAdmission::Accept);
        let mut fec = NullFecEngine;
        let pak = rtp_pak(&mut pool, 1);
        is.receive_one(&mut pool, &mut host, &mut fec, pak, Time::ZERO);
        assert_eq!(is.drops.total(), 0);
        assert!(pool.get(pak).is_none());
    }

    #[test]
    fn engine_rejection_counts_pakseq_drop() {
        let mut pool = PakPool::new(4);
        let mut is = FecInputStream::new(true);
        let mut host = FakeHost(PakAdmission::Accept);
        let mut fec = NullFecEngine; // always rejects
        let pak = rtp_pak(&mut pool, 1);
        is.receive_one(&mut pool, &mut host, &mut fec, pak, Time::ZERO);
        assert_eq!(is.drops.get(DropReason::FecEngine), 1);
    }

    #[test]
    fn sm_rejection_counts_state_machine_drop() {
        let mut pool = PakPool::new(4);
        let mut is = FecInputStream::new(true);
        let mut host = FakeHost(PakAdmission::Drop);
        let mut fec = NullFecEngine;
        let pak = rtp_pak(&mut pool, 1);
        is.receive_one(&mut pool, &mut host, &mut fec, pak, Time::ZERO);
        assert_eq!(is.drops.get(DropReason::StateMachine), 1);
    }
}
