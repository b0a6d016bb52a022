// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TS-Rapid-Acquisition-Point TLV decode and synthetic RTP header
//! construction over TS-APP packets, `spec.md` §4.9 and §9 ("APP TLV
//! parser: pure function from bytes to a decoded stream of TS packets plus
//! callbacks for PAT/PMT/PCR/PTS").

use crate::config::TlvParseConfig;
use crate::error::{err, ErrorInt, Result};
use crate::extseq::ExtSeq;
use crate::pak::{PakData, PakPool, PakRef, DP_PAK_PAYLOAD_LEN, TS_PACKET_LEN};
use crate::rtp::RTP_FIXED_HEADER_LEN;

/// Maximum size of a captured PAT/PMT section buffer (`spec.md` §4.9: "≤
/// `MP_PSISECTION_LEN` each").
pub const MP_PSISECTION_LEN: usize = 4096;

/// TLV tags in the TS-Rapid-Acquisition-Point payload. The wire format
/// isn't externally specified beyond "TLVs decoded into MPEG-TS packets"
/// (`spec.md` glossary); this is a minimal, self-consistent encoding
/// sufficient to drive the PSI-capture and TS-reassembly contracts §4.9
/// names: `tag:u8, len:u16 (big-endian), payload[len]`, repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    TsPacket = 0,
    Pat = 1,
    Pmt = 2,
    Pcr = 3,
    Pts = 4,
}

impl Tag {
    fn from_u8(b: u8) -> Option<Tag> {
        match b {
            0 => Some(Tag::TsPacket),
            1 => Some(Tag::Pat),
            2 => Some(Tag::Pmt),
            3 => Some(Tag::Pcr),
            4 => Some(Tag::Pts),
            _ => None,
        }
    }
}

/// Callbacks invoked while decoding, rather than global parser state
/// (`spec.md` §9).
pub trait PsiSink {
    fn on_pat(&mut self, section: &[u8]);
    fn on_pmt(&mut self, section: &[u8]);
    fn on_pcr(&mut self, base: u64);
    fn on_pts(&mut self, base: u64);
}

/// Per-channel cached PAT/PMT/PCR/PTS, exposed via `get_pat`/`get_pmt`/
/// `get_pcr`/`get_pts` (`spec.md` §4.9).
#[derive(Debug, Default, Clone)]
pub struct PsiCapture {
    pat: Vec<u8>,
    pmt: Vec<u8>,
    pcr: Option<u64>,
    pts: Option<u64>,
}

impl PsiCapture {
    pub fn get_pat(&self) -> &[u8] {
        &self.pat
    }

    pub fn get_pmt(&self) -> &[u8] {
        &self.pmt
    }

    pub fn get_pcr(&self) -> Option<u64> {
        self.pcr
    }

    pub fn get_pts(&self) -> Option<u64> {
        self.pts
    }
}

impl PsiSink for PsiCapture {
    fn on_pat(&mut self, section: &[u8]) {
        self.pat.clear();
        self.pat
            .extend_from_slice(&section[..section.len().min(MP_PSISECTION_LEN)]);
    }

    fn on_pmt(&mut self, section: &[u8]) {
        self.pmt.clear();
        self.pmt
            .extend_from_slice(&section[..section.len().min(MP_PSISECTION_LEN)]);
    }

    fn on_pcr(&mut self, base: u64) {
        self.pcr = Some(base);
    }

    fn on_pts(&mut self, base: u64) {
        self.pts = Some(base);
    }
}

/// Decodes a TSRAP TLV buffer into a contiguous stream of 188-byte MPEG-TS
/// packets, invoking `sink` for PAT/PMT/PCR/PTS sections along the way.
///
/// `cfg` bounds how many PAT/PMT repeats and PCRs are honored — extra
/// repeats beyond the configured count are still parsed (to stay in sync
/// with the TLV stream) but not re-delivered to `sink`.
pub fn parse_tsrap(bytes: &[u8], cfg: &TlvParseConfig, sink: &mut dyn PsiSink) -> Result<Vec<u8>> {
    let mut ts = Vec::new();
    let mut pat_seen = 0u8;
    let mut pmt_seen = 0u8;
    let mut pcr_seen = 0u8;
    let mut i = 0usize;
    while i < bytes.len() {
        if i + 3 > bytes.len() {
            return Err(err!(InvalidApp, "truncated TLV header"));
        }
        let tag_byte = bytes[i];
        let len = u16::from_be_bytes([bytes[i + 1], bytes[i + 2]]) as usize;
        let payload_start = i + 3;
        let payload_end = payload_start
            .checked_add(len)
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| err!(InvalidApp, "TLV length overruns buffer"))?;
        let payload = &bytes[payload_start..payload_end];
        match Tag::from_u8(tag_byte) {
            Some(Tag::TsPacket) => {
                if len != TS_PACKET_LEN {
                    return Err(err!(InvalidApp, "TS packet TLV entry is not 188 bytes"));
                }
                ts.extend_from_slice(payload);
            }
            Some(Tag::Pat) => {
                if pat_seen < cfg.pat_repeats {
                    sink.on_pat(payload);
                }
                pat_seen = pat_seen.saturating_add(1);
            }
            Some(Tag::Pmt) => {
                if pmt_seen < cfg.pmt_repeats {
                    sink.on_pmt(payload);
                }
                pmt_seen = pmt_seen.saturating_add(1);
            }
            Some(Tag::Pcr) => {
                if len != 8 {
                    return Err(err!(InvalidApp, "PCR TLV entry is not 8 bytes"));
                }
                if pcr_seen < cfg.num_pcrs {
                    sink.on_pcr(u64::from_be_bytes(payload.try_into().unwrap()));
                }
                pcr_seen = pcr_seen.saturating_add(1);
            }
            Some(Tag::Pts) => {
                if len != 8 {
                    return Err(err!(InvalidApp, "PTS TLV entry is not 8 bytes"));
                }
                sink.on_pts(u64::from_be_bytes(payload.try_into().unwrap()));
            }
            None => return Err(err!(InvalidApp, "unknown TLV tag ({})", tag_byte)),
        }
        i = payload_end;
    }
    if ts.is_empty() || ts.len() % TS_PACKET_LEN != 0 {
        return Err(err!(InvalidApp, "decoded TS buffer is not a whole number of 188-byte packets"));
    }
    Ok(ts)
}

/// Splits a decoded TS buffer into `DP_PAK_PAYLOAD_LEN`-sized (1316-byte)
/// dataplane packets, allocates a pool slot per chunk, tags it `App`, and
/// seeds its extended sequence as `start_seq_num - remaining` (`spec.md`
/// §4.9 step 4).
///
/// Trailing bytes that don't fill a full `NUM_TSPKTS_PER_DP_PAK`-packet
/// chunk are dropped — the caller already validated that `ts.len()` is a
/// whole number of 188-byte TS packets, but it need not be a whole number
/// of 1316-byte dataplane packets.
pub fn chunk_into_app_paks(
    pool: &mut PakPool,
    ts: &[u8],
    start_seq_num: u32,
) -> Result<Vec<(ExtSeq, PakRef)>> {
    let num_chunks = ts.len() / DP_PAK_PAYLOAD_LEN;
    let mut out = Vec::with_capacity(num_chunks);
    for (i, chunk) in ts.chunks(DP_PAK_PAYLOAD_LEN).enumerate() {
        if chunk.len() != DP_PAK_PAYLOAD_LEN {
            break;
        }
        let r = pool
            .alloc(DP_PAK_PAYLOAD_LEN + RTP_FIXED_HEADER_LEN, crate::pak::PakKind::App)
            .ok_or_else(|| err!(NoResource, "packet pool exhausted chunking APP buffer"))?;
        let data = pool.get_mut(r).expect("just allocated");
        data.set_content_with_prefix_room(chunk, RTP_FIXED_HEADER_LEN);
        let remaining = (num_chunks - i) as u32;
        let seq = ExtSeq(start_seq_num.wrapping_sub(remaining));
        data.ext_seq = Some(seq);
        out.push((seq, r));
    }
    Ok(out)
}

/// `spec.md` §4.9: `construct_rtp_hdr_over_ts_app(first_repair)`.
///
/// For each queued APP packet (assuming non-strip-RTP mode): verifies
/// `capacity >= 1316 + 12`, shifts the payload right by 12 bytes, copies
/// `first_repair`'s 12-byte RTP header as a template, overwrites the
/// sequence field with the packet's already-assigned extended sequence (low
/// 16 bits, network order), clears the marker/padding/extension bits, sets
/// version 2, payload type MP2T, marker 1.
pub fn construct_rtp_hdr_over_ts_app(
    pool: &mut PakPool,
    app_paks: &[(ExtSeq, PakRef)],
    first_repair_header: &[u8; RTP_FIXED_HEADER_LEN],
) -> Result<()> {
    const MP2T_PAYLOAD_TYPE: u8 = 33;
    for &(seq, pak) in app_paks {
        let data: &mut PakData = pool
            .get_mut(pak)
            .ok_or_else(|| err!(Internal, "APP packet disappeared from pool"))?;
        if data.capacity() < DP_PAK_PAYLOAD_LEN + RTP_FIXED_HEADER_LEN {
            return Err(ErrorInt::NoResourceForRtpHeader.into());
        }
        if !data.room_before(RTP_FIXED_HEADER_LEN) {
            return Err(err!(
                Internal,
                "APP packet missing reserved prefix room for synthetic RTP header"
            ));
        }
        data.retreat_head(RTP_FIXED_HEADER_LEN);
        {
            let head = data.head_mut();
            head[..RTP_FIXED_HEADER_LEN].copy_from_slice(first_repair_header);
            head[0] = (head[0] & 0b0011_1111) | 0b1000_0000; // version 2, clear P/X/CC high bits
            head[1] = 0b1000_0000 | MP2T_PAYLOAD_TYPE; // marker = 1
            let low16 = seq.low16().to_be_bytes();
            head[2] = low16[0];
            head[3] = low16[1];
        }
        data.mpeg_payload_offset = RTP_FIXED_HEADER_LEN;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pak::{PakKind, PakPool, MTU};

    fn tlv_entry(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![tag];
        v.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    fn sample_ts_packets(n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..n {
            let mut pkt = vec![0u8; TS_PACKET_LEN];
            pkt[0] = 0x47;
            pkt[1] = i as u8;
            out.extend_from_slice(&pkt);
        }
        out
    }

    #[test]
    fn parses_ts_packets_and_psi() {
        let mut bytes = Vec::new();
        bytes.extend(tlv_entry(1, b"PATSECTION"));
        bytes.extend(tlv_entry(2, b"PMTSECTION"));
        bytes.extend(tlv_entry(3, &42u64.to_be_bytes()));
        for pkt in sample_ts_packets(7).chunks(TS_PACKET_LEN) {
            bytes.extend(tlv_entry(0, pkt));
        }
        let mut psi = PsiCapture::default();
        let cfg = TlvParseConfig::default();
        let ts = parse_tsrap(&bytes, &cfg, &mut psi).unwrap();
        assert_eq!(ts.len(), 7 * TS_PACKET_LEN);
        assert_eq!(psi.get_pat(), b"PATSECTION");
        assert_eq!(psi.get_pmt(), b"PMTSECTION");
        assert_eq!(psi.get_pcr(), Some(42));
    }

    #[test]
    fn p7_chunking_assigns_expected_sequences() {
        let mut pool = PakPool::new(8);
        let ts = sample_ts_packets(NUM_TSPKTS_AS_4_DP_PAKS);
        let start_seq_num = 1000u32;
        let chunks = chunk_into_app_paks(&mut pool, &ts, start_seq_num).unwrap();
        assert_eq!(chunks.len(), 4);
        let seqs: Vec<u32> = chunks.iter().map(|(s, _)| s.0).collect();
        assert_eq!(seqs, vec![996, 997, 998, 999]);
        for (_, r) in &chunks {
            let data = pool.get(*r).unwrap();
            assert_eq!(data.content_len(), DP_PAK_PAYLOAD_LEN);
            assert_eq!(data.kind, PakKind::App);
        }
    }

    const NUM_TSPKTS_AS_4_DP_PAKS: usize = 4 * crate::pak::NUM_TSPKTS_PER_DP_PAK;

    #[test]
    fn p7_synthetic_rtp_header_fields() {
        let mut pool = PakPool::new(8);
        let ts = sample_ts_packets(crate::pak::NUM_TSPKTS_PER_DP_PAK);
        let chunks = chunk_into_app_paks(&mut pool, &ts, 1000).unwrap();
        let template: [u8; RTP_FIXED_HEADER_LEN] = {
            let mut t = [0u8; RTP_FIXED_HEADER_LEN];
            t[8..12].copy_from_slice(&0xCAFEBABEu32.to_be_bytes());
            t
        };
        construct_rtp_hdr_over_ts_app(&mut pool, &chunks, &template).unwrap();
        let (seq, r) = chunks[0];
        let data = pool.get(r).unwrap();
        assert_eq!(data.mpeg_payload_offset, RTP_FIXED_HEADER_LEN);
        assert_eq!(data.content_len(), DP_PAK_PAYLOAD_LEN + RTP_FIXED_HEADER_LEN);
        let head = data.head();
        assert_eq!(head[0] >> 6, 2); // version 2
        assert_eq!(head[1] & 0x80, 0x80); // marker set
        assert_eq!(head[1] & 0x7F, 33); // MP2T payload type
        assert_eq!(u16::from_be_bytes([head[2], head[3]]), seq.low16());
        assert_eq!(&head[8..12], &0xCAFEBABEu32.to_be_bytes());
        let _ = MTU;
    }
}
