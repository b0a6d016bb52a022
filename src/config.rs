// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Module-init configuration knobs (`spec.md` §6 "Configuration knobs",
//! expanded per SPEC_FULL.md §10.3).
//!
//! There is no persistent state and no file/serde-based configuration
//! format — `spec.md` §6 is explicit that persistent state is out of scope,
//! and the teacher repo's own configuration (`SessionOptions`,
//! `PlayOptions`) is a plain constructor-argument struct, not a deserialized
//! document. This module follows that convention.

use std::time::Duration;

/// MPEG-TS TLV parsing knobs (`spec.md` §6).
#[derive(Debug, Clone, Copy)]
pub struct TlvParseConfig {
    pub pat_repeats: u8,
    pub pmt_repeats: u8,
    pub num_pcrs: u8,
    pub include_discontinuity_indicator: bool,
    pub include_random_access: bool,
}

impl Default for TlvParseConfig {
    fn default() -> Self {
        TlvParseConfig {
            pat_repeats: 2,
            pmt_repeats: 2,
            num_pcrs: 2,
            include_discontinuity_indicator: true,
            include_random_access: true,
        }
    }
}

/// A debug-only fault injector (`spec.md` §4.3 step 1, §4.4 step 7;
/// SPEC_FULL.md §12.4). Disabled (`None`) by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropSim {
    /// Drop every Nth packet (1-indexed); `0` disables.
    pub drop_every: u32,
}

impl DropSim {
    pub fn disabled() -> Self {
        DropSim { drop_every: 0 }
    }

    /// Returns whether the `n`th (1-indexed) packet observed should be
    /// simulated as dropped.
    pub fn should_drop(&self, n: u64) -> bool {
        self.drop_every != 0 && n % u64::from(self.drop_every) == 0
    }
}

/// Pool and table sizing, set once at module init (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub max_channels: usize,
    pub max_streams_per_channel: usize,
    pub app_paks_per_rcc: usize,
    pub packet_pool_size: usize,
    pub histogram_bounds_ns: Vec<u64>,
    pub tlv: TlvParseConfig,
    pub activity_timer_period: Duration,
    pub activity_timeout: Duration,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        ModuleConfig {
            max_channels: 256,
            max_streams_per_channel: 3,
            app_paks_per_rcc: 64,
            packet_pool_size: 4096,
            histogram_bounds_ns: vec![
                1_000_000,
                10_000_000,
                50_000_000,
                100_000_000,
                500_000_000,
            ],
            tlv: TlvParseConfig::default(),
            activity_timer_period: Duration::from_millis(50),
            activity_timeout: Duration::from_millis(200),
        }
    }
}

/// Per-channel RCC timing parameters learned from `process_app` (`spec.md`
/// §3 "Channel": "Stores ... RCC timing parameters").
#[derive(Debug, Clone, Copy, Default)]
pub struct RccParams {
    pub dt_earliest_join: Duration,
    pub dt_repair_end: Duration,
    pub er_holdoff_time: Duration,
    pub first_repair_deadline: Duration,
    pub start_seq_num: u32,
    pub act_min_backfill: Duration,
    pub act_backfill_at_join: Duration,
    pub min_backfill: Duration,
    pub max_fastfill: Duration,
    pub fast_fill_time_server: Duration,
    pub memory_optimized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_sim_disabled_never_drops() {
        let sim = DropSim::disabled();
        for n in 1..100 {
            assert!(!sim.should_drop(n));
        }
    }

    #[test]
    fn drop_sim_every_nth() {
        let sim = DropSim { drop_every: 3 };
        assert!(!sim.should_drop(1));
        assert!(!sim.should_drop(2));
        assert!(sim.should_drop(3));
        assert!(sim.should_drop(6));
    }
}
