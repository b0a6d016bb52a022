// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! FEC engine contract.
//!
//! The FEC reconstruction algorithm itself (1-D/2-D column/row XOR) is an
//! external collaborator per `spec.md` §1 ("only their interface contracts
//! specified in §6") — this module specifies only the interface the FEC
//! input stream and channel coordinator need: insertion of a tagged FEC
//! packet, and a query for whether the inferred L/D parameters changed
//! (backing the `CHAN_FEC_UPDATE` upcall reason, `spec.md` §6).

use crate::pak::{PakPool, PakRef};

/// Implemented by the out-of-scope FEC reconstruction engine.
pub trait FecEngine {
    /// Accepts a FEC packet already validated and admitted by the state
    /// machine (`spec.md` §4.5 step 4). Returns `false` if the engine
    /// rejected the insertion (counted as a `pakseq_drops` event by the
    /// caller).
    fn insert(&mut self, pool: &mut PakPool, pak: PakRef) -> bool;

    /// Whether the inferred (L, D) FEC matrix dimensions changed since the
    /// last call — backs the `CHAN_FEC_UPDATE` upcall reason.
    fn take_dimensions_changed(&mut self) -> bool;

    /// Commits the FEC bind as part of an RCC `join` or `success`/`abort`
    /// notification (`spec.md` §4.9).
    fn bind_commit(&mut self);
}

/// A no-op FEC engine, used when FEC is globally disabled for a channel
/// (`spec.md` §4.5 step 1) or by tests that don't exercise FEC.
#[derive(Debug, Default)]
pub struct NullFecEngine;

impl FecEngine for NullFecEngine {
    fn insert(&mut self, _pool: &mut PakPool, _pak: PakRef) -> bool {
        false
    }

    fn take_dimensions_changed(&mut self) -> bool {
        false
    }

    fn bind_commit(&mut self) {}
}
