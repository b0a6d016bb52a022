// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! IRQ descriptors and upcall plumbing, `spec.md` §3 ("IRQ Descriptor") and
//! §4.9 ("Upcalls/IRQs").

/// One device line per channel (`spec.md` §3: "one per *device*: primary,
/// repair, dpchan").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Primary,
    Repair,
    DpChan,
}

pub const ALL_DEVICES: [Device; 3] = [Device::Primary, Device::Repair, Device::DpChan];

/// Hand-rolled bitflags newtype, same rationale as [`crate::pak::PakFlags`].
macro_rules! bitflags_reason {
    (
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $val:expr;)*
        }
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($ty);

        impl $name {
            $(pub const $flag: $name = $name($val);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub fn bits(self) -> $ty {
                self.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_reason! {
    pub struct Reason: u32 {
        const PRIMARY_SOURCE_CHANGED = 1 << 0;
        const PRIMARY_INACTIVE       = 1 << 1;
        const REPAIR_SOURCE_CHANGED  = 1 << 2;
        const CHAN_RCC_NCSI          = 1 << 3;
        const CHAN_RCC_ABORT         = 1 << 4;
        const CHAN_FAST_FILL_DONE    = 1 << 5;
        const CHAN_FEC_UPDATE        = 1 << 6;
        const CHAN_BURST_DONE        = 1 << 7;
        const CHAN_PRIM_INACTIVE     = 1 << 8;
        const CHAN_GEN_NUM_SYNC      = 1 << 9;
    }
}

/// Per-`(channel, device)` IRQ state (`spec.md` §3).
///
/// Invariant: while `pending`, no new IRQ message is sent for this
/// descriptor, though reason bits keep accumulating in `cause`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IrqDescriptor {
    pending: bool,
    cause: Reason,
    pub input_events: u64,
    pub sent: u64,
    pub dropped: u64,
    pub acknowledged: u64,
    pub spurious_acks: u64,
}

impl IrqDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn cause(&self) -> Reason {
        self.cause
    }

    /// `spec.md` §4.9: `tx_upcall_ev(dev, id, reason)`. Returns `true` if a
    /// new upcall message should be enqueued to the control plane (i.e. this
    /// descriptor transitioned from idle to pending).
    pub fn tx_upcall_ev(&mut self, reason: Reason) -> bool {
        self.input_events += 1;
        self.cause.insert(reason);
        if self.pending {
            self.dropped += 1;
            false
        } else {
            self.pending = true;
            self.sent += 1;
            true
        }
    }

    /// `spec.md` §4.9: `ack_upcall_irq(dev)`. Returns the accumulated cause
    /// bitmap, clearing `cause` and `pending`.
    ///
    /// Per SPEC_FULL.md §13.1, *all* accumulated reason bits are returned,
    /// not just the most recent — this resolves the ambiguous multi-reason
    /// fan-in in the original source in favor of the literal invariant
    /// stated for this descriptor.
    pub fn ack_upcall_irq(&mut self) -> Reason {
        self.acknowledged += 1;
        let cause = self.cause;
        self.cause = Reason::empty();
        self.pending = false;
        cause
    }

    /// Acknowledges without any prior `tx_upcall_ev` — counted as spurious
    /// (used by `poll_upcall_irq` when the control plane suspects lost
    /// upcall messages and polls unconditionally).
    pub fn poll_ack(&mut self) -> Reason {
        if !self.pending && self.cause.is_empty() {
            self.spurious_acks += 1;
        }
        self.ack_upcall_irq()
    }
}
