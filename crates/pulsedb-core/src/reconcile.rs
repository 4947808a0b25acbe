//! Debounce and commit decisions.
//!
//! These functions only decide. The daemon performs the resulting store
//! calls with retry and then updates the buffer and backup log.

use std::time::Duration;

use crate::buffer::OpenState;
use crate::event::Timestamp;
use crate::store::StoreOp;

/// True when the phase from `from` to `to` is shorter than `min_pulse`.
/// A backwards step of the clock counts as a zero-length phase.
#[must_use]
pub fn is_noise(from: Timestamp, to: Timestamp, min_pulse: Duration) -> bool {
    u128::from(from.micros_until(to)) < min_pulse.as_micros()
}

/// Resolution of a complete `[on, off]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    /// Too short to be a pulse. Cancel the open interval if the store may
    /// hold it.
    Noise { cancel: Option<StoreOp> },
    /// A real pulse.
    Commit(StoreOp),
}

impl PairOutcome {
    /// The store call to make, if any.
    #[must_use]
    pub fn op(&self) -> Option<StoreOp> {
        match *self {
            Self::Noise { cancel } => cancel,
            Self::Commit(op) => Some(op),
        }
    }

    #[must_use]
    pub fn is_noise(&self) -> bool {
        matches!(self, Self::Noise { .. })
    }
}

fn cancel_if_stored(start: Timestamp, open: OpenState) -> Option<StoreOp> {
    open.may_be_stored().then_some(StoreOp::Cancel { start })
}

/// Decide what a settled `[on, off]` pair means.
#[must_use]
pub fn resolve_pair(
    on: Timestamp,
    off: Timestamp,
    open: OpenState,
    min_pulse: Duration,
) -> PairOutcome {
    if is_noise(on, off, min_pulse) {
        return PairOutcome::Noise {
            cancel: cancel_if_stored(on, open),
        };
    }
    let op = if open.is_reported() {
        StoreOp::Off {
            start: on,
            stop: off,
        }
    } else {
        StoreOp::OnOff {
            start: on,
            stop: off,
        }
    };
    PairOutcome::Commit(op)
}

/// Resolution of `[on0, off1, on2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripleOutcome {
    /// `off1` was a dropout. The pulse continues from `survivor`, which is
    /// reopened with `pulse_resume` after the optional cancel.
    Bridge {
        cancel: Option<StoreOp>,
        survivor: Timestamp,
    },
    /// `[on0, off1]` stands alone; `next` becomes the new unreported open
    /// pulse once `pair` is done.
    Split { pair: PairOutcome, next: Timestamp },
}

/// Decide what three buffered pulses mean.
#[must_use]
pub fn resolve_triple(
    on0: Timestamp,
    off1: Timestamp,
    on2: Timestamp,
    open: OpenState,
    min_pulse: Duration,
) -> TripleOutcome {
    if is_noise(off1, on2, min_pulse) {
        if is_noise(on0, off1, min_pulse) {
            TripleOutcome::Bridge {
                cancel: cancel_if_stored(on0, open),
                survivor: on2,
            }
        } else {
            TripleOutcome::Bridge {
                cancel: None,
                survivor: on0,
            }
        }
    } else {
        TripleOutcome::Split {
            pair: resolve_pair(on0, off1, open, min_pulse),
            next: on2,
        }
    }
}
