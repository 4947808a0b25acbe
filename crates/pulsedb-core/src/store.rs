//! The interval store capability.
//!
//! Every operation is idempotent so the daemon can repeat a step after a
//! failure or a restart without duplicating an interval:
//!
//! | operation      | effect                                               |
//! |----------------|------------------------------------------------------|
//! | `pulse_on`     | open an interval at `start` unless it exists         |
//! | `pulse_off`    | set `stop` on the interval opened at `start`         |
//! | `pulse_on_off` | as `pulse_off`, inserting a closed interval if absent|
//! | `pulse_cancel` | delete the interval opened at `start`                |
//! | `pulse_resume` | make the interval at `start` open again (upsert)     |
//! | `pulse_reset`  | record a meter reset unless the last record is one   |

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::event::{MeterId, Timestamp};

/// Result of a single store call.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Backend that records pulse intervals.
pub trait PulseStore {
    fn pulse_on(&mut self, meter: MeterId, start: Timestamp) -> StoreResult<()>;

    fn pulse_off(&mut self, meter: MeterId, start: Timestamp, stop: Timestamp) -> StoreResult<()>;

    fn pulse_on_off(
        &mut self,
        meter: MeterId,
        start: Timestamp,
        stop: Timestamp,
    ) -> StoreResult<()>;

    fn pulse_cancel(&mut self, meter: MeterId, start: Timestamp) -> StoreResult<()>;

    fn pulse_resume(&mut self, meter: MeterId, start: Timestamp) -> StoreResult<()>;

    fn pulse_reset(&mut self, meter: MeterId) -> StoreResult<()>;
}

/// One store call, as decided by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    On { start: Timestamp },
    Off { start: Timestamp, stop: Timestamp },
    OnOff { start: Timestamp, stop: Timestamp },
    Cancel { start: Timestamp },
    Resume { start: Timestamp },
    Reset,
}

impl StoreOp {
    /// Operation name as used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::On { .. } => "pulse_on",
            Self::Off { .. } => "pulse_off",
            Self::OnOff { .. } => "pulse_on_off",
            Self::Cancel { .. } => "pulse_cancel",
            Self::Resume { .. } => "pulse_resume",
            Self::Reset => "pulse_reset",
        }
    }

    pub fn apply(&self, store: &mut dyn PulseStore, meter: MeterId) -> StoreResult<()> {
        match *self {
            Self::On { start } => store.pulse_on(meter, start),
            Self::Off { start, stop } => store.pulse_off(meter, start, stop),
            Self::OnOff { start, stop } => store.pulse_on_off(meter, start, stop),
            Self::Cancel { start } => store.pulse_cancel(meter, start),
            Self::Resume { start } => store.pulse_resume(meter, start),
            Self::Reset => store.pulse_reset(meter),
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On { start } | Self::Cancel { start } | Self::Resume { start } => {
                write!(f, "{}({start})", self.name())
            }
            Self::Off { start, stop } | Self::OnOff { start, stop } => {
                write!(f, "{}({start}, {stop})", self.name())
            }
            Self::Reset => write!(f, "{}()", self.name()),
        }
    }
}

/// A stored row: either an interval (open while `stop` is `None`) or a
/// reset marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub meter: MeterId,
    pub start: Option<Timestamp>,
    pub stop: Option<Timestamp>,
    pub reset: bool,
}

impl Interval {
    #[must_use]
    pub fn closed(meter: MeterId, start: Timestamp, stop: Timestamp) -> Self {
        Self {
            meter,
            start: Some(start),
            stop: Some(stop),
            reset: false,
        }
    }

    #[must_use]
    pub fn open(meter: MeterId, start: Timestamp) -> Self {
        Self {
            meter,
            start: Some(start),
            stop: None,
            reset: false,
        }
    }

    #[must_use]
    pub fn reset_marker(meter: MeterId) -> Self {
        Self {
            meter,
            start: None,
            stop: None,
            reset: true,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<Interval>,
    calls: Vec<(MeterId, StoreOp)>,
    attempts: usize,
    fail_next: usize,
    /// Calls left before one is applied but reported as failed.
    lose_reply_after: Option<usize>,
}

impl MemoryState {
    fn position(&self, meter: MeterId, start: Timestamp) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.meter == meter && row.start == Some(start))
    }

    fn set_stop(&mut self, meter: MeterId, start: Timestamp, stop: Option<Timestamp>) -> bool {
        match self.position(meter, start) {
            Some(index) => {
                self.rows[index].stop = stop;
                true
            }
            None => false,
        }
    }
}

/// In-process store with the same idempotent semantics as [`SqliteStore`].
///
/// Clones share state. Successful calls are logged in order; `fail_next`
/// makes the following calls fail with [`StoreError::Unavailable`] without
/// touching the rows. `lose_reply_after` makes one call take effect and
/// still report a failure, as if the caller died right after the commit.
///
/// [`SqliteStore`]: crate::sqlite::SqliteStore
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` calls.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Let `count` calls succeed, then apply the next one but report it as
    /// failed. Later calls behave normally.
    pub fn lose_reply_after(&self, count: usize) {
        self.lock().lose_reply_after = Some(count);
    }

    /// Drop any pending injected failure.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.fail_next = 0;
        state.lose_reply_after = None;
    }

    /// Successful calls, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<StoreOp> {
        self.lock().calls.iter().map(|(_, op)| *op).collect()
    }

    /// Calls including failed ones.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// All rows for `meter`, in insertion order.
    #[must_use]
    pub fn rows(&self, meter: MeterId) -> Vec<Interval> {
        self.lock()
            .rows
            .iter()
            .filter(|row| row.meter == meter)
            .copied()
            .collect()
    }

    /// Interval rows for `meter`, without reset markers.
    #[must_use]
    pub fn intervals(&self, meter: MeterId) -> Vec<Interval> {
        self.rows(meter).into_iter().filter(|row| !row.reset).collect()
    }

    #[must_use]
    pub fn resets(&self, meter: MeterId) -> usize {
        self.rows(meter).iter().filter(|row| row.reset).count()
    }

    fn call(
        &mut self,
        meter: MeterId,
        op: StoreOp,
        apply: impl FnOnce(&mut MemoryState),
    ) -> StoreResult<()> {
        let mut state = self.lock();
        state.attempts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Unavailable(format!("injected failure for {op}")));
        }
        apply(&mut state);
        state.calls.push((meter, op));
        match state.lose_reply_after {
            Some(0) => {
                state.lose_reply_after = None;
                Err(StoreError::Unavailable(format!("reply lost for {op}")))
            }
            Some(left) => {
                state.lose_reply_after = Some(left - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl PulseStore for MemoryStore {
    fn pulse_on(&mut self, meter: MeterId, start: Timestamp) -> StoreResult<()> {
        self.call(meter, StoreOp::On { start }, |state| {
            if state.position(meter, start).is_none() {
                state.rows.push(Interval::open(meter, start));
            }
        })
    }

    fn pulse_off(&mut self, meter: MeterId, start: Timestamp, stop: Timestamp) -> StoreResult<()> {
        self.call(meter, StoreOp::Off { start, stop }, |state| {
            state.set_stop(meter, start, Some(stop));
        })
    }

    fn pulse_on_off(
        &mut self,
        meter: MeterId,
        start: Timestamp,
        stop: Timestamp,
    ) -> StoreResult<()> {
        self.call(meter, StoreOp::OnOff { start, stop }, |state| {
            if !state.set_stop(meter, start, Some(stop)) {
                state.rows.push(Interval::closed(meter, start, stop));
            }
        })
    }

    fn pulse_cancel(&mut self, meter: MeterId, start: Timestamp) -> StoreResult<()> {
        self.call(meter, StoreOp::Cancel { start }, |state| {
            state
                .rows
                .retain(|row| !(row.meter == meter && row.start == Some(start)));
        })
    }

    fn pulse_resume(&mut self, meter: MeterId, start: Timestamp) -> StoreResult<()> {
        self.call(meter, StoreOp::Resume { start }, |state| {
            if !state.set_stop(meter, start, None) {
                state.rows.push(Interval::open(meter, start));
            }
        })
    }

    fn pulse_reset(&mut self, meter: MeterId) -> StoreResult<()> {
        self.call(meter, StoreOp::Reset, |state| {
            let last_is_reset = state
                .rows
                .iter()
                .rev()
                .find(|row| row.meter == meter)
                .is_some_and(|row| row.reset);
            if !last_is_reset {
                state.rows.push(Interval::reset_marker(meter));
            }
        })
    }
}
