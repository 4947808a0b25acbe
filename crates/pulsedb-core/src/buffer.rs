//! The bounded buffer of unresolved pulse events.
//!
//! Pulses (resets excluded) always form a prefix of `On, Off, On`. At most
//! one reset is held; it may sit anywhere in the sequence and is retired
//! before any pulse work.

use std::fmt;

use heapless::Vec as BoundedVec;

use crate::error::{Error, Result};
use crate::event::{Event, PulseKind, Timestamp};

/// Events the buffer (and the backup queue) can hold.
pub const BUFFER_CAPACITY: usize = 3;

/// Fixed-capacity event sequence.
pub type Events = BoundedVec<Event, BUFFER_CAPACITY>;

/// Whether the store already knows about the open interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenState {
    /// The leading On has not been sent.
    Unreported,
    /// `pulse_on` or `pulse_resume` succeeded in this process.
    Reported,
    /// Restored after a restart; the store may or may not have it.
    Unknown,
}

impl OpenState {
    /// Whether a cancel is needed to undo the open interval.
    #[must_use]
    pub fn may_be_stored(self) -> bool {
        !matches!(self, Self::Unreported)
    }

    /// Whether the store is known to hold the open interval.
    #[must_use]
    pub fn is_reported(self) -> bool {
        matches!(self, Self::Reported)
    }
}

/// Why an event was dropped on admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Off with no open pulse.
    UnmatchedOff,
    /// On while a pulse is already open.
    DuplicateOn,
    /// Reset while one is already pending.
    DuplicateReset,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmatchedOff => write!(f, "off without a matching on"),
            Self::DuplicateOn => write!(f, "on while already on"),
            Self::DuplicateReset => write!(f, "reset already pending"),
        }
    }
}

/// What admission did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The event was appended; mirror it with an append.
    Appended,
    /// The event was dropped; nothing changed.
    Discarded(DiscardReason),
    /// An Off after a complete pair dropped every pulse; mirror with a rewrite.
    Cleared,
}

/// The daemon's view of unresolved events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseBuffer {
    events: Events,
    reset_pending: bool,
    open: OpenState,
}

impl Default for PulseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PulseBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Events::new(),
            reset_pending: false,
            open: OpenState::Unreported,
        }
    }

    /// Rebuild from backup contents. The input is normalized first and the
    /// open interval, if any, is marked [`OpenState::Unknown`].
    #[must_use]
    pub fn restore(raw: &[Event]) -> Self {
        let events = normalize(raw);
        let reset_pending = events.iter().any(Event::is_reset);
        Self {
            events,
            reset_pending,
            open: OpenState::Unknown,
        }
    }

    /// All held events in arrival order, including a reset.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn pulses(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(|event| !event.is_reset())
    }

    #[must_use]
    pub fn pulse_count(&self) -> usize {
        self.pulses().count()
    }

    /// Timestamp of the pulse at `index`, resets skipped.
    #[must_use]
    pub fn pulse_at(&self, index: usize) -> Option<Timestamp> {
        self.pulses().nth(index).map(|event| event.at)
    }

    #[must_use]
    pub fn reset_pending(&self) -> bool {
        self.reset_pending
    }

    #[must_use]
    pub fn open_state(&self) -> OpenState {
        self.open
    }

    pub fn set_open_state(&mut self, open: OpenState) {
        self.open = open;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Apply the admission rules to one incoming event.
    pub fn admit(&mut self, event: Event) -> Result<Admission> {
        if event.is_reset() {
            if self.reset_pending {
                return Ok(Admission::Discarded(DiscardReason::DuplicateReset));
            }
            self.push(event)?;
            self.reset_pending = true;
            return Ok(Admission::Appended);
        }

        let admission = match (self.pulse_count(), event.kind) {
            (0, PulseKind::On) => {
                self.push(event)?;
                self.open = OpenState::Unreported;
                Admission::Appended
            }
            (0, _) => Admission::Discarded(DiscardReason::UnmatchedOff),
            (1, PulseKind::Off) => {
                self.push(event)?;
                Admission::Appended
            }
            (1, _) => Admission::Discarded(DiscardReason::DuplicateOn),
            (2, PulseKind::On) => {
                self.push(event)?;
                Admission::Appended
            }
            (2, _) => {
                self.clear_pulses();
                Admission::Cleared
            }
            (count, _) => {
                return Err(Error::Invariant(format!(
                    "admitting {event} into a buffer holding {count} pulses"
                )));
            }
        };
        debug_assert!(self.is_plausible(), "buffer after admit: {self}");
        Ok(admission)
    }

    fn push(&mut self, event: Event) -> Result<()> {
        self.events.push(event).map_err(|rejected| {
            Error::Invariant(format!("buffer full, cannot hold {rejected}"))
        })
    }

    /// Remove the pending reset. Returns whether one was held.
    pub fn take_reset(&mut self) -> bool {
        let had = self.reset_pending;
        self.events.retain(|event| !event.is_reset());
        self.reset_pending = false;
        had
    }

    /// Drop every pulse, keeping a pending reset.
    pub fn clear_pulses(&mut self) {
        self.events.retain(|event| event.is_reset());
    }

    /// Keep only the pulse starting at `start` as an open interval, keeping
    /// a pending reset in place.
    pub fn collapse_to(&mut self, start: Timestamp, open: OpenState) {
        self.events
            .retain(|event| event.is_reset() || (event.is_on() && event.at == start));
        self.open = open;
        debug_assert!(self.is_plausible(), "buffer after collapse: {self}");
    }

    /// Check the structural invariant: pulses form a prefix of On, Off, On
    /// and the reset flag matches the presence of exactly one reset.
    #[must_use]
    pub fn is_plausible(&self) -> bool {
        let resets = self.events.iter().filter(|event| event.is_reset()).count();
        if resets > 1 || (resets == 1) != self.reset_pending {
            return false;
        }
        self.pulses()
            .enumerate()
            .all(|(index, event)| event.kind == expected_kind(index))
    }
}

impl fmt::Display for PulseBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (index, event) in self.events.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{event}")?;
        }
        write!(f, "]")
    }
}

fn expected_kind(index: usize) -> PulseKind {
    if index % 2 == 0 {
        PulseKind::On
    } else {
        PulseKind::Off
    }
}

/// Repair a restored event sequence.
///
/// Resets are stripped and one is put back at the front if any was present.
/// Leading Offs are dropped, of two leading Ons only the later is kept, and
/// the sequence is cut at the first break in On/Off alternation. Applying it
/// twice gives the same result as applying it once.
#[must_use]
pub fn normalize(raw: &[Event]) -> Events {
    let had_reset = raw.iter().any(Event::is_reset);
    let mut pulses: Vec<Event> =
        raw.iter().filter(|event| !event.is_reset()).copied().collect();

    let leading_offs = pulses.iter().take_while(|event| event.is_off()).count();
    pulses.drain(..leading_offs);

    while pulses.len() >= 2 && pulses[0].is_on() && pulses[1].is_on() {
        pulses.remove(0);
    }

    let alternating = pulses
        .iter()
        .enumerate()
        .take_while(|(index, event)| event.kind == expected_kind(*index))
        .count();
    pulses.truncate(alternating);

    let mut events = Events::new();
    if had_reset {
        let _ = events.push(Event::reset());
    }
    for event in pulses {
        if events.push(event).is_err() {
            break;
        }
    }
    events
}
