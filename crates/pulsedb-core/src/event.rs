//! Pulse events and their fixed-size queue record.
//!
//! The producer and the daemon exchange 16-byte records:
//!
//! ```text
//! offset  size  field
//! 0       8     seconds       (u64, little endian)
//! 8       4     microseconds  (u32, little endian)
//! 12      1     kind          (0 = off, 1 = on, 2 = reset)
//! 13      3     padding       (zero)
//! ```
//!
//! A meter reset carries the sentinel timestamp `seconds == 0`. Decoders treat
//! a record as a reset if it has that timestamp, whatever its kind byte, or if
//! its kind byte is 2, whatever its timestamp. Encoders always write both.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size in bytes of one queue record.
pub const RECORD_SIZE: usize = 16;

const KIND_OFF: u8 = 0;
const KIND_ON: u8 = 1;
const KIND_RESET: u8 = 2;

/// Meter identifier recorded with every interval.
pub type MeterId = u64;

/// Wall-clock instant with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u64,
    pub micros: u32,
}

impl Timestamp {
    /// The reserved timestamp that marks a meter reset.
    pub const RESET_SENTINEL: Self = Self { secs: 0, micros: 0 };

    #[must_use]
    pub const fn new(secs: u64, micros: u32) -> Self {
        Self { secs, micros }
    }

    /// Build from a count of microseconds since the epoch.
    #[must_use]
    pub const fn from_micros(total: u64) -> Self {
        Self {
            secs: total / 1_000_000,
            micros: (total % 1_000_000) as u32,
        }
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: elapsed.as_secs(),
            micros: elapsed.subsec_micros(),
        }
    }

    #[must_use]
    pub const fn is_reset_sentinel(&self) -> bool {
        self.secs == 0
    }

    /// Microseconds since the epoch, saturating at `u64::MAX`.
    #[must_use]
    pub fn as_micros(&self) -> u64 {
        self.secs
            .saturating_mul(1_000_000)
            .saturating_add(u64::from(self.micros))
    }

    /// Microseconds from `self` until `later`; zero if `later` is not after `self`.
    #[must_use]
    pub fn micros_until(&self, later: Self) -> u64 {
        later.as_micros().saturating_sub(self.as_micros())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

/// What the meter contact reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PulseKind {
    On,
    Off,
    Reset,
}

impl fmt::Display for PulseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// One raw notification from the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub at: Timestamp,
    pub kind: PulseKind,
}

/// Reasons a record could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected {RECORD_SIZE} bytes, got {0}")]
    WrongSize(usize),

    #[error("microseconds {0} out of range")]
    MicrosOutOfRange(u32),

    #[error("unknown pulse kind {0}")]
    UnknownKind(u8),
}

impl Event {
    #[must_use]
    pub const fn on(at: Timestamp) -> Self {
        Self {
            at,
            kind: PulseKind::On,
        }
    }

    #[must_use]
    pub const fn off(at: Timestamp) -> Self {
        Self {
            at,
            kind: PulseKind::Off,
        }
    }

    #[must_use]
    pub const fn reset() -> Self {
        Self {
            at: Timestamp::RESET_SENTINEL,
            kind: PulseKind::Reset,
        }
    }

    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.kind == PulseKind::Reset
    }

    #[must_use]
    pub fn is_on(&self) -> bool {
        self.kind == PulseKind::On
    }

    #[must_use]
    pub fn is_off(&self) -> bool {
        self.kind == PulseKind::Off
    }

    /// Encode into the queue record layout.
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let (at, kind) = match self.kind {
            PulseKind::Reset => (Timestamp::RESET_SENTINEL, KIND_RESET),
            PulseKind::On => (self.at, KIND_ON),
            PulseKind::Off => (self.at, KIND_OFF),
        };
        let mut record = [0u8; RECORD_SIZE];
        record[0..8].copy_from_slice(&at.secs.to_le_bytes());
        record[8..12].copy_from_slice(&at.micros.to_le_bytes());
        record[12] = kind;
        record
    }

    /// Decode one queue record.
    pub fn decode(record: &[u8]) -> Result<Self, DecodeError> {
        if record.len() != RECORD_SIZE {
            return Err(DecodeError::WrongSize(record.len()));
        }
        let mut secs = [0u8; 8];
        secs.copy_from_slice(&record[0..8]);
        let mut micros = [0u8; 4];
        micros.copy_from_slice(&record[8..12]);
        let at = Timestamp::new(u64::from_le_bytes(secs), u32::from_le_bytes(micros));

        if at.is_reset_sentinel() || record[12] == KIND_RESET {
            return Ok(Self::reset());
        }
        if at.micros >= 1_000_000 {
            return Err(DecodeError::MicrosOutOfRange(at.micros));
        }
        match record[12] {
            KIND_ON => Ok(Self::on(at)),
            KIND_OFF => Ok(Self::off(at)),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PulseKind::Reset => write!(f, "reset"),
            kind => write!(f, "{kind}@{}", self.at),
        }
    }
}
