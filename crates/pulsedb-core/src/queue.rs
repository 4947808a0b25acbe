//! Queue seams between the daemon and its transports.
//!
//! [`EventSource`] is the main inbox the producer writes to; [`BackupMedium`]
//! is the small durable FIFO that mirrors the pulse buffer. Both are
//! implemented by the POSIX message queue adapter and by [`MemoryQueue`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::error::{QueueError, Result};
use crate::event::{Event, RECORD_SIZE};

/// Longest queue name accepted, including the leading '/' and the backup suffix.
pub const MAX_QUEUE_NAME: usize = 255;

/// Result of a blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Event(Event),
    /// The wait was cut short by a signal.
    Interrupted,
    /// No producer can ever deliver again.
    Closed,
}

/// The main event inbox.
pub trait EventSource {
    fn name(&self) -> &str;

    /// Block until the next event, a signal, or end of input.
    fn recv(&mut self) -> Result<Received>;

    /// Take one event if one is already queued.
    fn try_recv(&mut self) -> Result<Option<Event>>;
}

/// Durable FIFO backing the buffer mirror.
pub trait BackupMedium {
    fn name(&self) -> &str;

    fn push(&mut self, event: &Event) -> Result<()>;

    /// Take the oldest record, `None` when empty.
    fn pop(&mut self) -> Result<Option<Event>>;
}

/// Check a main queue name and return the matching backup queue name.
pub fn backup_queue_name(main: &str, suffix: &str) -> Result<String> {
    let reason = if !main.starts_with('/') {
        Some("must start with '/'")
    } else if main.len() < 2 {
        Some("must name a queue after the '/'")
    } else if main[1..].contains('/') {
        Some("must not contain '/' after the first character")
    } else if main.contains('\0') {
        Some("must not contain NUL")
    } else if main.len() + suffix.len() > MAX_QUEUE_NAME {
        Some("is too long once the backup suffix is appended")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(QueueError::InvalidName {
            name: main.to_string(),
            reason,
        }
        .into()),
        None => Ok(format!("{main}{suffix}")),
    }
}

pub(crate) fn decode_record(queue: &str, record: &[u8]) -> Result<Event> {
    Event::decode(record).map_err(|source| {
        QueueError::Malformed {
            name: queue.to_string(),
            source,
        }
        .into()
    })
}

#[derive(Debug)]
enum Slot {
    Record(Vec<u8>),
    Interrupt,
}

#[derive(Debug)]
struct Shared {
    slots: VecDeque<Slot>,
    capacity: usize,
    pushes: usize,
}

/// In-process queue holding encoded records.
///
/// Clones share the same contents, so a test can keep a handle while the
/// daemon owns another. A blocking receive on an empty queue reports
/// [`Received::Closed`] because nothing else can fill it.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    name: String,
    shared: Arc<Mutex<Shared>>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Mutex::new(Shared {
                slots: VecDeque::new(),
                capacity,
                pushes: 0,
            })),
        }
    }

    /// A queue sized like the backup queue.
    #[must_use]
    pub fn backup(name: impl Into<String>) -> Self {
        Self::new(name, crate::backup::BACKUP_CAPACITY)
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue one event as the producer would.
    pub fn send(&self, event: &Event) -> Result<()> {
        self.send_raw(&event.encode())
    }

    /// Enqueue raw bytes, valid or not.
    pub fn send_raw(&self, record: &[u8]) -> Result<()> {
        let mut shared = self.lock();
        let queued = shared
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Record(_)))
            .count();
        if queued >= shared.capacity {
            return Err(QueueError::Full {
                name: self.name.clone(),
                capacity: shared.capacity,
            }
            .into());
        }
        shared.slots.push_back(Slot::Record(record.to_vec()));
        shared.pushes += 1;
        Ok(())
    }

    /// Make the blocking receive at this position report an interruption.
    pub fn interrupt(&self) {
        self.lock().slots.push_back(Slot::Interrupt);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Record(_)))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total records ever accepted by `send`/`push`.
    #[must_use]
    pub fn pushes(&self) -> usize {
        self.lock().pushes
    }

    /// Decoded contents in queue order, skipping undecodable records.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.lock()
            .slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Record(bytes) => Event::decode(bytes).ok(),
                Slot::Interrupt => None,
            })
            .collect()
    }

    fn next_record(&self) -> Option<Vec<u8>> {
        let mut shared = self.lock();
        let index = shared
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Record(_)))?;
        match shared.slots.remove(index) {
            Some(Slot::Record(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

impl EventSource for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv(&mut self) -> Result<Received> {
        let slot = self.lock().slots.pop_front();
        match slot {
            Some(Slot::Record(bytes)) => {
                let event = decode_record(&self.name, &bytes)?;
                trace!(queue = %self.name, %event, "received");
                Ok(Received::Event(event))
            }
            Some(Slot::Interrupt) => Ok(Received::Interrupted),
            None => Ok(Received::Closed),
        }
    }

    fn try_recv(&mut self) -> Result<Option<Event>> {
        match self.next_record() {
            Some(bytes) => {
                let event = decode_record(&self.name, &bytes)?;
                trace!(queue = %self.name, %event, "received without waiting");
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }
}

impl BackupMedium for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, event: &Event) -> Result<()> {
        debug_assert_eq!(event.encode().len(), RECORD_SIZE);
        self.send(event)
    }

    fn pop(&mut self) -> Result<Option<Event>> {
        self.try_recv()
    }
}
