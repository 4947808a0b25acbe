//! Durable mirror of the pulse buffer.
//!
//! [`BackupLog`] keeps a copy of what it believes the backup queue holds so
//! that a rewrite can retire a prefix by popping instead of draining and
//! refilling the whole queue.

use tracing::{trace, warn};

use crate::buffer::{BUFFER_CAPACITY, Events};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::queue::BackupMedium;

/// Records the backup queue holds.
pub const BACKUP_CAPACITY: usize = BUFFER_CAPACITY;

/// Buffer mirror over a [`BackupMedium`].
#[derive(Debug)]
pub struct BackupLog<M> {
    medium: M,
    mirror: Events,
}

impl<M: BackupMedium> BackupLog<M> {
    pub fn new(medium: M) -> Self {
        Self {
            medium,
            mirror: Events::new(),
        }
    }

    /// What the backup queue holds, oldest first.
    #[must_use]
    pub fn contents(&self) -> &[Event] {
        &self.mirror
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn into_inner(self) -> M {
        self.medium
    }

    /// Empty the queue, returning at most [`BACKUP_CAPACITY`] records.
    ///
    /// Extra records, which only a foreign writer could have added, are
    /// dropped with a warning.
    pub fn drain(&mut self) -> Result<Events> {
        let mut drained = Events::new();
        let mut dropped = 0usize;
        while let Some(event) = self.medium.pop()? {
            if drained.push(event).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(
                queue = self.medium.name(),
                dropped, "backup queue held more records than the buffer can"
            );
        }
        self.mirror.clear();
        trace!(queue = self.medium.name(), count = drained.len(), "drained backup");
        Ok(drained)
    }

    /// Mirror one appended event.
    pub fn append(&mut self, event: &Event) -> Result<()> {
        if self.mirror.is_full() {
            return Err(Error::Invariant(format!(
                "backup mirror full, cannot append {event}"
            )));
        }
        self.medium.push(event)?;
        let _ = self.mirror.push(*event);
        Ok(())
    }

    /// Make the queue hold exactly `events`.
    ///
    /// When `events` is a suffix of the current contents only the retired
    /// prefix is popped; otherwise the queue is drained and refilled.
    pub fn rewrite(&mut self, events: &[Event]) -> Result<()> {
        if self.mirror.as_slice() == events {
            return Ok(());
        }
        let mut mirror = Events::new();
        for event in events {
            mirror.push(*event).map_err(|rejected| {
                Error::Invariant(format!("backup rewrite too long at {rejected}"))
            })?;
        }
        if self.mirror.ends_with(events) {
            let retired = self.mirror.len() - events.len();
            for _ in 0..retired {
                self.medium.pop()?;
            }
            trace!(queue = self.medium.name(), retired, "retired backup prefix");
        } else {
            self.drain()?;
            for event in events {
                self.medium.push(event)?;
            }
            trace!(queue = self.medium.name(), count = events.len(), "rewrote backup");
        }
        self.mirror = mirror;
        Ok(())
    }
}
