//! Shared test infrastructure for pulsedb-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::Rig;
//! ```

#![allow(dead_code)]

use pulsedb_core::daemon::{Daemon, DaemonSettings};
use pulsedb_core::event::{Event, MeterId, Timestamp};
use pulsedb_core::queue::MemoryQueue;
use pulsedb_core::retry::RecordingSleeper;
use pulsedb_core::signals::SignalGate;
use pulsedb_core::store::MemoryStore;

pub const METER: MeterId = 1;

pub type TestDaemon = Daemon<MemoryQueue, MemoryQueue, MemoryStore>;

/// Queues, store and sleeper that outlive any one daemon, so a test can
/// drop a daemon mid-stream and start another over the same state.
pub struct Rig {
    pub queue: MemoryQueue,
    pub backup: MemoryQueue,
    pub store: MemoryStore,
    pub sleeper: RecordingSleeper,
    pub gate: SignalGate,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            queue: MemoryQueue::new("/meter", 1024),
            backup: MemoryQueue::backup("/meter~"),
            store: MemoryStore::new(),
            sleeper: RecordingSleeper::new(),
            gate: SignalGate::inert(),
        }
    }

    pub fn daemon(&self) -> TestDaemon {
        self.daemon_with(DaemonSettings::new(METER))
    }

    pub fn daemon_with(&self, settings: DaemonSettings) -> TestDaemon {
        Daemon::new(
            self.queue.clone(),
            self.backup.clone(),
            self.store.clone(),
            self.gate.clone(),
            settings,
        )
        .with_sleeper(self.sleeper.clone())
    }

    pub fn send(&self, events: &[Event]) {
        for event in events {
            self.queue.send(event).expect("main queue has room");
        }
    }

    /// Feed `events` to a fresh daemon and run it until the queue drains.
    pub fn run(&self, events: &[Event]) -> TestDaemon {
        self.send(events);
        let mut daemon = self.daemon();
        daemon.run().expect("daemon run");
        daemon
    }
}

pub fn at(secs: u64, micros: u32) -> Timestamp {
    Timestamp::new(secs, micros)
}

pub fn on(secs: u64, micros: u32) -> Event {
    Event::on(at(secs, micros))
}

pub fn off(secs: u64, micros: u32) -> Event {
    Event::off(at(secs, micros))
}
