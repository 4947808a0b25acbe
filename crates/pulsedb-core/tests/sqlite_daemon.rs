//! Recorder runs against a real SQLite file.

use pulsedb_core::daemon::{Daemon, DaemonSettings, Exit};
use pulsedb_core::event::{Event, Timestamp};
use pulsedb_core::queue::MemoryQueue;
use pulsedb_core::retry::RecordingSleeper;
use pulsedb_core::signals::SignalGate;
use pulsedb_core::sqlite::SqliteStore;
use pulsedb_core::store::Interval;

const METER: u64 = 42;

fn at(secs: u64) -> Timestamp {
    Timestamp::new(secs, 0)
}

fn daemon(
    queue: &MemoryQueue,
    backup: &MemoryQueue,
    store: SqliteStore,
) -> Daemon<MemoryQueue, MemoryQueue, SqliteStore> {
    Daemon::new(
        queue.clone(),
        backup.clone(),
        store,
        SignalGate::inert(),
        DaemonSettings::new(METER),
    )
    .with_sleeper(RecordingSleeper::new())
}

#[test]
fn pulses_and_reset_land_in_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulses.sqlite3");
    let queue = MemoryQueue::new("/meter", 16);
    let backup = MemoryQueue::backup("/meter~");
    for event in [
        Event::on(at(100)),
        Event::off(at(101)),
        Event::reset(),
        Event::on(at(200)),
        Event::off(at(203)),
        Event::on(at(300)),
    ] {
        queue.send(&event).unwrap();
    }

    let mut recorder = daemon(&queue, &backup, SqliteStore::new(&path));
    assert_eq!(recorder.run().unwrap(), Exit::Drained);
    drop(recorder);

    let mut store = SqliteStore::new(&path);
    assert_eq!(
        store.rows(METER).unwrap(),
        vec![
            Interval::closed(METER, at(100), at(101)),
            Interval::reset_marker(METER),
            Interval::closed(METER, at(200), at(203)),
            Interval::open(METER, at(300)),
        ]
    );
    assert_eq!(backup.snapshot(), vec![Event::on(at(300))]);
}

#[test]
fn restart_over_sqlite_closes_the_open_interval_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulses.sqlite3");
    let queue = MemoryQueue::new("/meter", 16);
    let backup = MemoryQueue::backup("/meter~");

    queue.send(&Event::on(at(10))).unwrap();
    daemon(&queue, &backup, SqliteStore::new(&path)).run().unwrap();

    queue.send(&Event::off(at(12))).unwrap();
    daemon(&queue, &backup, SqliteStore::new(&path)).run().unwrap();

    let mut store = SqliteStore::new(&path);
    assert_eq!(
        store.intervals(METER).unwrap(),
        vec![Interval::closed(METER, at(10), at(12))]
    );
    assert!(backup.is_empty());
}

#[test]
fn unreachable_database_blocks_until_retried() {
    let dir = tempfile::tempdir().unwrap();
    // The parent directory does not exist, so every attempt fails.
    let store = SqliteStore::new(dir.path().join("missing").join("pulses.sqlite3"));
    let queue = MemoryQueue::new("/meter", 4);
    let backup = MemoryQueue::backup("/meter~");
    queue.send(&Event::on(at(10))).unwrap();

    let settings = DaemonSettings {
        retry: pulsedb_core::RetryPolicy {
            max_attempts: Some(3),
            ..pulsedb_core::RetryPolicy::store()
        },
        ..DaemonSettings::new(METER)
    };
    let sleeper = RecordingSleeper::new();
    let mut recorder = Daemon::new(queue, backup.clone(), store, SignalGate::inert(), settings)
        .with_sleeper(sleeper.clone());

    assert!(matches!(recorder.run(), Err(pulsedb_core::Error::Store(_))));
    assert_eq!(sleeper.recorded().len(), 2);
    // The event is still in the backup queue for the next process.
    assert_eq!(backup.snapshot(), vec![Event::on(at(10))]);
}
