//! End-to-end recorder scenarios over in-memory queues and store.
//!
//! Each test feeds producer events through a real [`Daemon`] and checks the
//! store calls, the stored intervals and what is left in the buffer and the
//! backup queue.
//!
//! A. Basic pulses: open, noise, dropout, long pulse, reset
//! B. Restarts: restored buffers never duplicate intervals
//! C. Store outages and termination requests

mod common;

use std::time::Duration;

use common::{METER, Rig, at, off, on};
use nix::sys::signal::Signal;
use pulsedb_core::Error;
use pulsedb_core::buffer::OpenState;
use pulsedb_core::daemon::{DaemonSettings, Exit};
use pulsedb_core::event::Event;
use pulsedb_core::retry::RetryPolicy;
use pulsedb_core::store::{Interval, StoreOp};

// =============================================================================
// A. Basic pulses
// =============================================================================

#[test]
fn single_on_opens_an_interval() {
    let rig = Rig::new();
    let daemon = rig.run(&[on(10, 0)]);

    assert_eq!(rig.store.calls(), vec![StoreOp::On { start: at(10, 0) }]);
    assert_eq!(rig.store.rows(METER), vec![Interval::open(METER, at(10, 0))]);
    assert_eq!(daemon.buffer().events(), &[on(10, 0)]);
    assert_eq!(daemon.buffer().open_state(), OpenState::Reported);
    assert_eq!(rig.backup.snapshot(), vec![on(10, 0)]);
}

#[test]
fn short_pulse_is_cancelled() {
    let rig = Rig::new();
    let daemon = rig.run(&[on(10, 0), off(10, 5)]);

    assert_eq!(
        rig.store.calls(),
        vec![
            StoreOp::On { start: at(10, 0) },
            StoreOp::Cancel { start: at(10, 0) },
        ]
    );
    assert!(rig.store.rows(METER).is_empty());
    assert!(daemon.buffer().is_empty());
    assert!(rig.backup.is_empty());
    assert_eq!(daemon.stats().cancelled, 1);
}

#[test]
fn dropout_after_long_on_is_bridged() {
    let rig = Rig::new();
    let daemon = rig.run(&[on(10, 0), off(10, 500_000), on(10, 500_010)]);

    assert_eq!(
        rig.store.calls(),
        vec![
            StoreOp::On { start: at(10, 0) },
            StoreOp::Resume { start: at(10, 0) },
        ]
    );
    assert_eq!(daemon.buffer().events(), &[on(10, 0)]);
    assert_eq!(rig.backup.snapshot(), vec![on(10, 0)]);
    assert_eq!(rig.store.rows(METER), vec![Interval::open(METER, at(10, 0))]);
    assert_eq!(daemon.stats().bridged, 1);
}

#[test]
fn long_pulse_is_recorded() {
    let rig = Rig::new();
    let daemon = rig.run(&[on(10, 0), off(11, 0)]);

    assert_eq!(
        rig.store.calls(),
        vec![
            StoreOp::On { start: at(10, 0) },
            StoreOp::Off {
                start: at(10, 0),
                stop: at(11, 0)
            },
        ]
    );
    assert_eq!(
        rig.store.intervals(METER),
        vec![Interval::closed(METER, at(10, 0), at(11, 0))]
    );
    assert!(daemon.buffer().is_empty());
    assert!(rig.backup.is_empty());
    assert_eq!(daemon.stats().committed, 1);
}

#[test]
fn reset_during_open_pulse_keeps_the_pulse() {
    let rig = Rig::new();
    let daemon = rig.run(&[on(10, 0), Event::reset()]);

    assert_eq!(
        rig.store.calls(),
        vec![StoreOp::On { start: at(10, 0) }, StoreOp::Reset]
    );
    assert_eq!(daemon.buffer().events(), &[on(10, 0)]);
    assert!(!daemon.buffer().reset_pending());
    assert_eq!(rig.backup.snapshot(), vec![on(10, 0)]);
    assert_eq!(rig.store.resets(METER), 1);
}

#[test]
fn reset_is_recorded_before_a_later_off() {
    let rig = Rig::new();
    rig.run(&[on(10, 0), Event::reset(), off(11, 0)]);

    assert_eq!(
        rig.store.calls(),
        vec![
            StoreOp::On { start: at(10, 0) },
            StoreOp::Reset,
            StoreOp::Off {
                start: at(10, 0),
                stop: at(11, 0)
            },
        ]
    );
}

#[test]
fn repeated_resets_leave_one_marker() {
    let rig = Rig::new();
    rig.run(&[Event::reset(), Event::reset()]);
    assert_eq!(rig.store.resets(METER), 1);
}

#[test]
fn noisy_edges_collapse_into_one_pulse() {
    let rig = Rig::new();
    let daemon = rig.run(&[on(10, 0), off(10, 10), on(10, 20), off(12, 0)]);

    assert_eq!(
        rig.store.calls(),
        vec![
            StoreOp::On { start: at(10, 0) },
            StoreOp::Cancel { start: at(10, 0) },
            StoreOp::Resume { start: at(10, 20) },
            StoreOp::Off {
                start: at(10, 20),
                stop: at(12, 0)
            },
        ]
    );
    assert_eq!(
        rig.store.intervals(METER),
        vec![Interval::closed(METER, at(10, 20), at(12, 0))]
    );
    assert!(daemon.buffer().is_empty());
}

#[test]
fn separate_pulses_are_split() {
    let rig = Rig::new();
    rig.run(&[on(1, 0), off(2, 0), on(3, 0), off(4, 0)]);

    assert_eq!(
        rig.store.intervals(METER),
        vec![
            Interval::closed(METER, at(1, 0), at(2, 0)),
            Interval::closed(METER, at(3, 0), at(4, 0)),
        ]
    );
}

#[test]
fn unmatched_off_and_duplicate_on_are_discarded() {
    let rig = Rig::new();
    let daemon = rig.run(&[off(1, 0), on(2, 0), on(3, 0), off(4, 0)]);

    assert_eq!(
        rig.store.intervals(METER),
        vec![Interval::closed(METER, at(2, 0), at(4, 0))]
    );
    assert_eq!(daemon.stats().discarded, 2);
    assert_eq!(daemon.stats().admitted, 2);
}

#[test]
fn settle_sleep_is_bounded_by_the_debounce_window() {
    let rig = Rig::new();
    rig.send(&[on(10, 0), off(11, 0)]);
    // A clock far behind the event must not produce a long sleep.
    let mut daemon = rig.daemon().with_clock(|| at(1, 0));
    daemon.run().unwrap();
    assert_eq!(rig.sleeper.recorded(), vec![Duration::from_millis(50)]);
}

// =============================================================================
// B. Restarts
// =============================================================================

#[test]
fn restart_with_open_pulse_closes_it_once() {
    let rig = Rig::new();
    drop(rig.run(&[on(10, 0)]));

    let daemon = rig.run(&[off(11, 0)]);
    assert_eq!(
        rig.store.intervals(METER),
        vec![Interval::closed(METER, at(10, 0), at(11, 0))]
    );
    // The open interval is re-reported because its state is unknown.
    assert_eq!(
        rig.store.calls(),
        vec![
            StoreOp::On { start: at(10, 0) },
            StoreOp::On { start: at(10, 0) },
            StoreOp::Off {
                start: at(10, 0),
                stop: at(11, 0)
            },
        ]
    );
    assert!(daemon.buffer().is_empty());
}

#[test]
fn restart_after_commit_before_clear_does_not_duplicate() {
    let rig = Rig::new();
    // The interval reached the store but the process died before the
    // buffer was cleared, so the backup still holds the pair.
    let mut store = rig.store.clone();
    StoreOp::OnOff {
        start: at(10, 0),
        stop: at(11, 0),
    }
    .apply(&mut store, METER)
    .unwrap();
    rig.backup.send(&on(10, 0)).unwrap();
    rig.backup.send(&off(11, 0)).unwrap();

    let daemon = rig.run(&[]);
    assert_eq!(
        rig.store.intervals(METER),
        vec![Interval::closed(METER, at(10, 0), at(11, 0))]
    );
    assert!(daemon.buffer().is_empty());
    assert!(rig.backup.is_empty());
}

#[test]
fn restart_repairs_an_implausible_backup() {
    let rig = Rig::new();
    for event in [off(1, 0), on(2, 0), on(3, 0)] {
        rig.backup.send(&event).unwrap();
    }
    let mut daemon = rig.daemon();
    daemon.load().unwrap();
    assert_eq!(daemon.buffer().events(), &[on(3, 0)]);
    assert_eq!(daemon.buffer().open_state(), OpenState::Unknown);
    assert_eq!(rig.backup.snapshot(), vec![on(3, 0)]);
    assert_eq!(rig.store.attempts(), 0);
}

#[test]
fn restart_with_pending_reset_records_it_first() {
    let rig = Rig::new();
    rig.backup.send(&on(5, 0)).unwrap();
    rig.backup.send(&Event::reset()).unwrap();

    rig.run(&[]);
    assert_eq!(
        rig.store.calls(),
        vec![StoreOp::Reset, StoreOp::On { start: at(5, 0) }]
    );
    assert_eq!(rig.backup.snapshot(), vec![on(5, 0)]);
}

#[test]
fn crash_after_reset_commit_leaves_one_marker() {
    let rig = Rig::new();
    rig.send(&[on(10, 0), Event::reset(), off(11, 0)]);
    // pulse_on succeeds; pulse_reset lands but the process dies before the
    // reset leaves the backup queue.
    rig.store.lose_reply_after(1);
    let single_attempt = DaemonSettings {
        retry: RetryPolicy {
            max_attempts: Some(1),
            ..RetryPolicy::store()
        },
        ..DaemonSettings::new(METER)
    };
    assert!(matches!(
        rig.daemon_with(single_attempt).run(),
        Err(Error::Store(_))
    ));
    assert_eq!(rig.backup.snapshot(), vec![on(10, 0), Event::reset()]);

    rig.store.clear_faults();
    rig.run(&[]);
    assert_eq!(
        rig.store.rows(METER),
        vec![
            Interval::closed(METER, at(10, 0), at(11, 0)),
            Interval::reset_marker(METER),
        ]
    );
    assert!(rig.backup.is_empty());
}

// =============================================================================
// C. Outages and termination
// =============================================================================

#[test]
fn store_outage_is_retried_until_it_recovers() {
    let rig = Rig::new();
    rig.store.fail_next(5);
    let daemon = rig.run(&[on(10, 0), off(11, 0)]);

    assert_eq!(
        rig.sleeper.recorded(),
        [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
    );
    assert_eq!(daemon.stats().retries, 5);
    assert_eq!(rig.store.attempts(), 7);
    assert_eq!(
        rig.store.intervals(METER),
        vec![Interval::closed(METER, at(10, 0), at(11, 0))]
    );
}

#[test]
fn termination_request_stops_at_the_loop_boundary() {
    let rig = Rig::new();
    rig.send(&[on(10, 0), off(11, 0)]);
    rig.gate.request(Signal::SIGTERM);

    let mut daemon = rig.daemon();
    assert_eq!(daemon.run().unwrap(), Exit::Terminated(Signal::SIGTERM));
    assert_eq!(rig.queue.len(), 2);
    assert!(rig.store.calls().is_empty());

    // A new process picks up where the old one stopped.
    let mut daemon = rig.daemon();
    assert_eq!(daemon.run().unwrap(), Exit::Drained);
    assert_eq!(
        rig.store.intervals(METER),
        vec![Interval::closed(METER, at(10, 0), at(11, 0))]
    );
}
