//! The pulse recorder main loop.
//!
//! One [`Daemon`] owns the event queue, the backup log, the store and the
//! pulse buffer. Each loop iteration:
//!
//! 1. stops if a termination signal was deferred;
//! 2. records a pending reset, if any;
//! 3. reconciles the buffered pulses (report an open pulse, settle and
//!    resolve a pair, or resolve three pulses);
//! 4. waits for the next event and admits it.
//!
//! Buffer and backup mutations run inside held critical sections. Store
//! calls and the settle wait run outside them, so a kill there is safe: the
//! backup still holds the events and every store operation is idempotent.

use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::backup::BackupLog;
use crate::buffer::{Admission, OpenState, PulseBuffer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, MeterId, Timestamp};
use crate::queue::{BackupMedium, EventSource, Received};
use crate::reconcile::{self, PairOutcome, TripleOutcome};
use crate::retry::{RetryPolicy, Sleeper, ThreadSleeper, retry_with};
use crate::signals::SignalGate;
use crate::store::{PulseStore, StoreOp};

/// Per-meter daemon settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSettings {
    pub meter: MeterId,
    /// Phases shorter than this are electrical noise.
    pub min_pulse: Duration,
    /// Backoff for store calls.
    pub retry: RetryPolicy,
}

impl DaemonSettings {
    #[must_use]
    pub fn new(meter: MeterId) -> Self {
        Self {
            meter,
            min_pulse: Duration::from_millis(50),
            retry: RetryPolicy::store(),
        }
    }

    #[must_use]
    pub fn from_config(meter: MeterId, config: &Config) -> Self {
        Self {
            meter,
            min_pulse: config.min_pulse(),
            retry: config.retry.policy(),
        }
    }
}

/// Why [`Daemon::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// A termination signal was deferred; the caller should re-deliver it.
    Terminated(Signal),
    /// The event source reported that no more events can arrive.
    Drained,
}

/// Counters reported when the daemon stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    /// Events appended to the buffer.
    pub admitted: u64,
    /// Events dropped by the admission rules.
    pub discarded: u64,
    /// Intervals closed in the store.
    pub committed: u64,
    /// On/off pairs rejected as noise.
    pub cancelled: u64,
    /// Dropouts merged into a continuing pulse.
    pub bridged: u64,
    /// Resets recorded.
    pub resets: u64,
    /// Store attempts beyond the first, summed over all calls.
    pub retries: u64,
}

type Clock = Box<dyn Fn() -> Timestamp>;

/// Pulse recorder for one meter.
pub struct Daemon<Q, B, S> {
    queue: Q,
    backup: BackupLog<B>,
    store: S,
    gate: SignalGate,
    settings: DaemonSettings,
    buffer: PulseBuffer,
    sleeper: Box<dyn Sleeper>,
    clock: Clock,
    stats: DaemonStats,
    loaded: bool,
}

impl<Q, B, S> Daemon<Q, B, S>
where
    Q: EventSource,
    B: BackupMedium,
    S: PulseStore,
{
    pub fn new(queue: Q, backup: B, store: S, gate: SignalGate, settings: DaemonSettings) -> Self {
        Self {
            queue,
            backup: BackupLog::new(backup),
            store,
            gate,
            settings,
            buffer: PulseBuffer::new(),
            sleeper: Box::new(ThreadSleeper),
            clock: Box::new(Timestamp::now),
            stats: DaemonStats::default(),
            loaded: false,
        }
    }

    /// Replace the sleeper used for retry backoff and the settle wait.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// Replace the wall clock used for the settle wait.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> Timestamp + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn buffer(&self) -> &PulseBuffer {
        &self.buffer
    }

    pub fn backup(&self) -> &BackupLog<B> {
        &self.backup
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stats(&self) -> DaemonStats {
        self.stats
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// Give back the transports, e.g. to close them.
    pub fn into_parts(self) -> (Q, B, S) {
        (self.queue, self.backup.into_inner(), self.store)
    }

    fn critical<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let mut section = self.gate.capture()?;
        section.hold()?;
        let result = f(self);
        section.close()?;
        result
    }

    fn mirror_buffer(&mut self) -> Result<()> {
        self.backup.rewrite(self.buffer.events())
    }

    /// Restore the buffer from the backup queue.
    ///
    /// The restored sequence is normalized and written back, so the backup
    /// matches the buffer before any new event is read. No store call is
    /// made. Called by [`run`](Self::run) if not called before.
    pub fn load(&mut self) -> Result<()> {
        self.critical(|daemon| {
            let raw = daemon.backup.drain()?;
            daemon.buffer = PulseBuffer::restore(&raw);
            daemon.mirror_buffer()?;
            if raw.as_slice() != daemon.buffer.events() {
                warn!(
                    queue = daemon.backup.medium().name(),
                    restored = raw.len(),
                    kept = daemon.buffer.events().len(),
                    "repaired backup queue"
                );
            }
            Ok(())
        })?;
        self.loaded = true;
        info!(
            meter = self.settings.meter,
            buffer = %self.buffer,
            "restored pulse buffer"
        );
        Ok(())
    }

    /// Run until a termination signal is deferred or the source closes.
    pub fn run(&mut self) -> Result<Exit> {
        let span = crate::meter_span!(
            "pulsedb",
            meter = self.settings.meter,
            queue = self.queue.name()
        );
        let _guard = span.enter();

        if !self.loaded {
            self.load()?;
        }
        info!(
            min_pulse_us = self.settings.min_pulse.as_micros() as u64,
            "recording pulses"
        );
        let exit = self.run_loop();
        let stats = self.stats;
        info!(
            exit = ?exit.as_ref().ok(),
            admitted = stats.admitted,
            discarded = stats.discarded,
            committed = stats.committed,
            cancelled = stats.cancelled,
            bridged = stats.bridged,
            resets = stats.resets,
            retries = stats.retries,
            "pulse recorder stopped"
        );
        exit
    }

    fn run_loop(&mut self) -> Result<Exit> {
        loop {
            if let Some(signal) = self.gate.take_deferred() {
                info!(%signal, "termination requested");
                return Ok(Exit::Terminated(signal));
            }

            if self.buffer.reset_pending() {
                self.record_reset()?;
                continue;
            }

            match self.buffer.pulse_count() {
                0 => {}
                1 => self.report_open()?,
                2 => {
                    if !self.settle()? {
                        self.resolve_pair()?;
                    }
                    continue;
                }
                3 => {
                    self.resolve_triple()?;
                    continue;
                }
                count => {
                    return Err(Error::Invariant(format!(
                        "buffer holds {count} pulses: {}",
                        self.buffer
                    )));
                }
            }

            if self.ingest()? {
                return Ok(Exit::Drained);
            }
        }
    }

    fn pulse(&self, index: usize) -> Result<Timestamp> {
        self.buffer.pulse_at(index).ok_or_else(|| {
            Error::Invariant(format!("no pulse at {index} in {}", self.buffer))
        })
    }

    fn store_call(&mut self, op: StoreOp) -> Result<()> {
        debug!(operation = op.name(), %op, "store call");
        let meter = self.settings.meter;
        let store = &mut self.store;
        let outcome = retry_with(
            &self.settings.retry,
            self.sleeper.as_ref(),
            op.name(),
            || op.apply(&mut *store, meter),
        );
        self.stats.retries += u64::from(outcome.retries());
        outcome.result.map_err(Error::Store)
    }

    fn record_reset(&mut self) -> Result<()> {
        self.store_call(StoreOp::Reset)?;
        self.stats.resets += 1;
        info!("meter reset recorded");
        self.critical(|daemon| {
            daemon.buffer.take_reset();
            daemon.mirror_buffer()
        })
    }

    fn report_open(&mut self) -> Result<()> {
        if self.buffer.open_state().is_reported() {
            return Ok(());
        }
        let start = self.pulse(0)?;
        self.store_call(StoreOp::On { start })?;
        self.buffer.set_open_state(OpenState::Reported);
        debug!(%start, "pulse opened");
        Ok(())
    }

    /// Wait until the off phase could have ended, then take one more event
    /// if one is queued. Returns whether an event was taken.
    ///
    /// Only the wait runs outside a critical section. The dequeue and the
    /// admit share one held section, so a signal cannot land between them.
    fn settle(&mut self) -> Result<bool> {
        let off = self.pulse(1)?;
        let min_micros = u64::try_from(self.settings.min_pulse.as_micros()).unwrap_or(u64::MAX);
        let deadline = Timestamp::from_micros(off.as_micros().saturating_add(min_micros));
        let wait = (self.clock)().micros_until(deadline).min(min_micros);
        if wait > 0 {
            trace!(wait_us = wait, "settling");
            self.sleeper.sleep(Duration::from_micros(wait));
        }
        self.critical(|daemon| match daemon.queue.try_recv()? {
            Some(event) => {
                daemon.admit(event)?;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn finish_pair(&mut self, start: Timestamp, stop: Timestamp, outcome: PairOutcome) -> Result<()> {
        if let Some(op) = outcome.op() {
            self.store_call(op)?;
        }
        if outcome.is_noise() {
            self.stats.cancelled += 1;
            debug!(%start, %stop, "noise discarded");
        } else {
            self.stats.committed += 1;
            info!(%start, %stop, "pulse recorded");
        }
        Ok(())
    }

    fn resolve_pair(&mut self) -> Result<()> {
        let (on, off) = (self.pulse(0)?, self.pulse(1)?);
        let outcome = reconcile::resolve_pair(on, off, self.buffer.open_state(), self.settings.min_pulse);
        self.finish_pair(on, off, outcome)?;
        self.critical(|daemon| {
            daemon.buffer.clear_pulses();
            daemon.mirror_buffer()
        })
    }

    fn resolve_triple(&mut self) -> Result<()> {
        let (on0, off1, on2) = (self.pulse(0)?, self.pulse(1)?, self.pulse(2)?);
        let outcome = reconcile::resolve_triple(
            on0,
            off1,
            on2,
            self.buffer.open_state(),
            self.settings.min_pulse,
        );
        match outcome {
            TripleOutcome::Bridge { cancel, survivor } => {
                if let Some(op) = cancel {
                    self.store_call(op)?;
                }
                self.store_call(StoreOp::Resume { start: survivor })?;
                self.stats.bridged += 1;
                debug!(%off1, %on2, %survivor, "dropout bridged");
                self.critical(|daemon| {
                    daemon.buffer.collapse_to(survivor, OpenState::Reported);
                    daemon.mirror_buffer()
                })
            }
            TripleOutcome::Split { pair, next } => {
                self.finish_pair(on0, off1, pair)?;
                self.critical(|daemon| {
                    daemon.buffer.collapse_to(next, OpenState::Unreported);
                    daemon.mirror_buffer()
                })
            }
        }
    }

    /// Apply admission and mirror the result. Runs inside a held section.
    fn admit(&mut self, event: Event) -> Result<()> {
        match self.buffer.admit(event)? {
            Admission::Appended => {
                self.backup.append(&event)?;
                self.stats.admitted += 1;
                trace!(%event, buffer = %self.buffer, "admitted");
            }
            Admission::Discarded(reason) => {
                self.stats.discarded += 1;
                debug!(%event, %reason, "discarded");
            }
            Admission::Cleared => {
                self.mirror_buffer()?;
                self.stats.discarded += 1;
                debug!(%event, "off after a complete pair, buffer cleared");
            }
        }
        Ok(())
    }

    /// Wait for the next event and admit it. Returns true once the source
    /// is closed.
    fn ingest(&mut self) -> Result<bool> {
        let mut section = self.gate.capture()?;
        if self.gate.has_deferred() {
            // Deferred after the loop check; stop before blocking.
            section.close()?;
            return Ok(false);
        }
        let received = self.queue.recv();
        section.hold()?;
        let outcome = match received {
            Ok(Received::Event(event)) => self.admit(event).map(|()| false),
            Ok(Received::Interrupted) => Ok(false),
            Ok(Received::Closed) => Ok(true),
            Err(err) => Err(err),
        };
        section.close()?;
        outcome
    }
}
