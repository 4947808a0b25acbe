//! Deferral of termination signals around state mutations.
//!
//! While a [`CriticalSection`] is open, SIGHUP, SIGINT, SIGQUIT and SIGTERM
//! are caught by a handler that only records the first one. Holding the
//! section additionally blocks them so they stay pending. Closing unblocks
//! them (a pending one reaches the recording handler) and restores the
//! default disposition. The recorded signal is handed back to the caller at
//! the next loop boundary via [`SignalGate::take_deferred`].
//!
//! The handler is installed without `SA_RESTART`, so a blocking queue receive
//! inside an unheld section returns `EINTR` instead of resuming.

use std::os::raw::c_int;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{
    self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, pthread_sigmask,
};
use tracing::{debug, trace};

use crate::error::{Result, SignalError};

/// Signals that stop the daemon.
pub const TERMINATION_SIGNALS: [Signal; 4] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
];

/// First termination signal caught by the handler, 0 if none.
static DEFERRED: AtomicI32 = AtomicI32::new(0);

extern "C" fn defer_signal(signal: c_int) {
    let _ = DEFERRED.compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst);
}

fn termination_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in TERMINATION_SIGNALS {
        set.add(signal);
    }
    set
}

#[allow(unsafe_code)]
fn set_disposition(handler: SigHandler, mask: SigSet) -> Result<()> {
    let action = SigAction::new(handler, SaFlags::empty(), mask);
    for signal in TERMINATION_SIGNALS {
        // SAFETY: the only handler installed is `defer_signal`, which performs
        // a single atomic compare-exchange and is async-signal-safe.
        unsafe { signal::sigaction(signal, &action) }
            .map_err(|source| SignalError::Disposition { signal, source })?;
    }
    Ok(())
}

/// Serializes tests that change process-wide dispositions.
#[cfg(test)]
pub(crate) static ARMED_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn set_mask(how: SigmaskHow, set: &SigSet) -> Result<()> {
    pthread_sigmask(how, Some(set), None).map_err(|source| SignalError::Mask(source).into())
}

#[derive(Debug, Clone)]
enum Mode {
    /// Real dispositions and masks.
    Armed { set: SigSet },
    /// No process state is touched; signals are injected with `request`.
    Inert { deferred: Arc<AtomicI32> },
}

/// Owner of the termination-signal discipline.
#[derive(Debug, Clone)]
pub struct SignalGate {
    mode: Mode,
}

impl SignalGate {
    /// A gate that manipulates the process's real signal state.
    pub fn install() -> Result<Self> {
        let set = termination_set();
        set_disposition(SigHandler::SigDfl, SigSet::empty())?;
        debug!(signals = ?TERMINATION_SIGNALS, "signal gate installed");
        Ok(Self {
            mode: Mode::Armed { set },
        })
    }

    /// A gate for tests and embedding that never touches process signal state.
    #[must_use]
    pub fn inert() -> Self {
        Self {
            mode: Mode::Inert {
                deferred: Arc::new(AtomicI32::new(0)),
            },
        }
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        matches!(self.mode, Mode::Armed { .. })
    }

    /// Record `signal` as if the handler had caught it (inert gates only).
    pub fn request(&self, signal: Signal) {
        if let Mode::Inert { deferred } = &self.mode {
            let _ = deferred.compare_exchange(0, signal as i32, Ordering::SeqCst, Ordering::SeqCst);
        }
    }

    /// Take the first deferred signal, if any.
    pub fn take_deferred(&self) -> Option<Signal> {
        let cell = match &self.mode {
            Mode::Armed { .. } => &DEFERRED,
            Mode::Inert { deferred } => deferred.as_ref(),
        };
        let raw = cell.swap(0, Ordering::SeqCst);
        if raw == 0 {
            None
        } else {
            Signal::try_from(raw).ok()
        }
    }

    /// Whether a signal is waiting, without taking it.
    #[must_use]
    pub fn has_deferred(&self) -> bool {
        let cell = match &self.mode {
            Mode::Armed { .. } => &DEFERRED,
            Mode::Inert { deferred } => deferred.as_ref(),
        };
        cell.load(Ordering::SeqCst) != 0
    }

    /// Start capturing termination signals. The section is not yet held.
    pub fn capture(&self) -> Result<CriticalSection> {
        let set = match &self.mode {
            Mode::Armed { set } => {
                set_disposition(SigHandler::Handler(defer_signal), *set)?;
                Some(*set)
            }
            Mode::Inert { .. } => None,
        };
        trace!("signals captured");
        Ok(CriticalSection {
            set,
            held: false,
            open: true,
        })
    }
}

/// A span during which termination signals are deferred.
///
/// Dropping an open section closes it on a best-effort basis.
#[derive(Debug)]
#[must_use = "an open section keeps signals captured until closed"]
pub struct CriticalSection {
    set: Option<SigSet>,
    held: bool,
    open: bool,
}

impl CriticalSection {
    /// Block the termination signals so they stay pending.
    pub fn hold(&mut self) -> Result<()> {
        if !self.held {
            if let Some(set) = &self.set {
                set_mask(SigmaskHow::SIG_BLOCK, set)?;
            }
            self.held = true;
        }
        Ok(())
    }

    /// Let pending signals reach the recording handler, then restore the
    /// default disposition.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if let Some(set) = &self.set {
            if self.held {
                set_mask(SigmaskHow::SIG_UNBLOCK, set)?;
            }
            set_disposition(SigHandler::SigDfl, SigSet::empty())?;
        }
        self.held = false;
        trace!("signals released");
        Ok(())
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Deliver `signal` to this process with its default disposition.
///
/// For termination signals this does not return. Returns an error if the
/// signal could not be raised and `Ok` if the process survived it.
pub fn redeliver(signal: Signal) -> Result<()> {
    set_disposition(SigHandler::SigDfl, SigSet::empty())?;
    debug!(%signal, "re-delivering deferred signal");
    signal::raise(signal).map_err(|source| SignalError::Raise { signal, source }.into())
}
