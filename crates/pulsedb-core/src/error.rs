//! Error types for pulsedb-core

use std::fmt::Write;
use thiserror::Error;

use crate::event::DecodeError;

/// Remediation command for resolving an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a diagnostic or fix-up command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pulsedb-core
#[derive(Error, Debug)]
pub enum Error {
    /// Message queue transport errors (main queue or backup log)
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Store errors (only surfaced when a retry policy gives up)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Signal disposition errors
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),

    /// The pulse buffer or backup log reached a state that admission rules forbid
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Setup errors (bad arguments, unusable names)
    #[error("Setup error: {0}")]
    Setup(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Queue(err) => Some(err.remediation()),
            Self::Store(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Signal(_) => None,
            Self::Invariant(_) => Some(
                Remediation::new(
                    "The backup queue holds an impossible pulse sequence. Inspect it before restarting.",
                )
                .command("Backup queue state", "cat /dev/mqueue/<queue>~")
                .alternative("Restarting re-normalizes the backup queue on load."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the log and database directories exist and are writable."),
            ),
            Self::Setup(_) => Some(
                Remediation::new("Check the command line arguments.")
                    .command("Usage", "pulsedb --help"),
            ),
        }
    }
}

/// Message queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid queue name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Failed to open queue {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to send to queue {name}: {source}")]
    Send {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to receive from queue {name}: {source}")]
    Receive {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to close queue {name}: {source}")]
    Close {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("Queue {name} is full ({capacity} records)")]
    Full { name: String, capacity: usize },

    #[error("Malformed record on queue {name}: {source}")]
    Malformed {
        name: String,
        #[source]
        source: DecodeError,
    },
}

impl QueueError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::InvalidName { .. } => Remediation::new(
                "POSIX queue names start with '/', contain no other '/', and fit in 255 bytes.",
            )
            .command("Example", "pulsedb /gasmeter 1"),
            Self::Open { .. } => Remediation::new(
                "The queue could not be opened. Check the mqueue limits and permissions.",
            )
            .command("Queue length limit", "cat /proc/sys/fs/mqueue/msg_max")
            .command("Raise the limit", "sysctl -w fs.mqueue.msg_max=4096")
            .alternative("Lower [queue] capacity in the config file."),
            Self::Send { .. } | Self::Receive { .. } | Self::Close { .. } => Remediation::new(
                "Queue transport failed. The daemon stops rather than risk losing pulses.",
            )
            .command("List queues", "ls -l /dev/mqueue")
            .alternative("Restart the daemon; buffered pulses are recovered from the backup queue."),
            Self::Full { .. } => Remediation::new(
                "The backup queue is full, so it no longer mirrors the pulse buffer.",
            )
            .command("Inspect", "cat /dev/mqueue/<queue>~")
            .alternative("Stop the daemon and remove the stale backup queue if it was created by another tool."),
            Self::Malformed { .. } => Remediation::new(
                "A record with an unexpected size or encoding was read. Check the producer version.",
            )
            .alternative("Make sure only pulse producers write to this queue."),
        }
    }
}

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl StoreError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => Remediation::new(
                "Database operation failed. The daemon keeps retrying with backoff.",
            )
            .command("Integrity check", "sqlite3 <db> 'PRAGMA integrity_check'")
            .alternative("Ensure the database directory is writable."),
            Self::Unavailable(_) => {
                Remediation::new("The store is unreachable. The daemon keeps retrying with backoff.")
                    .alternative("Check the [store] section of the config file.")
            }
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check that {path} exists and is readable."))
                    .command("Check file", format!("ls -l {path}"))
            }
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Remove the file to run with built-in defaults."),
            Self::ValidationError(_) => {
                Remediation::new("A config value is out of range. Adjust it and restart.")
                    .alternative("Remove the offending key to use its default.")
            }
        }
    }
}

/// Signal disposition errors
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Failed to install handler for {signal}: {source}")]
    Disposition {
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to change the signal mask: {0}")]
    Mask(#[source] nix::Error),

    #[error("Failed to re-deliver {signal}: {source}")]
    Raise {
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::Error,
    },
}
