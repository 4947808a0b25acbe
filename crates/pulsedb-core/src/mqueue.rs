//! POSIX message queue transport.
//!
//! The main queue is opened twice: a blocking read-only descriptor for the
//! interruptible wait and a non-blocking one for the settle peek. The backup
//! queue is a single read-write non-blocking descriptor. Both are created on
//! first use.

use std::ffi::CString;

use nix::errno::Errno;
use nix::mqueue::{MQ_OFlag, MqAttr, MqdT, mq_close, mq_getattr, mq_open, mq_receive, mq_send};
use nix::sys::stat::Mode;
use tracing::{debug, trace};

use crate::backup::BACKUP_CAPACITY;
use crate::error::{QueueError, Result};
use crate::event::{Event, RECORD_SIZE};
use crate::queue::{BackupMedium, EventSource, Received, decode_record};

fn queue_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| {
        QueueError::InvalidName {
            name: name.to_string(),
            reason: "must not contain NUL",
        }
        .into()
    })
}

fn open(name: &str, c_name: &CString, flags: MQ_OFlag, capacity: usize) -> Result<MqdT> {
    let attr = MqAttr::new(0, capacity as _, RECORD_SIZE as _, 0);
    mq_open(c_name.as_c_str(), flags, queue_mode(), Some(&attr)).map_err(|source| {
        QueueError::Open {
            name: name.to_string(),
            source,
        }
        .into()
    })
}

/// Receive buffer large enough for whatever message size the queue was
/// created with, since the kernel rejects shorter buffers.
fn receive_buffer(name: &str, mqd: &MqdT) -> Result<Vec<u8>> {
    let attr = mq_getattr(mqd).map_err(|source| QueueError::Open {
        name: name.to_string(),
        source,
    })?;
    let size = usize::try_from(attr.msgsize()).unwrap_or(RECORD_SIZE);
    Ok(vec![0u8; size.max(RECORD_SIZE)])
}

fn close_descriptor(name: &str, mqd: Option<MqdT>) -> Result<()> {
    if let Some(mqd) = mqd {
        mq_close(mqd).map_err(|source| QueueError::Close {
            name: name.to_string(),
            source,
        })?;
    }
    Ok(())
}

/// The main event queue.
#[derive(Debug)]
pub struct PosixQueue {
    name: String,
    blocking: Option<MqdT>,
    nonblocking: Option<MqdT>,
    buf: Vec<u8>,
}

impl PosixQueue {
    /// Open (creating if needed) the main queue for reading.
    pub fn open(name: &str, capacity: usize) -> Result<Self> {
        let c = c_name(name)?;
        let blocking = open(name, &c, MQ_OFlag::O_RDONLY | MQ_OFlag::O_CREAT, capacity)?;
        let nonblocking = open(name, &c, MQ_OFlag::O_RDONLY | MQ_OFlag::O_NONBLOCK, capacity)?;
        let buf = receive_buffer(name, &blocking)?;
        debug!(queue = name, capacity, "opened event queue");
        Ok(Self {
            name: name.to_string(),
            blocking: Some(blocking),
            nonblocking: Some(nonblocking),
            buf,
        })
    }

    /// Close both descriptors. The queue itself persists.
    pub fn close(mut self) -> Result<()> {
        close_descriptor(&self.name, self.blocking.take())?;
        close_descriptor(&self.name, self.nonblocking.take())
    }

    fn receive_raw(&mut self, blocking: bool) -> std::result::Result<Vec<u8>, Errno> {
        let mqd = if blocking {
            self.blocking.as_ref()
        } else {
            self.nonblocking.as_ref()
        };
        let mqd = mqd.ok_or(Errno::EBADF)?;
        let mut priority = 0u32;
        let len = mq_receive(mqd, &mut self.buf, &mut priority)?;
        Ok(self.buf[..len].to_vec())
    }

    fn receive_error(&self, source: Errno) -> crate::Error {
        QueueError::Receive {
            name: self.name.clone(),
            source,
        }
        .into()
    }
}

impl EventSource for PosixQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv(&mut self) -> Result<Received> {
        match self.receive_raw(true) {
            Ok(record) => {
                let event = decode_record(&self.name, &record)?;
                trace!(queue = %self.name, %event, "received");
                Ok(Received::Event(event))
            }
            Err(Errno::EINTR) => {
                trace!(queue = %self.name, "receive interrupted");
                Ok(Received::Interrupted)
            }
            Err(source) => Err(self.receive_error(source)),
        }
    }

    fn try_recv(&mut self) -> Result<Option<Event>> {
        match self.receive_raw(false) {
            Ok(record) => {
                let event = decode_record(&self.name, &record)?;
                trace!(queue = %self.name, %event, "received without waiting");
                Ok(Some(event))
            }
            Err(Errno::EAGAIN | Errno::EINTR) => Ok(None),
            Err(source) => Err(self.receive_error(source)),
        }
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        let _ = close_descriptor(&self.name, self.blocking.take());
        let _ = close_descriptor(&self.name, self.nonblocking.take());
    }
}

/// The backup queue mirroring the pulse buffer.
#[derive(Debug)]
pub struct PosixBackup {
    name: String,
    mqd: Option<MqdT>,
    buf: Vec<u8>,
}

impl PosixBackup {
    /// Open (creating if needed) the backup queue for reading and writing.
    pub fn open(name: &str) -> Result<Self> {
        let c = c_name(name)?;
        let mqd = open(
            name,
            &c,
            MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK | MQ_OFlag::O_CREAT,
            BACKUP_CAPACITY,
        )?;
        let buf = receive_buffer(name, &mqd)?;
        debug!(queue = name, "opened backup queue");
        Ok(Self {
            name: name.to_string(),
            mqd: Some(mqd),
            buf,
        })
    }

    pub fn close(mut self) -> Result<()> {
        close_descriptor(&self.name, self.mqd.take())
    }

    fn descriptor(&self) -> std::result::Result<&MqdT, Errno> {
        self.mqd.as_ref().ok_or(Errno::EBADF)
    }
}

impl BackupMedium for PosixBackup {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, event: &Event) -> Result<()> {
        let record = event.encode();
        let sent = self
            .descriptor()
            .and_then(|mqd| mq_send(mqd, &record, 0));
        match sent {
            Ok(()) => {
                trace!(queue = %self.name, %event, "backed up");
                Ok(())
            }
            Err(Errno::EAGAIN) => Err(QueueError::Full {
                name: self.name.clone(),
                capacity: BACKUP_CAPACITY,
            }
            .into()),
            Err(source) => Err(QueueError::Send {
                name: self.name.clone(),
                source,
            }
            .into()),
        }
    }

    fn pop(&mut self) -> Result<Option<Event>> {
        let mut priority = 0u32;
        let received = match self.mqd.as_ref() {
            Some(mqd) => mq_receive(mqd, &mut self.buf, &mut priority),
            None => Err(Errno::EBADF),
        };
        match received {
            Ok(len) => {
                let event = decode_record(&self.name, &self.buf[..len])?;
                trace!(queue = %self.name, %event, "restored");
                Ok(Some(event))
            }
            Err(Errno::EAGAIN) => Ok(None),
            Err(source) => Err(QueueError::Receive {
                name: self.name.clone(),
                source,
            }
            .into()),
        }
    }
}

impl Drop for PosixBackup {
    fn drop(&mut self) {
        let _ = close_descriptor(&self.name, self.mqd.take());
    }
}
