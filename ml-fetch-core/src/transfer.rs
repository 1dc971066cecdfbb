//! Asynchronous transfer channel and completion events
//!
//! A [`TransferStream`] runs placement jobs off the consumer's thread. Each
//! job is paired with a [`TransferEvent`] that is signaled once the job has
//! finished, so the consumer can block on exactly the batch it is about to
//! read while later transfers keep running.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use static_assertions::assert_impl_all;
use tracing::{trace, warn};

use crate::error::{FetchError, Result};

/// Work executed on a transfer stream
pub type TransferJob = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventStatus {
    Pending,
    Complete,
    Failed(String),
}

#[derive(Debug)]
struct EventInner {
    status: Mutex<EventStatus>,
    ready: Condvar,
}

/// Completion signal for one in-flight transfer
#[derive(Clone)]
pub struct TransferEvent {
    id: u64,
    inner: Arc<EventInner>,
}

impl TransferEvent {
    /// Create an unsignaled event
    pub fn new(id: u64) -> Self {
        Self {
            id,
            inner: Arc::new(EventInner {
                status: Mutex::new(EventStatus::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    /// Creation order of this event on its stream
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the transfer complete and wake waiters
    pub fn signal(&self) {
        self.settle(EventStatus::Complete);
    }

    /// Mark the transfer failed and wake waiters
    pub fn fail(&self, reason: impl Into<String>) {
        self.settle(EventStatus::Failed(reason.into()));
    }

    fn settle(&self, outcome: EventStatus) {
        let mut status = self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *status == EventStatus::Pending {
            *status = outcome;
        }
        self.inner.ready.notify_all();
    }

    /// Whether the event has been signaled or failed
    pub fn is_signaled(&self) -> bool {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            != EventStatus::Pending
    }

    /// Block until the event settles
    pub fn wait(&self) -> Result<()> {
        let status = self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let status = self
            .inner
            .ready
            .wait_while(status, |status| *status == EventStatus::Pending)
            .unwrap_or_else(PoisonError::into_inner);

        match &*status {
            EventStatus::Failed(reason) => Err(FetchError::Transfer(format!(
                "transfer {} failed: {reason}",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEvent")
            .field("id", &self.id)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// A channel that runs transfer jobs asynchronously to the caller
pub trait TransferStream: Send {
    /// Create a new completion event
    fn create_event(&self) -> TransferEvent;

    /// Queue `job`; `event` settles once the job has run
    fn launch(&self, job: TransferJob, event: &TransferEvent) -> Result<()>;
}

/// Transfer stream backed by one worker thread running jobs in order
pub struct HostTransferStream {
    sender: Option<Sender<(TransferJob, TransferEvent)>>,
    worker: Option<JoinHandle<()>>,
    next_event: AtomicU64,
}

impl HostTransferStream {
    /// Spawn the stream's worker thread
    pub fn new() -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<(TransferJob, TransferEvent)>();

        let worker = thread::Builder::new()
            .name("transfer-stream".into())
            .spawn(move || {
                for (job, event) in receiver {
                    match panic::catch_unwind(AssertUnwindSafe(job)) {
                        Ok(()) => event.signal(),
                        Err(payload) => {
                            let reason = panic_message(payload.as_ref());
                            warn!(event = event.id(), %reason, "transfer job panicked");
                            event.fail(reason);
                        }
                    }
                }
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            next_event: AtomicU64::new(0),
        })
    }
}

impl TransferStream for HostTransferStream {
    fn create_event(&self) -> TransferEvent {
        TransferEvent::new(self.next_event.fetch_add(1, Ordering::Relaxed))
    }

    fn launch(&self, job: TransferJob, event: &TransferEvent) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| FetchError::Transfer("transfer stream is closed".into()))?;
        sender
            .send((job, event.clone()))
            .map_err(|_| FetchError::Transfer("transfer stream worker has stopped".into()))?;
        trace!(event = event.id(), "queued transfer");
        Ok(())
    }
}

impl Drop for HostTransferStream {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            join_worker(worker);
        }
    }
}

impl fmt::Debug for HostTransferStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTransferStream")
            .field("next_event", &self.next_event.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Join a stream worker, logging instead of propagating its panic
fn join_worker(worker: JoinHandle<()>) {
    if let Err(payload) = worker.join() {
        let reason = panic_message(payload.as_ref());
        warn!(%reason, "transfer stream worker panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

assert_impl_all!(TransferEvent: Send, Sync, Clone);
assert_impl_all!(HostTransferStream: Send, Sync);
