//! Inter-batch overlap of device transfer and computation
//!
//! Placement of every prefetched batch is launched on a dedicated
//! [`TransferStream`] as soon as the batch is pulled. While the consumer
//! computes on batch N, the transfer of batch N+1 runs on the stream, and
//! selecting N+1 only blocks for whatever is left of its transfer:
//!
//! ```text
//! sequential:  [HtoD][compute]
//!                             [HtoD][compute]
//! overlapped:  [HtoD][compute]
//!                    [HtoD]   [compute]
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use super::prefetch::{BatchToDevice, Placement, Prefetch};
use super::Fetcher;
use crate::config::FetcherConfig;
use crate::error::{FetchError, Result};
use crate::source::{BatchSet, Source};
use crate::transfer::{HostTransferStream, TransferEvent, TransferStream};

/// Slot a transfer job fills with the placed batch
pub type PendingBatch<B> = Arc<Mutex<Option<BatchSet<B>>>>;

/// Placement that runs on a transfer stream, with one event per batch
pub struct OverlappedPlacement<B, T> {
    stream: T,
    store_on_device: bool,
    batch_to_device: Option<BatchToDevice<B>>,
    events: VecDeque<TransferEvent>,
    waits: usize,
    last_waited: Option<u64>,
}

impl<B, T: TransferStream> OverlappedPlacement<B, T> {
    /// Create a placement running on `stream`
    pub fn new(stream: T, store_on_device: bool) -> Self {
        Self {
            stream,
            store_on_device,
            batch_to_device: None,
            events: VecDeque::new(),
            waits: 0,
            last_waited: None,
        }
    }

    /// Transfers launched but not yet waited on
    pub fn in_flight(&self) -> usize {
        self.events.len()
    }

    /// Waits performed since creation
    pub fn waits(&self) -> usize {
        self.waits
    }

    /// Id of the most recently waited event
    pub fn last_waited(&self) -> Option<u64> {
        self.last_waited
    }

    /// The stream transfers run on
    pub fn stream(&self) -> &T {
        &self.stream
    }
}

impl<B, T> Placement for OverlappedPlacement<B, T>
where
    B: Send + 'static,
    T: TransferStream,
{
    type Batch = B;
    type Pending = PendingBatch<B>;
    type Start = TransferEvent;

    fn on_fetch_start(&mut self) -> TransferEvent {
        self.stream.create_event()
    }

    fn stage(&mut self, batch: BatchSet<B>, event: TransferEvent) -> Result<PendingBatch<B>> {
        let slot: PendingBatch<B> = Arc::new(Mutex::new(None));
        let target = Arc::clone(&slot);
        let batch_to_device = self
            .batch_to_device
            .clone()
            .filter(|_| self.store_on_device);

        self.stream.launch(
            Box::new(move || {
                let batch = match batch_to_device {
                    Some(batch_to_device) => batch.map(|b| batch_to_device(b)),
                    None => batch,
                };
                *target.lock().unwrap_or_else(PoisonError::into_inner) = Some(batch);
            }),
            &event,
        )?;
        trace!(event = event.id(), in_flight = self.events.len() + 1, "launched transfer");

        self.events.push_back(event);
        Ok(slot)
    }

    fn wait(&mut self) -> Result<()> {
        let event = self
            .events
            .pop_front()
            .ok_or_else(|| FetchError::Transfer("no in-flight transfer to wait on".into()))?;
        event.wait()?;
        self.waits += 1;
        self.last_waited = Some(event.id());
        trace!(event = event.id(), "transfer complete");
        Ok(())
    }

    fn finish(&mut self, pending: PendingBatch<B>) -> Result<BatchSet<B>> {
        pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| FetchError::Transfer("transfer completed without a batch".into()))
    }

    fn set_batch_to_device(&mut self, batch_to_device: BatchToDevice<B>) {
        self.batch_to_device = Some(batch_to_device);
    }

    fn reset(&mut self) {
        // in-flight transfers finish on their own; nobody waits for them
        self.events.clear();
    }
}

impl<B, T> fmt::Debug for OverlappedPlacement<B, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlappedPlacement")
            .field("store_on_device", &self.store_on_device)
            .field("in_flight", &self.events.len())
            .field("waits", &self.waits)
            .field("last_waited", &self.last_waited)
            .finish_non_exhaustive()
    }
}

/// Prefetching fetcher whose device placement overlaps with the
/// consumer's computation
pub type OverlappedTransferFetcher<S, T = HostTransferStream> =
    Fetcher<S, Prefetch<OverlappedPlacement<<S as Source>::Batch, T>>>;

impl<S, T> Fetcher<S, Prefetch<OverlappedPlacement<S::Batch, T>>>
where
    S: Source,
    S::Batch: Send + 'static,
    T: TransferStream,
{
    /// Create a fetcher running transfers on `stream`; `prefetch_batches`
    /// must be at least 1
    pub fn with_stream(config: FetcherConfig, stream: T) -> Result<Self> {
        config.validate(1)?;
        Ok(Self::from_parts(
            "OverlappedTransferFetcher",
            &config,
            Prefetch::new(OverlappedPlacement::new(stream, config.store_on_device)),
        ))
    }
}

impl<S> Fetcher<S, Prefetch<OverlappedPlacement<S::Batch, HostTransferStream>>>
where
    S: Source,
    S::Batch: Send + 'static,
{
    /// Create a fetcher with its own host transfer stream
    pub fn new(config: FetcherConfig) -> Result<Self> {
        config.validate(1)?;
        Self::with_stream(config, HostTransferStream::new()?)
    }
}
