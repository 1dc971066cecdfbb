//! Look-ahead prefetching
//!
//! Keeps `prefetch_batches` batches fetched ahead of the consumer, so that
//! every batch can be handed out together with an "is last" flag without
//! the consumer ever probing the source for more.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::{FetchStrategy, Fetcher, FetcherCore};
use crate::config::FetcherConfig;
use crate::error::{FetchError, Result};
use crate::source::{BatchSet, Source, SourceSet};

/// Device-placement function applied to each batch
pub type BatchToDevice<B> = Arc<dyn Fn(B) -> B + Send + Sync>;

/// How buffered batches reach the device
///
/// `stage` runs right after a batch is pulled; `wait` and `finish` run when
/// that batch is selected for the consumer.
pub trait Placement {
    /// Batch type handled
    type Batch;

    /// What the look-ahead buffer holds for one batch
    type Pending;

    /// Value created before each pull
    type Start;

    /// Called before each pull
    fn on_fetch_start(&mut self) -> Self::Start;

    /// Turn a freshly pulled batch into its buffered form
    fn stage(&mut self, batch: BatchSet<Self::Batch>, start: Self::Start) -> Result<Self::Pending>;

    /// Block until the oldest staged batch may be read
    fn wait(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce the batch handed to the consumer
    fn finish(&mut self, pending: Self::Pending) -> Result<BatchSet<Self::Batch>>;

    /// Install the device-placement function
    fn set_batch_to_device(&mut self, batch_to_device: BatchToDevice<Self::Batch>);

    /// Drop anything tied to the current pass
    fn reset(&mut self) {}
}

/// Placement on the consumer's own thread, after the batch is selected
pub struct HostPlacement<B> {
    store_on_device: bool,
    batch_to_device: Option<BatchToDevice<B>>,
}

impl<B> HostPlacement<B> {
    /// Create a placement; `store_on_device` gates the placement function
    pub fn new(store_on_device: bool) -> Self {
        Self {
            store_on_device,
            batch_to_device: None,
        }
    }

    /// Apply the placement function, if any and if enabled
    pub fn move_to_device(&self, batch: BatchSet<B>) -> BatchSet<B> {
        match (&self.batch_to_device, self.store_on_device) {
            (Some(batch_to_device), true) => batch.map(|b| batch_to_device(b)),
            _ => batch,
        }
    }
}

impl<B> Placement for HostPlacement<B> {
    type Batch = B;
    type Pending = BatchSet<B>;
    type Start = ();

    fn on_fetch_start(&mut self) {}

    fn stage(&mut self, batch: BatchSet<B>, _start: ()) -> Result<BatchSet<B>> {
        Ok(batch)
    }

    fn finish(&mut self, pending: BatchSet<B>) -> Result<BatchSet<B>> {
        Ok(self.move_to_device(pending))
    }

    fn set_batch_to_device(&mut self, batch_to_device: BatchToDevice<B>) {
        self.batch_to_device = Some(batch_to_device);
    }
}

impl<B> fmt::Debug for HostPlacement<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPlacement")
            .field("store_on_device", &self.store_on_device)
            .field("batch_to_device", &self.batch_to_device.is_some())
            .finish()
    }
}

/// Look-ahead strategy over a [`Placement`]
pub struct Prefetch<P: Placement> {
    batches: VecDeque<P::Pending>,
    placement: P,
}

impl<P: Placement> Prefetch<P> {
    /// Create an empty look-ahead buffer
    pub fn new(placement: P) -> Self {
        Self {
            batches: VecDeque::new(),
            placement,
        }
    }

    /// Batches fetched but not yet handed out
    pub fn buffered(&self) -> usize {
        self.batches.len()
    }

    /// The placement in use
    pub fn placement(&self) -> &P {
        &self.placement
    }
}

impl<P: Placement> fmt::Debug for Prefetch<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prefetch")
            .field("buffered", &self.batches.len())
            .finish_non_exhaustive()
    }
}

impl<S, P> FetchStrategy<S> for Prefetch<P>
where
    S: Source,
    P: Placement<Batch = S::Batch>,
{
    type Output<'a> = (BatchSet<S::Batch>, bool)
    where
        Self: 'a,
        S: 'a;

    type Start = P::Start;

    fn prefetching(&mut self, core: &mut FetcherCore<S>) -> Result<()> {
        for _ in 0..core.prefetch_batches() {
            if !core.fetch_next_batch(self)? {
                core.mark_done();
                break;
            }
        }
        debug!(buffered = self.batches.len(), "prefetched");
        Ok(())
    }

    fn fetching_function<'a>(
        &'a mut self,
        core: &'a mut FetcherCore<S>,
    ) -> Result<(BatchSet<S::Batch>, bool)> {
        // an empty buffer here means the source had nothing to prefetch
        let Some(pending) = self.batches.pop_front() else {
            return Err(core.exhausted());
        };

        // refill before computing the flag: the last deliverable batch is
        // the one that leaves the buffer empty
        if !core.is_done() {
            match core.fetch_next_batch(self) {
                Ok(true) => {}
                Ok(false) => core.mark_done(),
                Err(err) => {
                    // keep the selected batch and its transfer at the head
                    self.batches.push_front(pending);
                    return Err(err);
                }
            }
        }

        <Self as FetchStrategy<S>>::wait(self)?;
        let batch = self.placement.finish(pending)?;
        Ok((batch, self.batches.is_empty()))
    }

    fn on_fetch_start(&mut self) -> P::Start {
        self.placement.on_fetch_start()
    }

    fn on_fetch_end(&mut self, batch: BatchSet<S::Batch>, start: P::Start) -> Result<()> {
        let pending = self.placement.stage(batch, start)?;
        self.batches.push_back(pending);
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        self.placement.wait()
    }

    fn reset(&mut self) {
        self.batches.clear();
        self.placement.reset();
    }
}

/// Fetcher that keeps a FIFO of prefetched batches and places each one on
/// the consumer's thread
pub type SynchronousPrefetchFetcher<S> = Fetcher<S, Prefetch<HostPlacement<<S as Source>::Batch>>>;

impl<S: Source> Fetcher<S, Prefetch<HostPlacement<S::Batch>>> {
    /// Create a fetcher; `prefetch_batches` must be at least 1
    pub fn new(config: FetcherConfig) -> Result<Self> {
        config.validate(1)?;
        Ok(Self::from_parts(
            "SynchronousPrefetchFetcher",
            &config,
            Prefetch::new(HostPlacement::new(config.store_on_device)),
        ))
    }
}

impl<S, P> Fetcher<S, Prefetch<P>>
where
    S: Source,
    P: Placement<Batch = S::Batch>,
{
    /// Bind the sources together with a device-placement function
    pub fn setup_with_device<F>(&mut self, source: SourceSet<S>, batch_to_device: F)
    where
        F: Fn(S::Batch) -> S::Batch + Send + Sync + 'static,
    {
        self.strategy.placement.set_batch_to_device(Arc::new(batch_to_device));
        self.setup(source);
    }

    /// The placement in use
    pub fn placement(&self) -> &P {
        &self.strategy.placement
    }
}

impl<S, P> Iterator for Fetcher<S, Prefetch<P>>
where
    S: Source,
    P: Placement<Batch = S::Batch>,
{
    type Item = Result<(BatchSet<S::Batch>, bool)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(item) => Some(Ok(item)),
            Err(FetchError::Exhausted) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
