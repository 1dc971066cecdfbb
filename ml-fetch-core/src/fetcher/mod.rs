//! Fetcher lifecycle and the strategy interface
//!
//! A [`Fetcher`] couples a [`FetcherCore`], which owns the bound sources, the
//! active iterator, the fetch counters and the progress side-table, with a
//! [`FetchStrategy`] that decides how batches are pulled and handed out.
//!
//! Lifecycle: `Unconfigured -> Ready (setup) -> Iterating (enter_iteration)
//! -> Exhausted | Reset`. A fetcher can be re-entered for a new pass at any
//! time after `setup`.

mod caller_driven;
mod overlap;
mod prefetch;

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::FetcherConfig;
use crate::error::{FetchError, Result};
use crate::source::{BatchSet, Source, SourceIterator, SourceSet, SourceSetIter};
use crate::state::{FetcherCheckpoint, IterationStateMerger, MergedState, ProgressToken};

pub use caller_driven::{CallerDriven, CallerDrivenFetcher, StepIter};
pub use overlap::{OverlappedPlacement, OverlappedTransferFetcher, PendingBatch};
pub use prefetch::{BatchToDevice, HostPlacement, Placement, Prefetch, SynchronousPrefetchFetcher};

/// Where a fetcher is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No source bound yet
    Unconfigured,
    /// Source bound, no pass started
    Ready,
    /// A pass is active
    Iterating,
    /// The active pass reported the end of the sequence
    Exhausted,
    /// Counters were cleared by `reset` or `teardown`
    Reset,
}

/// How a fetcher pulls batches and hands them to the consumer
///
/// Hooks default to no-ops where that is meaningful; `on_fetch_start` and
/// `on_fetch_end` are always spelled out since their types differ per
/// strategy.
pub trait FetchStrategy<S: Source> {
    /// What one `advance` hands to the consumer
    type Output<'a>
    where
        Self: 'a,
        S: 'a;

    /// Value produced before a pull and passed along with the pulled batch
    type Start;

    /// Initial look-ahead at the start of a pass
    fn prefetching(&mut self, core: &mut FetcherCore<S>) -> Result<()>;

    /// Produce the next unit, or [`FetchError::Exhausted`]
    fn fetching_function<'a>(&'a mut self, core: &'a mut FetcherCore<S>) -> Result<Self::Output<'a>>;

    /// Called immediately before each pull
    fn on_fetch_start(&mut self) -> Self::Start;

    /// Called immediately after each successful pull
    fn on_fetch_end(&mut self, batch: BatchSet<S::Batch>, start: Self::Start) -> Result<()>;

    /// Block until the selected batch is ready to be read
    fn wait(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop per-pass buffers
    fn reset(&mut self) {}
}

/// State shared by every strategy for one fetcher
pub struct FetcherCore<S: Source> {
    name: &'static str,
    prefetch_batches: usize,
    capture_progress: bool,
    source: Option<SourceSet<S>>,
    iterator: Option<SourceSetIter<S::Iter>>,
    iterator_ids: Vec<Uuid>,
    states: HashMap<Uuid, IterationStateMerger>,
    fetched: usize,
    done: bool,
    phase: Phase,
}

impl<S: Source> FetcherCore<S> {
    fn new(name: &'static str, config: &FetcherConfig) -> Self {
        Self {
            name,
            prefetch_batches: config.prefetch_batches,
            capture_progress: config.capture_progress,
            source: None,
            iterator: None,
            iterator_ids: Vec::new(),
            states: HashMap::new(),
            fetched: 0,
            done: false,
            phase: Phase::Unconfigured,
        }
    }

    /// Look-ahead depth
    pub fn prefetch_batches(&self) -> usize {
        self.prefetch_batches
    }

    /// Batches pulled in the current pass
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    /// Whether the underlying iterator has run out
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Record that the underlying iterator has run out
    pub fn mark_done(&mut self) {
        if !self.done {
            debug!(fetcher = self.name, fetched = self.fetched, "source exhausted");
        }
        self.done = true;
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Enter the exhausted phase and produce the signal to return
    pub fn exhausted(&mut self) -> FetchError {
        self.phase = Phase::Exhausted;
        FetchError::Exhausted
    }

    /// The bound sources
    pub fn source(&self) -> Result<&SourceSet<S>> {
        self.source
            .as_ref()
            .ok_or_else(|| FetchError::NotConfigured(self.name.to_string()))
    }

    fn source_mut(&mut self) -> Result<&mut SourceSet<S>> {
        let name = self.name;
        self.source
            .as_mut()
            .ok_or_else(|| FetchError::NotConfigured(name.to_string()))
    }

    /// Child sources, one for a single source
    pub fn child_sources(&self) -> Result<&[S]> {
        Ok(self.source()?.children())
    }

    /// Child iterators of the active pass
    pub fn child_iterators(&self) -> Result<&[S::Iter]> {
        self.iterator
            .as_ref()
            .map(SourceSetIter::children)
            .ok_or(FetchError::NotIterating)
    }

    /// Identities of the child iterators of the active pass, in child order
    pub fn iterator_ids(&self) -> Result<&[Uuid]> {
        if self.iterator.is_none() {
            return Err(FetchError::NotIterating);
        }
        Ok(&self.iterator_ids)
    }

    /// Visible merged state of each child iterator, in child order
    pub fn child_states(&self) -> Result<Vec<&MergedState>> {
        Ok(self
            .iterator_ids()?
            .iter()
            .filter_map(|id| self.states.get(id))
            .map(IterationStateMerger::state)
            .collect())
    }

    /// Buffer progress tokens of one child iterator and merge those whose
    /// look-ahead has drained
    pub fn store_progress(&mut self, iterator: Uuid, tokens: Vec<ProgressToken>) {
        self.states
            .entry(iterator)
            .or_default()
            .store(tokens, self.fetched, self.prefetch_batches);
    }

    /// Pull one batch, capture its progress tokens and count it.
    ///
    /// Returns `None` when the iterator is exhausted; callers decide what
    /// exhaustion means for them.
    pub fn pull(&mut self) -> Result<Option<BatchSet<S::Batch>>> {
        let iterator = self.iterator.as_mut().ok_or(FetchError::NotIterating)?;
        let Some(batch) = iterator.next_batch()? else {
            return Ok(None);
        };

        if self.capture_progress {
            let captured: Vec<(Uuid, Vec<ProgressToken>)> = self
                .iterator_ids
                .iter()
                .copied()
                .zip(iterator.children_mut().iter_mut().map(SourceIterator::take_progress))
                .filter(|(_, tokens)| !tokens.is_empty())
                .collect();
            for (id, tokens) in captured {
                self.store_progress(id, tokens);
            }
        }

        self.fetched += 1;
        trace!(fetcher = self.name, fetched = self.fetched, "pulled batch");
        Ok(Some(batch))
    }

    /// Pull one batch wrapped in the strategy's fetch hooks.
    ///
    /// Returns `false` when the iterator is exhausted.
    pub fn fetch_next_batch<K>(&mut self, hooks: &mut K) -> Result<bool>
    where
        K: FetchStrategy<S> + ?Sized,
    {
        let start = hooks.on_fetch_start();
        match self.pull()? {
            Some(batch) => {
                hooks.on_fetch_end(batch, start)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn setup(&mut self, source: SourceSet<S>) {
        debug!(
            fetcher = self.name,
            children = source.children().len(),
            "bound source"
        );
        self.source = Some(source);
        self.phase = Phase::Ready;
    }

    fn begin_pass(&mut self) -> Result<()> {
        self.iterator = None;
        self.iterator_ids.clear();
        self.states.clear();

        let capture_progress = self.capture_progress;
        let source = self.source_mut()?;
        if capture_progress {
            source.enable_progress_capture();
        }
        let iterator = match source.iter() {
            Ok(iterator) => iterator,
            Err(err) => {
                self.phase = Phase::Ready;
                return Err(err);
            }
        };

        self.iterator_ids = iterator.children().iter().map(|_| Uuid::new_v4()).collect();
        self.states = self
            .iterator_ids
            .iter()
            .map(|id| (*id, IterationStateMerger::new()))
            .collect();
        self.iterator = Some(iterator);
        self.phase = Phase::Iterating;

        debug!(
            fetcher = self.name,
            prefetch_batches = self.prefetch_batches,
            children = self.iterator_ids.len(),
            capture_progress,
            "entering iteration"
        );
        Ok(())
    }

    fn reset(&mut self) {
        trace!(fetcher = self.name, fetched = self.fetched, "reset counters");
        self.fetched = 0;
        self.done = false;
        if matches!(self.phase, Phase::Iterating | Phase::Exhausted) {
            self.phase = Phase::Reset;
        }
    }

    fn teardown(&mut self) -> Result<()> {
        self.reset();
        self.iterator = None;
        self.iterator_ids.clear();
        self.states.clear();

        match self.source.as_mut() {
            Some(source) => {
                source.shutdown_workers_and_reset()?;
                self.phase = Phase::Reset;
                debug!(fetcher = self.name, "torn down");
            }
            None => self.phase = Phase::Unconfigured,
        }
        Ok(())
    }
}

impl<S: Source> fmt::Debug for FetcherCore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherCore")
            .field("name", &self.name)
            .field("prefetch_batches", &self.prefetch_batches)
            .field("capture_progress", &self.capture_progress)
            .field("fetched", &self.fetched)
            .field("done", &self.done)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// A fetcher: lifecycle state plus a fetching strategy
pub struct Fetcher<S: Source, K> {
    core: FetcherCore<S>,
    strategy: K,
}

impl<S: Source, K> fmt::Debug for Fetcher<S, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<S: Source, K: FetchStrategy<S>> Fetcher<S, K> {
    fn from_parts(name: &'static str, config: &FetcherConfig, strategy: K) -> Self {
        Self {
            core: FetcherCore::new(name, config),
            strategy,
        }
    }

    /// Enable or disable progress capture for the following passes
    #[must_use]
    pub fn with_progress_capture(mut self, enabled: bool) -> Self {
        self.core.capture_progress = enabled;
        self
    }

    /// Bind the sources to iterate
    pub fn setup(&mut self, source: SourceSet<S>) {
        self.core.setup(source);
    }

    /// Start a new pass: clear counters, obtain a fresh iterator and run the
    /// strategy's initial look-ahead
    pub fn enter_iteration(&mut self) -> Result<&mut Self> {
        self.reset();
        self.core.begin_pass()?;
        self.strategy.prefetching(&mut self.core)?;
        Ok(self)
    }

    /// Hand out the next unit, or [`FetchError::Exhausted`] at the end
    pub fn advance(&mut self) -> Result<K::Output<'_>> {
        self.core.source()?;
        if self.core.iterator.is_none() {
            return Err(FetchError::NotIterating);
        }
        self.strategy.fetching_function(&mut self.core)
    }

    /// Clear counters and per-pass buffers. Idempotent.
    pub fn reset(&mut self) {
        self.core.reset();
        self.strategy.reset();
    }

    /// Reset, release the iterator and shut down the sources' workers.
    ///
    /// Safe at any point; unconsumed buffered batches and in-flight
    /// transfers are dropped without waiting on them.
    pub fn teardown(&mut self) -> Result<()> {
        self.strategy.reset();
        self.core.teardown()
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    /// Look-ahead depth
    pub fn prefetch_batches(&self) -> usize {
        self.core.prefetch_batches()
    }

    /// Batches pulled in the current pass
    pub fn fetched(&self) -> usize {
        self.core.fetched()
    }

    /// Whether the underlying iterator has run out
    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    /// The bound sources
    pub fn source(&self) -> Result<&SourceSet<S>> {
        self.core.source()
    }

    /// Child sources, one for a single source
    pub fn child_sources(&self) -> Result<&[S]> {
        self.core.child_sources()
    }

    /// Child iterators of the active pass
    pub fn child_iterators(&self) -> Result<&[S::Iter]> {
        self.core.child_iterators()
    }

    /// Identities of the child iterators of the active pass
    pub fn iterator_ids(&self) -> Result<&[Uuid]> {
        self.core.iterator_ids()
    }

    /// Visible merged state of each child iterator
    pub fn child_states(&self) -> Result<Vec<&MergedState>> {
        self.core.child_states()
    }

    /// Feed progress tokens for one child iterator
    pub fn store_progress(&mut self, iterator: Uuid, tokens: Vec<ProgressToken>) {
        self.core.store_progress(iterator, tokens);
    }

    /// The fetching strategy
    pub fn strategy(&self) -> &K {
        &self.strategy
    }

    /// Snapshot the visible state of the active pass
    pub fn checkpoint(&self) -> Result<FetcherCheckpoint> {
        Ok(FetcherCheckpoint {
            fetched: self.core.fetched(),
            states: self.child_states()?.into_iter().cloned().collect(),
        })
    }

    /// Hand a checkpoint's states to the bound sources so that the next
    /// pass resumes where the checkpointed one left off
    pub fn restore(&mut self, checkpoint: &FetcherCheckpoint) -> Result<()> {
        self.core.source_mut()?.load_states(&checkpoint.states)?;
        debug!(
            fetcher = self.core.name,
            fetched = checkpoint.fetched,
            "restored checkpoint"
        );
        Ok(())
    }
}
