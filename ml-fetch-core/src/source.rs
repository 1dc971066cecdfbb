//! Source collaborator contracts and the single/combined source traversal
//!
//! A fetcher never owns the logic that produces batches. It binds a
//! [`SourceSet`], asks it for a [`SourceSetIter`] at the start of every pass,
//! and pulls from that. Combined sets step all children in lockstep and stop
//! as soon as the shortest child runs out.

use std::slice;
use std::sync::Arc;

use crate::error::{FetchError, Result};
use crate::state::{MergedState, ProgressToken};

/// Active iteration cursor over one source
pub trait SourceIterator {
    /// Batch type produced by this iterator
    type Batch;

    /// Pull the next batch. Returns `None` once exhausted, and keeps
    /// returning `None` on later calls.
    fn next_batch(&mut self) -> Result<Option<Self::Batch>>;

    /// Progress tokens attached by the pulls since the last call
    fn take_progress(&mut self) -> Vec<ProgressToken> {
        Vec::new()
    }
}

/// A sequence of batches that can be iterated repeatedly
pub trait Source {
    /// Batch type produced by this source
    type Batch;

    /// Iterator type produced by [`Source::iter`]
    type Iter: SourceIterator<Batch = Self::Batch>;

    /// Start a new iteration pass
    fn iter(&mut self) -> Result<Self::Iter>;

    /// Reset the source's own iteration cursor
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop background workers, then reset
    fn shutdown_workers_and_reset(&mut self) -> Result<()> {
        self.reset()
    }

    /// Make iterators created from now on emit progress tokens
    fn enable_progress_capture(&mut self) {}

    /// Resume the next pass from a previously captured state
    fn load_state(&mut self, _state: &MergedState) -> Result<()> {
        Ok(())
    }
}

impl<S: Source + ?Sized> Source for &mut S {
    type Batch = S::Batch;
    type Iter = S::Iter;

    fn iter(&mut self) -> Result<Self::Iter> {
        (**self).iter()
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn shutdown_workers_and_reset(&mut self) -> Result<()> {
        (**self).shutdown_workers_and_reset()
    }

    fn enable_progress_capture(&mut self) {
        (**self).enable_progress_capture();
    }

    fn load_state(&mut self, state: &MergedState) -> Result<()> {
        (**self).load_state(state)
    }
}

/// One batch, or one batch per child of a combined source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSet<B> {
    /// Batch from a single source
    Single(B),
    /// One batch from each child, in child order
    Combined(Vec<B>),
}

impl<B> BatchSet<B> {
    /// Apply `f` to every batch in the set
    pub fn map<F>(self, mut f: F) -> Self
    where
        F: FnMut(B) -> B,
    {
        match self {
            BatchSet::Single(batch) => BatchSet::Single(f(batch)),
            BatchSet::Combined(batches) => BatchSet::Combined(batches.into_iter().map(f).collect()),
        }
    }

    /// Batches in the set, in child order
    pub fn as_slice(&self) -> &[B] {
        match self {
            BatchSet::Single(batch) => slice::from_ref(batch),
            BatchSet::Combined(batches) => batches,
        }
    }

    /// The batch of a single-source set
    pub fn into_single(self) -> Option<B> {
        match self {
            BatchSet::Single(batch) => Some(batch),
            BatchSet::Combined(_) => None,
        }
    }
}

/// The sources bound to a fetcher
#[derive(Debug, Clone)]
pub enum SourceSet<S> {
    /// A single source
    Single(S),
    /// Several sources iterated in lockstep
    Combined(Vec<S>),
}

impl<S> SourceSet<S> {
    /// Bind one source
    pub fn single(source: S) -> Self {
        SourceSet::Single(source)
    }

    /// Bind several sources iterated together
    pub fn combined(sources: Vec<S>) -> Self {
        SourceSet::Combined(sources)
    }

    /// Child sources, a one-element slice for a single source
    pub fn children(&self) -> &[S] {
        match self {
            SourceSet::Single(source) => slice::from_ref(source),
            SourceSet::Combined(sources) => sources,
        }
    }

    /// Mutable child sources
    pub fn children_mut(&mut self) -> &mut [S] {
        match self {
            SourceSet::Single(source) => slice::from_mut(source),
            SourceSet::Combined(sources) => sources,
        }
    }
}

impl<S: Source> SourceSet<S> {
    /// Start an iteration pass over every child
    pub fn iter(&mut self) -> Result<SourceSetIter<S::Iter>> {
        Ok(match self {
            SourceSet::Single(source) => SourceSetIter::Single(source.iter()?),
            SourceSet::Combined(sources) => SourceSetIter::Combined(
                sources
                    .iter_mut()
                    .map(Source::iter)
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    /// Instrument every child for progress capture
    pub fn enable_progress_capture(&mut self) {
        self.children_mut()
            .iter_mut()
            .for_each(Source::enable_progress_capture);
    }

    /// Shut down every child's workers and reset it
    pub fn shutdown_workers_and_reset(&mut self) -> Result<()> {
        self.children_mut()
            .iter_mut()
            .try_for_each(Source::shutdown_workers_and_reset)
    }

    /// Hand each child the state captured for it
    pub fn load_states(&mut self, states: &[MergedState]) -> Result<()> {
        let children = self.children_mut();
        if children.len() != states.len() {
            return Err(FetchError::Checkpoint(format!(
                "checkpoint holds {} iterator states but {} sources are bound",
                states.len(),
                children.len()
            )));
        }
        children
            .iter_mut()
            .zip(states)
            .try_for_each(|(source, state)| source.load_state(state))
    }
}

/// Iteration cursor over a [`SourceSet`]
#[derive(Debug)]
pub enum SourceSetIter<I> {
    /// Cursor over a single source
    Single(I),
    /// One cursor per child source
    Combined(Vec<I>),
}

impl<I: SourceIterator> SourceSetIter<I> {
    /// Pull the next batch set
    pub fn next_batch(&mut self) -> Result<Option<BatchSet<I::Batch>>> {
        match self {
            SourceSetIter::Single(iter) => Ok(iter.next_batch()?.map(BatchSet::Single)),
            SourceSetIter::Combined(iters) => {
                if iters.is_empty() {
                    return Ok(None);
                }
                let mut batches = Vec::with_capacity(iters.len());
                for iter in iters.iter_mut() {
                    match iter.next_batch()? {
                        Some(batch) => batches.push(batch),
                        None => return Ok(None),
                    }
                }
                Ok(Some(BatchSet::Combined(batches)))
            }
        }
    }
}

impl<I> SourceSetIter<I> {
    /// Child iterators, a one-element slice for a single source
    pub fn children(&self) -> &[I] {
        match self {
            SourceSetIter::Single(iter) => slice::from_ref(iter),
            SourceSetIter::Combined(iters) => iters,
        }
    }

    /// Mutable child iterators
    pub fn children_mut(&mut self) -> &mut [I] {
        match self {
            SourceSetIter::Single(iter) => slice::from_mut(iter),
            SourceSetIter::Combined(iters) => iters,
        }
    }
}

/// A replayable source backed by batches held in memory
///
/// When instrumented it attaches one [`ProgressToken`] per pull, carrying the
/// number of batches produced so far, and it can resume from such a token.
#[derive(Debug, Clone)]
pub struct InMemorySource<B> {
    name: String,
    batches: Arc<[B]>,
    capture_progress: bool,
    resume_from: usize,
    passes: usize,
    shutdowns: usize,
}

impl<B: Clone> InMemorySource<B> {
    /// Create a named source over `batches`
    pub fn new(name: impl Into<String>, batches: Vec<B>) -> Self {
        Self {
            name: name.into(),
            batches: batches.into(),
            capture_progress: false,
            resume_from: 0,
            passes: 0,
            shutdowns: 0,
        }
    }

    /// Name used in progress tokens
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of batches in one full pass
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether the source holds no batches
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Number of iteration passes started
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Number of times workers were shut down
    pub fn shutdowns(&self) -> usize {
        self.shutdowns
    }
}

impl<B: Clone> Source for InMemorySource<B> {
    type Batch = B;
    type Iter = InMemoryIter<B>;

    fn iter(&mut self) -> Result<Self::Iter> {
        self.passes += 1;
        Ok(InMemoryIter {
            name: self.name.clone(),
            batches: Arc::clone(&self.batches),
            position: std::mem::take(&mut self.resume_from),
            capture_progress: self.capture_progress,
            progress: Vec::new(),
        })
    }

    fn reset(&mut self) -> Result<()> {
        self.resume_from = 0;
        Ok(())
    }

    fn shutdown_workers_and_reset(&mut self) -> Result<()> {
        self.shutdowns += 1;
        self.reset()
    }

    fn enable_progress_capture(&mut self) {
        self.capture_progress = true;
    }

    fn load_state(&mut self, state: &MergedState) -> Result<()> {
        if let Some(token) = state.get(&self.name) {
            let position = usize::try_from(token.num_batches_fetched).map_err(|_| {
                FetchError::Checkpoint(format!("position of `{}` out of range", self.name))
            })?;
            self.resume_from = position.min(self.batches.len());
        }
        Ok(())
    }
}

/// Iterator over an [`InMemorySource`]
#[derive(Debug)]
pub struct InMemoryIter<B> {
    name: String,
    batches: Arc<[B]>,
    position: usize,
    capture_progress: bool,
    progress: Vec<ProgressToken>,
}

impl<B: Clone> SourceIterator for InMemoryIter<B> {
    type Batch = B;

    fn next_batch(&mut self) -> Result<Option<B>> {
        let Some(batch) = self.batches.get(self.position).cloned() else {
            return Ok(None);
        };
        self.position += 1;

        if self.capture_progress {
            let position = self.position as u64;
            self.progress.push(
                ProgressToken::new(self.name.clone(), 0, position)
                    .with_state(position.to_le_bytes().to_vec()),
            );
        }
        Ok(Some(batch))
    }

    fn take_progress(&mut self) -> Vec<ProgressToken> {
        std::mem::take(&mut self.progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<I: SourceIterator>(iter: &mut SourceSetIter<I>) -> Vec<BatchSet<I::Batch>> {
        let mut out = Vec::new();
        while let Some(batch) = iter.next_batch().unwrap() {
            out.push(batch);
        }
        out
    }

    #[test]
    fn test_single_source_iteration() {
        let mut set = SourceSet::single(InMemorySource::new("a", vec![1, 2, 3]));
        let mut iter = set.iter().unwrap();

        let batches = drain(&mut iter);
        assert_eq!(batches, vec![BatchSet::Single(1), BatchSet::Single(2), BatchSet::Single(3)]);
        assert!(iter.next_batch().unwrap().is_none());
        assert_eq!(iter.children().len(), 1);
    }

    #[test]
    fn test_combined_stops_at_shortest_child() {
        let mut set = SourceSet::combined(vec![
            InMemorySource::new("a", vec![1, 2, 3]),
            InMemorySource::new("b", vec![10, 20]),
        ]);
        let mut iter = set.iter().unwrap();

        let batches = drain(&mut iter);
        assert_eq!(
            batches,
            vec![BatchSet::Combined(vec![1, 10]), BatchSet::Combined(vec![2, 20])]
        );
    }

    #[test]
    fn test_empty_combined_set_is_exhausted() {
        let mut set: SourceSet<InMemorySource<u8>> = SourceSet::combined(Vec::new());
        let mut iter = set.iter().unwrap();
        assert!(iter.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_batch_set_map_visits_every_member() {
        let mapped = BatchSet::Combined(vec![1, 2, 3]).map(|b| b * 10);
        assert_eq!(mapped.as_slice(), &[10, 20, 30]);
        assert_eq!(BatchSet::Single(4).map(|b| b + 1).into_single(), Some(5));
    }

    #[test]
    fn test_progress_tokens_only_when_instrumented() {
        let mut source = InMemorySource::new("a", vec!['x', 'y']);
        let mut plain = source.iter().unwrap();
        plain.next_batch().unwrap();
        assert!(plain.take_progress().is_empty());

        source.enable_progress_capture();
        let mut captured = source.iter().unwrap();
        captured.next_batch().unwrap();
        captured.next_batch().unwrap();
        let tokens = captured.take_progress();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1].num_batches_fetched, 2);
        assert!(captured.take_progress().is_empty());
    }

    #[test]
    fn test_load_state_resumes_next_pass_only() {
        let mut source = InMemorySource::new("a", vec![1, 2, 3, 4]);
        let mut state = MergedState::default();
        state.update(ProgressToken::new("a", 0, 2));
        source.load_state(&state).unwrap();

        let mut resumed = source.iter().unwrap();
        assert_eq!(resumed.next_batch().unwrap(), Some(3));

        let mut fresh = source.iter().unwrap();
        assert_eq!(fresh.next_batch().unwrap(), Some(1));
        assert_eq!(source.passes(), 2);
    }

    #[test]
    fn test_load_states_checks_child_count() {
        let mut set = SourceSet::combined(vec![
            InMemorySource::new("a", vec![1]),
            InMemorySource::new("b", vec![2]),
        ]);
        let err = set.load_states(&[MergedState::default()]).unwrap_err();
        assert!(matches!(err, FetchError::Checkpoint(_)));
    }

    #[test]
    fn test_borrowed_source_is_a_source() {
        let mut owned = InMemorySource::new("a", vec![1, 2]);
        {
            let mut set = SourceSet::single(&mut owned);
            set.shutdown_workers_and_reset().unwrap();
            let mut iter = set.iter().unwrap();
            assert_eq!(iter.next_batch().unwrap(), Some(BatchSet::Single(1)));
        }
        assert_eq!(owned.shutdowns(), 1);
        assert_eq!(owned.passes(), 1);
    }
}
