//! Caller-driven fetching
//!
//! Instead of batches, the consumer receives the iterator itself and pulls
//! whenever it likes. Pulls still go through the fetcher so that fetch
//! counts, exhaustion and progress capture stay accurate. No device
//! placement is applied in this mode.

use tracing::debug;

use super::{FetchStrategy, Fetcher, FetcherCore};
use crate::config::FetcherConfig;
use crate::error::Result;
use crate::source::{BatchSet, Source};

/// Strategy that hands the iterator to the consumer
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerDriven;

impl<S: Source> FetchStrategy<S> for CallerDriven {
    type Output<'a> = (usize, (StepIter<'a, S>, bool))
    where
        Self: 'a,
        S: 'a;

    type Start = ();

    fn prefetching(&mut self, core: &mut FetcherCore<S>) -> Result<()> {
        debug!(fetched = core.fetched(), "handing iterator to the caller");
        Ok(())
    }

    fn fetching_function<'a>(
        &'a mut self,
        core: &'a mut FetcherCore<S>,
    ) -> Result<(usize, (StepIter<'a, S>, bool))> {
        if core.is_done() {
            return Err(core.exhausted());
        }
        let fetched = core.fetched();
        let done = core.is_done();
        Ok((fetched, (StepIter { core }, done)))
    }

    fn on_fetch_start(&mut self) {}

    fn on_fetch_end(&mut self, _batch: BatchSet<S::Batch>, _start: ()) -> Result<()> {
        Ok(())
    }
}

/// Counting wrapper around the source iterator, lent to the consumer
#[derive(Debug)]
pub struct StepIter<'a, S: Source> {
    core: &'a mut FetcherCore<S>,
}

impl<S: Source> StepIter<'_, S> {
    /// Batches pulled so far in this pass
    pub fn fetched(&self) -> usize {
        self.core.fetched()
    }

    /// Whether a pull has hit the end of the source
    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }
}

impl<S: Source> Iterator for StepIter<'_, S> {
    type Item = Result<BatchSet<S::Batch>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.core.pull() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.core.mark_done();
                None
            }
            Err(err) => Some(Err(err)),
        }
    }
}

/// Fetcher that cedes iteration to the consumer while tracking progress
pub type CallerDrivenFetcher<S> = Fetcher<S, CallerDriven>;

impl<S: Source> Fetcher<S, CallerDriven> {
    /// Create a caller-driven fetcher; it keeps no look-ahead and never
    /// places batches on a device
    pub fn new() -> Self {
        let config = FetcherConfig {
            prefetch_batches: 0,
            store_on_device: false,
            capture_progress: false,
        };
        Self::from_parts("CallerDrivenFetcher", &config, CallerDriven)
    }
}

impl<S: Source> Default for Fetcher<S, CallerDriven> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::source::{InMemorySource, SourceSet};

    type Fetch = CallerDrivenFetcher<InMemorySource<i32>>;

    #[test]
    fn test_consumer_pulls_through_wrapper() {
        let mut fetcher = Fetch::new();
        fetcher.setup(SourceSet::single(InMemorySource::new("n", vec![1, 2, 3])));
        fetcher.enter_iteration().unwrap();
        assert_eq!(fetcher.fetched(), 0);

        let (fetched, (mut iter, done)) = fetcher.advance().unwrap();
        assert_eq!(fetched, 0);
        assert!(!done);

        let mut pulled = Vec::new();
        for expected_fetched in 1..=3 {
            let batch = iter.next().unwrap().unwrap();
            pulled.push(batch.into_single().unwrap());
            assert_eq!(iter.fetched(), expected_fetched);
            assert!(!iter.is_done());
        }
        assert!(iter.next().is_none());
        assert!(iter.is_done());
        assert_eq!(pulled, vec![1, 2, 3]);

        assert!(matches!(fetcher.advance(), Err(FetchError::Exhausted)));
    }

    #[test]
    fn test_partial_consumption_hands_out_same_cursor() {
        let mut fetcher = Fetch::new();
        fetcher.setup(SourceSet::single(InMemorySource::new("n", vec![1, 2, 3])));
        fetcher.enter_iteration().unwrap();

        {
            let (_, (mut iter, _)) = fetcher.advance().unwrap();
            iter.next().unwrap().unwrap();
        }
        let (fetched, (mut iter, done)) = fetcher.advance().unwrap();
        assert_eq!(fetched, 1);
        assert!(!done);
        assert_eq!(iter.next().unwrap().unwrap(), BatchSet::Single(2));
    }

    #[test]
    fn test_no_lookahead_and_no_placement() {
        let fetcher = Fetch::new();
        assert_eq!(fetcher.prefetch_batches(), 0);
    }
}
