//! Progress capture, visible-state lag and checkpoint resumption

use ml_fetch_core::{
    BatchSet, CallerDrivenFetcher, FetchError, FetcherCheckpoint, FetcherConfig, InMemorySource,
    MergedState, SourceSet, SynchronousPrefetchFetcher,
};
use tempfile::tempdir;
use test_case::test_case;

type Fetch = SynchronousPrefetchFetcher<InMemorySource<u32>>;

fn captured(depth: usize, len: u32) -> Fetch {
    let config = FetcherConfig::with_prefetch_batches(depth).capture_progress(true);
    let mut fetcher = Fetch::new(config).unwrap();
    fetcher.setup(SourceSet::single(InMemorySource::new("numbers", (0..len).collect())));
    fetcher
}

fn visible(states: &[&MergedState], name: &str) -> Option<u64> {
    states[0].get(name).map(|token| token.num_batches_fetched)
}

#[test_case(1, 6; "depth one")]
#[test_case(2, 10; "depth two")]
#[test_case(4, 9; "depth four")]
fn test_visible_state_trails_fetching(depth: usize, len: u32) {
    let mut fetcher = captured(depth, len);
    fetcher.enter_iteration().unwrap();

    // only look-ahead so far, nothing consumed
    assert_eq!(visible(&fetcher.child_states().unwrap(), "numbers"), None);

    let mut consumed = 0u64;
    while consumed + (depth as u64) < u64::from(len) {
        fetcher.advance().unwrap();
        consumed += 1;
        assert_eq!(fetcher.fetched() as u64, consumed + depth as u64);
        assert_eq!(
            visible(&fetcher.child_states().unwrap(), "numbers"),
            Some(consumed)
        );
    }
}

#[test]
fn test_previous_snapshot_kept() {
    let mut fetcher = captured(1, 5);
    fetcher.enter_iteration().unwrap();
    fetcher.advance().unwrap();
    fetcher.advance().unwrap();

    let states = fetcher.child_states().unwrap();
    assert_eq!(states[0].get("numbers").unwrap().num_batches_fetched, 2);
    let previous = states[0].previous().unwrap();
    assert_eq!(previous.get("numbers").unwrap().num_batches_fetched, 1);
    assert!(previous.previous().is_none());
}

#[test]
fn test_no_tokens_without_capture() {
    let mut fetcher = Fetch::new(FetcherConfig::with_prefetch_batches(1)).unwrap();
    fetcher.setup(SourceSet::single(InMemorySource::new("numbers", (0..4).collect())));
    fetcher.enter_iteration().unwrap();
    fetcher.advance().unwrap();
    fetcher.advance().unwrap();
    assert!(fetcher.child_states().unwrap()[0].is_empty());
}

#[test]
fn test_capture_enabled_from_json_config() {
    let config =
        FetcherConfig::from_json(r#"{"prefetch_batches": 1, "capture_progress": true}"#).unwrap();
    let mut fetcher = Fetch::new(config).unwrap();
    fetcher.setup(SourceSet::single(InMemorySource::new("numbers", (0..4).collect())));
    fetcher.enter_iteration().unwrap();
    fetcher.advance().unwrap();
    assert_eq!(visible(&fetcher.child_states().unwrap(), "numbers"), Some(1));
}

#[test]
fn test_resume_from_saved_checkpoint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fetcher.ckpt");

    let mut fetcher = captured(2, 10);
    fetcher.enter_iteration().unwrap();
    let consumed: Vec<u32> = (0..4)
        .map(|_| fetcher.advance().unwrap().0.into_single().unwrap())
        .collect();
    assert_eq!(consumed, vec![0, 1, 2, 3]);

    let checkpoint = fetcher.checkpoint().unwrap();
    assert_eq!(checkpoint.fetched, 6);
    checkpoint.save(&path).unwrap();
    fetcher.teardown().unwrap();

    // a different fetcher over the same data picks up where consumption stopped
    let loaded = FetcherCheckpoint::load(&path).unwrap();
    assert_eq!(loaded, checkpoint);

    let mut resumed = captured(3, 10);
    resumed.restore(&loaded).unwrap();
    resumed.enter_iteration().unwrap();
    let rest: Vec<(BatchSet<u32>, bool)> = resumed.by_ref().map(|item| item.unwrap()).collect();

    let batches: Vec<u32> = rest
        .iter()
        .map(|(batch, _)| batch.as_slice()[0])
        .collect();
    assert_eq!(batches, vec![4, 5, 6, 7, 8, 9]);
    assert!(rest.last().unwrap().1);

    // restoring applies to one pass only
    resumed.enter_iteration().unwrap();
    assert_eq!(resumed.count(), 10);
}

#[test]
fn test_combined_checkpoint_per_child() {
    let config = FetcherConfig::with_prefetch_batches(1).capture_progress(true);
    let sources = || {
        SourceSet::combined(vec![
            InMemorySource::new("left", (0..5).collect::<Vec<u32>>()),
            InMemorySource::new("right", (100..108).collect::<Vec<u32>>()),
        ])
    };

    let mut fetcher = Fetch::new(config.clone()).unwrap();
    fetcher.setup(sources());
    fetcher.enter_iteration().unwrap();
    fetcher.advance().unwrap();
    fetcher.advance().unwrap();

    let checkpoint = fetcher.checkpoint().unwrap();
    assert_eq!(checkpoint.states.len(), 2);
    assert_eq!(checkpoint.states[0].get("left").unwrap().num_batches_fetched, 2);
    assert_eq!(checkpoint.states[1].get("right").unwrap().num_batches_fetched, 2);

    let mut resumed = Fetch::new(config).unwrap();
    resumed.setup(sources());
    resumed.restore(&checkpoint).unwrap();
    resumed.enter_iteration().unwrap();
    assert_eq!(
        resumed.advance().unwrap(),
        (BatchSet::Combined(vec![2, 102]), false)
    );
}

#[test]
fn test_restore_rejects_mismatched_children() {
    let mut fetcher = Fetch::new(FetcherConfig::default()).unwrap();
    fetcher.setup(SourceSet::combined(vec![
        InMemorySource::new("left", vec![1]),
        InMemorySource::new("right", vec![2]),
    ]));
    let checkpoint = FetcherCheckpoint {
        fetched: 1,
        states: vec![MergedState::default()],
    };
    assert!(matches!(
        fetcher.restore(&checkpoint),
        Err(FetchError::Checkpoint(_))
    ));
}

#[test]
fn test_restore_needs_bound_source() {
    let mut fetcher = Fetch::new(FetcherConfig::default()).unwrap();
    assert!(matches!(
        fetcher.restore(&FetcherCheckpoint::default()),
        Err(FetchError::NotConfigured(_))
    ));
}

#[test]
fn test_caller_driven_state_has_no_lag() {
    let mut fetcher: CallerDrivenFetcher<InMemorySource<u32>> =
        CallerDrivenFetcher::new().with_progress_capture(true);
    fetcher.setup(SourceSet::single(InMemorySource::new("numbers", (0..4).collect())));
    fetcher.enter_iteration().unwrap();

    {
        let (_, (mut iter, _)) = fetcher.advance().unwrap();
        iter.next().unwrap().unwrap();
        iter.next().unwrap().unwrap();
    }
    assert_eq!(visible(&fetcher.child_states().unwrap(), "numbers"), Some(2));
}
