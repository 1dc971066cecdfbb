//! Benchmarks for batch fetchers
//!
//! Compares synchronous look-ahead against overlapped device transfer on a
//! synthetic source whose pull, transfer and compute costs are simulated with
//! sleeps, so the effect of overlapping is visible independently of hardware.

use std::thread;
use std::time::{Duration, Instant};

use ml_fetch_core::{
    FetcherConfig, OverlappedTransferFetcher, Result, Source, SourceIterator, SourceSet,
    SynchronousPrefetchFetcher,
};
use serde::Serialize;
use tracing::debug;

/// Benchmark configuration
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Number of measured iterations
    pub iterations: usize,

    /// Warmup iterations
    pub warmup_iterations: usize,

    /// Batches per pass
    pub num_batches: usize,

    /// Look-ahead depth of the fetchers
    pub prefetch_batches: usize,

    /// Simulated cost of pulling one batch from the source
    pub pull_latency: Duration,

    /// Simulated cost of placing one batch on the device
    pub transfer_latency: Duration,

    /// Simulated cost of the training step on one batch
    pub compute_latency: Duration,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 5,
            warmup_iterations: 1,
            num_batches: 32,
            prefetch_batches: 2,
            pull_latency: Duration::from_millis(1),
            transfer_latency: Duration::from_millis(4),
            compute_latency: Duration::from_millis(4),
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone, Serialize)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Throughput (batches/second)
    pub throughput: f64,
}

/// Run `func` as a benchmark, propagating the first failure
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, mut func: F) -> Result<BenchResult>
where
    F: FnMut() -> Result<()>,
{
    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let start_total = Instant::now();

    for _ in 0..config.iterations {
        let start = Instant::now();
        func()?;
        times.push(start.elapsed());
    }

    let total_time = start_total.elapsed();

    let runs = u32::try_from(times.len().max(1)).unwrap_or(u32::MAX);
    let avg_time = times.iter().sum::<Duration>() / runs;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();

    #[allow(clippy::cast_precision_loss)]
    let total_batches = (config.iterations * config.num_batches) as f64;
    let throughput = if total_time.is_zero() {
        0.0
    } else {
        total_batches / total_time.as_secs_f64()
    };

    debug!(benchmark = name, ?avg_time, throughput, "benchmark finished");

    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        throughput,
    })
}

/// Source producing numbered batches at a fixed pull cost
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    num_batches: usize,
    pull_latency: Duration,
}

impl SyntheticSource {
    /// Create a source of `num_batches` batches, each taking `pull_latency`
    pub fn new(num_batches: usize, pull_latency: Duration) -> Self {
        Self {
            num_batches,
            pull_latency,
        }
    }
}

/// Iterator over a [`SyntheticSource`]
#[derive(Debug)]
pub struct SyntheticIter {
    next: usize,
    num_batches: usize,
    pull_latency: Duration,
}

impl Source for SyntheticSource {
    type Batch = Vec<f32>;
    type Iter = SyntheticIter;

    fn iter(&mut self) -> Result<SyntheticIter> {
        Ok(SyntheticIter {
            next: 0,
            num_batches: self.num_batches,
            pull_latency: self.pull_latency,
        })
    }
}

impl SourceIterator for SyntheticIter {
    type Batch = Vec<f32>;

    fn next_batch(&mut self) -> Result<Option<Vec<f32>>> {
        if self.next >= self.num_batches {
            return Ok(None);
        }
        thread::sleep(self.pull_latency);
        #[allow(clippy::cast_precision_loss)]
        let batch = vec![self.next as f32; 64];
        self.next += 1;
        Ok(Some(batch))
    }
}

fn fetcher_config(config: &BenchConfig) -> FetcherConfig {
    FetcherConfig::with_prefetch_batches(config.prefetch_batches)
}

fn source(config: &BenchConfig) -> SourceSet<SyntheticSource> {
    SourceSet::single(SyntheticSource::new(config.num_batches, config.pull_latency))
}

fn to_device(latency: Duration) -> impl Fn(Vec<f32>) -> Vec<f32> + Send + Sync + 'static {
    move |batch| {
        thread::sleep(latency);
        batch
    }
}

/// One pass with placement on the consumer's thread
pub fn bench_synchronous(config: &BenchConfig) -> Result<BenchResult> {
    let mut fetcher: SynchronousPrefetchFetcher<SyntheticSource> =
        SynchronousPrefetchFetcher::new(fetcher_config(config))?;
    fetcher.setup_with_device(source(config), to_device(config.transfer_latency));

    run_benchmark("SynchronousPrefetchFetcher", config, || {
        fetcher.enter_iteration()?;
        for item in fetcher.by_ref() {
            item?;
            thread::sleep(config.compute_latency);
        }
        Ok(())
    })
}

/// One pass with placement overlapped with the simulated compute
pub fn bench_overlapped(config: &BenchConfig) -> Result<BenchResult> {
    let mut fetcher: OverlappedTransferFetcher<SyntheticSource> =
        OverlappedTransferFetcher::new(fetcher_config(config))?;
    fetcher.setup_with_device(source(config), to_device(config.transfer_latency));

    run_benchmark("OverlappedTransferFetcher", config, || {
        fetcher.enter_iteration()?;
        for item in fetcher.by_ref() {
            item?;
            thread::sleep(config.compute_latency);
        }
        Ok(())
    })
}

/// Run both fetchers under the same configuration
pub fn compare_fetchers(config: &BenchConfig) -> Result<Vec<BenchResult>> {
    Ok(vec![bench_synchronous(config)?, bench_overlapped(config)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> BenchConfig {
        BenchConfig {
            iterations: 1,
            warmup_iterations: 0,
            num_batches: 10,
            prefetch_batches: 2,
            pull_latency: Duration::ZERO,
            transfer_latency: Duration::from_millis(10),
            compute_latency: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_run_benchmark_counts_iterations() {
        let config = BenchConfig {
            iterations: 3,
            warmup_iterations: 2,
            ..quick()
        };
        let mut calls = 0;
        let result = run_benchmark("noop", &config, || {
            calls += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(calls, 5);
        assert_eq!(result.name, "noop");
        assert!(result.min_time <= result.max_time);
    }

    #[test]
    fn test_run_benchmark_propagates_failure() {
        let result = run_benchmark("failing", &quick(), || {
            Err(ml_fetch_core::FetchError::Transfer("lost".into()))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_compare_runs_both_fetchers() {
        // wall-clock comparisons belong to the criterion bench
        let config = BenchConfig {
            iterations: 2,
            transfer_latency: Duration::ZERO,
            compute_latency: Duration::ZERO,
            ..quick()
        };
        let results = compare_fetchers(&config).unwrap();

        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["SynchronousPrefetchFetcher", "OverlappedTransferFetcher"]);
        assert!(results.iter().all(|r| r.min_time <= r.max_time));
    }
}
