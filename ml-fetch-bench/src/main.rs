//! Benchmark runner for batch fetchers

use std::time::Duration;

use anyhow::Result;
use ml_fetch_bench::{compare_fetchers, BenchConfig, BenchResult};
use tracing::Level;
use tracing_subscriber::fmt;

fn print_result(result: &BenchResult) {
    println!("\nFetcher: {}", result.name);
    println!("  Total time:   {:?}", result.total_time);
    println!("  Average time: {:?}", result.avg_time);
    println!("  Min time:     {:?}", result.min_time);
    println!("  Max time:     {:?}", result.max_time);
    println!("  Throughput:   {:.2} batches/sec", result.throughput);
}

fn main() -> Result<()> {
    // stdout carries the report
    fmt::Subscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    // optional path for a JSON copy of every result row
    let json_path = std::env::args().nth(1);

    println!("=== Batch Fetcher Benchmarks ===");

    let config = BenchConfig::default();
    let mut rows = Vec::new();

    for result in compare_fetchers(&config)? {
        print_result(&result);
        rows.push(result);
    }

    // Transfer-bound and compute-bound regimes
    println!("\n=== Transfer vs Compute ===");
    for (transfer_ms, compute_ms) in [(8, 2), (4, 4), (2, 8)] {
        let config = BenchConfig {
            transfer_latency: Duration::from_millis(transfer_ms),
            compute_latency: Duration::from_millis(compute_ms),
            ..BenchConfig::default()
        };
        println!("\nTransfer {transfer_ms} ms, compute {compute_ms} ms");
        for result in compare_fetchers(&config)? {
            println!("  {:<28} {:?}", result.name, result.avg_time);
            rows.push(result);
        }
    }

    // Look-ahead depth
    println!("\n=== Prefetch Depth ===");
    for prefetch_batches in [1, 2, 4, 8] {
        let config = BenchConfig {
            prefetch_batches,
            ..BenchConfig::default()
        };
        println!("\nprefetch_batches: {prefetch_batches}");
        for result in compare_fetchers(&config)? {
            println!(
                "  {:<28} {:.2} batches/sec",
                result.name, result.throughput
            );
            rows.push(result);
        }
    }

    if let Some(path) = json_path {
        std::fs::write(&path, serde_json::to_string_pretty(&rows)?)?;
        tracing::info!(%path, rows = rows.len(), "wrote results");
    }

    Ok(())
}
