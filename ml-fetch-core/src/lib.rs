//! Batch fetching for ML training loops
//!
//! This crate decouples pulling input batches from the loop that consumes
//! them. Fetchers keep a configurable look-ahead so the consumer learns one
//! batch early whether the sequence is ending, can overlap device transfer
//! of upcoming batches with computation on the current one, or can hand the
//! raw iterator to the consumer while still tracking progress. Per-source
//! progress is merged into a checkpoint-able state that trails consumption,
//! so an interrupted pass can be resumed exactly.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod fetcher;
pub mod source;
pub mod state;
pub mod transfer;

// Re-export key types for convenience
pub use config::FetcherConfig;
pub use error::{FetchError, Result};
pub use fetcher::{
    CallerDrivenFetcher, FetchStrategy, Fetcher, FetcherCore, OverlappedTransferFetcher, Phase,
    SynchronousPrefetchFetcher,
};
pub use source::{BatchSet, InMemorySource, Source, SourceIterator, SourceSet};
pub use state::{FetcherCheckpoint, IterationStateMerger, MergedState, ProgressToken};
pub use transfer::{HostTransferStream, TransferEvent, TransferStream};
