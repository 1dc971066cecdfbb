//! Per-source progress tokens and their lag-delayed merge into checkpoint state
//!
//! Sources emit a [`ProgressToken`] every time a batch is pulled. Tokens are
//! buffered per source name and only folded into the visible [`MergedState`]
//! once the look-ahead buffer in front of them has drained, so the visible
//! state always matches what the consumer has actually received.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Result;

/// Snapshot of one source's iteration position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressToken {
    /// Name of the source that produced this token
    pub name: String,

    /// Worker that produced the batch
    pub worker_id: u32,

    /// Batches produced by the source up to and including this one
    pub num_batches_fetched: u64,

    /// Source-specific opaque state
    pub state: Vec<u8>,
}

impl ProgressToken {
    /// Create a token with an empty opaque payload
    pub fn new(name: impl Into<String>, worker_id: u32, num_batches_fetched: u64) -> Self {
        Self {
            name: name.into(),
            worker_id,
            num_batches_fetched,
            state: Vec::new(),
        }
    }

    /// Attach an opaque payload
    pub fn with_state(mut self, state: Vec<u8>) -> Self {
        self.state = state;
        self
    }
}

/// Visible progress of one iterator, keyed by source name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedState {
    tokens: BTreeMap<String, ProgressToken>,
    latest: Option<String>,
    previous: Option<Box<MergedState>>,
}

impl MergedState {
    /// Number of sources with a merged token
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether nothing has been merged yet
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Token currently applicable to the named source
    pub fn get(&self, name: &str) -> Option<&ProgressToken> {
        self.tokens.get(name)
    }

    /// All tokens, ordered by source name
    pub fn tokens(&self) -> impl Iterator<Item = &ProgressToken> {
        self.tokens.values()
    }

    /// Name of the source merged most recently
    pub fn latest(&self) -> Option<&str> {
        self.latest.as_deref()
    }

    /// The merged snapshot immediately before the last update
    pub fn previous(&self) -> Option<&MergedState> {
        self.previous.as_deref()
    }

    /// Replace the token for its source name
    pub fn update(&mut self, token: ProgressToken) {
        self.latest = Some(token.name.clone());
        self.tokens.insert(token.name.clone(), token);
    }

    /// Copy of this state without its own history
    fn snapshot(&self) -> MergedState {
        MergedState {
            tokens: self.tokens.clone(),
            latest: self.latest.clone(),
            previous: None,
        }
    }

    /// Encode as bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from bytes produced by [`MergedState::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Buffers progress tokens and folds them into a [`MergedState`]
#[derive(Debug, Default, Clone)]
pub struct IterationStateMerger {
    cache: HashMap<String, VecDeque<ProgressToken>>,
    state: MergedState,
}

impl IterationStateMerger {
    /// Create an empty merger
    pub fn new() -> Self {
        Self::default()
    }

    /// The externally visible state
    pub fn state(&self) -> &MergedState {
        &self.state
    }

    /// Tokens buffered but not yet visible, for the named source
    pub fn pending(&self, name: &str) -> usize {
        self.cache.get(name).map_or(0, VecDeque::len)
    }

    /// Buffer incoming tokens and, once `fetched >= prefetch_batches`, merge
    /// the oldest buffered token of each incoming name.
    ///
    /// `fetched` is the number of batches pulled before the one these tokens
    /// describe.
    pub fn store(&mut self, tokens: Vec<ProgressToken>, fetched: usize, prefetch_batches: usize) {
        let names: Vec<String> = tokens.iter().map(|token| token.name.clone()).collect();

        for token in tokens {
            self.cache
                .entry(token.name.clone())
                .or_default()
                .push_back(token);
        }

        if fetched < prefetch_batches {
            return;
        }

        for name in names {
            if !self.state.is_empty() {
                self.state.previous = Some(Box::new(self.state.snapshot()));
            }
            if let Some(token) = self.cache.get_mut(&name).and_then(VecDeque::pop_front) {
                trace!(
                    source = %name,
                    num_batches_fetched = token.num_batches_fetched,
                    "merged progress token"
                );
                self.state.update(token);
            }
        }
    }
}

/// Resumable state of a whole fetcher: one merged state per child iterator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetcherCheckpoint {
    /// Batches pulled from the source when the checkpoint was taken
    pub fetched: usize,

    /// Merged state of each child iterator, in child order
    pub states: Vec<MergedState>,
}

impl FetcherCheckpoint {
    /// Write the checkpoint to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, bincode::serialize(self)?)?;
        Ok(())
    }

    /// Read a checkpoint written by [`FetcherCheckpoint::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}
