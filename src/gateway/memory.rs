//! In-process sharded keyspace
//!
//! Serves SCAN round-trips from sorted in-memory key lists with the same
//! cursor contract as a Redis node: the cursor is an offset into the shard,
//! `COUNT` bounds how many keys are examined (not returned), filtered
//! batches may be empty, and a returned cursor of 0 means the shard is done.
//!
//! Used by the test suite and the benchmarks. Shards can be given latency
//! and can be told to fail after a number of round-trips.

use super::pattern::GlobPattern;
use super::{NodeId, ScanBatch, ScanGateway, ScanRequest, ShardDirectory, ShardRef};
use crate::error::{ScanError, ScanResult};
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One shard of a [`MemoryKeyspace`]
#[derive(Debug)]
pub struct MemoryShard {
    shard: ShardRef,
    node: NodeId,
    keys: Vec<String>,
    latency: Option<Duration>,
    fail_after: Option<u64>,
    round_trips: AtomicU64,
    /// Last compiled MATCH pattern
    pattern: Mutex<Option<GlobPattern>>,
}

impl MemoryShard {
    /// Create a shard served by a node of the same name
    pub fn new<I, S>(name: &str, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();

        Self {
            shard: ShardRef::new(name),
            node: NodeId::new(format!("{}#primary", name)),
            keys,
            latency: None,
            fail_after: None,
            round_trips: AtomicU64::new(0),
            pattern: Mutex::new(None),
        }
    }

    /// Delay every round-trip
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every round-trip after the first `rounds`
    pub fn fail_after(mut self, rounds: u64) -> Self {
        self.fail_after = Some(rounds);
        self
    }

    pub fn shard(&self) -> &ShardRef {
        &self.shard
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn serve(&self, round: u64, request: &ScanRequest) -> ScanResult<ScanBatch> {
        if let Some(limit) = self.fail_after {
            if round > limit {
                return Err(ScanError::Transport {
                    shard: self.shard.to_string(),
                    reason: format!("injected failure on round-trip {}", round),
                });
            }
        }

        if let Some(node) = &request.node {
            if node != &self.node {
                return Err(ScanError::Protocol {
                    shard: self.shard.to_string(),
                    reason: format!("cursor issued by '{}' sent to '{}'", node, self.node),
                });
            }
        }

        let pattern = self.compiled(&request.pattern)?;

        let start = usize::try_from(request.position).unwrap_or(usize::MAX).min(self.keys.len());
        let end = start.saturating_add(request.batch_hint.max(1)).min(self.keys.len());

        let values = self.keys[start..end]
            .iter()
            .filter(|key| pattern.matches_all() || pattern.is_match(key))
            .cloned()
            .collect();

        let next_position = if end >= self.keys.len() { 0 } else { end as u64 };

        Ok(ScanBatch {
            values,
            next_position,
            responding_node: self.node.clone(),
        })
    }

    /// Compiled form of `pattern`, reused while scans keep asking for it
    fn compiled(&self, pattern: &str) -> ScanResult<GlobPattern> {
        let mut cached = self.pattern.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(glob) = cached.as_ref().filter(|glob| glob.as_str() == pattern) {
            return Ok(glob.clone());
        }

        let glob = GlobPattern::new(pattern).map_err(|e| ScanError::Protocol {
            shard: self.shard.to_string(),
            reason: e.to_string(),
        })?;
        *cached = Some(glob.clone());
        Ok(glob)
    }
}

/// Sharded keyspace held in memory
#[derive(Debug, Default)]
pub struct MemoryKeyspace {
    shards: Vec<Arc<MemoryShard>>,
}

impl MemoryKeyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spread keys round-robin over `shard_count` shards named `shard-N`
    pub fn with_keys<I, S>(shard_count: usize, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let shard_count = shard_count.max(1);
        let mut buckets: Vec<Vec<String>> = vec![Vec::new(); shard_count];
        for (i, key) in keys.into_iter().enumerate() {
            buckets[i % shard_count].push(key.into());
        }

        buckets
            .into_iter()
            .enumerate()
            .fold(Self::new(), |space, (i, keys)| {
                space.with_shard(MemoryShard::new(&format!("shard-{}", i), keys))
            })
    }

    /// Add a shard
    pub fn with_shard(mut self, shard: MemoryShard) -> Self {
        self.shards.push(Arc::new(shard));
        self
    }

    /// Look up a shard by reference
    pub fn shard(&self, shard: &ShardRef) -> Option<&MemoryShard> {
        self.shards.iter().find(|s| &s.shard == shard).map(|s| s.as_ref())
    }

    /// Round-trips issued so far against a shard
    pub fn round_trips(&self, shard: &ShardRef) -> u64 {
        self.shard(shard)
            .map(|s| s.round_trips.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Total keys across all shards
    pub fn key_count(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }
}

impl ShardDirectory for MemoryKeyspace {
    fn current_shards(&self) -> Vec<ShardRef> {
        self.shards.iter().map(|s| s.shard.clone()).collect()
    }
}

impl ScanGateway for MemoryKeyspace {
    fn scan(&self, request: ScanRequest) -> BoxFuture<'static, ScanResult<ScanBatch>> {
        let shard = match self.shards.iter().find(|s| s.shard == request.shard) {
            Some(shard) => Arc::clone(shard),
            None => {
                let err = ScanError::ConnectionFailed {
                    shard: request.shard.to_string(),
                    reason: "unknown shard".into(),
                };
                return futures::future::ready(Err(err)).boxed();
            }
        };

        // Counted at issue time, not when the future first runs
        let round = shard.round_trips.fetch_add(1, Ordering::SeqCst) + 1;

        async move {
            if let Some(latency) = shard.latency {
                tokio::time::sleep(latency).await;
            }
            shard.serve(round, &request)
        }
        .boxed()
    }
}
