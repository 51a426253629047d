//! Cluster-wide key scanning
//!
//! [`KeyScanner`] ties the pieces together for one scan pass:
//!
//! ```text
//!   subscribe(pattern)
//!        │
//!        ▼
//!   ShardDirectory::current_shards()     snapshot, read once
//!        │
//!        ├──▶ shard task 0 ─┐
//!        ├──▶ shard task 1 ─┼──▶ merge task ──▶ Subscription / KeyStream
//!        └──▶ shard task N ─┘
//! ```
//!
//! Every call starts a fresh pass with new cursors. Keys present for the
//! whole pass are returned at least once; keys added or removed during the
//! pass may or may not show up, and duplicates across rounds are possible.

pub mod cursor;
pub mod merge;
pub mod shard;
pub mod stats;
pub mod subscription;

pub use self::cursor::{CursorPosition, Exhaustion, ScanCursor};
pub use self::stats::{ScanCounters, ScanProgress};
pub use self::subscription::{Subscription, SubscriptionHandle};

use crate::error::{ConfigError, ScanResult};
use crate::gateway::pattern::MATCH_ALL;
use crate::gateway::{ScanGateway, ShardDirectory};

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, info_span};
use uuid::Uuid;

/// Lazy sequence of keys produced by a scan
pub type KeyStream = BoxStream<'static, ScanResult<String>>;

/// Default COUNT hint per round-trip
pub const DEFAULT_BATCH_HINT: usize = 10;

/// Largest accepted COUNT hint
pub const MAX_BATCH_HINT: usize = 100_000;

/// Validated batch-size hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHint(usize);

impl BatchHint {
    pub fn new(hint: usize) -> Result<Self, ConfigError> {
        if hint == 0 || hint > MAX_BATCH_HINT {
            return Err(ConfigError::InvalidBatchHint {
                hint,
                min: 1,
                max: MAX_BATCH_HINT,
            });
        }
        Ok(Self(hint))
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for BatchHint {
    fn default() -> Self {
        Self(DEFAULT_BATCH_HINT)
    }
}

impl fmt::Display for BatchHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a shard does with the rest of a batch when demand runs out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemainderPolicy {
    /// Hold the remainder and emit it on the next request
    #[default]
    Buffer,
    /// Drop the remainder
    Discard,
}

/// Scanner options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// COUNT hint used by `scan_keys` and `keys`
    pub batch_hint: BatchHint,

    pub remainder: RemainderPolicy,

    /// Demand granted at a time by [`KeyStream`]s (defaults to the batch hint)
    pub prefetch: Option<u64>,
}

impl ScanOptions {
    pub fn with_batch_hint(mut self, hint: BatchHint) -> Self {
        self.batch_hint = hint;
        self
    }

    pub fn with_remainder(mut self, policy: RemainderPolicy) -> Self {
        self.remainder = policy;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u64) -> Self {
        self.prefetch = Some(prefetch.max(1));
        self
    }

    fn prefetch_for(&self, hint: BatchHint) -> u64 {
        self.prefetch.unwrap_or(hint.get() as u64)
    }
}

/// Scans the keys of a sharded keyspace
///
/// Cheap to clone; clones share the gateway and directory.
#[derive(Clone)]
pub struct KeyScanner {
    gateway: Arc<dyn ScanGateway>,
    directory: Arc<dyn ShardDirectory>,
    options: ScanOptions,
}

impl fmt::Debug for KeyScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyScanner")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl KeyScanner {
    pub fn new(gateway: Arc<dyn ScanGateway>, directory: Arc<dyn ShardDirectory>) -> Self {
        Self {
            gateway,
            directory,
            options: ScanOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Start a scan with the configured batch hint
    ///
    /// Nothing is fetched until demand is granted. Must be called from
    /// within a tokio runtime.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        self.subscribe_with_hint(pattern, self.options.batch_hint)
    }

    /// Start a scan with an explicit batch hint
    pub fn subscribe_with_hint(&self, pattern: &str, hint: BatchHint) -> Subscription {
        let shards = self.directory.current_shards();
        let scan_id = Uuid::new_v4().simple().to_string()[..8].to_string();

        let span = info_span!("scan", scan_id = %scan_id, pattern = %pattern);
        let _enter = span.enter();
        info!(
            shards = shards.len(),
            batch_hint = hint.get(),
            remainder = ?self.options.remainder,
            "Starting scan"
        );

        let counters = Arc::new(ScanCounters::new(shards.len()));
        let subscriptions = shards
            .into_iter()
            .map(|shard| {
                debug!("Spawning scan of {}", shard);
                shard::spawn_shard_scan(
                    Arc::clone(&self.gateway),
                    ScanCursor::new(shard, pattern, hint.get()),
                    self.options.remainder,
                    Arc::clone(&counters),
                )
            })
            .collect();

        merge::spawn_merge(scan_id, subscriptions, counters)
    }

    /// Lazily scan keys matching `pattern`
    ///
    /// The scan starts on first poll. Each call is an independent pass.
    pub fn scan_keys(&self, pattern: &str) -> KeyStream {
        self.scan_keys_with_hint(pattern, self.options.batch_hint)
    }

    pub fn scan_keys_with_hint(&self, pattern: &str, hint: BatchHint) -> KeyStream {
        let scanner = self.clone();
        let pattern = pattern.to_string();
        let prefetch = self.options.prefetch_for(hint);

        stream::once(async move { scanner.subscribe_with_hint(&pattern, hint).into_stream(prefetch) })
            .flatten()
            .boxed()
    }

    /// Lazily scan every key
    pub fn keys(&self) -> KeyStream {
        self.scan_keys(MATCH_ALL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MemoryKeyspace, MemoryShard, ShardRef};
    use std::collections::BTreeSet;

    fn scanner(space: MemoryKeyspace) -> (Arc<MemoryKeyspace>, KeyScanner) {
        let space = Arc::new(space);
        let scanner = KeyScanner::new(space.clone(), space.clone());
        (space, scanner)
    }

    #[test]
    fn test_batch_hint_bounds() {
        assert_eq!(BatchHint::default().get(), DEFAULT_BATCH_HINT);
        assert!(BatchHint::new(1).is_ok());
        assert!(BatchHint::new(MAX_BATCH_HINT).is_ok());
        assert!(matches!(
            BatchHint::new(0),
            Err(ConfigError::InvalidBatchHint { hint: 0, .. })
        ));
        assert!(BatchHint::new(MAX_BATCH_HINT + 1).is_err());
    }

    #[test]
    fn test_options_builder() {
        let options = ScanOptions::default()
            .with_batch_hint(BatchHint::new(50).unwrap())
            .with_remainder(RemainderPolicy::Discard)
            .with_prefetch(0);

        assert_eq!(options.batch_hint.get(), 50);
        assert_eq!(options.remainder, RemainderPolicy::Discard);
        assert_eq!(options.prefetch, Some(1));
        assert_eq!(ScanOptions::default().prefetch_for(BatchHint::default()), 10);
    }

    #[tokio::test]
    async fn test_scan_keys_filters_pattern() {
        let (_, scanner) = scanner(MemoryKeyspace::with_keys(
            3,
            ["user:1", "user:2", "job:1", "user:3", "job:2"],
        ));

        let keys: BTreeSet<String> = scanner
            .scan_keys("user:*")
            .map(|k| k.unwrap())
            .collect()
            .await;
        let expected: BTreeSet<String> = ["user:1", "user:2", "user:3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_scan_keys_is_lazy() {
        let (space, scanner) = scanner(MemoryKeyspace::new().with_shard(MemoryShard::new("s", ["a"])));

        let stream = scanner.keys();
        tokio::task::yield_now().await;
        assert_eq!(space.round_trips(&ShardRef::new("s")), 0);

        let keys: Vec<String> = stream.map(|k| k.unwrap()).collect().await;
        assert_eq!(keys, vec!["a"]);
    }

    #[tokio::test]
    async fn test_each_scan_is_a_fresh_pass() {
        let (space, scanner) = scanner(MemoryKeyspace::with_keys(2, (0..9).map(|i| format!("k{}", i))));

        let first: Vec<_> = scanner.keys().collect().await;
        let second: Vec<_> = scanner.keys().collect().await;
        assert_eq!(first.len(), 9);
        assert_eq!(second.len(), 9);
        assert_eq!(space.key_count(), 9);
    }
}
