//! Scan command gateway and shard directory
//!
//! The scan engine never talks to a store directly. It is handed two
//! collaborators at construction time:
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │    ShardDirectory    │        │     ScanGateway      │
//! │  current_shards()    │        │  scan(ScanRequest)   │
//! │  read once per scan  │        │  one SCAN round-trip │
//! └──────────┬───────────┘        └──────────┬───────────┘
//!            │                               │
//!            ▼                               ▼
//!      shard snapshot  ──────────▶  per-shard cursor loops
//! ```
//!
//! Implementations in this crate:
//! - [`RedisGateway`] issues `SCAN cursor MATCH pattern COUNT hint`
//! - [`MemoryKeyspace`] is an in-process sharded keyspace (tests, benches)
//! - [`StaticDirectory`] is a fixed list of shards

pub mod memory;
pub mod pattern;
pub mod redis_gateway;

pub use self::memory::{MemoryKeyspace, MemoryShard};
pub use self::pattern::GlobPattern;
pub use self::redis_gateway::{RedisGateway, RedisGatewayConfig};

use crate::error::ScanResult;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cursor value that starts a fresh scan
pub const START_POSITION: u64 = 0;

/// Reference to one shard of the keyspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardRef(String);

impl ShardRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the node that answered a round-trip
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One SCAN round-trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Shard being scanned
    pub shard: ShardRef,

    /// Node the cursor is pinned to (None on the first round-trip)
    pub node: Option<NodeId>,

    /// Cursor position (0 starts a new scan)
    pub position: u64,

    /// Glob pattern keys must match
    pub pattern: String,

    /// COUNT hint passed to the store
    pub batch_hint: usize,
}

/// Result of one SCAN round-trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanBatch {
    /// Keys in the order the store returned them
    pub values: Vec<String>,

    /// Cursor for the next round-trip (0 when the store is done)
    pub next_position: u64,

    /// Node that issued the cursor
    pub responding_node: NodeId,
}

/// Issues SCAN round-trips against shards
///
/// The returned future is `'static` so the caller can spawn it and walk
/// away from it on cancellation without aborting the request. Timeouts are
/// the gateway's responsibility and surface as [`ScanError::Timeout`].
///
/// Calling with position 0 must start a fresh scan, and repeating a call
/// with an unchanged cursor must be safe.
///
/// [`ScanError::Timeout`]: crate::error::ScanError::Timeout
pub trait ScanGateway: Send + Sync + 'static {
    fn scan(&self, request: ScanRequest) -> BoxFuture<'static, ScanResult<ScanBatch>>;
}

/// Lists the shards of the keyspace
pub trait ShardDirectory: Send + Sync + 'static {
    /// Shards to scan; read once per subscription
    fn current_shards(&self) -> Vec<ShardRef>;
}

/// Fixed shard list
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    shards: Vec<ShardRef>,
}

impl StaticDirectory {
    pub fn new(shards: Vec<ShardRef>) -> Self {
        Self { shards }
    }
}

impl ShardDirectory for StaticDirectory {
    fn current_shards(&self) -> Vec<ShardRef> {
        self.shards.clone()
    }
}

impl FromIterator<ShardRef> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = ShardRef>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
