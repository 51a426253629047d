//! keyscan - Demand-driven key scanning across a sharded keyspace
//!
//! Enumerates every key matching a glob pattern across all shards of a
//! partitioned key-value store, one `SCAN` cursor per shard, merged into a
//! single lazy sequence that only fetches as fast as the consumer asks.
//!
//! # Features
//!
//! - **Per-Shard Cursors**: each shard is walked by its own task with at
//!   most one round-trip in flight, pinned to the node that issued the
//!   cursor.
//!
//! - **Guaranteed Termination**: a cursor that stops advancing or wraps
//!   back to its first batch ends the shard instead of looping forever.
//!
//! - **Backpressure**: consumers grant demand with `request(n)`; nothing
//!   is fetched beyond what was asked for.
//!
//! - **Fail-Fast Merge**: the first shard failure cancels the others and
//!   ends the scan with that error.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Sharded Key-Value Store                      │
//! │          shard 0          shard 1      ...      shard N         │
//! └───────────┬──────────────────┬─────────────────────┬────────────┘
//!             │ SCAN cursor      │                     │
//!             ▼                  ▼                     ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 ScanGateway (RedisGateway, ...)                 │
//! └───────────┬──────────────────┬─────────────────────┬────────────┘
//!             ▼                  ▼                     ▼
//! │  ┌──────────────┐   ┌──────────────┐      ┌──────────────┐     │
//! │  │ shard task 0 │   │ shard task 1 │ ...  │ shard task N │     │
//! │  │  ScanCursor  │   │  ScanCursor  │      │  ScanCursor  │     │
//! │  └──────┬───────┘   └──────┬───────┘      └──────┬───────┘     │
//! │         └──────────────────┼─────────────────────┘             │
//! │                            ▼                                   │
//! │                ┌──────────────────────┐                        │
//! │                │      merge task      │                        │
//! │                │  fan-out demand,     │                        │
//! │                │  fail fast           │                        │
//! │                └──────────┬───────────┘                        │
//! └───────────────────────────┼────────────────────────────────────┘
//!                             ▼
//!                 Subscription / KeyStream
//! ```
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use keyscan::gateway::{RedisGateway, RedisGatewayConfig, ShardRef, StaticDirectory};
//! use keyscan::KeyScanner;
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let directory: StaticDirectory = ["redis://10.0.0.1:6379", "redis://10.0.0.2:6379"]
//!     .into_iter()
//!     .map(ShardRef::new)
//!     .collect();
//! let gateway = RedisGateway::new(RedisGatewayConfig::default());
//! let scanner = KeyScanner::new(Arc::new(gateway), Arc::new(directory));
//!
//! let mut keys = scanner.scan_keys("session:*");
//! while let Some(key) = keys.next().await {
//!     println!("{}", key.unwrap());
//! }
//! # }
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod progress;
pub mod scan;

pub use config::{CliArgs, OutputFormat, ScanConfig, ShardUrl};
pub use error::{ConfigError, FailureKind, KeyscanError, Result, ScanError, ScanResult};
pub use scan::{
    BatchHint, KeyScanner, KeyStream, RemainderPolicy, ScanOptions, ScanProgress, Subscription,
    SubscriptionHandle,
};
