//! Redis-backed scan gateway
//!
//! Issues `SCAN <cursor> [MATCH <pattern>] COUNT <hint>` on a multiplexed
//! async connection. Each shard reference names the shard's node
//! (`redis://host:port/db`); a cursor pinned to a node is always sent back
//! to that node.
//!
//! Names show up in logs and errors, so they never carry credentials. A name
//! registered with [`RedisGateway::with_endpoint`] is connected through the
//! URL given there; any other name is used as the URL itself.
//!
//! Connections are opened lazily, one per node, and shared by every scan
//! that goes through this gateway. A connection that fails with an I/O
//! error is dropped from the cache so the next scan reconnects.
//!
//! Key names are not required to be UTF-8 on the server. Invalid bytes are
//! replaced with U+FFFD, so such keys are printed but cannot be fed back to
//! the server verbatim.

use super::pattern::MATCH_ALL;
use super::{NodeId, ScanBatch, ScanGateway, ScanRequest};
use crate::error::{ScanError, ScanResult};

use futures::future::{BoxFuture, FutureExt};
use redis::{aio::MultiplexedConnection, Client, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Configuration for the Redis gateway
#[derive(Debug, Clone)]
pub struct RedisGatewayConfig {
    /// Per round-trip timeout
    pub timeout: Duration,
    /// Timeout for opening a node connection
    pub connect_timeout: Duration,
}

impl Default for RedisGatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisGatewayConfig {
    /// Config with a custom round-trip timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

type ConnectionCache = Arc<RwLock<HashMap<String, MultiplexedConnection>>>;

/// Scan gateway talking to Redis nodes
pub struct RedisGateway {
    config: RedisGatewayConfig,
    connections: ConnectionCache,
    /// Connection URL by node name
    endpoints: HashMap<String, String>,
}

impl RedisGateway {
    pub fn new(config: RedisGatewayConfig) -> Self {
        Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            endpoints: HashMap::new(),
        }
    }

    /// Connect to the node called `name` through `url`
    ///
    /// `url` may carry credentials; only `name` is ever logged.
    pub fn with_endpoint(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.endpoints.insert(name.into(), url.into());
        self
    }

    pub fn config(&self) -> &RedisGatewayConfig {
        &self.config
    }

    /// URL to connect to for a node name
    pub fn endpoint<'a>(&'a self, node: &'a str) -> &'a str {
        self.endpoints.get(node).map(String::as_str).unwrap_or(node)
    }

    /// Get the cached connection for a node, opening it if needed
    async fn connection(
        connections: &ConnectionCache,
        config: &RedisGatewayConfig,
        shard: &str,
        node: &str,
        url: &str,
    ) -> ScanResult<MultiplexedConnection> {
        if let Some(conn) = connections.read().await.get(node) {
            return Ok(conn.clone());
        }

        let client = Client::open(url).map_err(|e| ScanError::ConnectionFailed {
            shard: shard.to_string(),
            reason: e.to_string(),
        })?;

        let conn = match tokio::time::timeout(
            config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(ScanError::ConnectionFailed {
                    shard: shard.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ScanError::ConnectionFailed {
                    shard: shard.to_string(),
                    reason: format!("connect timed out after {:?}", config.connect_timeout),
                })
            }
        };

        debug!("Opened connection to {}", node);
        let mut cache = connections.write().await;
        // Another scan may have raced us here; keep whichever landed first
        let conn = cache.entry(node.to_string()).or_insert(conn).clone();
        Ok(conn)
    }

    async fn round_trip(
        connections: ConnectionCache,
        config: RedisGatewayConfig,
        request: ScanRequest,
        node: String,
        url: String,
    ) -> ScanResult<ScanBatch> {
        let shard = request.shard.to_string();
        let mut conn = Self::connection(&connections, &config, &shard, &node, &url).await?;
        let cmd = scan_command(&request);

        let reply: Value = match tokio::time::timeout(config.timeout, cmd.query_async(&mut conn)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    warn!("Dropping connection to {}: {}", node, e);
                    connections.write().await.remove(&node);
                }
                return Err(ScanError::from_redis(&shard, e));
            }
            Err(_) => {
                return Err(ScanError::Timeout {
                    shard,
                    timeout: config.timeout,
                })
            }
        };

        let (next_position, values) = parse_scan_reply(&shard, reply)?;

        Ok(ScanBatch {
            values,
            next_position,
            responding_node: NodeId::new(node),
        })
    }
}

impl ScanGateway for RedisGateway {
    fn scan(&self, request: ScanRequest) -> BoxFuture<'static, ScanResult<ScanBatch>> {
        let node = request
            .node
            .as_ref()
            .map(|n| n.as_str())
            .unwrap_or_else(|| request.shard.as_str())
            .to_string();
        let url = self.endpoint(&node).to_string();

        Self::round_trip(
            Arc::clone(&self.connections),
            self.config.clone(),
            request,
            node,
            url,
        )
        .boxed()
    }
}

/// Build the SCAN command for a round-trip
pub fn scan_command(request: &ScanRequest) -> redis::Cmd {
    let mut cmd = redis::cmd("SCAN");
    cmd.arg(request.position);
    if request.pattern != MATCH_ALL {
        cmd.arg("MATCH").arg(&request.pattern);
    }
    cmd.arg("COUNT").arg(request.batch_hint);
    cmd
}

/// Decode a `[cursor, [key, ...]]` SCAN reply
pub fn parse_scan_reply(shard: &str, reply: Value) -> ScanResult<(u64, Vec<String>)> {
    let protocol = |reason: String| ScanError::Protocol {
        shard: shard.to_string(),
        reason,
    };

    let items = match reply {
        Value::Array(items) => items,
        other => return Err(protocol(format!("expected [cursor, keys], got {:?}", other))),
    };

    let mut items = items.into_iter();
    let cursor = items
        .next()
        .ok_or_else(|| protocol("reply is missing the next cursor".into()))?;
    let keys = items
        .next()
        .ok_or_else(|| protocol("reply is missing the key batch".into()))?;

    let next_position: u64 = redis::from_redis_value(&cursor)
        .map_err(|e| protocol(format!("cursor is not an integer: {}", e)))?;

    let keys = match keys {
        Value::Array(keys) => keys,
        other => return Err(protocol(format!("key batch is not a list, got {:?}", other))),
    };

    let mut replaced = 0usize;
    let values = keys
        .into_iter()
        .map(|key| match key {
            Value::BulkString(bytes) => Ok(String::from_utf8(bytes).unwrap_or_else(|e| {
                replaced += 1;
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            })),
            Value::SimpleString(key) => Ok(key),
            other => Err(protocol(format!("key is not a string: {:?}", other))),
        })
        .collect::<ScanResult<Vec<String>>>()?;

    if replaced > 0 {
        warn!(shard, keys = replaced, "Replaced invalid UTF-8 in key names");
    }

    Ok((next_position, values))
}
