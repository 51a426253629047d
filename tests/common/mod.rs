//! Shared fakes for the integration tests

#![allow(dead_code)]

use futures::future::{BoxFuture, FutureExt};
use keyscan::gateway::{NodeId, ScanBatch, ScanGateway, ScanRequest, ShardDirectory, ShardRef};
use keyscan::ScanError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Scripted reply to one round-trip
#[derive(Debug, Clone)]
pub enum Step {
    Batch { next: u64, keys: Vec<String> },
    Fail(String),
}

pub fn batch(next: u64, keys: &[&str]) -> Step {
    Step::Batch {
        next,
        keys: keys.iter().map(|k| k.to_string()).collect(),
    }
}

/// `rounds` single-key batches with ever-advancing cursors
pub fn endless(prefix: &str, rounds: u64) -> Vec<Step> {
    (1..=rounds)
        .map(|i| Step::Batch {
            next: i,
            keys: vec![format!("{}{}", prefix, i)],
        })
        .collect()
}

pub fn fail(reason: &str) -> Step {
    Step::Fail(reason.to_string())
}

/// Gateway that replays scripted replies per shard and records every call
///
/// Calls are recorded when `scan()` is invoked, not when the future runs.
/// Running off the end of a script is reported as a protocol error.
#[derive(Default)]
pub struct ScriptedGateway {
    scripts: Mutex<HashMap<ShardRef, VecDeque<Step>>>,
    calls: Mutex<Vec<ScanRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, shard: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(ShardRef::new(shard), steps.into());
        self
    }

    /// Every request issued so far, in order
    pub fn calls(&self) -> Vec<ScanRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, shard: &str) -> Vec<ScanRequest> {
        self.calls()
            .into_iter()
            .filter(|r| r.shard.as_str() == shard)
            .collect()
    }

    pub fn positions_for(&self, shard: &str) -> Vec<u64> {
        self.calls_for(shard).iter().map(|r| r.position).collect()
    }
}

impl ScanGateway for ScriptedGateway {
    fn scan(&self, request: ScanRequest) -> BoxFuture<'static, Result<ScanBatch, ScanError>> {
        self.calls.lock().unwrap().push(request.clone());

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.shard)
            .and_then(|steps| steps.pop_front());

        let shard = request.shard.to_string();
        let reply = match step {
            Some(Step::Batch { next, keys }) => Ok(ScanBatch {
                values: keys,
                next_position: next,
                responding_node: NodeId::new(format!("{}-node", shard)),
            }),
            Some(Step::Fail(reason)) => Err(ScanError::Transport { shard, reason }),
            None => Err(ScanError::Protocol {
                shard,
                reason: "script exhausted".into(),
            }),
        };

        async move {
            tokio::task::yield_now().await;
            reply
        }
        .boxed()
    }
}

/// Directory over a fixed list of shard names
pub struct Shards(pub Vec<&'static str>);

impl ShardDirectory for Shards {
    fn current_shards(&self) -> Vec<ShardRef> {
        self.0.iter().map(|s| ShardRef::new(*s)).collect()
    }
}

pub fn scanner(gateway: &Arc<ScriptedGateway>, shards: Vec<&'static str>) -> keyscan::KeyScanner {
    keyscan::KeyScanner::new(gateway.clone(), Arc::new(Shards(shards)))
}

/// Drain a subscription with unlimited demand
pub async fn drain(sub: &mut keyscan::Subscription) -> (Vec<String>, Option<ScanError>) {
    sub.request(u64::MAX);
    let mut keys = Vec::new();
    while let Some(item) = sub.next().await {
        match item {
            Ok(key) => keys.push(key),
            Err(err) => return (keys, Some(err)),
        }
    }
    (keys, None)
}
