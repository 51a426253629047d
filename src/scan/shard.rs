//! Per-shard scan task
//!
//! One task per shard drives the cursor through repeated SCAN round-trips.
//! The task is an explicit state machine; a finished round-trip moves it to
//! the next state and the loop picks up from there, so long scans never
//! grow the stack.
//!
//! ```text
//!            request(n)                 batch, demand left
//!   ┌──────┐ ─────────▶ ┌──────────┐ ◀───────────────────┐
//!   │ Idle │            │ Fetching │ ────────────────────┘
//!   └──────┘ ◀───────── └──────────┘
//!           demand used       │  exhausted / wrapped ──▶ Completed
//!                             │  gateway error       ──▶ Failed
//! ```
//!
//! At most one round-trip per shard is in flight. Demand that arrives while
//! fetching is absorbed, never turned into a second request. On cancel the
//! in-flight round-trip is left to finish on its own and its result is
//! dropped.

use super::cursor::{Advance, Exhaustion, ScanCursor};
use super::stats::ScanCounters;
use super::subscription::{self, Control, Producer, Signal, Subscription};
use super::RemainderPolicy;
use crate::error::ScanError;
use crate::gateway::{ScanBatch, ScanGateway};

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, debug_span, info, warn, Instrument};

/// Lifecycle of a shard scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Waiting for demand
    Idle,
    /// A round-trip is (about to be) in flight
    Fetching,
    /// Cursor exhausted or wrapped
    Completed,
    /// Gateway or protocol failure
    Failed,
    /// Consumer cancelled
    Cancelled,
}

impl ShardState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ShardState::Completed | ShardState::Failed | ShardState::Cancelled
        )
    }
}

/// Start scanning one shard
///
/// Nothing is fetched until demand is granted on the returned subscription.
/// Must be called from within a tokio runtime.
pub fn spawn_shard_scan(
    gateway: Arc<dyn ScanGateway>,
    cursor: ScanCursor,
    policy: RemainderPolicy,
    counters: Arc<ScanCounters>,
) -> Subscription {
    let (mut subscription, producer) = subscription::channel(cursor.shard().to_string(), Arc::clone(&counters));
    let span = debug_span!("shard", shard = %cursor.shard());

    let scanner = ShardScanner {
        gateway,
        cursor,
        policy,
        counters,
        producer,
        state: ShardState::Idle,
        demand: 0,
        remainder: VecDeque::new(),
    };
    subscription.attach_task(tokio::spawn(scanner.run().instrument(span)));

    subscription
}

struct ShardScanner {
    gateway: Arc<dyn ScanGateway>,
    cursor: ScanCursor,
    policy: RemainderPolicy,
    counters: Arc<ScanCounters>,
    producer: Producer,
    state: ShardState,
    /// Keys the consumer will still accept
    demand: u64,
    /// Batch tail held back when demand ran out (Buffer policy only)
    remainder: VecDeque<String>,
}

impl ShardScanner {
    async fn run(mut self) {
        loop {
            match self.state {
                ShardState::Idle => {
                    match self.producer.control.recv().await {
                        Some(Control::Request(n)) => self.grant(n),
                        Some(Control::Cancel) | None => self.cancelled(),
                    }
                    if self.state == ShardState::Idle {
                        self.resume();
                    }
                }
                ShardState::Fetching => {
                    self.drain_control();
                    if self.state == ShardState::Fetching {
                        self.fetch().await;
                    }
                }
                ShardState::Completed | ShardState::Failed | ShardState::Cancelled => break,
            }
        }
        debug!("Shard task exiting in state {:?}", self.state);
    }

    fn grant(&mut self, n: u64) {
        self.demand = self.demand.saturating_add(n);
    }

    /// Pick up after new demand while idle
    fn resume(&mut self) {
        // Buffered keys go out before any new round-trip
        while self.demand > 0 {
            match self.remainder.pop_front() {
                Some(key) => {
                    if !self.emit(key) {
                        return;
                    }
                }
                None => break,
            }
        }

        if !self.remainder.is_empty() {
            return;
        }
        if self.cursor.is_exhausted() {
            self.complete();
        } else if self.demand > 0 {
            self.state = ShardState::Fetching;
        }
    }

    /// Apply control messages that queued up without blocking
    fn drain_control(&mut self) {
        loop {
            match self.producer.control.try_recv() {
                Ok(Control::Request(n)) => self.grant(n),
                Ok(Control::Cancel) | Err(TryRecvError::Disconnected) => {
                    self.cancelled();
                    return;
                }
                Err(TryRecvError::Empty) => return,
            }
        }
    }

    async fn fetch(&mut self) {
        let request = match self.cursor.request() {
            Some(request) => request,
            None => {
                self.complete();
                return;
            }
        };

        debug!(
            position = request.position,
            node = ?request.node,
            "Issuing SCAN round-trip"
        );
        self.counters.record_round_trip();

        // Spawned so that walking away on cancel does not abort it
        let mut in_flight = tokio::spawn(self.gateway.scan(request));

        let joined = loop {
            tokio::select! {
                biased;
                control = self.producer.control.recv() => match control {
                    Some(Control::Request(n)) => self.grant(n),
                    Some(Control::Cancel) | None => {
                        debug!("Cancelled with a round-trip in flight; result will be dropped");
                        self.cancelled();
                        return;
                    }
                },
                joined = &mut in_flight => break joined,
            }
        };

        match joined {
            Ok(Ok(batch)) => self.on_batch(batch),
            Ok(Err(err)) => self.fail(err),
            Err(join_err) => {
                warn!("Round-trip task died: {}", join_err);
                self.fail(ScanError::Aborted {
                    shard: self.cursor.shard().to_string(),
                })
            }
        }
    }

    fn on_batch(&mut self, batch: ScanBatch) {
        let values = match self.cursor.advance(batch) {
            Ok(Advance::Emit(values)) => values,
            Ok(Advance::Wrapped) => {
                info!(
                    rounds = self.cursor.rounds(),
                    "First batch came round again, shard complete"
                );
                self.counters.record_wrapped();
                self.complete();
                return;
            }
            Err(err) => {
                self.fail(err);
                return;
            }
        };

        debug!(
            keys = values.len(),
            position = ?self.cursor.position(),
            "Round-trip returned"
        );
        if self.cursor.exhaustion() == Some(Exhaustion::Stalled) {
            info!(
                rounds = self.cursor.rounds(),
                "Cursor did not advance, treating shard as complete"
            );
            self.counters.record_stalled();
        }

        self.emit_batch(values);
        if self.state.is_terminal() {
            return;
        }

        if self.cursor.is_exhausted() && self.remainder.is_empty() {
            self.complete();
        } else if self.demand > 0 && self.remainder.is_empty() {
            self.state = ShardState::Fetching;
        } else {
            self.state = ShardState::Idle;
        }
    }

    fn emit_batch(&mut self, values: Vec<String>) {
        let mut values = values.into_iter();

        while self.demand > 0 {
            match values.next() {
                Some(key) => {
                    if !self.emit(key) {
                        return;
                    }
                }
                None => return,
            }
        }

        let rest: Vec<String> = values.collect();
        if rest.is_empty() {
            return;
        }

        match self.policy {
            RemainderPolicy::Buffer => {
                debug!(keys = rest.len(), "Demand used up mid-batch, holding remainder");
                self.remainder.extend(rest);
            }
            RemainderPolicy::Discard => {
                warn!(keys = rest.len(), "Demand used up mid-batch, discarding remainder");
                self.counters.record_discarded(rest.len() as u64);
            }
        }
    }

    fn emit(&mut self, key: String) -> bool {
        self.demand -= 1;
        if self.producer.emit(Signal::Item(key)) {
            self.counters.record_emitted();
            true
        } else {
            self.cancelled();
            false
        }
    }

    fn complete(&mut self) {
        self.state = ShardState::Completed;
        self.counters.record_completed();
        info!(
            rounds = self.cursor.rounds(),
            exhaustion = ?self.cursor.exhaustion(),
            "Shard scan complete"
        );
        self.producer.emit(Signal::Complete);
    }

    fn fail(&mut self, err: ScanError) {
        self.state = ShardState::Failed;
        self.counters.record_failed();
        warn!("Shard scan failed: {}", err);
        self.producer.emit(Signal::Error(err));
    }

    fn cancelled(&mut self) {
        if self.state != ShardState::Cancelled {
            debug!("Shard scan cancelled");
        }
        self.state = ShardState::Cancelled;
    }
}
