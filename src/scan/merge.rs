//! Stream merger
//!
//! Multiplexes the shard subscriptions of one scan into a single
//! subscription. Keys are forwarded in arrival order; nothing is promised
//! about ordering across shards.
//!
//! ```text
//!             request(n)
//!   consumer ────────────▶ merger ──┬──▶ shard 0  request(n)
//!            ◀──── keys ───        ├──▶ shard 1  request(n)
//!                                   └──▶ shard 2  request(n)
//! ```
//!
//! Demand is fanned out whole to every shard; each shard spends its own
//! share. The merged sequence completes when every shard has completed.
//! The first shard failure cancels the rest and ends the merged sequence
//! with that error. The error is only sent once every other shard task has
//! stopped, so no round-trip is issued after the consumer sees it.

use super::stats::ScanCounters;
use super::subscription::{self, Control, Producer, Signal, Subscription, SubscriptionHandle};
use crate::error::ScanError;

use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Merge shard subscriptions into one
///
/// Must be called from within a tokio runtime.
pub fn spawn_merge(label: String, mut shards: Vec<Subscription>, counters: Arc<ScanCounters>) -> Subscription {
    let (mut subscription, producer) = subscription::channel(label.clone(), counters);

    let handles: Vec<SubscriptionHandle> = shards.iter().map(Subscription::handle).collect();
    let tasks: Vec<JoinHandle<()>> = shards.iter_mut().filter_map(Subscription::take_task).collect();
    let signals = stream::select_all(
        shards
            .into_iter()
            .enumerate()
            .map(|(index, shard)| shard_signals(index, shard)),
    );

    let task = MergeTask {
        label,
        remaining: handles.len(),
        handles,
        tasks,
        signals,
        producer,
    };
    subscription.attach_task(tokio::spawn(task.run().in_current_span()));

    subscription
}

/// Signals of one shard, ending after its terminal signal
fn shard_signals(index: usize, shard: Subscription) -> BoxStream<'static, (usize, Signal)> {
    stream::unfold(Some(shard), move |shard| async move {
        let mut shard = shard?;
        match shard.next_signal().await? {
            Signal::Item(key) => Some(((index, Signal::Item(key)), Some(shard))),
            terminal => Some(((index, terminal), None)),
        }
    })
    .boxed()
}

struct MergeTask {
    label: String,
    handles: Vec<SubscriptionHandle>,
    /// Shard tasks, joined before a failure goes downstream
    tasks: Vec<JoinHandle<()>>,
    signals: SelectAll<BoxStream<'static, (usize, Signal)>>,
    producer: Producer,
    /// Shards yet to complete
    remaining: usize,
}

impl MergeTask {
    async fn run(mut self) {
        if self.remaining == 0 {
            info!("No shards to scan");
            self.producer.emit(Signal::Complete);
            return;
        }

        loop {
            tokio::select! {
                biased;
                control = self.producer.control.recv() => match control {
                    Some(Control::Request(n)) => self.fan_out(n),
                    Some(Control::Cancel) | None => {
                        debug!("Merged scan cancelled");
                        self.cancel_shards();
                        return;
                    }
                },
                next = self.signals.next() => match next {
                    Some((_, Signal::Item(key))) => {
                        if !self.producer.emit(Signal::Item(key)) {
                            self.cancel_shards();
                            return;
                        }
                    }
                    Some((index, Signal::Complete)) => {
                        self.remaining -= 1;
                        debug!(shard = index, remaining = self.remaining, "Shard completed");
                        if self.remaining == 0 {
                            info!("All shards completed");
                            self.producer.emit(Signal::Complete);
                            return;
                        }
                    }
                    Some((_, Signal::Error(err))) => {
                        self.fail(err).await;
                        return;
                    }
                    None => {
                        // Every shard stream ended but not all completed
                        let err = ScanError::Aborted { shard: self.label.clone() };
                        self.fail(err).await;
                        return;
                    }
                },
            }
        }
    }

    fn fan_out(&self, n: u64) {
        for handle in &self.handles {
            handle.request(n);
        }
    }

    fn cancel_shards(&self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }

    /// Stop every shard, then send the error downstream
    async fn fail(&mut self, err: ScanError) {
        warn!(
            remaining = self.remaining,
            kind = ?err.kind(),
            "Shard {} failed, cancelling the rest of the scan: {}",
            err.shard(),
            err
        );
        self.cancel_shards();

        // A shard past its control check may still issue one round-trip;
        // it must land before the consumer can observe the failure
        for task in self.tasks.drain(..) {
            if let Err(join_err) = task.await {
                debug!("Shard task ended abnormally: {}", join_err);
            }
        }
        self.producer.emit(Signal::Error(err));
    }
}
