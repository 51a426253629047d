//! Demand-driven subscriptions
//!
//! A [`Subscription`] is the consumer end of a producer task (a shard
//! scanner or the merger). The consumer grants demand with
//! [`request`](Subscription::request); the producer may only emit that many
//! keys, and the subscription refuses to hand out more than was granted even
//! if the producer runs ahead.
//!
//! ```text
//!   consumer                         producer task
//!   ────────                         ─────────────
//!   request(n) ── Control::Request ─▶ demand += n
//!   cancel()   ── Control::Cancel  ─▶ stop scheduling
//!   next()     ◀─ Signal::Item ────── emit key
//!              ◀─ Signal::Complete ── done
//!              ◀─ Signal::Error ───── failed
//! ```
//!
//! Terminal signals are delivered without demand. After a terminal signal or
//! a cancel, `next()` returns `None` forever.

use super::stats::{ScanCounters, ScanProgress};
use super::KeyStream;
use crate::error::{ScanError, ScanResult};

use futures::stream::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

/// Producer-to-consumer signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Signal {
    Item(String),
    Complete,
    Error(ScanError),
}

/// Consumer-to-producer control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Request(u64),
    Cancel,
}

/// Demand bookkeeping shared between a subscription and its handles
#[derive(Debug, Default)]
struct DemandGate {
    /// Granted but not yet delivered
    outstanding: AtomicU64,
    cancelled: AtomicBool,
    finished: AtomicBool,
    notify: Notify,
}

impl DemandGate {
    fn try_consume(&self) -> bool {
        self.outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Cloneable control surface of a [`Subscription`]
///
/// Lets another task grant demand or cancel while the owner is parked in
/// [`Subscription::next`].
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    control: mpsc::UnboundedSender<Control>,
    gate: Arc<DemandGate>,
}

impl SubscriptionHandle {
    /// Grant demand for `n` more keys
    pub fn request(&self, n: u64) {
        if n == 0 {
            warn!("Ignoring request for zero keys");
            return;
        }
        if self.is_cancelled() || self.gate.finished.load(Ordering::SeqCst) {
            return;
        }

        let _ = self
            .gate
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some(cur.saturating_add(n)));
        // A closed channel means the producer already finished
        let _ = self.control.send(Control::Request(n));
        self.gate.notify.notify_one();
    }

    /// Stop the scan; idempotent, and a no-op after a terminal signal
    pub fn cancel(&self) {
        if self.gate.finished.load(Ordering::SeqCst) {
            return;
        }
        if self.gate.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.control.send(Control::Cancel);
        self.gate.notify.notify_one();
    }

    /// Demand granted but not yet delivered
    pub fn outstanding(&self) -> u64 {
        self.gate.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.cancelled.load(Ordering::SeqCst)
    }
}

/// Producer end of a subscription
#[derive(Debug)]
pub(crate) struct Producer {
    pub(crate) control: mpsc::UnboundedReceiver<Control>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Producer {
    /// Send a signal; false once the consumer is gone
    pub(crate) fn emit(&self, signal: Signal) -> bool {
        self.signals.send(signal).is_ok()
    }
}

/// Create a connected subscription/producer pair
pub(crate) fn channel(label: impl Into<String>, counters: Arc<ScanCounters>) -> (Subscription, Producer) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();

    let subscription = Subscription {
        label: label.into(),
        handle: SubscriptionHandle {
            control: control_tx,
            gate: Arc::new(DemandGate::default()),
        },
        signals: signal_rx,
        parked: None,
        terminated: false,
        counters,
        task: None,
    };

    let producer = Producer {
        control: control_rx,
        signals: signal_tx,
    };

    (subscription, producer)
}

/// Demand-driven key sequence
///
/// Dropping a subscription cancels it.
#[derive(Debug)]
pub struct Subscription {
    label: String,
    handle: SubscriptionHandle,
    signals: mpsc::UnboundedReceiver<Signal>,
    /// Key received ahead of demand
    parked: Option<String>,
    terminated: bool,
    counters: Arc<ScanCounters>,
    /// Producer task, for callers that must see it stop
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Grant demand for `n` more keys
    pub fn request(&self, n: u64) {
        self.handle.request(n);
    }

    /// Stop the scan; idempotent
    pub fn cancel(&self) {
        if !self.terminated {
            self.handle.cancel();
        }
    }

    /// Control handle usable from other tasks
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// True after completion, failure or cancellation was observed
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Counters of the scan this subscription belongs to
    pub fn progress(&self) -> ScanProgress {
        self.counters.progress()
    }

    /// Shared counters, readable after the subscription is consumed
    pub fn counters(&self) -> Arc<ScanCounters> {
        Arc::clone(&self.counters)
    }

    /// Next key
    ///
    /// Waits for demand if none is outstanding. Returns `None` once the
    /// scan completed or was cancelled, `Some(Err(..))` exactly once if it
    /// failed.
    pub async fn next(&mut self) -> Option<ScanResult<String>> {
        match self.next_signal().await? {
            Signal::Item(key) => Some(Ok(key)),
            Signal::Error(err) => Some(Err(err)),
            Signal::Complete => None,
        }
    }

    /// Adapt to a [`Stream`](futures::Stream) that grants `prefetch` keys of
    /// demand each time the previous grant is used up
    pub fn into_stream(self, prefetch: u64) -> KeyStream {
        let prefetch = prefetch.max(1);
        futures::stream::unfold(self, move |mut sub| async move {
            if sub.handle.outstanding() == 0 {
                sub.request(prefetch);
            }
            let item = sub.next().await?;
            Some((item, sub))
        })
        .boxed()
    }

    pub(crate) fn attach_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    pub(crate) fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }

    pub(crate) async fn next_signal(&mut self) -> Option<Signal> {
        loop {
            if self.terminated {
                return None;
            }
            if self.handle.is_cancelled() {
                self.finish();
                return None;
            }

            if let Some(key) = self.parked.take() {
                if self.handle.gate.try_consume() {
                    return Some(Signal::Item(key));
                }
                self.parked = Some(key);
                self.handle.gate.notify.notified().await;
                continue;
            }

            let signal = tokio::select! {
                biased;
                _ = self.handle.gate.notify.notified() => continue,
                signal = self.signals.recv() => signal,
            };

            match signal {
                Some(Signal::Item(key)) => self.parked = Some(key),
                Some(terminal) => {
                    self.finish();
                    return Some(terminal);
                }
                None => {
                    // Producer went away without saying why
                    self.finish();
                    return Some(Signal::Error(ScanError::Aborted {
                        shard: self.label.clone(),
                    }));
                }
            }
        }
    }

    fn finish(&mut self) {
        self.terminated = true;
        self.parked = None;
        self.handle.gate.finished.store(true, Ordering::SeqCst);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair() -> (Subscription, Producer) {
        channel("test", Arc::new(ScanCounters::new(1)))
    }

    #[tokio::test]
    async fn test_items_wait_for_demand() {
        let (mut sub, producer) = pair();
        producer.emit(Signal::Item("a".into()));
        producer.emit(Signal::Item("b".into()));

        // Nothing granted yet
        let pending = tokio::time::timeout(Duration::from_millis(20), sub.next()).await;
        assert!(pending.is_err());

        sub.request(1);
        assert_eq!(sub.next().await, Some(Ok("a".to_string())));

        let pending = tokio::time::timeout(Duration::from_millis(20), sub.next()).await;
        assert!(pending.is_err());

        sub.request(1);
        assert_eq!(sub.next().await, Some(Ok("b".to_string())));
    }

    #[tokio::test]
    async fn test_request_forwards_control() {
        let (sub, mut producer) = pair();
        sub.request(3);
        sub.request(0);
        sub.request(u64::MAX);

        assert_eq!(producer.control.recv().await, Some(Control::Request(3)));
        assert_eq!(producer.control.recv().await, Some(Control::Request(u64::MAX)));
        assert_eq!(sub.handle().outstanding(), u64::MAX);
    }

    #[tokio::test]
    async fn test_complete_needs_no_demand() {
        let (mut sub, producer) = pair();
        producer.emit(Signal::Complete);

        assert_eq!(sub.next().await, None);
        assert!(sub.is_terminated());

        // Nothing after a terminal signal
        producer.emit(Signal::Item("late".into()));
        sub.request(5);
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_error_is_delivered_once() {
        let (mut sub, producer) = pair();
        let err = ScanError::Transport {
            shard: "s".into(),
            reason: "reset".into(),
        };
        producer.emit(Signal::Error(err.clone()));

        assert_eq!(sub.next().await, Some(Err(err)));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (mut sub, mut producer) = pair();
        sub.request(2);
        sub.cancel();
        sub.cancel();
        sub.handle().cancel();

        assert_eq!(producer.control.recv().await, Some(Control::Request(2)));
        assert_eq!(producer.control.recv().await, Some(Control::Cancel));
        assert!(producer.control.try_recv().is_err());

        producer.emit(Signal::Item("a".into()));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_cancel_after_complete_is_noop() {
        let (mut sub, mut producer) = pair();
        producer.emit(Signal::Complete);
        assert_eq!(sub.next().await, None);

        sub.cancel();
        sub.handle().cancel();
        assert!(!sub.handle().is_cancelled());
        assert!(producer.control.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_wakes_parked_consumer() {
        let (mut sub, producer) = pair();
        producer.emit(Signal::Item("a".into()));
        let handle = sub.handle();

        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.request(1);

        let got = waiter.await.unwrap();
        assert_eq!(got, Some(Ok("a".to_string())));
    }

    #[tokio::test]
    async fn test_vanished_producer_is_aborted() {
        let (mut sub, producer) = pair();
        drop(producer);

        let got = sub.next().await;
        assert!(matches!(got, Some(Err(ScanError::Aborted { .. }))));
    }
}
