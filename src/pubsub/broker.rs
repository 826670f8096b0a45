// Typed publish/subscribe broker with per-subscriber backpressure
//
// Each subscriber owns a bounded mpsc channel. The registry lock is only held
// while the subscriber map is read or mutated, never while a send is pending.

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use super::event::{Event, EventKind};

/// Default per-subscriber buffer
pub const DEFAULT_BUFFER_SIZE: usize = 64;

/// Default wait for `BlockPublisher` before an event is dropped
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// What a publish does when a subscriber's buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Skip the full subscriber and count the drop. Never blocks.
    #[default]
    DropEvents,
    /// Wait up to the block timeout, then drop and count.
    BlockPublisher,
    /// Close and deregister the full subscriber.
    RemoveSlowSubscribers,
}

/// Construction-time broker settings
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub buffer_size: usize,
    pub policy: BackpressurePolicy,
    pub block_timeout: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            policy: BackpressurePolicy::default(),
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }
}

impl BrokerOptions {
    pub fn with_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }
}

/// Point-in-time copy of the broker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BrokerMetrics {
    pub dropped_events: u64,
    pub slow_subscribers_removed: u64,
    pub subscribers: usize,
}

struct Inner<T> {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Event<T>>>>,
    next_id: AtomicU64,
    options: BrokerOptions,
    done: CancellationToken,
    dropped: AtomicU64,
    evicted: AtomicU64,
    subscriber_count: AtomicUsize,
}

impl<T> Inner<T> {
    /// Deregister a subscriber. Dropping the sender closes its channel.
    fn remove(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let removed = subscribers.remove(&id);
        self.subscriber_count
            .store(subscribers.len(), Ordering::Release);
        drop(subscribers);
        removed.is_some()
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Release any subscription watchers still parked on the token.
        self.done.cancel();
    }
}

/// Session-scoped event broker handle. Clones share the same registry.
pub struct Broker<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Broker<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broker<T>
where
    T: Clone + Send + 'static,
{
    /// Broker with default options (`DropEvents`, buffer 64, 5s block timeout)
    pub fn new() -> Self {
        Self::with_options(BrokerOptions::default())
    }

    pub fn with_options(options: BrokerOptions) -> Self {
        let options = BrokerOptions {
            buffer_size: options.buffer_size.max(1),
            ..options
        };
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                options,
                done: CancellationToken::new(),
                dropped: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                subscriber_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.inner.options
    }

    /// Register a subscriber.
    ///
    /// The subscription closes when `cancel` fires, when it is dropped, when
    /// the broker shuts down, or when the `RemoveSlowSubscribers` policy
    /// evicts it. Must be called from within a tokio runtime.
    pub fn subscribe(&self, cancel: &CancellationToken) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.inner.options.buffer_size);

        let id = {
            let mut subscribers = self.inner.subscribers.lock();
            if self.inner.done.is_cancelled() {
                // Sender dropped here: the caller gets an already-closed channel.
                return Subscription { rx, _guard: None };
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            subscribers.insert(id, tx);
            self.inner
                .subscriber_count
                .store(subscribers.len(), Ordering::Release);
            id
        };

        let token = cancel.child_token();
        let watch = token.clone();
        let done = self.inner.done.clone();
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::select! {
                _ = watch.cancelled() => {}
                _ = done.cancelled() => return,
            }
            if let Some(inner) = weak.upgrade() {
                if inner.remove(id) {
                    debug!(subscriber = id, "Subscriber cancelled");
                }
            }
        });

        debug!(subscriber = id, "Subscriber registered");
        Subscription {
            rx,
            _guard: Some(token.drop_guard()),
        }
    }

    /// Deliver an event to every live subscriber.
    ///
    /// Never fails; undelivered events only show up in the metrics. Under
    /// `BlockPublisher` this waits at most the configured block timeout for
    /// the whole call.
    pub async fn publish(&self, kind: EventKind, payload: T) {
        if self.inner.done.is_cancelled() {
            return;
        }

        let targets: Vec<(u64, mpsc::Sender<Event<T>>)> = {
            let subscribers = self.inner.subscribers.lock();
            subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let event = Event::new(kind, payload);
        match self.inner.options.policy {
            BackpressurePolicy::DropEvents => self.publish_with_drop(targets, event),
            BackpressurePolicy::BlockPublisher => self.publish_with_block(targets, event).await,
            BackpressurePolicy::RemoveSlowSubscribers => {
                self.publish_with_removal(targets, event)
            }
        }
    }

    fn publish_with_drop(&self, targets: Vec<(u64, mpsc::Sender<Event<T>>)>, event: Event<T>) {
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => {
                    self.inner.remove(id);
                }
            }
        }
    }

    async fn publish_with_block(
        &self,
        targets: Vec<(u64, mpsc::Sender<Event<T>>)>,
        event: Event<T>,
    ) {
        let deadline = tokio::time::Instant::now() + self.inner.options.block_timeout;

        for (id, tx) in targets {
            let pending = match tx.try_send(event.clone()) {
                Ok(()) => continue,
                Err(TrySendError::Closed(_)) => {
                    self.inner.remove(id);
                    continue;
                }
                Err(TrySendError::Full(pending)) => pending,
            };

            tokio::select! {
                _ = self.inner.done.cancelled() => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                sent = tokio::time::timeout_at(deadline, tx.send(pending)) => match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        self.inner.remove(id);
                    }
                    Err(_) => {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(subscriber = id, "Publish timed out, event dropped");
                    }
                },
            }
        }
    }

    fn publish_with_removal(
        &self,
        targets: Vec<(u64, mpsc::Sender<Event<T>>)>,
        event: Event<T>,
    ) {
        let mut slow = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    slow.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    self.inner.remove(id);
                }
            }
        }

        if slow.is_empty() {
            return;
        }

        let mut subscribers = self.inner.subscribers.lock();
        for id in slow {
            if subscribers.remove(&id).is_some() {
                self.inner.evicted.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber = id, "Removed slow subscriber");
            }
        }
        self.inner
            .subscriber_count
            .store(subscribers.len(), Ordering::Release);
    }

    /// Close every subscription. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.inner.done.is_cancelled() {
            return;
        }
        let mut subscribers = self.inner.subscribers.lock();
        // Cancel under the lock so no subscribe can slip in between.
        self.inner.done.cancel();
        let closed = subscribers.len();
        subscribers.clear();
        self.inner.subscriber_count.store(0, Ordering::Release);
        debug!(closed, "Broker shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn slow_subscribers_removed(&self) -> u64 {
        self.inner.evicted.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> BrokerMetrics {
        BrokerMetrics {
            dropped_events: self.dropped_events(),
            slow_subscribers_removed: self.slow_subscribers_removed(),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Receiving end of one subscription.
///
/// Yields events in publish order and returns `None` once the broker has
/// closed it and the buffer is drained.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Event<T>>,
    _guard: Option<DropGuard>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Event<T>, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Event<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
