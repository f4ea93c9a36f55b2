//! Per-host pending queue with live subscriber fan-out.
//!
//! The pending queue is the system of record. Live push is a latency
//! optimisation: a full or slow subscriber is skipped, and the task stays
//! queued until the next drain. A live-pushed task is therefore delivered
//! again by the next drain (at-least-once).
//!
//! [`DispatchManager::drain_and_subscribe`] takes the drain and the
//! registration under one entry lock, so no enqueue can fall between them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use vertera_proto::TaskEnvelope;

/// Live channel capacity used when none is configured.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 8;

#[derive(Debug, Default)]
struct HostQueue {
    pending: VecDeque<TaskEnvelope>,
    subscribers: HashMap<u64, mpsc::Sender<TaskEnvelope>>,
}

impl HostQueue {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.subscribers.is_empty()
    }
}

type HostMap = DashMap<String, HostQueue>;

/// Pending queues and live subscribers, keyed by host id.
#[derive(Debug)]
pub struct DispatchManager {
    hosts: Arc<HostMap>,
    capacity: usize,
    next_subscriber: AtomicU64,
}

impl Default for DispatchManager {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl DispatchManager {
    /// Manager whose live channels hold `capacity` tasks (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            hosts: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Append to `host_id`'s queue and offer the task to every live
    /// subscriber without waiting.
    pub fn enqueue(&self, host_id: &str, task: TaskEnvelope) {
        let mut queue = self.hosts.entry(host_id.to_string()).or_default();
        queue.pending.push_back(task.clone());

        let mut closed = Vec::new();
        for (id, tx) in &queue.subscribers {
            match tx.try_send(task.clone()) {
                Ok(()) => trace!(host_id, subscriber = id, task_id = %task.id, "Live push"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    telemetry_metrics::counter!("vertera_live_push_skipped_total").increment(1);
                    debug!(host_id, subscriber = id, task_id = %task.id, "Subscriber full, skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            queue.subscribers.remove(&id);
        }
        debug!(host_id, task_id = %task.id, pending = queue.pending.len(), "Task enqueued");
    }

    /// Take everything pending for `host_id`, oldest first.
    pub fn drain_pending(&self, host_id: &str) -> Vec<TaskEnvelope> {
        let drained = match self.hosts.get_mut(host_id) {
            Some(mut queue) => queue.pending.drain(..).collect(),
            None => Vec::new(),
        };
        self.hosts.remove_if(host_id, |_, q| q.is_idle());
        drained
    }

    /// Register a new live channel for `host_id`.
    pub fn subscribe(&self, host_id: &str) -> Subscription {
        let mut queue = self.hosts.entry(host_id.to_string()).or_default();
        self.register(host_id, &mut queue)
    }

    /// Drain the queue and subscribe in one step relative to [`enqueue`].
    ///
    /// [`enqueue`]: DispatchManager::enqueue
    pub fn drain_and_subscribe(&self, host_id: &str) -> (Vec<TaskEnvelope>, Subscription) {
        let mut queue = self.hosts.entry(host_id.to_string()).or_default();
        let drained = queue.pending.drain(..).collect();
        let subscription = self.register(host_id, &mut queue);
        (drained, subscription)
    }

    /// Tasks currently queued for `host_id`.
    pub fn pending_len(&self, host_id: &str) -> usize {
        self.hosts.get(host_id).map_or(0, |q| q.pending.len())
    }

    /// Live channels registered for `host_id`.
    pub fn subscriber_count(&self, host_id: &str) -> usize {
        self.hosts.get(host_id).map_or(0, |q| q.subscribers.len())
    }

    fn register(&self, host_id: &str, queue: &mut HostQueue) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        queue.subscribers.insert(id, tx);
        debug!(host_id, subscriber = id, "Subscriber registered");

        Subscription {
            rx,
            handle: SubscriptionHandle(Arc::new(HandleInner {
                hosts: Arc::clone(&self.hosts),
                host_id: host_id.to_string(),
                id,
                cancelled: AtomicBool::new(false),
            })),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscriptions
// ─────────────────────────────────────────────────────────────────────────────

/// A live channel for one host. Deregisters itself on drop.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<TaskEnvelope>,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Next live task; `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<TaskEnvelope> {
        self.rx.recv().await
    }

    /// A cloneable cancel handle.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Deregister and close the channel.
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

#[derive(Debug)]
struct HandleInner {
    hosts: Arc<HostMap>,
    host_id: String,
    id: u64,
    cancelled: AtomicBool,
}

/// Cancels a [`Subscription`]. Idempotent; safe from any thread.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle(Arc<HandleInner>);

impl SubscriptionHandle {
    /// Remove the registration, which closes the channel. Only the first
    /// call has an effect.
    pub fn cancel(&self) {
        let inner = &self.0;
        if inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut queue) = inner.hosts.get_mut(&inner.host_id) {
            queue.subscribers.remove(&inner.id);
        }
        inner.hosts.remove_if(&inner.host_id, |_, q| q.is_idle());
        debug!(host_id = %inner.host_id, subscriber = inner.id, "Subscriber cancelled");
    }

    /// Whether [`cancel`](Self::cancel) has run.
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }
}
