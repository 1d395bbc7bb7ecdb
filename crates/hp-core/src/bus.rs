//! In-process publish/subscribe bus
//!
//! Components never talk to each other directly. They publish on a named
//! channel and every current subscriber of that channel gets its own copy in
//! its own FIFO queue. Publishing never blocks and never waits for
//! subscribers; a bounded channel drops the oldest queued message of a full
//! subscriber instead.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;

use crate::types::BusMessage;

/// Bus topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Peer discovery and discovery markers
    Bootstrap,
    /// Decoded telemetry for the publisher
    Info,
    /// Parameter changes for the command actuator
    Track,
    /// Restart requests for the orchestrator
    System,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Bootstrap,
        Channel::Info,
        Channel::Track,
        Channel::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Bootstrap => "bootstrap",
            Channel::Info => "info",
            Channel::Track => "track",
            Channel::System => "system",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue capacity policy of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPolicy {
    /// At most `n` queued messages per subscriber, oldest dropped first
    Bounded(usize),
    Unbounded,
}

impl ChannelPolicy {
    /// Default policy of a channel
    pub fn default_for(channel: Channel) -> Self {
        match channel {
            Channel::Bootstrap => ChannelPolicy::Bounded(256),
            Channel::Info => ChannelPolicy::Bounded(1024),
            Channel::Track => ChannelPolicy::Bounded(256),
            Channel::System => ChannelPolicy::Unbounded,
        }
    }
}

/// One subscriber's queue
struct SubscriberQueue<M> {
    policy: ChannelPolicy,
    queue: Mutex<VecDeque<M>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl<M> SubscriberQueue<M> {
    fn new(policy: ChannelPolicy) -> Self {
        Self {
            policy,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a message; returns true if an older message had to go
    fn push(&self, msg: M) -> bool {
        let mut evicted = false;
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if let ChannelPolicy::Bounded(capacity) = self.policy {
                while queue.len() >= capacity.max(1) {
                    queue.pop_front();
                    evicted = true;
                }
            }
            queue.push_back(msg);
        }
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<M> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct SubscriberEntry<M> {
    id: u64,
    name: String,
    queue: Arc<SubscriberQueue<M>>,
}

struct BusInner<M> {
    subscribers: DashMap<Channel, Vec<SubscriberEntry<M>>>,
    policies: HashMap<Channel, ChannelPolicy>,
    next_id: AtomicU64,
}

impl<M> BusInner<M> {
    fn remove(&self, channel: Channel, id: u64) -> bool {
        match self.subscribers.get_mut(&channel) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|entry| entry.id != id);
                before != entries.len()
            }
            None => false,
        }
    }
}

/// Multi-channel, multi-subscriber fan-out bus.
///
/// Cheap to clone; every clone publishes to the same subscribers.
pub struct MessageBus<M = BusMessage> {
    inner: Arc<BusInner<M>>,
}

impl<M> Clone for MessageBus<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Clone + Send + 'static> Default for MessageBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone + Send + 'static> MessageBus<M> {
    /// Create a bus with the default channel policies
    pub fn new() -> Self {
        let policies = Channel::ALL
            .iter()
            .map(|channel| (*channel, ChannelPolicy::default_for(*channel)))
            .collect();
        Self::with_policies(policies)
    }

    /// Create a bus with explicit channel policies; channels missing from
    /// the map keep their default policy
    pub fn with_policies(mut policies: HashMap<Channel, ChannelPolicy>) -> Self {
        for channel in Channel::ALL {
            policies
                .entry(channel)
                .or_insert_with(|| ChannelPolicy::default_for(channel));
        }
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                policies,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn policy(&self, channel: Channel) -> ChannelPolicy {
        self.inner
            .policies
            .get(&channel)
            .copied()
            .unwrap_or_else(|| ChannelPolicy::default_for(channel))
    }

    /// Subscribe to a channel; only messages published from now on are seen
    pub fn subscribe(&self, channel: Channel, name: impl Into<String>) -> Subscription<M> {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.policy(channel)));

        self.inner
            .subscribers
            .entry(channel)
            .or_default()
            .push(SubscriberEntry {
                id,
                name: name.clone(),
                queue: Arc::clone(&queue),
            });
        tracing::debug!("{} subscribed to {} (id {})", name, channel, id);

        Subscription {
            channel,
            name,
            id,
            queue,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Release a subscription; dropping it has the same effect
    pub fn unsubscribe(&self, subscription: Subscription<M>) {
        drop(subscription);
    }

    /// Copy `msg` into every subscriber queue of `channel`.
    ///
    /// Returns the number of queues reached.
    pub fn publish(&self, channel: Channel, msg: M) -> usize {
        let Some(entries) = self.inner.subscribers.get(&channel) else {
            tracing::trace!("publish on {} without subscribers", channel);
            return 0;
        };

        for entry in entries.iter() {
            if entry.queue.push(msg.clone()) {
                let dropped = entry.queue.dropped.load(Ordering::Relaxed);
                if dropped == 1 || dropped % 100 == 0 {
                    tracing::warn!(
                        "subscriber {} on {} is lagging, {} message(s) dropped",
                        entry.name,
                        channel,
                        dropped
                    );
                }
            }
        }
        entries.len()
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.inner
            .subscribers
            .get(&channel)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

/// Handle on one subscriber queue
pub struct Subscription<M = BusMessage> {
    channel: Channel,
    name: String,
    id: u64,
    queue: Arc<SubscriberQueue<M>>,
    bus: Weak<BusInner<M>>,
}

impl<M> Subscription<M> {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Messages dropped from this queue because it was full
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Queued messages not yet received
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Next queued message without waiting
    pub fn try_recv(&self) -> Option<M> {
        self.queue.pop()
    }

    /// Wait at most `timeout` for the next message
    pub async fn listen(&self, timeout: Duration) -> Option<M> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = self.queue.pop() {
                return Some(msg);
            }
            if tokio::time::timeout_at(deadline, self.queue.notify.notified())
                .await
                .is_err()
            {
                return self.queue.pop();
            }
        }
    }
}

impl<M> fmt::Debug for Subscription<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl<M> Drop for Subscription<M> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(self.channel, self.id) {
                tracing::debug!("{} unsubscribed from {}", self.name, self.channel);
            }
        }
    }
}
