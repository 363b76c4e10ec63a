use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll, Waker},
};

use dashmap::DashMap;
use futures_util::Stream;
use parking_lot::Mutex;

use crate::Id;

/// Kind marker for [SubscriptionId].
pub enum SubscriptionKind {}
pub type SubscriptionId = Id<SubscriptionKind>;

/// How many undelivered events a subscriber may accumulate before it is
/// considered unreachable and evicted from its topic.
const MAX_PENDING_EVENTS: usize = 1024;

/// Topic-scoped fan-out of events to subscribed connections.
///
/// Delivery is at-most-once and fire-and-forget per recipient. Events
/// published through a single [Fabric::publish_all] call are enqueued for
/// every subscriber under one topic lock, so all recipients of a topic
/// observe the same total order.
pub struct Fabric<E> {
    me: Weak<Self>,
    topics: DashMap<String, Arc<Topic<E>>>,
}

struct Topic<E> {
    subscribers: Mutex<Vec<TopicSubscriber<E>>>,
}

struct TopicSubscriber<E> {
    id: SubscriptionId,
    queue: Arc<Mutex<VecDeque<E>>>,
    waker: Arc<Mutex<Option<Waker>>>,
    closed: Arc<AtomicBool>,
}

/// A handle to a topic subscription. Yields events as a [Stream] and
/// unregisters itself when dropped.
pub struct Subscription<E> {
    pub id: SubscriptionId,
    topic: String,
    queue: Arc<Mutex<VecDeque<E>>>,
    waker: Arc<Mutex<Option<Waker>>>,
    closed: Arc<AtomicBool>,
    fabric: Weak<Fabric<E>>,
}

impl<E> Fabric<E> {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            topics: Default::default(),
        })
    }

    /// Subscribes to a topic, receiving every event published to it from now on.
    pub fn subscribe(&self, topic: &str) -> Subscription<E> {
        let subscriber = TopicSubscriber {
            id: SubscriptionId::new(),
            queue: Default::default(),
            waker: Default::default(),
            closed: Default::default(),
        };

        let subscription = Subscription {
            id: subscriber.id,
            topic: topic.to_string(),
            queue: subscriber.queue.clone(),
            waker: subscriber.waker.clone(),
            closed: subscriber.closed.clone(),
            fabric: self.me.clone(),
        };

        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                Arc::new(Topic {
                    subscribers: Default::default(),
                })
            })
            .subscribers
            .lock()
            .push(subscriber);

        subscription
    }

    /// Publishes a single event to every subscriber of a topic.
    pub fn publish(&self, topic: &str, event: E)
    where
        E: Clone,
    {
        self.publish_all(topic, vec![event])
    }

    /// Publishes a batch of events in one critical section, so every
    /// subscriber observes them in the given order with nothing interleaved.
    pub fn publish_all(&self, topic: &str, events: Vec<E>)
    where
        E: Clone,
    {
        let Some(topic) = self.topics.get(topic).map(|t| t.clone()) else {
            return;
        };

        let mut subscribers = topic.subscribers.lock();

        subscribers.retain(|subscriber| {
            let mut queue = subscriber.queue.lock();

            if queue.len() + events.len() > MAX_PENDING_EVENTS {
                // The consumer stopped draining. Cut it loose rather than
                // letting it grow without bound or block anyone else.
                subscriber.closed.store(true, Ordering::Release);
                subscriber.wake();
                return false;
            }

            queue.extend(events.iter().cloned());
            drop(queue);

            subscriber.wake();
            true
        });
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let Some(entry) = self.topics.get(topic) else {
            return;
        };

        entry.subscribers.lock().retain(|s| s.id != id);
    }

    /// Returns how many connections are subscribed to a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.subscribers.lock().len())
            .unwrap_or_default()
    }
}

impl<E> TopicSubscriber<E> {
    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake()
        }
    }
}

impl<E> Subscription<E> {
    /// Pushes an event to this subscriber alone, bypassing the topic.
    ///
    /// Used to deliver the initial state snapshot before the connection is
    /// released into normal event flow.
    pub fn push(&self, event: E) {
        self.queue.lock().push_back(event);

        if let Some(waker) = self.waker.lock().take() {
            waker.wake()
        }
    }
}

impl<E> Stream for Subscription<E> {
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut queue = self.queue.lock();

        if let Some(event) = queue.pop_front() {
            return Poll::Ready(Some(event));
        }

        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }

        *self.waker.lock() = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(fabric) = self.fabric.upgrade() {
            fabric.unsubscribe(&self.topic, self.id);
        }
    }
}
