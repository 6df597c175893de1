use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Kind of change a topic event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

/// A broadcast topic delivering events to each subscriber over its own
/// unbounded channel. Delivery order to a single subscriber equals publish
/// order; dropping a [`Subscription`] unsubscribes it.
pub struct Topic<T> {
    inner: Arc<TopicInner<T>>,
}

struct TopicInner<T> {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Event<T>>>>,
    next_token: AtomicU64,
    closed: AtomicBool,
}

impl<T: Clone> Topic<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TopicInner {
                subscribers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.inner.closed.load(Ordering::Acquire) {
            let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
            self.inner
                .subscribers
                .lock()
                .expect("topic lock poisoned")
                .insert(token, tx);
        }
        // On a closed topic the sender is dropped here and the subscription
        // reads as immediately closed.
        Subscription { rx }
    }

    pub fn publish(&self, kind: EventKind, payload: T) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let mut subscribers = self.inner.subscribers.lock().expect("topic lock poisoned");
        subscribers.retain(|_, tx| {
            tx.send(Event {
                kind,
                payload: payload.clone(),
            })
            .is_ok()
        });
    }

    /// Closes the topic: existing subscriptions observe end-of-stream and new
    /// subscriptions start closed. Idempotent.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner
            .subscribers
            .lock()
            .expect("topic lock poisoned")
            .clear();
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("topic lock poisoned")
            .len()
    }
}

impl<T: Clone> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Event<T>>,
}

impl<T> Subscription<T> {
    /// Receives the next event, or `None` once the topic is closed.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event<T>> {
        self.rx.try_recv().ok()
    }
}
