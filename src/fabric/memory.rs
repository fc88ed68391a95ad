//! In-process channel fabric.
//!
//! # Responsibilities
//! - Map channel URIs to shared topics
//! - Fan published payloads out to subscribers
//! - Retain the last value on `Persistence::Latest` topics
//! - Drop a topic when its last handle closes

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use url::Url;

use super::{Channel, ChannelFabric, FabricError, Persistence, Subscription};

/// A thread-safe, in-memory pub/sub bus.
#[derive(Debug, Clone, Default)]
pub struct MemoryFabric {
    topics: Arc<DashMap<String, Arc<Topic>>>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of topics with at least one open handle.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn is_open(&self, uri: &Url) -> bool {
        self.topics.contains_key(uri.as_str())
    }
}

#[async_trait]
impl ChannelFabric for MemoryFabric {
    async fn open(&self, uri: &Url, persistence: Persistence) -> Result<Box<dyn Channel>, FabricError> {
        let topic = {
            // The entry guard keeps the handle count consistent with `remove_if` in close.
            let entry = self
                .topics
                .entry(uri.as_str().to_string())
                .or_insert_with(|| Arc::new(Topic::new(uri.clone())));
            entry.handles.fetch_add(1, Ordering::SeqCst);
            Arc::clone(entry.value())
        };
        if persistence == Persistence::Latest {
            topic.retain.store(true, Ordering::SeqCst);
        }

        tracing::trace!(channel = %uri, ?persistence, "Channel opened");
        Ok(Box::new(MemoryChannel {
            topics: Arc::clone(&self.topics),
            topic,
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Debug)]
struct Topic {
    uri: Url,
    retain: AtomicBool,
    handles: AtomicUsize,
    next_subscriber: AtomicU64,
    latest: Mutex<Option<Bytes>>,
    subscribers: Mutex<Vec<(u64, mpsc::UnboundedSender<Bytes>)>>,
}

impl Topic {
    fn new(uri: Url) -> Self {
        Self {
            uri,
            retain: AtomicBool::new(false),
            handles: AtomicUsize::new(0),
            next_subscriber: AtomicU64::new(1),
            latest: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn add_subscriber(&self) -> (u64, mpsc::UnboundedReceiver<Bytes>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push((id, tx));
        (id, rx)
    }

    fn remove_subscribers(&self, ids: &[u64]) {
        lock(&self.subscribers).retain(|(id, _)| !ids.contains(id));
    }

    fn deliver(&self, payload: Bytes) {
        if self.retain.load(Ordering::SeqCst) {
            *lock(&self.latest) = Some(payload.clone());
        }
        // Receivers dropped by their owner are pruned here.
        lock(&self.subscribers).retain(|(_, tx)| tx.send(payload.clone()).is_ok());
    }

    fn retained(&self) -> Option<Bytes> {
        lock(&self.latest).clone()
    }
}

/// Subscriber lists are only touched under short, non-async critical sections,
/// so a poisoned lock still holds consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A handle on a [`MemoryFabric`] topic.
#[derive(Debug)]
struct MemoryChannel {
    topics: Arc<DashMap<String, Arc<Topic>>>,
    topic: Arc<Topic>,
    closed: AtomicBool,
    subscriptions: Mutex<Vec<u64>>,
}

impl MemoryChannel {
    /// Detach this handle's subscribers and give up its hold on the topic.
    /// Returns false if the handle was already released.
    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let ids = std::mem::take(&mut *lock(&self.subscriptions));
        self.topic.remove_subscribers(&ids);

        self.topic.handles.fetch_sub(1, Ordering::SeqCst);
        self.topics
            .remove_if(self.topic.uri.as_str(), |_, topic| topic.handles.load(Ordering::SeqCst) == 0);
        true
    }

    fn ensure_open(&self) -> Result<(), FabricError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FabricError::Closed(self.topic.uri.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn uri(&self) -> &Url {
        &self.topic.uri
    }

    async fn publish(&self, payload: Bytes) -> Result<(), FabricError> {
        self.ensure_open()?;
        self.topic.deliver(payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, FabricError> {
        self.ensure_open()?;
        let (id, rx) = self.topic.add_subscriber();
        lock(&self.subscriptions).push(id);
        Ok(Subscription::new(rx))
    }

    async fn latest(&self, timeout: Duration) -> Result<Bytes, FabricError> {
        self.ensure_open()?;

        // Subscribe before checking the retained slot so a concurrent publish is not missed.
        let (id, mut rx) = self.topic.add_subscriber();
        let result = match self.topic.retained() {
            Some(value) => Ok(value),
            None => match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(FabricError::Closed(self.topic.uri.clone())),
                Err(_) => Err(FabricError::Timeout {
                    uri: self.topic.uri.clone(),
                    timeout,
                }),
            },
        };
        self.topic.remove_subscribers(&[id]);
        result
    }

    async fn close(&self) -> Result<(), FabricError> {
        if self.release() {
            tracing::trace!(channel = %self.topic.uri, "Channel closed");
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}
