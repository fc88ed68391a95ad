//! Live connection registry.
//!
//! # Responsibilities
//! - Hand out random identifiers that are unique among live connections
//! - Own every [`ConnectionRecord`] from Setup until Teardown or shutdown
//! - Answer membership checks without serializing unrelated connections

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::protocol::{ConnectionId, SetupCommand};

/// Live state for one logical connection.
///
/// Read-only after creation apart from the stop signal.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    /// The accepted Setup, with its derived channel URIs filled in.
    pub setup: SetupCommand,
    pub data_channel: Url,
    pub return_channel: Url,
    stop: CancellationToken,
}

impl ConnectionRecord {
    pub fn new(id: ConnectionId, setup: SetupCommand, data_channel: Url, return_channel: Url) -> Self {
        Self {
            id,
            setup,
            data_channel,
            return_channel,
            stop: CancellationToken::new(),
        }
    }

    /// Ask the worker to stop. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token the worker waits on.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

/// Concurrent map of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, Arc<ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under a fresh random identifier.
    ///
    /// `build` runs exactly once, with the identifier already reserved.
    pub fn register<F, E>(&self, build: F) -> Result<Arc<ConnectionRecord>, E>
    where
        F: FnOnce(ConnectionId) -> Result<ConnectionRecord, E>,
    {
        self.register_with(rand::random::<u64>, build)
    }

    /// Like [`register`](Self::register), drawing candidates from `next_id`.
    pub fn register_with<G, F, E>(&self, mut next_id: G, build: F) -> Result<Arc<ConnectionRecord>, E>
    where
        G: FnMut() -> u64,
        F: FnOnce(ConnectionId) -> Result<ConnectionRecord, E>,
    {
        loop {
            let id = ConnectionId::new(next_id());
            if id.is_none() {
                continue;
            }
            match self.entries.entry(id) {
                Entry::Occupied(_) => {
                    tracing::debug!(connection_id = %id, "Connection id collision, resampling");
                }
                Entry::Vacant(slot) => {
                    let record = Arc::new(build(id)?);
                    slot.insert(Arc::clone(&record));
                    return Ok(record);
                }
            }
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.entries.remove(&id).map(|(_, record)| record)
    }

    /// Remove `record` only if it is still the entry under its identifier.
    pub fn remove_if_same(&self, record: &Arc<ConnectionRecord>) -> bool {
        self.entries
            .remove_if(&record.id, |_, current| Arc::ptr_eq(current, record))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every record.
    pub fn drain(&self) -> Vec<Arc<ConnectionRecord>> {
        let ids: Vec<ConnectionId> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}
