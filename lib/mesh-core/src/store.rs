//! Coordination store contract and an in-memory implementation

use crate::{CoreError, Result};
use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// A stored key with the revision of its last modification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

/// Change observed on a watched prefix
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, revision: i64 },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            WatchEvent::Put(kv) => kv.mod_revision,
            WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

/// Consistent read of a prefix as of `revision`
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

/// Strongly consistent key-value store with prefix watches.
///
/// Revisions are store-wide and strictly increasing; every put and delete
/// gets a fresh one. A snapshot at revision `r` reflects every change up to
/// and including `r`.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Upsert `key`, returning the new modification revision
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64>;

    /// Delete `key`, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot>;

    /// Stream of changes under `prefix` made after the call returns
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;
}

#[derive(Clone, Debug)]
enum StoreSignal {
    Event(WatchEvent),
    Fault(String),
}

#[derive(Default)]
struct StoreState {
    revision: i64,
    entries: BTreeMap<String, KeyValue>,
}

/// In-process coordination store.
///
/// Used by tests and single-process deployments. Watchers that fall too far
/// behind observe an error, as they would on a compacted etcd revision.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreSignal>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a store whose watchers buffer at most `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(StoreState::default()),
            events,
        }
    }

    /// Break every open watch stream with `reason`
    pub fn inject_watch_fault(&self, reason: impl Into<String>) {
        let _ = self.events.send(StoreSignal::Fault(reason.into()));
    }

    /// Number of open watch streams
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let mut state = self.lock();
        state.revision += 1;
        let kv = KeyValue {
            key: key.to_string(),
            value,
            mod_revision: state.revision,
        };
        state.entries.insert(key.to_string(), kv.clone());
        // Sent under the lock so watchers see events in revision order
        let _ = self.events.send(StoreSignal::Event(WatchEvent::Put(kv)));
        Ok(state.revision)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.lock();
        if state.entries.remove(key).is_none() {
            return Ok(false);
        }
        state.revision += 1;
        let event = WatchEvent::Delete {
            key: key.to_string(),
            revision: state.revision,
        };
        let _ = self.events.send(StoreSignal::Event(event));
        Ok(true)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let state = self.lock();
        let kvs = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(Snapshot {
            revision: state.revision,
            kvs,
        })
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |signal| match signal {
            Ok(StoreSignal::Event(event)) if event.key().starts_with(&prefix) => Some(Ok(event)),
            Ok(StoreSignal::Event(_)) => None,
            Ok(StoreSignal::Fault(reason)) => Some(Err(CoreError::Store(reason))),
            Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(CoreError::Store(format!(
                "watcher lagged behind by {} events",
                missed
            )))),
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_revisions_increase() {
        let store = MemoryStore::new();
        let r1 = store.put("/server/game/g1", b"a".to_vec()).await.unwrap();
        let r2 = store.put("/server/game/g1", b"b".to_vec()).await.unwrap();
        assert!(r2 > r1);
        assert!(store.delete("/server/game/g1").await.unwrap());
        assert!(!store.delete("/server/game/g1").await.unwrap());
        assert_eq!(store.revision(), r2 + 1);
    }

    #[tokio::test]
    async fn test_get_prefix_scopes_keys() {
        let store = MemoryStore::new();
        store.put("/server/game/g1", b"1".to_vec()).await.unwrap();
        store.put("/server/gate/t1", b"2".to_vec()).await.unwrap();
        store.put("/other/game/g9", b"3".to_vec()).await.unwrap();

        let snapshot = store.get_prefix("/server/").await.unwrap();
        assert_eq!(snapshot.kvs.len(), 2);
        assert_eq!(snapshot.revision, 3);

        let games = store.get_prefix("/server/game/").await.unwrap();
        assert_eq!(games.kvs.len(), 1);
        assert_eq!(games.kvs[0].value, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_watch_filters_prefix() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("/server/").await.unwrap();

        store.put("/other/x", b"ignored".to_vec()).await.unwrap();
        store.put("/server/game/g1", b"1".to_vec()).await.unwrap();
        store.delete("/server/game/g1").await.unwrap();

        let first = watch.next().await.unwrap().unwrap();
        assert!(matches!(first, WatchEvent::Put(ref kv) if kv.key == "/server/game/g1"));
        let second = watch.next().await.unwrap().unwrap();
        assert_eq!(
            second,
            WatchEvent::Delete {
                key: "/server/game/g1".to_string(),
                revision: 3
            }
        );
    }

    #[tokio::test]
    async fn test_injected_fault_surfaces_as_error() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("/server/").await.unwrap();
        assert_eq!(store.watcher_count(), 1);

        store.inject_watch_fault("connection reset");
        assert!(matches!(watch.next().await, Some(Err(CoreError::Store(_)))));
    }
}
