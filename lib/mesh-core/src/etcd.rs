//! etcd adapter for the coordination store contract

use crate::store::{CoordinationStore, KeyValue, Snapshot, WatchEvent, WatchStream};
use crate::{CoreError, Result};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, WatchOptions};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{debug, info};

fn store_error(err: etcd_client::Error) -> CoreError {
    CoreError::Store(err.to_string())
}

fn key_value(kv: &etcd_client::KeyValue) -> Result<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| CoreError::InvalidKey(e.to_string()))?
        .to_string();
    Ok(KeyValue {
        key,
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
    })
}

fn watch_event(event: &etcd_client::Event) -> Option<Result<WatchEvent>> {
    let kv = event.kv()?;
    Some(match event.event_type() {
        EventType::Put => key_value(kv).map(WatchEvent::Put),
        EventType::Delete => key_value(kv).map(|kv| WatchEvent::Delete {
            key: kv.key,
            revision: kv.mod_revision,
        }),
    })
}

/// Coordination store backed by an etcd cluster.
///
/// The client is cheap to clone; every call works on its own clone so
/// calls never contend on a lock. Broken gRPC channels are re-dialed by
/// the client itself.
pub struct EtcdStore {
    client: Client,
    endpoints: Vec<String>,
}

impl EtcdStore {
    pub async fn connect(endpoints: Vec<String>, dial_timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(&endpoints, Some(options)).await.map_err(|e| {
            CoreError::Store(format!(
                "unable to connect to etcd at {}: {}",
                endpoints.join(", "),
                e
            ))
        })?;
        info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self { client, endpoints })
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            endpoints: Vec::new(),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64> {
        let response = self.client().put(key, value, None).await.map_err(store_error)?;
        response
            .header()
            .map(|header| header.revision())
            .ok_or_else(|| CoreError::Store(format!("put of {} returned no header", key)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let response = self.client().delete(key, None).await.map_err(store_error)?;
        Ok(response.deleted() > 0)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let response = self
            .client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(store_error)?;
        let revision = response.header().map(|header| header.revision()).unwrap_or_default();
        let kvs = response.kvs().iter().map(key_value).collect::<Result<Vec<_>>>()?;
        Ok(Snapshot { revision, kvs })
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let (watcher, responses) = self
            .client()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(store_error)?;
        debug!(prefix = %prefix, watch_id = watcher.watch_id(), "Watch opened");

        // The watcher travels with the stream; dropping it cancels the watch
        let events = stream::unfold(Some((watcher, responses)), |state| async move {
            let (watcher, mut responses) = state?;
            match responses.message().await {
                Ok(Some(response)) if response.canceled() => {
                    let reason = if response.compact_revision() > 0 {
                        format!("watch compacted at revision {}", response.compact_revision())
                    } else {
                        format!("watch canceled: {}", response.cancel_reason())
                    };
                    Some((vec![Err(CoreError::Store(reason))], None))
                }
                Ok(Some(response)) => {
                    let events = response.events().iter().filter_map(watch_event).collect();
                    Some((events, Some((watcher, responses))))
                }
                Ok(None) => None,
                Err(e) => Some((vec![Err(store_error(e))], None)),
            }
        })
        .flat_map(stream::iter);
        Ok(Box::pin(events))
    }
}
