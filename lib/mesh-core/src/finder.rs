//! Sticky selection cache in front of the registry

use crate::{FinderConfig, ServiceRegistry};
use lru::LruCache;
use mesh_api::InstanceDescriptor;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Finder remembers which instance each routing argument was sent to.
///
/// Once an argument has been routed to an instance of a type it keeps going
/// there for as long as that instance stays registered and eligible, even if
/// ring membership changes would now pick another member.
pub struct Finder {
    registry: Arc<ServiceRegistry>,
    // routing argument -> server type -> server id
    cache: Mutex<LruCache<String, HashMap<String, String>>>,
}

impl Finder {
    pub fn new(registry: Arc<ServiceRegistry>, config: FinderConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Resolve `server_type` for routing argument `arg`
    pub async fn find(
        &self,
        server_type: &str,
        arg: &str,
        filter_maintained: bool,
    ) -> Option<InstanceDescriptor> {
        let cached = self
            .lock()
            .get(arg)
            .and_then(|types| types.get(server_type))
            .cloned();

        if let Some(server_id) = cached {
            if let Some(desc) = self.registry.get_server_by_id(&server_id, filter_maintained).await {
                if desc.server_type == server_type {
                    return Some(desc);
                }
            }
            debug!(arg = %arg, server_id = %server_id, "Cached selection no longer eligible");
        }

        let desc = self
            .registry
            .get_server_by_type(server_type, arg, filter_maintained)
            .await?;
        let mut cache = self.lock();
        match cache.get_mut(arg) {
            Some(types) => {
                types.insert(server_type.to_string(), desc.server_id.clone());
            }
            None => {
                let types = HashMap::from([(server_type.to_string(), desc.server_id.clone())]);
                cache.put(arg.to_string(), types);
            }
        }
        Some(desc)
    }

    /// Forget every selection made for `arg`
    pub fn remove(&self, arg: &str) {
        if self.lock().pop(arg).is_some() {
            debug!(arg = %arg, "Removed find cache");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, HashMap<String, String>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
