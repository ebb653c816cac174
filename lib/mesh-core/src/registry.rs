//! Service registry kept current by watching the coordination store

use crate::{CoordinationStore, CoreError, HashRing, KeyValue, RegistryConfig, Result, WatchEvent, WatchStream};
use mesh_api::InstanceDescriptor;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

const WATCH_BACKOFF_MIN: Duration = Duration::from_millis(50);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Change applied to the registry view
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    Upserted(InstanceDescriptor),
    Removed(InstanceDescriptor),
}

impl RegistryEvent {
    pub fn descriptor(&self) -> &InstanceDescriptor {
        match self {
            RegistryEvent::Upserted(desc) | RegistryEvent::Removed(desc) => desc,
        }
    }
}

type EventHandler = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Instances sharing one service type
struct TypeGroup {
    ring: HashRing,
    members: BTreeMap<String, InstanceDescriptor>,
}

impl TypeGroup {
    fn new(replicas: usize) -> Self {
        Self {
            ring: HashRing::new(replicas),
            members: BTreeMap::new(),
        }
    }

    fn has_maintained(&self) -> bool {
        self.members.values().any(|desc| desc.maintained)
    }
}

#[derive(Clone, Copy, Debug)]
struct KeyRevision {
    revision: i64,
    deleted: bool,
}

#[derive(Default)]
struct RegistryState {
    servers: HashMap<String, InstanceDescriptor>,
    groups: HashMap<String, TypeGroup>,
    /// Last applied revision per store key, deletes kept as tombstones
    revisions: HashMap<String, KeyRevision>,
    /// Highest snapshot revision applied; older events are already reflected
    floor_revision: i64,
}

impl RegistryState {
    /// Records `revision` for `key` if it is newer than anything applied
    fn admit(&mut self, key: &str, revision: i64, deleted: bool) -> bool {
        if revision <= self.floor_revision {
            return false;
        }
        if let Some(seen) = self.revisions.get(key) {
            if seen.revision >= revision {
                return false;
            }
        }
        self.revisions.insert(key.to_string(), KeyRevision { revision, deleted });
        true
    }

    fn upsert(&mut self, desc: InstanceDescriptor, replicas: usize) -> RegistryEvent {
        let moved_from = self
            .servers
            .get(&desc.server_id)
            .filter(|old| old.server_type != desc.server_type)
            .map(|old| old.server_type.clone());
        if let Some(old_type) = moved_from {
            self.remove_from_group(&old_type, &desc.server_id);
        }

        self.servers.insert(desc.server_id.clone(), desc.clone());
        let group = self
            .groups
            .entry(desc.server_type.clone())
            .or_insert_with(|| TypeGroup::new(replicas));
        if !group.ring.contains(&desc.server_id) {
            group.ring.add(&desc.server_id);
        }
        group.members.insert(desc.server_id.clone(), desc.clone());
        RegistryEvent::Upserted(desc)
    }

    fn remove(&mut self, server_type: &str, server_id: &str) -> Option<RegistryEvent> {
        if self
            .servers
            .get(server_id)
            .is_some_and(|desc| desc.server_type == server_type)
        {
            self.servers.remove(server_id);
        }
        self.remove_from_group(server_type, server_id)
            .map(RegistryEvent::Removed)
    }

    fn remove_from_group(&mut self, server_type: &str, server_id: &str) -> Option<InstanceDescriptor> {
        let group = self.groups.get_mut(server_type)?;
        let removed = group.members.remove(server_id)?;
        group.ring.remove(server_id);
        if group.members.is_empty() {
            self.groups.remove(server_type);
        }
        Some(removed)
    }

    fn eligible<'a>(&'a self, filter_maintained: bool) -> impl Iterator<Item = &'a InstanceDescriptor> + 'a {
        self.servers
            .values()
            .filter(move |desc| !(filter_maintained && desc.maintained))
    }
}

/// ServiceRegistry tracks live service instances.
///
/// The in-memory view is eventually consistent with the coordination store:
/// it is populated by one initial scan and kept current by a watch loop that
/// never exits. Selection reads only take the read lock.
pub struct ServiceRegistry {
    store: Arc<dyn CoordinationStore>,
    config: RegistryConfig,
    key_prefix: String,
    state: RwLock<RegistryState>,
    handlers: StdRwLock<Vec<EventHandler>>,
    // Serializes read-modify-register of load and maintenance changes
    update_lock: Mutex<()>,
    watch_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, config: RegistryConfig) -> Arc<Self> {
        let key_prefix = config.key_prefix();
        Arc::new(Self {
            store,
            config,
            key_prefix,
            state: RwLock::new(RegistryState::default()),
            handlers: StdRwLock::new(Vec::new()),
            update_lock: Mutex::new(()),
            watch_task: StdMutex::new(None),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Start the watch loop and run the initial scan.
    ///
    /// The watch is opened before the scan so no change falls between the
    /// two; both feed the same revision-checked apply step.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let stream = self.open_watch().await?;
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move { registry.watch_loop(stream).await });
        if let Some(previous) = self.lock_watch_task().replace(handle) {
            previous.abort();
        }

        self.sync_snapshot().await?;
        let servers = self.server_count().await;
        info!(prefix = %self.key_prefix, servers, "Service registry started");
        self.dump_servers().await;
        Ok(())
    }

    /// Stop the watch loop
    pub fn shutdown(&self) {
        if let Some(handle) = self.lock_watch_task().take() {
            handle.abort();
            debug!("Service registry watch stopped");
        }
    }

    /// Register a callback invoked after every applied change
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(handler));
    }

    /// Publish `desc` under `<prefix>/<type>/<id>`; last write wins
    pub async fn register(&self, desc: &InstanceDescriptor) -> Result<()> {
        self.put_descriptor(desc).await?;
        if !desc.silent {
            info!(server_type = %desc.server_type, server_id = %desc.server_id, address = %desc.address, "Registered server");
        }
        Ok(())
    }

    async fn put_descriptor(&self, desc: &InstanceDescriptor) -> Result<i64> {
        Self::validate(desc)?;
        let key = self.server_key(desc);
        let value = desc.to_json()?;
        self.with_deadline(self.store.put(&key, value)).await
    }

    pub async fn unregister(&self, desc: &InstanceDescriptor) -> Result<()> {
        let key = self.server_key(desc);
        let existed = self.with_deadline(self.store.delete(&key)).await?;
        if !existed {
            debug!(key = %key, "Unregistered server was not present");
        } else if !desc.silent {
            info!(server_type = %desc.server_type, server_id = %desc.server_id, "Unregistered server");
        }
        Ok(())
    }

    pub async fn incre_load(&self, server_id: &str, delta: i64) -> Result<()> {
        self.adjust_load(server_id, delta).await
    }

    pub async fn decre_load(&self, server_id: &str, delta: i64) -> Result<()> {
        self.adjust_load(server_id, -delta).await
    }

    async fn adjust_load(&self, server_id: &str, delta: i64) -> Result<()> {
        self.update_cached(server_id, |desc| {
            desc.load += delta;
            desc.silent = true;
        })
        .await
    }

    /// Enter or leave maintenance; peers stop routing new traffic to it
    pub async fn set_maintenance(&self, server_id: &str, maintained: bool) -> Result<()> {
        self.update_cached(server_id, |desc| {
            desc.maintained = maintained;
            desc.silent = false;
        })
        .await
    }

    /// Re-register a mutated copy of the cached descriptor.
    ///
    /// The cache is updated with the revision the store assigned, so an
    /// older watch echo arriving later cannot roll the change back.
    async fn update_cached<F>(&self, server_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut InstanceDescriptor),
    {
        let _guard = self.update_lock.lock().await;
        let mut desc = self
            .get_server_by_id(server_id, false)
            .await
            .ok_or_else(|| CoreError::ServiceNotFound(server_id.to_string()))?;
        mutate(&mut desc);
        let revision = self.put_descriptor(&desc).await?;

        let key = self.server_key(&desc);
        let notice = {
            let mut state = self.state.write().await;
            state
                .admit(&key, revision, false)
                .then(|| state.upsert(desc, self.config.replicas))
        };
        if let Some(notice) = notice {
            self.emit(&notice);
        }
        Ok(())
    }

    /// Deterministic selection by routing key
    pub async fn get_server_by_type(
        &self,
        server_type: &str,
        routing_key: &str,
        filter_maintained: bool,
    ) -> Option<InstanceDescriptor> {
        let state = self.state.read().await;
        let group = state.groups.get(server_type)?;
        let selected = if filter_maintained && group.has_maintained() {
            group.ring.get_where(routing_key, |id| {
                group.members.get(id).is_some_and(|desc| !desc.maintained)
            })
        } else {
            group.ring.get(routing_key)
        }?;
        group.members.get(selected).cloned()
    }

    /// Least loaded eligible member; ties go to the smallest id
    pub async fn get_server_by_type_load(
        &self,
        server_type: &str,
        filter_maintained: bool,
    ) -> Option<InstanceDescriptor> {
        let state = self.state.read().await;
        let group = state.groups.get(server_type)?;
        let mut best: Option<&InstanceDescriptor> = None;
        for desc in group.members.values() {
            if filter_maintained && desc.maintained {
                continue;
            }
            if best.map_or(true, |current| desc.load < current.load) {
                best = Some(desc);
            }
        }
        best.cloned()
    }

    pub async fn get_server_by_id(&self, server_id: &str, filter_maintained: bool) -> Option<InstanceDescriptor> {
        let state = self.state.read().await;
        state
            .servers
            .get(server_id)
            .filter(|desc| !(filter_maintained && desc.maintained))
            .cloned()
    }

    /// Snapshot of every known instance keyed by id
    pub async fn get_server_list(&self, filter_maintained: bool) -> HashMap<String, InstanceDescriptor> {
        let state = self.state.read().await;
        state
            .eligible(filter_maintained)
            .map(|desc| (desc.server_id.clone(), desc.clone()))
            .collect()
    }

    /// Members of one type keyed by id
    pub async fn get_server_type_list(
        &self,
        server_type: &str,
        filter_maintained: bool,
    ) -> BTreeMap<String, InstanceDescriptor> {
        let state = self.state.read().await;
        state
            .groups
            .get(server_type)
            .map(|group| {
                group
                    .members
                    .iter()
                    .filter(|(_, desc)| !(filter_maintained && desc.maintained))
                    .map(|(id, desc)| (id.clone(), desc.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Read one type's descriptors straight from the store
    pub async fn find_servers(&self, server_type: &str) -> Result<Vec<InstanceDescriptor>> {
        let prefix = format!("{}{}/", self.key_prefix, server_type);
        let snapshot = self.with_deadline(self.store.get_prefix(&prefix)).await?;
        Ok(snapshot.kvs.iter().filter_map(|kv| self.decode(kv)).collect())
    }

    /// Read every descriptor straight from the store, grouped by type
    pub async fn find_server_list(&self) -> Result<HashMap<String, Vec<InstanceDescriptor>>> {
        let snapshot = self.with_deadline(self.store.get_prefix(&self.key_prefix)).await?;
        let mut list: HashMap<String, Vec<InstanceDescriptor>> = HashMap::new();
        for desc in snapshot.kvs.iter().filter_map(|kv| self.decode(kv)) {
            list.entry(desc.server_type.clone()).or_default().push(desc);
        }
        Ok(list)
    }

    pub async fn server_count(&self) -> usize {
        self.state.read().await.servers.len()
    }

    pub async fn type_count(&self) -> usize {
        self.state.read().await.groups.len()
    }

    /// Log the current view
    pub async fn dump_servers(&self) {
        let state = self.state.read().await;
        let mut servers: Vec<_> = state.servers.values().collect();
        servers.sort_by(|a, b| (&a.server_type, &a.server_id).cmp(&(&b.server_type, &b.server_id)));
        info!(servers = servers.len(), types = state.groups.len(), "Registry snapshot");
        for desc in servers {
            debug!(
                server_type = %desc.server_type,
                server_id = %desc.server_id,
                address = %desc.address,
                load = desc.load,
                maintained = desc.maintained,
                "Known server"
            );
        }
    }

    async fn watch_loop(self: Arc<Self>, mut stream: WatchStream) {
        loop {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => self.apply_event(event).await,
                    Err(e) => {
                        warn!(error = %e, "Registry watch stream failed, resubscribing");
                        break;
                    }
                }
            }

            stream = self.resubscribe().await;
            if let Err(e) = self.sync_snapshot().await {
                warn!(error = %e, "Registry resync after resubscribe failed");
            }
        }
    }

    async fn resubscribe(&self) -> WatchStream {
        let mut backoff = WATCH_BACKOFF_MIN;
        loop {
            tokio::time::sleep(backoff).await;
            match self.open_watch().await {
                Ok(stream) => {
                    info!(prefix = %self.key_prefix, "Registry watch resubscribed");
                    return stream;
                }
                Err(e) => {
                    error!(error = %e, retry_in = ?backoff, "Registry watch resubscribe failed");
                    backoff = (backoff * 2).min(WATCH_BACKOFF_MAX);
                }
            }
        }
    }

    async fn open_watch(&self) -> Result<WatchStream> {
        self.with_deadline(self.store.watch_prefix(&self.key_prefix)).await
    }

    /// Apply a full read of the prefix.
    ///
    /// Entries missing from the snapshot and not updated after it were
    /// deleted before it was taken and are removed.
    async fn sync_snapshot(&self) -> Result<()> {
        let snapshot = self.with_deadline(self.store.get_prefix(&self.key_prefix)).await?;
        let mut notices = Vec::new();
        {
            let mut state = self.state.write().await;
            let mut present = std::collections::HashSet::with_capacity(snapshot.kvs.len());
            for kv in &snapshot.kvs {
                present.insert(kv.key.as_str());
                if !state.admit(&kv.key, kv.mod_revision, false) {
                    continue;
                }
                if let Some(desc) = self.decode(kv) {
                    notices.push(state.upsert(desc, self.config.replicas));
                }
            }

            let vanished: Vec<String> = state
                .revisions
                .iter()
                .filter(|(key, seen)| {
                    !seen.deleted && seen.revision <= snapshot.revision && !present.contains(key.as_str())
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in vanished {
                state.revisions.insert(
                    key.clone(),
                    KeyRevision {
                        revision: snapshot.revision,
                        deleted: true,
                    },
                );
                if let Some((server_type, server_id)) = self.parse_key(&key) {
                    notices.extend(state.remove(&server_type, &server_id));
                }
            }

            state.floor_revision = state.floor_revision.max(snapshot.revision);
            let floor = state.floor_revision;
            state
                .revisions
                .retain(|_, seen| !(seen.deleted && seen.revision <= floor));
        }

        for notice in &notices {
            self.emit(notice);
        }
        Ok(())
    }

    async fn apply_event(&self, event: WatchEvent) {
        let notice = {
            let mut state = self.state.write().await;
            match &event {
                WatchEvent::Put(kv) => {
                    if !state.admit(&kv.key, kv.mod_revision, false) {
                        return;
                    }
                    self.decode(kv).map(|desc| state.upsert(desc, self.config.replicas))
                }
                WatchEvent::Delete { key, revision } => {
                    if !state.admit(key, *revision, true) {
                        return;
                    }
                    match self.parse_key(key) {
                        Some((server_type, server_id)) => state.remove(&server_type, &server_id),
                        None => {
                            warn!(key = %key, "Ignoring delete for malformed registry key");
                            None
                        }
                    }
                }
            }
        };

        if let Some(notice) = notice {
            let silent = matches!(&notice, RegistryEvent::Upserted(desc) if desc.silent);
            if !silent {
                info!(event = ?notice, "Registry changed");
            }
            self.emit(&notice);
            if !silent {
                self.dump_servers().await;
            }
        }
    }

    fn emit(&self, event: &RegistryEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for handler in handlers {
            handler(event);
        }
    }

    fn decode(&self, kv: &KeyValue) -> Option<InstanceDescriptor> {
        match InstanceDescriptor::from_json(&kv.value) {
            Ok(desc) => Some(desc),
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping undecodable server descriptor");
                None
            }
        }
    }

    /// Split `<prefix>/<type>/<id>` into its type and id
    fn parse_key(&self, key: &str) -> Option<(String, String)> {
        let rest = key.strip_prefix(&self.key_prefix)?;
        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(server_type), Some(server_id), None) if !server_type.is_empty() && !server_id.is_empty() => {
                Some((server_type.to_string(), server_id.to_string()))
            }
            _ => None,
        }
    }

    fn server_key(&self, desc: &InstanceDescriptor) -> String {
        format!("{}{}", self.key_prefix, desc.item_path())
    }

    fn validate(desc: &InstanceDescriptor) -> Result<()> {
        let valid = |segment: &str| !segment.is_empty() && !segment.contains('/');
        if valid(&desc.server_type) && valid(&desc.server_id) {
            Ok(())
        } else {
            Err(CoreError::InvalidKey(desc.item_path()))
        }
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.dial_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| CoreError::StoreTimeout(timeout))?
    }

    fn lock_watch_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watch_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
