//! Queue broker channel pool and connection management

use crate::broker::{ConnectionEvent, QueueChannel, QueueConnection, QueueConnector};
use crate::{BrokerError, BrokerResult, Result, RpcError, RpcMetrics};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bounded set of reusable channels on one connection
pub(crate) struct ChannelPool {
    connection: Arc<dyn QueueConnection>,
    idle: Mutex<Vec<Arc<dyn QueueChannel>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl ChannelPool {
    /// Open `size` channels up front
    pub(crate) async fn open(connection: Arc<dyn QueueConnection>, size: usize) -> BrokerResult<Arc<Self>> {
        let size = size.max(1);
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(connection.open_channel().await?);
        }
        Ok(Arc::new(Self {
            connection,
            idle: Mutex::new(idle),
            permits: Arc::new(Semaphore::new(size)),
            closed: AtomicBool::new(false),
        }))
    }

    /// Take a channel, waiting at most `wait` for one to be released
    pub(crate) async fn acquire(self: &Arc<Self>, wait: Duration) -> BrokerResult<PooledChannel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed("channel pool is closed".to_string()));
        }
        let permit = tokio::time::timeout(wait, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| BrokerError::ChannelUnavailable("channel pool exhausted".to_string()))?
            .map_err(|_| BrokerError::Closed("channel pool is closed".to_string()))?;

        let reusable = {
            let mut idle = self.lock_idle();
            let mut found = None;
            while let Some(channel) = idle.pop() {
                if channel.is_open() {
                    found = Some(channel);
                    break;
                }
            }
            found
        };
        let channel = match reusable {
            Some(channel) => channel,
            None => self.connection.open_channel().await?,
        };

        Ok(PooledChannel {
            channel: Some(channel),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        self.lock_idle().clear();
        self.connection.close().await;
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<Arc<dyn QueueChannel>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Channel on loan from a [`ChannelPool`], returned on drop
pub(crate) struct PooledChannel {
    channel: Option<Arc<dyn QueueChannel>>,
    pool: Arc<ChannelPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledChannel {
    type Target = dyn QueueChannel;

    fn deref(&self) -> &Self::Target {
        match &self.channel {
            Some(channel) => channel.as_ref(),
            None => unreachable!("channel is only taken on drop"),
        }
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            if channel.is_open() && !self.pool.closed.load(Ordering::SeqCst) {
                self.pool.lock_idle().push(channel);
            }
        }
    }
}

struct Link {
    generation: u64,
    pool: Arc<ChannelPool>,
    watcher: JoinHandle<()>,
}

/// ConnectionManager owns the queue broker connection and its channel pool.
///
/// A failed channel acquisition tears down the connection and the whole
/// pool, reconnects and retries, up to the configured number of times.
/// Concurrent failures rebuild the connection only once.
pub(crate) struct ConnectionManager {
    connector: Arc<dyn QueueConnector>,
    pool_size: usize,
    acquire_timeout: Duration,
    retries: u32,
    link: RwLock<Option<Arc<Link>>>,
    reconnect_lock: tokio::sync::Mutex<()>,
    blocked: Arc<RwLock<bool>>,
    metrics: Arc<RpcMetrics>,
}

impl ConnectionManager {
    pub(crate) async fn connect(
        connector: Arc<dyn QueueConnector>,
        pool_size: usize,
        acquire_timeout: Duration,
        retries: u32,
        metrics: Arc<RpcMetrics>,
    ) -> Result<Arc<Self>> {
        let manager = Arc::new(Self {
            connector,
            pool_size,
            acquire_timeout,
            retries,
            link: RwLock::new(None),
            reconnect_lock: tokio::sync::Mutex::new(()),
            blocked: Arc::new(RwLock::new(false)),
            metrics,
        });
        let link = manager.open_link(1).await?;
        *manager.write_link() = Some(link);
        Ok(manager)
    }

    pub(crate) fn is_blocked(&self) -> bool {
        *self.blocked.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.current().map(|link| link.generation).unwrap_or(0)
    }

    /// Borrow a channel, reconnecting when acquisition fails
    pub(crate) async fn acquire(&self) -> Result<PooledChannel> {
        let mut attempt = 0;
        loop {
            if self.is_blocked() {
                self.metrics.blocked_rejections_total.inc();
                return Err(RpcError::Blocked);
            }
            let link = self
                .current()
                .ok_or_else(|| RpcError::Transport(BrokerError::Closed("transport is closed".to_string())))?;

            let err = match link.pool.acquire(self.acquire_timeout).await {
                Ok(channel) => return Ok(channel),
                Err(err) => err,
            };
            if attempt >= self.retries {
                return Err(RpcError::Transport(err));
            }
            attempt += 1;
            warn!(error = %err, attempt, "Channel acquisition failed, reconnecting");
            self.reconnect(link.generation).await?;
        }
    }

    /// Rebuild the connection unless another task already replaced `seen`
    async fn reconnect(&self, seen: u64) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        let Some(current) = self.current() else {
            return Err(RpcError::Transport(BrokerError::Closed("transport is closed".to_string())));
        };
        if current.generation != seen {
            debug!(generation = current.generation, "Connection already rebuilt");
            return Ok(());
        }

        current.watcher.abort();
        current.pool.close().await;
        let link = self.open_link(seen + 1).await.map_err(|e| {
            error!(error = %e, "Reconnect failed");
            e
        })?;
        *self.write_link() = Some(link);
        self.metrics.reconnects_total.inc();
        info!(generation = seen + 1, "Reconnected to queue broker");
        Ok(())
    }

    async fn open_link(&self, generation: u64) -> Result<Arc<Link>> {
        let connection = self.connector.connect().await?;
        // Each connection starts unthrottled until the broker says otherwise
        *self.blocked.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = false;
        let watcher = Self::watch_events(connection.as_ref(), Arc::clone(&self.blocked));
        let pool = match ChannelPool::open(connection, self.pool_size).await {
            Ok(pool) => pool,
            Err(e) => {
                watcher.abort();
                return Err(e.into());
            }
        };
        Ok(Arc::new(Link {
            generation,
            pool,
            watcher,
        }))
    }

    fn watch_events(connection: &dyn QueueConnection, blocked: Arc<RwLock<bool>>) -> JoinHandle<()> {
        let mut events = connection.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Blocked(reason)) => {
                        warn!(reason = %reason, "Queue broker blocked");
                        *blocked.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
                    }
                    Ok(ConnectionEvent::Unblocked) => {
                        info!("Queue broker unblocked");
                        *blocked.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = false;
                    }
                    Ok(ConnectionEvent::Closed(reason)) => {
                        warn!(reason = %reason, "Queue broker connection closed");
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed queue broker connection events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub(crate) async fn close(&self) {
        let _guard = self.reconnect_lock.lock().await;
        let link = self.write_link().take();
        if let Some(link) = link {
            link.watcher.abort();
            link.pool.close().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_channels(&self) -> usize {
        self.current().map(|link| link.pool.idle_count()).unwrap_or(0)
    }

    fn current(&self) -> Option<Arc<Link>> {
        self.link
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn write_link(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Link>>> {
        self.link.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
