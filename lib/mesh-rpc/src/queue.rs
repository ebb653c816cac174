//! Transport over a fire-and-forget queue broker

use crate::broker::{DeliveryStream, Publishing, QueueConnector, Route};
use crate::dispatch::{Dispatcher, Inbound, Responder};
use crate::pool::ConnectionManager;
use crate::reply::ReplyQueue;
use crate::{
    subject, BrokerError, CallOptions, Codec, CodecRegistry, MessageHandler, Result, RpcConfig, RpcError,
    RpcMetrics, RpcTransport, SubscribeOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mesh_api::{CodeType, Envelope, InstanceDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Acquire a pooled channel and publish, bounded by `timeout`
async fn publish_on(
    manager: &ConnectionManager,
    timeout: Duration,
    route: &Route,
    publishing: Publishing,
) -> Result<()> {
    let channel = manager.acquire().await?;
    match tokio::time::timeout(timeout, channel.publish(route, publishing)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(RpcError::Timeout(timeout)),
    }
}

/// Sends handler responses to the reply destination named by the request
struct QueueResponder {
    manager: Arc<ConnectionManager>,
    dial_timeout: Duration,
}

#[async_trait]
impl Responder for QueueResponder {
    /// Reply destination and correlation id of the request
    type ReplyTo = (String, Option<String>);

    async fn respond(&self, reply_to: Self::ReplyTo, response: Bytes) -> Result<()> {
        let (destination, correlation_id) = reply_to;
        let publishing = Publishing {
            payload: response,
            correlation_id,
            reply_to: None,
        };
        publish_on(&self.manager, self.dial_timeout, &Route::Reply(destination), publishing).await
    }
}

/// QueueTransport implements request/reply on a broker that only offers
/// fire-and-forget queues.
///
/// Requests carry a correlation id and a reply destination. Replies are
/// consumed by one [`ReplyQueue`] per destination and matched back to the
/// waiting caller. Channels come from a pool owned by a connection manager
/// that reconnects when acquisition fails and refuses work while the broker
/// is blocked.
pub struct QueueTransport {
    manager: Arc<ConnectionManager>,
    config: RpcConfig,
    codecs: CodecRegistry,
    metrics: Arc<RpcMetrics>,
    instance_id: Option<String>,
    replies: tokio::sync::Mutex<HashMap<String, Arc<ReplyQueue>>>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueTransport {
    /// Connect and pre-size the channel pool
    pub async fn connect(
        connector: Arc<dyn QueueConnector>,
        config: RpcConfig,
        metrics: Arc<RpcMetrics>,
    ) -> Result<Self> {
        let manager = ConnectionManager::connect(
            connector,
            config.pool_size,
            config.dial_timeout(),
            config.reconnect_retries,
            Arc::clone(&metrics),
        )
        .await?;
        info!(prefix = %config.prefix, pool_size = config.pool_size, "Queue transport connected");
        Ok(Self {
            manager,
            config,
            codecs: CodecRegistry::standard(),
            metrics,
            instance_id: None,
            replies: tokio::sync::Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Bind replies to this instance so they never mix with other callers'
    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Whether the broker currently refuses publications
    pub fn is_blocked(&self) -> bool {
        self.manager.is_blocked()
    }

    pub fn metrics(&self) -> &Arc<RpcMetrics> {
        &self.metrics
    }

    async fn consume(&self, route: &Route) -> Result<DeliveryStream> {
        let channel = self.manager.acquire().await?;
        Ok(channel.consume(route).await?)
    }

    async fn listen(
        &self,
        route: Route,
        kind: &'static str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let codec = self.codecs.get(options.code_type)?;
        let deliveries = self.consume(&route).await?;
        let stream = deliveries.map(|delivery| Inbound {
            payload: delivery.payload,
            reply_to: delivery.reply_to.map(|reply_to| (reply_to, delivery.correlation_id)),
        });

        let dispatcher = Dispatcher {
            subject: route.name().to_string(),
            kind,
            codec,
            handler,
            responder: Arc::new(QueueResponder {
                manager: Arc::clone(&self.manager),
                dial_timeout: self.config.dial_timeout(),
            }),
            metrics: Arc::clone(&self.metrics),
            debug_msg: self.config.debug_msg,
        };
        let task = dispatcher.spawn(stream, options.parallel);
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
        debug!(route = ?route, kind, parallel = options.parallel, "Subscribed");
        Ok(())
    }

    async fn send(&self, route: Route, envelope: Envelope, code_type: CodeType, operation: &'static str) -> Result<()> {
        let codec = self.codecs.get(code_type)?;
        let payload = codec.encode(&envelope)?;
        publish_on(&self.manager, self.config.dial_timeout(), &route, Publishing::new(payload)).await?;
        self.metrics.record_publish(operation);
        if self.config.debug_msg {
            debug!(route = ?route, kind = %envelope.kind, msg_id = envelope.msg_id, "Message sent");
        }
        Ok(())
    }

    /// Reply queue for `destination`, created on first use or when its consumer died.
    ///
    /// The lock is not held while consuming so a slow reconnect does not
    /// stall callers whose reply queue is already live.
    async fn reply_queue(&self, destination: &str) -> Result<Arc<ReplyQueue>> {
        if let Some(queue) = self.live_reply_queue(destination).await {
            return Ok(queue);
        }

        let deliveries = self.consume(&Route::Reply(destination.to_string())).await?;
        let created = Arc::new(ReplyQueue::spawn(
            destination.to_string(),
            deliveries,
            self.config.reply_sweep_interval(),
            Arc::clone(&self.metrics),
        ));

        let mut replies = self.replies.lock().await;
        if let Some(queue) = replies.get(destination) {
            if queue.is_alive() {
                debug!(destination = %destination, "Reply queue created concurrently, keeping the first");
                return Ok(Arc::clone(queue));
            }
        }
        replies.insert(destination.to_string(), Arc::clone(&created));
        Ok(created)
    }

    async fn live_reply_queue(&self, destination: &str) -> Option<Arc<ReplyQueue>> {
        let replies = self.replies.lock().await;
        let queue = replies.get(destination)?;
        if queue.is_alive() {
            return Some(Arc::clone(queue));
        }
        warn!(destination = %queue.subject(), "Reply consumer died, recreating");
        None
    }

    async fn call(
        &self,
        request_subject: String,
        envelope: Envelope,
        options: &CallOptions,
        operation: &'static str,
    ) -> Result<Envelope> {
        let started = Instant::now();
        let codec = self.codecs.get(options.code_type)?;
        let payload = codec.encode(&envelope)?;

        let destination = subject::reply(&request_subject, self.instance_id.as_deref());
        let replies = self.reply_queue(&destination).await?;
        let correlation_id = Uuid::new_v4().to_string();
        // Registered before publishing so a fast reply cannot arrive unmatched
        let receiver = replies.register(correlation_id.clone(), codec)?;

        let publishing = Publishing {
            payload,
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(destination),
        };
        publish_on(
            &self.manager,
            self.config.dial_timeout(),
            &Route::Queue(request_subject.clone()),
            publishing,
        )
        .await?;
        if self.config.debug_msg {
            debug!(subject = %request_subject, correlation_id = %correlation_id, msg_id = envelope.msg_id, "Request sent");
        }

        let wait = options.timeout_or(self.config.dial_timeout()) * 2;
        let outcome = tokio::time::timeout(wait, receiver).await;
        self.metrics.record_request(operation, started.elapsed());
        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RpcError::Transport(BrokerError::Closed(format!(
                "reply consumer for {} stopped",
                request_subject
            )))),
            Err(_) => {
                self.metrics.request_timeouts_total.inc();
                warn!(subject = %request_subject, correlation_id = %correlation_id, "Request timed out");
                Err(RpcError::Timeout(wait))
            }
        }
    }
}

#[async_trait]
impl RpcTransport for QueueTransport {
    fn codec(&self, code_type: CodeType) -> Result<Codec> {
        self.codecs.get(code_type)
    }

    async fn subscribe(
        &self,
        server: &InstanceDescriptor,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let route = Route::Queue(subject::direct(&self.config.prefix, server, &options.suffix));
        self.listen(route, "direct", options, handler).await
    }

    async fn subscribe_broadcast(
        &self,
        server: &InstanceDescriptor,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let route = Route::Fanout(subject::broadcast(
            &self.config.prefix,
            &server.server_type,
            &options.suffix,
        ));
        self.listen(route, "broadcast", options, handler).await
    }

    async fn queue_subscribe(
        &self,
        server: &InstanceDescriptor,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let route = Route::Queue(subject::queue(
            &self.config.prefix,
            &server.server_type,
            &options.queue,
            &options.suffix,
        ));
        self.listen(route, "queue", options, handler).await
    }

    async fn publish(&self, target: &InstanceDescriptor, envelope: Envelope, options: &CallOptions) -> Result<()> {
        let route = Route::Queue(subject::direct(&self.config.prefix, target, &options.suffix));
        self.send(route, envelope, options.code_type, "publish").await
    }

    async fn queue_publish(&self, server_type: &str, envelope: Envelope, options: &CallOptions) -> Result<()> {
        let route = Route::Queue(subject::queue(
            &self.config.prefix,
            server_type,
            &options.queue,
            &options.suffix,
        ));
        self.send(route, envelope, options.code_type, "queue_publish").await
    }

    async fn publish_broadcast(&self, server_type: &str, envelope: Envelope, options: &CallOptions) -> Result<()> {
        let route = Route::Fanout(subject::broadcast(&self.config.prefix, server_type, &options.suffix));
        self.send(route, envelope, options.code_type, "broadcast").await
    }

    async fn send_msg(&self, destination: &str, envelope: Envelope, options: &CallOptions) -> Result<()> {
        let route = Route::Queue(subject::raw(&self.config.prefix, destination));
        self.send(route, envelope, options.code_type, "send_msg").await
    }

    async fn request(
        &self,
        target: &InstanceDescriptor,
        envelope: Envelope,
        options: &CallOptions,
    ) -> Result<Envelope> {
        let request_subject = subject::direct(&self.config.prefix, target, &options.suffix);
        self.call(request_subject, envelope, options, "request").await
    }

    async fn queue_request(&self, server_type: &str, envelope: Envelope, options: &CallOptions) -> Result<Envelope> {
        let request_subject = subject::queue(&self.config.prefix, server_type, &options.queue, &options.suffix);
        self.call(request_subject, envelope, options, "queue_request").await
    }

    async fn close(&self) -> Result<()> {
        let tasks: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.replies.lock().await.clear();
        self.manager.close().await;
        info!("Queue transport closed");
        Ok(())
    }
}
