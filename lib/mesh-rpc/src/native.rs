//! Transport over a broker with native request/reply

use crate::broker::{MessageStream, RequestReplyBroker};
use crate::dispatch::{Dispatcher, Inbound, Responder};
use crate::{
    subject, BrokerError, CallOptions, Codec, CodecRegistry, MessageHandler, Result, RpcConfig, RpcError,
    RpcMetrics, RpcTransport, SubscribeOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mesh_api::{CodeType, Envelope, InstanceDescriptor};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct NativeResponder<B> {
    broker: Arc<B>,
}

#[async_trait]
impl<B: RequestReplyBroker> Responder for NativeResponder<B> {
    type ReplyTo = String;

    async fn respond(&self, reply_to: String, response: Bytes) -> Result<()> {
        Ok(self.broker.publish(&reply_to, response).await?)
    }
}

/// Transport backed by a [`RequestReplyBroker`]
pub struct NativeTransport<B: RequestReplyBroker> {
    broker: Arc<B>,
    config: RpcConfig,
    codecs: CodecRegistry,
    metrics: Arc<RpcMetrics>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: RequestReplyBroker> NativeTransport<B> {
    pub fn new(broker: Arc<B>, config: RpcConfig, metrics: Arc<RpcMetrics>) -> Self {
        Self {
            broker,
            config,
            codecs: CodecRegistry::standard(),
            metrics,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    pub fn metrics(&self) -> &Arc<RpcMetrics> {
        &self.metrics
    }

    fn listen(
        &self,
        subject: String,
        stream: MessageStream,
        kind: &'static str,
        codec: Codec,
        parallel: bool,
        handler: Arc<dyn MessageHandler>,
    ) {
        let stream = stream.map(|message| Inbound {
            payload: message.payload,
            reply_to: message.reply,
        });
        let dispatcher = Dispatcher {
            subject: subject.clone(),
            kind,
            codec,
            handler,
            responder: Arc::new(NativeResponder {
                broker: Arc::clone(&self.broker),
            }),
            metrics: Arc::clone(&self.metrics),
            debug_msg: self.config.debug_msg,
        };
        let task = dispatcher.spawn(stream, parallel);
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
        debug!(subject = %subject, kind, parallel, "Subscribed");
    }

    async fn send(&self, subject: String, envelope: Envelope, code_type: CodeType, operation: &'static str) -> Result<()> {
        let data = self.codecs.get(code_type)?.encode(&envelope)?;
        self.broker.publish(&subject, data).await?;
        self.metrics.record_publish(operation);
        if self.config.debug_msg {
            debug!(subject = %subject, kind = %envelope.kind, msg_id = envelope.msg_id, "Message sent");
        }
        Ok(())
    }

    async fn call(
        &self,
        subject: String,
        envelope: Envelope,
        options: &CallOptions,
        operation: &'static str,
    ) -> Result<Envelope> {
        let codec = self.codecs.get(options.code_type)?;
        let data = codec.encode(&envelope)?;
        let timeout = options.timeout_or(self.config.dial_timeout());
        if self.config.debug_msg {
            debug!(subject = %subject, msg_id = envelope.msg_id, "Request sent");
        }

        let started = Instant::now();
        let outcome = self.broker.request(&subject, data, timeout).await;
        self.metrics.record_request(operation, started.elapsed());
        match outcome {
            Ok(reply) => codec.decode(&reply),
            Err(BrokerError::Timeout) => {
                self.metrics.request_timeouts_total.inc();
                warn!(subject = %subject, timeout = ?timeout, "Request timed out");
                Err(RpcError::Timeout(timeout))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<B: RequestReplyBroker> RpcTransport for NativeTransport<B> {
    fn codec(&self, code_type: CodeType) -> Result<Codec> {
        self.codecs.get(code_type)
    }

    async fn subscribe(
        &self,
        server: &InstanceDescriptor,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let codec = self.codecs.get(options.code_type)?;
        let subject = subject::direct(&self.config.prefix, server, &options.suffix);
        let stream = self.broker.subscribe(&subject, None).await?;
        self.listen(subject, stream, "direct", codec, options.parallel, handler);
        Ok(())
    }

    async fn subscribe_broadcast(
        &self,
        server: &InstanceDescriptor,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let codec = self.codecs.get(options.code_type)?;
        let subject = subject::broadcast(&self.config.prefix, &server.server_type, &options.suffix);
        let stream = self.broker.subscribe(&subject, None).await?;
        self.listen(subject, stream, "broadcast", codec, options.parallel, handler);
        Ok(())
    }

    async fn queue_subscribe(
        &self,
        server: &InstanceDescriptor,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let codec = self.codecs.get(options.code_type)?;
        let group = if options.queue.is_empty() {
            subject::DEFAULT_QUEUE
        } else {
            options.queue.as_str()
        };
        let subject = subject::queue(&self.config.prefix, &server.server_type, group, &options.suffix);
        let stream = self.broker.subscribe(&subject, Some(group)).await?;
        self.listen(subject, stream, "queue", codec, options.parallel, handler);
        Ok(())
    }

    async fn publish(&self, target: &InstanceDescriptor, envelope: Envelope, options: &CallOptions) -> Result<()> {
        let subject = subject::direct(&self.config.prefix, target, &options.suffix);
        self.send(subject, envelope, options.code_type, "publish").await
    }

    async fn queue_publish(&self, server_type: &str, envelope: Envelope, options: &CallOptions) -> Result<()> {
        let subject = subject::queue(&self.config.prefix, server_type, &options.queue, &options.suffix);
        self.send(subject, envelope, options.code_type, "queue_publish").await
    }

    async fn publish_broadcast(&self, server_type: &str, envelope: Envelope, options: &CallOptions) -> Result<()> {
        let subject = subject::broadcast(&self.config.prefix, server_type, &options.suffix);
        self.send(subject, envelope, options.code_type, "broadcast").await
    }

    async fn send_msg(&self, destination: &str, envelope: Envelope, options: &CallOptions) -> Result<()> {
        self.send(destination.to_string(), envelope, options.code_type, "send_msg")
            .await
    }

    async fn request(
        &self,
        target: &InstanceDescriptor,
        envelope: Envelope,
        options: &CallOptions,
    ) -> Result<Envelope> {
        let subject = subject::direct(&self.config.prefix, target, &options.suffix);
        self.call(subject, envelope, options, "request").await
    }

    async fn queue_request(&self, server_type: &str, envelope: Envelope, options: &CallOptions) -> Result<Envelope> {
        let subject = subject::queue(&self.config.prefix, server_type, &options.queue, &options.suffix);
        self.call(subject, envelope, options, "queue_request").await
    }

    async fn close(&self) -> Result<()> {
        let tasks: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        let count = tasks.len();
        for task in tasks {
            task.abort();
        }
        info!(subscriptions = count, "Native transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::{handler_fn, HandlerTable, RpcTransportExt};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const LOGIN: i32 = 10;
    const KICK: i32 = 11;

    #[derive(Debug, Serialize, Deserialize)]
    struct LoginRequest {
        uid: u64,
        token: String,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct LoginReply {
        uid: u64,
        accepted: bool,
    }

    fn transport(broker: &Arc<MemoryBroker>) -> NativeTransport<MemoryBroker> {
        let config = RpcConfig {
            dial_timeout_ms: 500,
            ..Default::default()
        };
        NativeTransport::new(Arc::clone(broker), config, Arc::new(RpcMetrics::new().unwrap()))
    }

    fn login_table() -> Arc<dyn MessageHandler> {
        let mut table = HandlerTable::new();
        table
            .on_request(LOGIN, |req: LoginRequest| async move {
                Ok::<_, RpcError>(LoginReply {
                    uid: req.uid,
                    accepted: req.token == "dss",
                })
            })
            .unwrap();
        table.into_handler()
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_request_reply_both_code_types() {
        let broker = Arc::new(MemoryBroker::new());
        let server = transport(&broker);
        let client = transport(&broker);
        let game = InstanceDescriptor::new("game", "g1", "");

        server
            .subscribe(&game, SubscribeOptions::default(), login_table())
            .await
            .unwrap();
        server
            .subscribe(
                &game,
                SubscribeOptions::default().with_code_type(CodeType::Json).with_suffix("json"),
                login_table(),
            )
            .await
            .unwrap();
        assert_eq!(broker.subscriber_count("Rpc/game/g1"), 1);
        assert_eq!(broker.subscriber_count("Rpc/game/g1/json"), 1);

        let request = LoginRequest {
            uid: 1001,
            token: "dss".to_string(),
        };
        let reply: LoginReply = client
            .request_value(&game, LOGIN, &request, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, LoginReply { uid: 1001, accepted: true });

        let json = CallOptions::default().with_code_type(CodeType::Json).with_suffix("json");
        let reply: LoginReply = client.request_value(&game, LOGIN, &request, &json).await.unwrap();
        assert!(reply.accepted);
        assert_eq!(client.metrics().requests_total.with_label_values(&["request"]).get(), 2.0);
    }

    #[tokio::test]
    async fn test_no_responder_surfaces_transport_error() {
        let broker = Arc::new(MemoryBroker::new());
        let client = transport(&broker);
        let err = client
            .request(
                &InstanceDescriptor::new("game", "missing", ""),
                Envelope::request(LOGIN, Codec::binary().encode_msg(&1u8).unwrap()),
                &CallOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(BrokerError::NoResponders(_))));
    }

    #[tokio::test]
    async fn test_silent_handler_times_out() {
        let broker = Arc::new(MemoryBroker::new());
        let server = transport(&broker);
        let client = transport(&broker);
        let game = InstanceDescriptor::new("game", "g1", "");
        // A publish handler never answers a request
        server
            .subscribe(
                &game,
                SubscribeOptions::default(),
                handler_fn(|_, _| async { Ok::<Option<Bytes>, RpcError>(None) }),
            )
            .await
            .unwrap();

        let options = CallOptions::default().with_timeout(Duration::from_millis(30));
        let err = client
            .request(&game, Envelope::request(LOGIN, Bytes::new()), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert_eq!(client.metrics().request_timeouts_total.get(), 1.0);
    }

    #[tokio::test]
    async fn test_queue_group_delivers_to_one_member() {
        let broker = Arc::new(MemoryBroker::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let mut members = Vec::new();
        for id in ["g1", "g2"] {
            let member = transport(&broker);
            let hits = Arc::clone(&hits);
            member
                .queue_subscribe(
                    &InstanceDescriptor::new("game", id, ""),
                    SubscribeOptions::default(),
                    handler_fn(move |_, _| {
                        let hits = Arc::clone(&hits);
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            Ok::<Option<Bytes>, RpcError>(None)
                        }
                    }),
                )
                .await
                .unwrap();
            members.push(member);
        }

        let client = transport(&broker);
        for n in 0..4u32 {
            client
                .queue_publish_value("game", KICK, &n, &CallOptions::default())
                .await
                .unwrap();
        }
        eventually(|| hits.load(Ordering::SeqCst) == 4).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_queue_request_reaches_group() {
        let broker = Arc::new(MemoryBroker::new());
        let server = transport(&broker);
        server
            .queue_subscribe(
                &InstanceDescriptor::new("game", "g1", ""),
                SubscribeOptions::default(),
                login_table(),
            )
            .await
            .unwrap();
        let request = LoginRequest {
            uid: 7,
            token: "nope".to_string(),
        };
        let reply: LoginReply = transport(&broker)
            .queue_request_value("game", LOGIN, &request, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, LoginReply { uid: 7, accepted: false });
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_instance() {
        let broker = Arc::new(MemoryBroker::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let mut members = Vec::new();
        for id in ["g1", "g2", "g3"] {
            let member = transport(&broker);
            let hits = Arc::clone(&hits);
            let mut table = HandlerTable::new();
            table
                .on_publish(KICK, move |_: u64| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, RpcError>(())
                    }
                })
                .unwrap();
            member
                .subscribe_broadcast(
                    &InstanceDescriptor::new("game", id, ""),
                    SubscribeOptions::default(),
                    table.into_handler(),
                )
                .await
                .unwrap();
            members.push(member);
        }

        transport(&broker)
            .publish_broadcast_value("game", KICK, &99u64, &CallOptions::default())
            .await
            .unwrap();
        eventually(|| hits.load(Ordering::SeqCst) == 3).await;
    }

    #[tokio::test]
    async fn test_serial_subscription_handles_in_order() {
        let broker = Arc::new(MemoryBroker::new());
        let server = transport(&broker);
        let game = InstanceDescriptor::new("game", "g1", "");
        let order = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        {
            let order = Arc::clone(&order);
            let in_flight = Arc::clone(&in_flight);
            let overlap = Arc::clone(&overlap);
            let mut table = HandlerTable::new();
            table
                .on_publish(KICK, move |n: u32| {
                    let order = Arc::clone(&order);
                    let in_flight = Arc::clone(&in_flight);
                    let overlap = Arc::clone(&overlap);
                    async move {
                        if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlap.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        order.lock().unwrap().push(n);
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, RpcError>(())
                    }
                })
                .unwrap();
            server
                .subscribe(&game, SubscribeOptions::default().with_parallel(false), table.into_handler())
                .await
                .unwrap();
        }

        let client = transport(&broker);
        for n in 0..5u32 {
            client
                .publish_value(&game, KICK, &n, &CallOptions::default())
                .await
                .unwrap();
        }
        eventually(|| order.lock().unwrap().len() == 5).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parallel_subscription_overlaps_handlers() {
        let broker = Arc::new(MemoryBroker::new());
        let server = transport(&broker);
        let game = InstanceDescriptor::new("game", "g1", "");
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        {
            let (peak, done, in_flight) = (Arc::clone(&peak), Arc::clone(&done), Arc::clone(&in_flight));
            server
                .subscribe(
                    &game,
                    SubscribeOptions::default(),
                    handler_fn(move |_, _| {
                        let (peak, done, in_flight) = (Arc::clone(&peak), Arc::clone(&done), Arc::clone(&in_flight));
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            done.fetch_add(1, Ordering::SeqCst);
                            Ok::<Option<Bytes>, RpcError>(None)
                        }
                    }),
                )
                .await
                .unwrap();
        }

        let client = transport(&broker);
        for n in 0..4u32 {
            client
                .publish_value(&game, KICK, &n, &CallOptions::default())
                .await
                .unwrap();
        }
        eventually(|| done.load(Ordering::SeqCst) == 4).await;
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_subscription_alive() {
        let broker = Arc::new(MemoryBroker::new());
        let server = transport(&broker);
        let game = InstanceDescriptor::new("game", "g1", "");
        server
            .subscribe(
                &game,
                SubscribeOptions::default().with_parallel(false),
                handler_fn(|codec: Codec, envelope: Envelope| async move {
                    let n: u32 = codec.decode_msg(&envelope.payload)?;
                    if n == 0 {
                        panic!("bad input");
                    }
                    Ok::<_, RpcError>(Some(codec.response(&(n + 1))?))
                }),
            )
            .await
            .unwrap();

        let client = transport(&broker);
        let options = CallOptions::default().with_timeout(Duration::from_millis(50));
        let err = client
            .request_value::<_, u32>(&game, LOGIN, &0u32, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));

        let reply: u32 = client
            .request_value(&game, LOGIN, &1u32, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, 2);
        assert_eq!(server.metrics().handler_failures_total.get(), 1.0);
    }

    #[tokio::test]
    async fn test_missing_codec_is_configuration_error() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = transport(&broker).with_codecs(CodecRegistry::empty());
        let err = transport
            .subscribe(
                &InstanceDescriptor::new("game", "g1", ""),
                SubscribeOptions::default(),
                login_table(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Configuration(_)));
        assert_eq!(broker.subscriber_count("Rpc/game/g1"), 0);
    }

    #[tokio::test]
    async fn test_close_drops_subscriptions() {
        let broker = Arc::new(MemoryBroker::new());
        let server = transport(&broker);
        let game = InstanceDescriptor::new("game", "g1", "");
        server
            .subscribe(&game, SubscribeOptions::default(), login_table())
            .await
            .unwrap();
        server.close().await.unwrap();
        eventually(|| broker.subscriber_count("Rpc/game/g1") == 0).await;
    }
}
