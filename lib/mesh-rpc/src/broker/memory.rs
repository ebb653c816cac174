//! In-process brokers for tests and single-process deployments

use super::{
    ConnectionEvent, DeliveryStream, InboundMessage, MessageStream, Publishing, QueueChannel, QueueConnection,
    QueueConnector, QueueDelivery, RequestReplyBroker, Route,
};
use crate::{BrokerError, BrokerResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Subscriber {
    sender: mpsc::UnboundedSender<InboundMessage>,
    queue_group: Option<String>,
}

#[derive(Default)]
struct SubjectTable {
    subjects: HashMap<String, Vec<Subscriber>>,
    // (subject, group) -> next member index
    cursors: HashMap<(String, String), usize>,
}

/// Request/reply broker with NATS-like subject semantics
#[derive(Default)]
pub struct MemoryBroker {
    table: Mutex<SubjectTable>,
    inbox_seq: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions on `subject`
    pub fn subscriber_count(&self, subject: &str) -> usize {
        lock(&self.table)
            .subjects
            .get(subject)
            .map(|subs| subs.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }

    /// Deliver to every plain subscriber and one member per queue group
    fn deliver(&self, subject: &str, payload: Bytes, reply: Option<String>) -> usize {
        let mut table = lock(&self.table);
        let SubjectTable { subjects, cursors } = &mut *table;
        let Some(subscribers) = subjects.get_mut(subject) else {
            return 0;
        };
        subscribers.retain(|s| !s.sender.is_closed());
        if subscribers.is_empty() {
            subjects.remove(subject);
            return 0;
        }

        let message = InboundMessage {
            subject: subject.to_string(),
            payload,
            reply,
        };
        let mut delivered = 0;
        let mut groups: HashMap<&str, Vec<&Subscriber>> = HashMap::new();
        for subscriber in subscribers.iter() {
            match &subscriber.queue_group {
                Some(group) => groups.entry(group.as_str()).or_default().push(subscriber),
                None => {
                    if subscriber.sender.send(message.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        for (group, members) in groups {
            let cursor = cursors.entry((subject.to_string(), group.to_string())).or_insert(0);
            let member = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            if member.sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn add_subscriber(&self, subject: &str, queue_group: Option<&str>) -> MessageStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.table)
            .subjects
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber {
                sender,
                queue_group: queue_group.map(str::to_string),
            });
        Box::pin(UnboundedReceiverStream::new(receiver))
    }
}

#[async_trait]
impl RequestReplyBroker for MemoryBroker {
    async fn publish(&self, subject: &str, payload: Bytes) -> BrokerResult<()> {
        self.deliver(subject, payload, None);
        Ok(())
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> BrokerResult<MessageStream> {
        Ok(self.add_subscriber(subject, queue_group))
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> BrokerResult<Bytes> {
        let inbox = format!("_INBOX.{}", self.inbox_seq.fetch_add(1, Ordering::Relaxed));
        let mut replies = self.add_subscriber(&inbox, None);
        if self.deliver(subject, payload, Some(inbox)) == 0 {
            return Err(BrokerError::NoResponders(subject.to_string()));
        }
        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(message)) => Ok(message.payload),
            Ok(None) => Err(BrokerError::Closed("reply inbox closed".to_string())),
            Err(_) => Err(BrokerError::Timeout),
        }
    }
}

#[derive(Default)]
struct NamedQueue {
    consumers: Vec<mpsc::UnboundedSender<QueueDelivery>>,
    next: usize,
    backlog: VecDeque<QueueDelivery>,
}

impl NamedQueue {
    fn push(&mut self, mut delivery: QueueDelivery) {
        loop {
            self.consumers.retain(|c| !c.is_closed());
            if self.consumers.is_empty() {
                self.backlog.push_back(delivery);
                return;
            }
            let idx = self.next % self.consumers.len();
            self.next = self.next.wrapping_add(1);
            match self.consumers[idx].send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => delivery = returned,
            }
        }
    }
}

#[derive(Default)]
struct QueueTopology {
    queues: HashMap<String, NamedQueue>,
    fanouts: HashMap<String, Vec<mpsc::UnboundedSender<QueueDelivery>>>,
}

struct ConnectionShared {
    open: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

#[derive(Default)]
struct QueueBrokerInner {
    topology: Mutex<QueueTopology>,
    connections: Mutex<Vec<Weak<ConnectionShared>>>,
    connections_opened: AtomicUsize,
    failing_channels: AtomicUsize,
    failing_connects: AtomicUsize,
    reply_consume_delay_ms: AtomicU64,
}

impl QueueBrokerInner {
    fn live_connections(&self) -> Vec<Arc<ConnectionShared>> {
        let mut connections = lock(&self.connections);
        connections.retain(|c| c.strong_count() > 0);
        connections.iter().filter_map(Weak::upgrade).collect()
    }

    fn publish(&self, route: &Route, publishing: Publishing) {
        let delivery = QueueDelivery {
            route: route.clone(),
            payload: publishing.payload,
            correlation_id: publishing.correlation_id,
            reply_to: publishing.reply_to,
        };
        let mut topology = lock(&self.topology);
        match route {
            Route::Queue(name) | Route::Reply(name) => topology.queues.entry(name.clone()).or_default().push(delivery),
            Route::Fanout(name) => {
                if let Some(consumers) = topology.fanouts.get_mut(name) {
                    consumers.retain(|c| c.send(delivery.clone()).is_ok());
                }
            }
        }
    }

    fn consume(&self, route: &Route) -> DeliveryStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut topology = lock(&self.topology);
        match route {
            Route::Queue(name) | Route::Reply(name) => {
                let queue = topology.queues.entry(name.clone()).or_default();
                while let Some(delivery) = queue.backlog.pop_front() {
                    let _ = sender.send(delivery);
                }
                queue.consumers.push(sender);
            }
            Route::Fanout(name) => topology.fanouts.entry(name.clone()).or_default().push(sender),
        }
        Box::pin(UnboundedReceiverStream::new(receiver))
    }
}

/// Queue broker with AMQP-like semantics and fault injection.
///
/// Queues hold messages until a consumer attaches; fanout exchanges drop
/// messages nobody is bound to.
#[derive(Clone, Default)]
pub struct MemoryQueueBroker {
    inner: Arc<QueueBrokerInner>,
}

impl MemoryQueueBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify every open connection that the broker is (un)blocked
    pub fn set_blocked(&self, blocked: bool) {
        let event = if blocked {
            ConnectionEvent::Blocked("memory broker flow control".to_string())
        } else {
            ConnectionEvent::Unblocked
        };
        for connection in self.inner.live_connections() {
            let _ = connection.events.send(event.clone());
        }
    }

    /// Close every open connection as a broker restart would
    pub fn drop_connections(&self, reason: &str) {
        for connection in self.inner.live_connections() {
            if connection.open.swap(false, Ordering::SeqCst) {
                let _ = connection.events.send(ConnectionEvent::Closed(reason.to_string()));
            }
        }
    }

    /// Make the next `count` channel opens fail
    pub fn fail_next_channels(&self, count: usize) {
        self.inner.failing_channels.store(count, Ordering::SeqCst);
    }

    /// Hold every reply queue consume for `delay` before it attaches
    pub fn delay_reply_consumers(&self, delay: Duration) {
        self.inner
            .reply_consume_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    /// Messages waiting in `queue` for a consumer
    pub fn backlog(&self, queue: &str) -> usize {
        lock(&self.inner.topology)
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    /// Open a connection outside of any transport
    pub fn connection(&self) -> Arc<dyn QueueConnection> {
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(ConnectionShared {
            open: AtomicBool::new(true),
            events,
        });
        lock(&self.inner.connections).push(Arc::downgrade(&shared));
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(MemoryQueueConnection {
            shared,
            broker: Arc::clone(&self.inner),
        })
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl QueueConnector for MemoryQueueBroker {
    async fn connect(&self) -> BrokerResult<Arc<dyn QueueConnection>> {
        if take_one(&self.inner.failing_connects) {
            return Err(BrokerError::Io("connection refused".to_string()));
        }
        Ok(self.connection())
    }
}

struct MemoryQueueConnection {
    shared: Arc<ConnectionShared>,
    broker: Arc<QueueBrokerInner>,
}

#[async_trait]
impl QueueConnection for MemoryQueueConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn QueueChannel>> {
        if !self.is_open() {
            return Err(BrokerError::Closed("connection is closed".to_string()));
        }
        if take_one(&self.broker.failing_channels) {
            return Err(BrokerError::ChannelUnavailable("channel open refused".to_string()));
        }
        Ok(Arc::new(MemoryQueueChannel {
            connection: Arc::clone(&self.shared),
            broker: Arc::clone(&self.broker),
        }))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            debug!("Memory queue connection closed");
        }
    }
}

struct MemoryQueueChannel {
    connection: Arc<ConnectionShared>,
    broker: Arc<QueueBrokerInner>,
}

#[async_trait]
impl QueueChannel for MemoryQueueChannel {
    async fn publish(&self, route: &Route, publishing: Publishing) -> BrokerResult<()> {
        if !self.is_open() {
            return Err(BrokerError::Closed("channel is closed".to_string()));
        }
        self.broker.publish(route, publishing);
        Ok(())
    }

    async fn consume(&self, route: &Route) -> BrokerResult<DeliveryStream> {
        if !self.is_open() {
            return Err(BrokerError::Closed("channel is closed".to_string()));
        }
        if let Route::Reply(_) = route {
            let delay = self.broker.reply_consume_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        Ok(self.broker.consume(route))
    }

    fn is_open(&self) -> bool {
        self.connection.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("Rpc/game/queue", Some("queue")).await.unwrap();
        let mut b = broker.subscribe("Rpc/game/queue", Some("queue")).await.unwrap();
        let mut watcher = broker.subscribe("Rpc/game/queue", None).await.unwrap();

        broker.publish("Rpc/game/queue", Bytes::from_static(b"1")).await.unwrap();
        broker.publish("Rpc/game/queue", Bytes::from_static(b"2")).await.unwrap();

        let first = a.next().await.unwrap();
        let second = b.next().await.unwrap();
        assert_ne!(first.payload, second.payload);
        assert_eq!(watcher.next().await.unwrap().payload, Bytes::from_static(b"1"));
        assert_eq!(watcher.next().await.unwrap().payload, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_request_without_responder() {
        let broker = MemoryBroker::new();
        let err = broker
            .request("Rpc/game/g1", Bytes::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::NoResponders("Rpc/game/g1".to_string()));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let broker = Arc::new(MemoryBroker::new());
        let mut requests = broker.subscribe("echo", None).await.unwrap();
        let responder = Arc::clone(&broker);
        tokio::spawn(async move {
            while let Some(message) = requests.next().await {
                if let Some(reply) = message.reply {
                    responder.publish(&reply, message.payload).await.unwrap();
                }
            }
        });

        let reply = broker
            .request("echo", Bytes::from_static(b"ping"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let broker = MemoryBroker::new();
        let stream = broker.subscribe("x", None).await.unwrap();
        assert_eq!(broker.subscriber_count("x"), 1);
        drop(stream);
        assert_eq!(broker.subscriber_count("x"), 0);
    }

    #[tokio::test]
    async fn test_queue_backlog_until_consumer() {
        let broker = MemoryQueueBroker::new();
        let channel = broker.connection().open_channel().await.unwrap();
        let route = Route::Queue("work".to_string());
        channel
            .publish(&route, Publishing::new(Bytes::from_static(b"job")))
            .await
            .unwrap();
        assert_eq!(broker.backlog("work"), 1);

        let mut deliveries = channel.consume(&route).await.unwrap();
        assert_eq!(deliveries.next().await.unwrap().payload, Bytes::from_static(b"job"));
        assert_eq!(broker.backlog("work"), 0);
    }

    #[tokio::test]
    async fn test_fanout_copies_to_every_consumer() {
        let broker = MemoryQueueBroker::new();
        let channel = broker.connection().open_channel().await.unwrap();
        let route = Route::Fanout("Rpc/game".to_string());
        let mut a = channel.consume(&route).await.unwrap();
        let mut b = channel.consume(&route).await.unwrap();
        channel
            .publish(&route, Publishing::new(Bytes::from_static(b"all")))
            .await
            .unwrap();
        assert_eq!(a.next().await.unwrap().payload, Bytes::from_static(b"all"));
        assert_eq!(b.next().await.unwrap().payload, Bytes::from_static(b"all"));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let broker = MemoryQueueBroker::new();
        let connection = broker.connect().await.unwrap();
        let mut events = connection.events();

        broker.fail_next_channels(1);
        assert!(connection.open_channel().await.is_err());
        let channel = connection.open_channel().await.unwrap();

        broker.set_blocked(true);
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Blocked(_)));

        broker.drop_connections("restart");
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed("restart".to_string()));
        assert!(!channel.is_open());
        assert!(connection.open_channel().await.is_err());

        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connections_opened(), 2);
    }
}
