//! Broker contracts for both transport backends

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use crate::BrokerResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub use crate::error::BrokerError;
pub use memory::{MemoryBroker, MemoryQueueBroker};

/// Message received by a request/reply broker subscription
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Where the sender waits for a reply, if anywhere
    pub reply: Option<String>,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// Broker offering subjects, queue groups and native request/reply
#[async_trait]
pub trait RequestReplyBroker: Send + Sync + 'static {
    async fn publish(&self, subject: &str, payload: Bytes) -> BrokerResult<()>;

    /// Subscribe to `subject`; within a queue group each message reaches one member
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> BrokerResult<MessageStream>;

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> BrokerResult<Bytes>;
}

/// Where a queue broker publication goes or a consumer reads from
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Route {
    /// Named durable queue; consumers compete for its messages
    Queue(String),
    /// Fanout exchange; every consumer gets its own copy
    Fanout(String),
    /// Reply queue private to the consuming connection, gone with it.
    /// Publishers address it like any named queue.
    Reply(String),
}

impl Route {
    pub fn name(&self) -> &str {
        match self {
            Route::Queue(name) | Route::Fanout(name) | Route::Reply(name) => name,
        }
    }
}

/// Outbound queue broker message
#[derive(Clone, Debug, Default)]
pub struct Publishing {
    pub payload: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Publishing {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }
}

/// Inbound queue broker message
#[derive(Clone, Debug)]
pub struct QueueDelivery {
    pub route: Route,
    pub payload: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = QueueDelivery> + Send>>;

/// Connection-level notification from a queue broker
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker stopped accepting publications
    Blocked(String),
    Unblocked,
    Closed(String),
}

/// Opens connections to a queue broker
#[async_trait]
pub trait QueueConnector: Send + Sync + 'static {
    async fn connect(&self) -> BrokerResult<Arc<dyn QueueConnection>>;
}

#[async_trait]
pub trait QueueConnection: Send + Sync {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn QueueChannel>>;

    /// Subscribe to block, unblock and close notifications
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait QueueChannel: Send + Sync {
    async fn publish(&self, route: &Route, publishing: Publishing) -> BrokerResult<()>;

    async fn consume(&self, route: &Route) -> BrokerResult<DeliveryStream>;

    fn is_open(&self) -> bool;
}
