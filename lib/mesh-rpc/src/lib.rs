//! RPC transport fabric for the service mesh
//!
//! This library provides:
//! - Envelope codecs for binary and JSON payloads
//! - A uniform publish, subscribe and request/reply transport contract
//! - A backend for brokers with native request/reply
//! - A backend for fire-and-forget queue brokers with reply correlation,
//!   channel pooling, reconnects and backpressure handling
//! - Typed handler tables and a service node lifecycle context

pub mod broker;
pub mod codec;
pub mod config;
mod dispatch;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod native;
pub mod node;
pub mod options;
mod pool;
pub mod queue;
mod reply;
pub mod subject;
pub mod transport;

pub use broker::{BrokerError, MemoryBroker, MemoryQueueBroker};
pub use codec::{Codec, CodecRegistry, Serializer};
pub use config::{RpcConfig, UseType};
pub use error::{BrokerResult, Result, RpcError};
pub use handler::{handler_fn, HandlerTable, MessageHandler};
pub use metrics::RpcMetrics;
pub use native::NativeTransport;
pub use node::ServiceNode;
pub use options::{CallOptions, SubscribeOptions};
pub use queue::QueueTransport;
pub use transport::{RpcTransport, RpcTransportExt};

#[cfg(feature = "amqp")]
pub use broker::amqp::AmqpConnector;
#[cfg(feature = "nats")]
pub use broker::nats::NatsBroker;
