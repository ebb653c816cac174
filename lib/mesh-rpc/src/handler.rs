//! Message handlers

use crate::{Codec, Result, RpcError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use mesh_api::{Envelope, MessageKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Receives decoded envelopes from a subscription.
///
/// A returned payload is wrapped in a response envelope and delivered back
/// to the caller.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, codec: Codec, envelope: Envelope) -> Result<Option<Bytes>>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Codec, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Bytes>>> + Send + 'static,
{
    async fn handle(&self, codec: Codec, envelope: Envelope) -> Result<Option<Bytes>> {
        (self.0)(codec, envelope).await
    }
}

/// Wrap a closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Codec, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Bytes>>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

type RequestFn = Box<dyn Fn(Codec, Bytes) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;
type PublishFn = Box<dyn Fn(Codec, Bytes) -> BoxFuture<'static, Result<()>> + Send + Sync>;

enum Registered {
    Request(RequestFn),
    Publish(PublishFn),
}

impl Registered {
    fn describe(&self) -> &'static str {
        match self {
            Registered::Request(_) => "request",
            Registered::Publish(_) => "publish",
        }
    }
}

/// HandlerTable dispatches envelopes to typed handlers by message id.
///
/// Payloads are decoded into the handler's argument type with the codec of
/// the subscription the message arrived on.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<i32, Registered>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler answering requests for `msg_id`
    pub fn on_request<Req, Resp, F, Fut>(&mut self, msg_id: i32, handler: F) -> Result<&mut Self>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.ensure_free(msg_id)?;
        let handler = Arc::new(handler);
        let wrapped: RequestFn = Box::new(move |codec, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request: Req = codec.decode_msg(&payload)?;
                let response = handler(request).await?;
                codec.response(&response)
            })
        });
        self.handlers.insert(msg_id, Registered::Request(wrapped));
        Ok(self)
    }

    /// Register a handler for publishes and notifications of `msg_id`
    pub fn on_publish<Msg, F, Fut>(&mut self, msg_id: i32, handler: F) -> Result<&mut Self>
    where
        Msg: DeserializeOwned + Send + 'static,
        F: Fn(Msg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.ensure_free(msg_id)?;
        let handler = Arc::new(handler);
        let wrapped: PublishFn = Box::new(move |codec, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let message: Msg = codec.decode_msg(&payload)?;
                handler(message).await
            })
        });
        self.handlers.insert(msg_id, Registered::Publish(wrapped));
        Ok(self)
    }

    pub fn contains(&self, msg_id: i32) -> bool {
        self.handlers.contains_key(&msg_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn into_handler(self) -> Arc<dyn MessageHandler> {
        Arc::new(self)
    }

    fn ensure_free(&self, msg_id: i32) -> Result<()> {
        if self.handlers.contains_key(&msg_id) {
            return Err(RpcError::Configuration(format!(
                "handler already registered for message {}",
                msg_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for HandlerTable {
    async fn handle(&self, codec: Codec, envelope: Envelope) -> Result<Option<Bytes>> {
        let registered = self
            .handlers
            .get(&envelope.msg_id)
            .ok_or_else(|| RpcError::NotFound(format!("no handler for message {}", envelope.msg_id)))?;

        match (registered, envelope.kind) {
            (Registered::Request(handler), MessageKind::Request) => {
                handler(codec, envelope.payload).await.map(Some)
            }
            (Registered::Publish(handler), MessageKind::Publish | MessageKind::Notify) => {
                handler(codec, envelope.payload).await.map(|_| None)
            }
            (registered, kind) => Err(RpcError::Handler(format!(
                "message {} has a {} handler but arrived as {}",
                envelope.msg_id,
                registered.describe(),
                kind
            ))),
        }
    }
}
