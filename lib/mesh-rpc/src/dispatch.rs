//! Subscription dispatch loop shared by both backends

use crate::{Codec, MessageHandler, Result, RpcMetrics};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt};
use mesh_api::Envelope;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Delivers handler responses back to the caller
#[async_trait]
pub(crate) trait Responder: Send + Sync + 'static {
    type ReplyTo: Send + 'static;

    async fn respond(&self, reply_to: Self::ReplyTo, response: Bytes) -> Result<()>;
}

/// Raw inbound message and where its caller expects a reply
pub(crate) struct Inbound<T> {
    pub payload: Bytes,
    pub reply_to: Option<T>,
}

pub(crate) struct Dispatcher<R: Responder> {
    pub subject: String,
    /// Subscription kind used as metrics label
    pub kind: &'static str,
    pub codec: Codec,
    pub handler: Arc<dyn MessageHandler>,
    pub responder: Arc<R>,
    pub metrics: Arc<RpcMetrics>,
    pub debug_msg: bool,
}

impl<R: Responder> Dispatcher<R> {
    /// Drain `stream` until it ends.
    ///
    /// Parallel subscriptions spawn a task per message; serial ones finish
    /// each message before reading the next.
    pub(crate) fn spawn<S>(self, mut stream: S, parallel: bool) -> JoinHandle<()>
    where
        S: Stream<Item = Inbound<R::ReplyTo>> + Send + Unpin + 'static,
    {
        let dispatcher = Arc::new(self);
        tokio::spawn(async move {
            while let Some(inbound) = stream.next().await {
                if parallel {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move { dispatcher.process(inbound).await });
                } else {
                    dispatcher.process(inbound).await;
                }
            }
            debug!(subject = %dispatcher.subject, "Subscription stream ended");
        })
    }

    async fn process(&self, inbound: Inbound<R::ReplyTo>) {
        let envelope = match self.codec.decode(&inbound.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(subject = %self.subject, error = %e, "Dropping undecodable message");
                return;
            }
        };
        self.metrics.record_received(self.kind);
        if self.debug_msg {
            debug!(subject = %self.subject, kind = %envelope.kind, msg_id = envelope.msg_id, "Dispatching message");
        }

        let msg_id = envelope.msg_id;
        let outcome = AssertUnwindSafe(self.handler.handle(self.codec, envelope))
            .catch_unwind()
            .await;
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.metrics.handler_failures_total.inc();
                warn!(subject = %self.subject, msg_id, error = %e, "Handler failed");
                return;
            }
            Err(panic) => {
                self.metrics.handler_failures_total.inc();
                error!(subject = %self.subject, msg_id, panic = %panic_message(&panic), "Handler panicked");
                return;
            }
        };

        let (Some(response), Some(reply_to)) = (response, inbound.reply_to) else {
            return;
        };
        let data = match self.codec.encode(&Envelope::response(msg_id, response)) {
            Ok(data) => data,
            Err(e) => {
                warn!(subject = %self.subject, msg_id, error = %e, "Failed to encode response");
                return;
            }
        };
        if let Err(e) = self.responder.respond(reply_to, data).await {
            warn!(subject = %self.subject, msg_id, error = %e, "Failed to deliver response");
        } else if self.debug_msg {
            debug!(subject = %self.subject, msg_id, "Response delivered");
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
