//! Transport contract shared by every backend

use crate::{CallOptions, Codec, MessageHandler, Result, SubscribeOptions};
use async_trait::async_trait;
use mesh_api::{Envelope, InstanceDescriptor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Uniform publish, subscribe and request/reply operations.
///
/// Subjects are derived from the target descriptor or server type, the
/// configured prefix and the suffix in the options. Every call fails with a
/// configuration error if no codec is registered for its code type.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Codec registered for `code_type`
    fn codec(&self, code_type: mesh_api::CodeType) -> Result<Codec>;

    /// Messages addressed to `server` itself
    async fn subscribe(
        &self,
        server: &InstanceDescriptor,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;

    /// Messages addressed to every instance of `server`'s type
    async fn subscribe_broadcast(
        &self,
        server: &InstanceDescriptor,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;

    /// Messages addressed to a queue group of `server`'s type
    async fn queue_subscribe(
        &self,
        server: &InstanceDescriptor,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;

    async fn publish(&self, target: &InstanceDescriptor, envelope: Envelope, options: &CallOptions) -> Result<()>;

    async fn queue_publish(&self, server_type: &str, envelope: Envelope, options: &CallOptions) -> Result<()>;

    async fn publish_broadcast(&self, server_type: &str, envelope: Envelope, options: &CallOptions) -> Result<()>;

    /// Publish to a raw destination outside the subject scheme
    async fn send_msg(&self, destination: &str, envelope: Envelope, options: &CallOptions) -> Result<()>;

    /// Send a request to `target` and wait for its response envelope
    async fn request(
        &self,
        target: &InstanceDescriptor,
        envelope: Envelope,
        options: &CallOptions,
    ) -> Result<Envelope>;

    async fn queue_request(&self, server_type: &str, envelope: Envelope, options: &CallOptions) -> Result<Envelope>;

    /// Stop all subscriptions and release broker resources
    async fn close(&self) -> Result<()>;
}

/// Typed helpers on top of [`RpcTransport`]
#[async_trait]
pub trait RpcTransportExt: RpcTransport {
    async fn publish_value<T>(&self, target: &InstanceDescriptor, msg_id: i32, value: &T, options: &CallOptions) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = self.codec(options.code_type)?.encode_msg(value)?;
        self.publish(target, Envelope::publish(msg_id, payload), options).await
    }

    async fn publish_broadcast_value<T>(&self, server_type: &str, msg_id: i32, value: &T, options: &CallOptions) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = self.codec(options.code_type)?.encode_msg(value)?;
        self.publish_broadcast(server_type, Envelope::publish(msg_id, payload), options)
            .await
    }

    async fn queue_publish_value<T>(&self, server_type: &str, msg_id: i32, value: &T, options: &CallOptions) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = self.codec(options.code_type)?.encode_msg(value)?;
        self.queue_publish(server_type, Envelope::publish(msg_id, payload), options)
            .await
    }

    async fn request_value<Req, Resp>(
        &self,
        target: &InstanceDescriptor,
        msg_id: i32,
        request: &Req,
        options: &CallOptions,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let codec = self.codec(options.code_type)?;
        let payload = codec.encode_msg(request)?;
        let response = self.request(target, Envelope::request(msg_id, payload), options).await?;
        codec.decode_msg(&response.payload)
    }

    async fn queue_request_value<Req, Resp>(
        &self,
        server_type: &str,
        msg_id: i32,
        request: &Req,
        options: &CallOptions,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let codec = self.codec(options.code_type)?;
        let payload = codec.encode_msg(request)?;
        let response = self
            .queue_request(server_type, Envelope::request(msg_id, payload), options)
            .await?;
        codec.decode_msg(&response.payload)
    }
}

impl<T: RpcTransport + ?Sized> RpcTransportExt for T {}
