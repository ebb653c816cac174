//! NATS adapter for the request/reply broker contract

use super::{InboundMessage, MessageStream, RequestReplyBroker};
use crate::{BrokerError, BrokerResult};
use async_nats::client::RequestErrorKind;
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::info;

pub struct NatsBroker {
    client: Client,
}

impl NatsBroker {
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Io(format!("failed to connect to NATS at {}: {}", url, e)))?;
        info!(url = %url, "Connected to NATS");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl RequestReplyBroker for NatsBroker {
    async fn publish(&self, subject: &str, payload: Bytes) -> BrokerResult<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BrokerError::Io(e.to_string()))
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> BrokerResult<MessageStream> {
        let subscriber = match queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| BrokerError::Io(e.to_string()))?;

        Ok(Box::pin(subscriber.map(|message| InboundMessage {
            subject: message.subject.to_string(),
            payload: message.payload,
            reply: message.reply.map(|reply| reply.to_string()),
        })))
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> BrokerResult<Bytes> {
        let response = tokio::time::timeout(timeout, self.client.request(subject.to_string(), payload))
            .await
            .map_err(|_| BrokerError::Timeout)?;
        match response {
            Ok(message) => Ok(message.payload),
            Err(e) => Err(match e.kind() {
                RequestErrorKind::NoResponders => BrokerError::NoResponders(subject.to_string()),
                RequestErrorKind::TimedOut => BrokerError::Timeout,
                RequestErrorKind::Other => BrokerError::Io(e.to_string()),
            }),
        }
    }
}
