//! Correlation of queue broker replies with their waiting requests

use crate::broker::{DeliveryStream, QueueDelivery};
use crate::{BrokerError, Codec, Result, RpcError, RpcMetrics};
use futures::StreamExt;
use mesh_api::Envelope;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Envelope>>;

struct PendingRequest {
    correlation_id: String,
    codec: Codec,
    reply: oneshot::Sender<Result<Envelope>>,
}

/// ReplyQueue consumes one reply destination and routes each delivery to
/// the request with the matching correlation id.
///
/// Entries whose caller stopped waiting are swept periodically so a
/// request that timed out does not leak.
pub(crate) struct ReplyQueue {
    subject: String,
    registrations: mpsc::UnboundedSender<PendingRequest>,
    task: JoinHandle<()>,
}

impl ReplyQueue {
    pub(crate) fn spawn(
        subject: String,
        deliveries: DeliveryStream,
        sweep_interval: Duration,
        metrics: Arc<RpcMetrics>,
    ) -> Self {
        let (registrations, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(subject.clone(), receiver, deliveries, sweep_interval, metrics));
        Self {
            subject,
            registrations,
            task,
        }
    }

    /// Start waiting for the reply carrying `correlation_id`
    pub(crate) fn register(&self, correlation_id: String, codec: Codec) -> Result<ReplyReceiver> {
        let (reply, receiver) = oneshot::channel();
        self.registrations
            .send(PendingRequest {
                correlation_id,
                codec,
                reply,
            })
            .map_err(|_| {
                RpcError::Transport(BrokerError::Closed(format!("reply queue {} is gone", self.subject)))
            })?;
        Ok(receiver)
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.registrations.is_closed() && !self.task.is_finished()
    }

    pub(crate) fn subject(&self) -> &str {
        &self.subject
    }
}

impl Drop for ReplyQueue {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    subject: String,
    mut registrations: mpsc::UnboundedReceiver<PendingRequest>,
    mut deliveries: DeliveryStream,
    sweep_interval: Duration,
    metrics: Arc<RpcMetrics>,
) {
    let mut pending: HashMap<String, (Codec, oneshot::Sender<Result<Envelope>>)> = HashMap::new();
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            registration = registrations.recv() => {
                let Some(request) = registration else { break };
                if pending.insert(request.correlation_id, (request.codec, request.reply)).is_none() {
                    metrics.pending_replies.inc();
                }
            }
            delivery = deliveries.next() => {
                let Some(delivery) = delivery else {
                    warn!(subject = %subject, "Reply consumer ended");
                    break;
                };
                route(&subject, &mut pending, delivery, &metrics);
            }
            _ = sweep.tick() => {
                let before = pending.len();
                pending.retain(|_, (_, reply)| !reply.is_closed());
                let swept = before - pending.len();
                if swept > 0 {
                    metrics.pending_replies.sub(swept as i64);
                    debug!(subject = %subject, swept, "Swept abandoned replies");
                }
            }
        }
    }

    // Remaining waiters see their sender dropped
    metrics.pending_replies.sub(pending.len() as i64);
}

fn route(
    subject: &str,
    pending: &mut HashMap<String, (Codec, oneshot::Sender<Result<Envelope>>)>,
    delivery: QueueDelivery,
    metrics: &RpcMetrics,
) {
    let Some(correlation_id) = delivery.correlation_id else {
        warn!(subject = %subject, "Dropping reply without correlation id");
        return;
    };
    let Some((codec, reply)) = pending.remove(&correlation_id) else {
        warn!(subject = %subject, correlation_id = %correlation_id, "Dropping unmatched reply");
        return;
    };
    metrics.pending_replies.dec();
    if reply.send(codec.decode(&delivery.payload)).is_err() {
        debug!(subject = %subject, correlation_id = %correlation_id, "Caller stopped waiting for reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Route;
    use bytes::Bytes;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn reply_queue(sweep: Duration) -> (ReplyQueue, UnboundedSender<QueueDelivery>, Arc<RpcMetrics>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let metrics = Arc::new(RpcMetrics::new().unwrap());
        let queue = ReplyQueue::spawn(
            "Rpc/game/g1/reply/c1".to_string(),
            Box::pin(UnboundedReceiverStream::new(receiver)),
            sweep,
            Arc::clone(&metrics),
        );
        (queue, sender, metrics)
    }

    fn delivery(correlation_id: &str, msg_id: i32, value: u32) -> QueueDelivery {
        let codec = Codec::binary();
        QueueDelivery {
            route: Route::Reply("Rpc/game/g1/reply/c1".to_string()),
            payload: codec.response_to(msg_id, &value).unwrap(),
            correlation_id: Some(correlation_id.to_string()),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn test_out_of_order_replies_match() {
        let (queue, sender, metrics) = reply_queue(Duration::from_secs(30));
        let first = queue.register("a".to_string(), Codec::binary()).unwrap();
        let second = queue.register("b".to_string(), Codec::binary()).unwrap();

        sender.send(delivery("b", 2, 20)).unwrap();
        sender.send(delivery("a", 1, 10)).unwrap();

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a.msg_id, 1);
        assert_eq!(Codec::binary().decode_msg::<u32>(&a.payload).unwrap(), 10);
        assert_eq!(b.msg_id, 2);
        assert_eq!(metrics.pending_replies.get(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_dropped() {
        let (queue, sender, _metrics) = reply_queue(Duration::from_secs(30));
        let waiting = queue.register("a".to_string(), Codec::binary()).unwrap();
        sender.send(delivery("stray", 9, 0)).unwrap();
        sender.send(delivery("a", 1, 1)).unwrap();
        assert_eq!(waiting.await.unwrap().unwrap().msg_id, 1);
        assert!(queue.is_alive());
    }

    #[tokio::test]
    async fn test_sweep_drops_abandoned_waiters() {
        let (queue, _sender, metrics) = reply_queue(Duration::from_millis(20));
        let abandoned = queue.register("a".to_string(), Codec::binary()).unwrap();
        let _kept = queue.register("b".to_string(), Codec::binary()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(metrics.pending_replies.get(), 2);

        drop(abandoned);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(metrics.pending_replies.get(), 1);
    }

    #[tokio::test]
    async fn test_ended_consumer_releases_waiters() {
        let (queue, sender, metrics) = reply_queue(Duration::from_secs(30));
        let waiting = queue.register("a".to_string(), Codec::binary()).unwrap();
        drop(sender);
        assert!(waiting.await.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!queue.is_alive());
        assert_eq!(metrics.pending_replies.get(), 0);
    }

    #[tokio::test]
    async fn test_register_on_stopped_queue_is_transport_error() {
        let (queue, sender, _metrics) = reply_queue(Duration::from_secs(30));
        drop(sender);
        for _ in 0..100 {
            if !queue.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let err = queue.register("late".to_string(), Codec::binary()).unwrap_err();
        assert!(matches!(err, RpcError::Transport(BrokerError::Closed(_))));
    }
}
