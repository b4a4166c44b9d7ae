//! Delivery of consumed messages to listeners.
//!
//! Each consumer gets one dispatcher task that reads deliveries in broker
//! order and runs the listener for each on its own task, so a listener
//! waiting on a client never holds up the next delivery. Every message is
//! settled exactly once:
//!
//! - `ack(true)` acks, `ack(false)` nacks (the broker requeues it).
//! - A listener that took an [`AckHandle`] owns settlement; returning `Ok`
//!   leaves the message unsettled until the handle is used.
//! - A listener that returns `Ok` without settling or taking the handle
//!   gets an ack.
//! - A listener that fails or panics without settling gets a nack without
//!   requeue, so a poison message is dead-lettered instead of looping.
//!
//! Listener failures and panics are logged; the dispatcher keeps running.

use crate::amqp::transport::{BrokerChannel, ConsumerStream, Delivery, QueueOptions};
use crate::errors::GatewayError;
use crate::observability::metrics;
use async_trait::async_trait;
use common::types::ConsumerTag;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Routing metadata handed to a listener with each message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMessageOptions {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub consumer_tag: String,
    pub routing_key: String,
    pub exchange: String,
}

/// Settles one delivery. Clones share state: the first settle wins.
#[derive(Clone)]
pub struct AckHandle {
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
    settled: Arc<AtomicBool>,
    deferred: Arc<AtomicBool>,
}

impl AckHandle {
    fn new(channel: Arc<dyn BrokerChannel>, delivery_tag: u64) -> Self {
        Self {
            channel,
            delivery_tag,
            settled: Arc::new(AtomicBool::new(false)),
            deferred: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ack the message, or nack it when `ok` is false.
    ///
    /// Settling twice is a no-op.
    pub async fn ack(&self, ok: bool) -> Result<(), GatewayError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if ok {
            self.channel.ack(self.delivery_tag).await?;
        } else {
            self.channel.nack(self.delivery_tag, true).await?;
        }
        Ok(())
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }

    async fn reject(&self) -> Result<(), GatewayError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.nack(self.delivery_tag, false).await?;
        Ok(())
    }
}

/// A consumed message.
pub struct QueueMessage {
    /// Message body, decoded as UTF-8 (lossy).
    pub payload: String,
    pub options: QueueMessageOptions,
    pub redelivered: bool,
    ack: AckHandle,
}

impl QueueMessage {
    /// Ack (`true`) or nack (`false`) this message.
    pub async fn ack(&self, ok: bool) -> Result<(), GatewayError> {
        self.ack.ack(ok).await
    }

    /// Handle for settling the message from elsewhere.
    ///
    /// Taking the handle hands settlement to the caller: the dispatcher no
    /// longer acks when the listener returns `Ok`.
    pub fn ack_handle(&self) -> AckHandle {
        self.ack.deferred.store(true, Ordering::SeqCst);
        self.ack.clone()
    }

    /// Completion hook. Reserved for reply forwarding; currently a no-op.
    pub fn done(&self) {}
}

/// Receives messages from a queue consumer.
#[async_trait]
pub trait QueueListener: Send + Sync {
    async fn on_message(&self, message: QueueMessage) -> Result<(), GatewayError>;
}

struct FnListener<F>(F);

#[async_trait]
impl<F, Fut> QueueListener for FnListener<F>
where
    F: Fn(QueueMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), GatewayError>> + Send,
{
    async fn on_message(&self, message: QueueMessage) -> Result<(), GatewayError> {
        (self.0)(message).await
    }
}

/// Wrap a closure as a [`QueueListener`].
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn QueueListener>
where
    F: Fn(QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
{
    Arc::new(FnListener(f))
}

/// A started consumer: the broker's queue name and consumer tag.
#[derive(Debug, Clone)]
pub struct StartedConsumer {
    pub queue: String,
    pub consumer_tag: ConsumerTag,
}

/// Assert `queue`, start consuming it and spawn its dispatcher.
///
/// `kind` labels the delivery counter (queue, exchange, reply).
pub async fn start_consumer(
    channel: Arc<dyn BrokerChannel>,
    queue: &str,
    options: &QueueOptions,
    listener: Arc<dyn QueueListener>,
    kind: &'static str,
) -> Result<StartedConsumer, GatewayError> {
    let actual = channel.assert_queue(queue, options).await.map_err(|e| {
        GatewayError::Broker(format!("failed asserting queue '{queue}': {}", e.message))
    })?;
    let stream = channel.consume(&actual).await?;
    let consumer_tag = stream.tag.clone();

    tokio::spawn(run_dispatcher(channel, stream, listener, kind));

    Ok(StartedConsumer {
        queue: actual,
        consumer_tag,
    })
}

async fn run_dispatcher(
    channel: Arc<dyn BrokerChannel>,
    mut stream: ConsumerStream,
    listener: Arc<dyn QueueListener>,
    kind: &'static str,
) {
    while let Some(delivery) = stream.deliveries.recv().await {
        metrics::record_queue_message(kind);
        tokio::spawn(dispatch_one(
            Arc::clone(&channel),
            delivery,
            Arc::clone(&listener),
        ));
    }
    debug!(
        target: "gw.amqp.dispatch",
        consumer_tag = %stream.tag,
        "Consumer stream ended"
    );
}

async fn dispatch_one(
    channel: Arc<dyn BrokerChannel>,
    delivery: Delivery,
    listener: Arc<dyn QueueListener>,
) {
    let ack = AckHandle::new(channel, delivery.delivery_tag);
    let message = QueueMessage {
        payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
        options: QueueMessageOptions {
            correlation_id: delivery.properties.correlation_id,
            reply_to: delivery.properties.reply_to,
            consumer_tag: delivery.consumer_tag.as_str().to_string(),
            routing_key: delivery.routing_key,
            exchange: delivery.exchange,
        },
        redelivered: delivery.redelivered,
        ack: ack.clone(),
    };

    // Run on its own task so a panicking listener is contained.
    let outcome = tokio::spawn(async move { listener.on_message(message).await }).await;

    let settle = match outcome {
        Ok(Ok(())) if ack.is_deferred() => {
            if !ack.is_settled() {
                debug!(
                    target: "gw.amqp.dispatch",
                    consumer_tag = %delivery.consumer_tag,
                    delivery_tag = delivery.delivery_tag,
                    "Settlement deferred to listener"
                );
            }
            Ok(())
        }
        Ok(Ok(())) => ack.ack(true).await,
        Ok(Err(e)) => {
            warn!(
                target: "gw.amqp.dispatch",
                consumer_tag = %delivery.consumer_tag,
                error = %e,
                "Queue listener failed"
            );
            ack.reject().await
        }
        Err(join_error) => {
            if join_error.is_panic() {
                error!(
                    target: "gw.amqp.dispatch",
                    consumer_tag = %delivery.consumer_tag,
                    "Queue listener panicked"
                );
            }
            ack.reject().await
        }
    };

    if let Err(e) = settle {
        // Channel likely gone; the broker requeues unacked messages itself.
        debug!(target: "gw.amqp.dispatch", error = %e, "Settling delivery failed");
    }
}
