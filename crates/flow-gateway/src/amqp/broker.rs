//! Message broker facade.
//!
//! `MessageBroker` is the handle the rest of the process uses for
//! messaging. It owns the connection supervisor, the consumer registry, the
//! correlation table and the reply queue. One instance is built by the
//! composition root and shared by `Arc`.
//!
//! Request/reply: every outbound request carries `replyTo` = this process's
//! reply queue and a correlation id. The reply queue consumer settles the
//! matching pending call. A request the broker cannot route comes back as a
//! return and is answered with a synthetic `timeout` reply, so the caller is
//! not left waiting.

use crate::amqp::connection::{BrokerConnection, BrokerEvent, ChannelSetup, ConnectionState};
use crate::amqp::dispatch::{start_consumer, QueueListener, QueueMessage};
use crate::amqp::naming::{NamingPolicy, QueueNameResolver};
use crate::amqp::pending::{PendingCallTable, PendingReply};
use crate::amqp::registry::{ExchangeHandle, QueueConsumerRegistry, QueueHandle};
use crate::amqp::transport::{
    BrokerChannel, BrokerTransport, ExchangeKind, ExchangeOptions, MessageProperties,
    QueueOptions, ReturnedMessage,
};
use crate::auth::TokenService;
use crate::config::BrokerConfig;
use crate::errors::GatewayError;
use crate::observability::metrics;
use crate::services::Store;
use crate::sessions::ConsumerReleaser;
use async_trait::async_trait;
use common::types::{CorrelationId, SessionId};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, instrument, warn};

/// Expiration of the synthetic `timeout` reply sent for a returned request.
pub const RETURNED_REPLY_EXPIRATION_MS: i64 = 20_000;

/// Command tag of the synthetic reply for an unroutable request.
pub const TIMEOUT_COMMAND: &str = "timeout";

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// TTL in milliseconds. Values below 1 use the configured default.
    pub expiration_ms: i64,
    /// Generated when absent.
    pub correlation_id: Option<CorrelationId>,
    /// Routing key for exchange sends. Ignored for direct queue sends.
    pub routing_key: String,
}

impl SendOptions {
    pub fn with_expiration(expiration_ms: i64) -> Self {
        Self {
            expiration_ms,
            ..Self::default()
        }
    }
}

/// Messaging facade: sends, request/reply and consumer management.
pub struct MessageBroker {
    connection: Arc<BrokerConnection>,
    registry: QueueConsumerRegistry,
    pending: Arc<PendingCallTable>,
    reply_queue: RwLock<Option<String>>,
    config: BrokerConfig,
}

impl MessageBroker {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        tokens: Arc<dyn TokenService>,
        store: Arc<dyn Store>,
        config: BrokerConfig,
    ) -> Arc<Self> {
        let connection = BrokerConnection::new(transport, config.reconnect_delay);
        let resolver = QueueNameResolver::new(
            tokens,
            store,
            NamingPolicy {
                force_queue_prefix: config.force_queue_prefix,
                force_exchange_prefix: config.force_exchange_prefix,
                access_check: config.access_check,
            },
        );
        let registry =
            QueueConsumerRegistry::new(Arc::clone(&connection), resolver, config.dlx.clone());

        let broker = Arc::new(Self {
            connection: Arc::clone(&connection),
            registry,
            pending: Arc::new(PendingCallTable::new()),
            reply_queue: RwLock::new(None),
            config,
        });

        let weak: Weak<MessageBroker> = Arc::downgrade(&broker);
        let setup: Weak<dyn ChannelSetup> = weak;
        connection.set_channel_setup(setup);
        broker
    }

    /// Connect to the broker. On failure a retry is already scheduled.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.connection.connect().await
    }

    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Connected/disconnected notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.connection.subscribe()
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    pub fn registry(&self) -> &QueueConsumerRegistry {
        &self.registry
    }

    pub fn pending_calls(&self) -> &Arc<PendingCallTable> {
        &self.pending
    }

    /// Broker-assigned name of the current reply queue.
    pub async fn reply_queue(&self) -> Option<String> {
        self.reply_queue.read().await.clone()
    }

    /// Publish without awaiting a reply. Direct queue sends return once the
    /// broker confirms.
    #[instrument(skip_all, fields(exchange = %exchange, queue = %queue))]
    pub async fn send(
        &self,
        exchange: &str,
        queue: &str,
        payload: impl Into<Vec<u8>>,
        options: SendOptions,
    ) -> Result<(), GatewayError> {
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(CorrelationId::generate);
        let properties = self.properties(&options, correlation_id, None);
        self.publish(exchange, queue, &options.routing_key, payload.into(), properties)
            .await
            .inspect_err(|e| metrics::record_error("send", e.error_type_label()))
    }

    /// Publish a request and return a future for its reply.
    ///
    /// The returned [`PendingReply`] settles when a message with the same
    /// correlation id reaches the reply queue. It has no timeout of its own.
    #[instrument(skip_all, fields(exchange = %exchange, queue = %queue))]
    pub async fn send_with_reply(
        &self,
        exchange: &str,
        queue: &str,
        payload: impl Into<Vec<u8>>,
        options: SendOptions,
    ) -> Result<PendingReply, GatewayError> {
        self.request(exchange, queue, payload.into(), options)
            .await
            .inspect_err(|e| metrics::record_error("send_with_reply", e.error_type_label()))
    }

    async fn request(
        &self,
        exchange: &str,
        queue: &str,
        payload: Vec<u8>,
        options: SendOptions,
    ) -> Result<PendingReply, GatewayError> {
        let reply_to = self.reply_queue().await.ok_or(GatewayError::NotConnected)?;
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(CorrelationId::generate);

        let reply = self.pending.register(&correlation_id).await?;
        let properties = self.properties(&options, correlation_id.clone(), Some(reply_to));

        if let Err(e) = self
            .publish(exchange, queue, &options.routing_key, payload, properties)
            .await
        {
            self.pending.remove(correlation_id.as_str()).await;
            return Err(e);
        }
        Ok(reply)
    }

    /// Publish a request whose reply goes to `reply_to` instead of this
    /// process's reply queue. Nothing is tracked locally.
    pub async fn send_with_reply_to(
        &self,
        exchange: &str,
        queue: &str,
        reply_to: &str,
        payload: impl Into<Vec<u8>>,
        options: SendOptions,
    ) -> Result<(), GatewayError> {
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(CorrelationId::generate);
        let properties = self.properties(&options, correlation_id, Some(reply_to.to_string()));
        self.publish(exchange, queue, &options.routing_key, payload.into(), properties)
            .await
            .inspect_err(|e| metrics::record_error("send", e.error_type_label()))
    }

    /// See [`QueueConsumerRegistry::add_queue_consumer`].
    pub async fn add_queue_consumer(
        &self,
        queue: &str,
        options: Option<QueueOptions>,
        token: Option<&str>,
        owner: Option<SessionId>,
        listener: Arc<dyn QueueListener>,
    ) -> Result<QueueHandle, GatewayError> {
        self.registry
            .add_queue_consumer(queue, options, token, owner, listener)
            .await
            .inspect_err(|e| metrics::record_error("register", e.error_type_label()))
    }

    /// See [`QueueConsumerRegistry::add_exchange_consumer`].
    #[allow(clippy::too_many_arguments)]
    pub async fn add_exchange_consumer(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        routing_key: &str,
        options: Option<ExchangeOptions>,
        token: Option<&str>,
        owner: Option<SessionId>,
        listener: Arc<dyn QueueListener>,
    ) -> Result<ExchangeHandle, GatewayError> {
        self.registry
            .add_exchange_consumer(exchange, kind, routing_key, options, token, owner, listener)
            .await
            .inspect_err(|e| metrics::record_error("register", e.error_type_label()))
    }

    pub async fn remove_queue_consumer(
        &self,
        handle: Option<&QueueHandle>,
    ) -> Result<(), GatewayError> {
        self.registry.remove_queue_consumer(handle).await
    }

    fn properties(
        &self,
        options: &SendOptions,
        correlation_id: CorrelationId,
        reply_to: Option<String>,
    ) -> MessageProperties {
        let expiration = if options.expiration_ms < 1 {
            self.config.default_expiration_ms
        } else {
            options.expiration_ms.unsigned_abs()
        };
        MessageProperties {
            correlation_id: Some(correlation_id.as_str().to_string()),
            reply_to,
            expiration: Some(expiration.to_string()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), GatewayError> {
        if exchange.is_empty() {
            debug!(target: "gw.amqp.broker", queue = %queue, "Sending to queue");
            self.connection.publish("", queue, payload, properties).await
        } else {
            debug!(target: "gw.amqp.broker", exchange = %exchange, "Sending to exchange");
            self.connection
                .publish(exchange, routing_key, payload, properties)
                .await
        }
    }
}

/// Turn a returned request body into a `timeout` reply body.
fn timeout_reply_body(payload: &[u8]) -> Vec<u8> {
    let reply = match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(mut body)) => {
            body.insert("command".to_string(), json!(TIMEOUT_COMMAND));
            Value::Object(body)
        }
        _ => json!({
            "command": TIMEOUT_COMMAND,
            "data": String::from_utf8_lossy(payload),
        }),
    };
    reply.to_string().into_bytes()
}

#[async_trait]
impl ChannelSetup for MessageBroker {
    async fn on_channel_open(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), GatewayError> {
        let options = QueueOptions {
            exclusive: true,
            ..self.registry.default_queue_options()
        };
        let listener = Arc::new(ReplyQueueListener {
            pending: Arc::clone(&self.pending),
        });
        let started = start_consumer(channel, "", &options, listener, "reply").await?;
        info!(target: "gw.amqp.broker", reply_queue = %started.queue, "Reply queue ready");
        *self.reply_queue.write().await = Some(started.queue);
        Ok(())
    }

    async fn on_returned(&self, message: ReturnedMessage) {
        let Some(reply_to) = message
            .properties
            .reply_to
            .as_deref()
            .filter(|r| !r.is_empty())
        else {
            debug!(
                target: "gw.amqp.broker",
                routing_key = %message.routing_key,
                "Returned message without reply address dropped"
            );
            return;
        };

        info!(
            target: "gw.amqp.broker",
            routing_key = %message.routing_key,
            reply_text = %message.reply_text,
            "Message returned, notifying requester"
        );
        let options = SendOptions {
            expiration_ms: RETURNED_REPLY_EXPIRATION_MS,
            correlation_id: message
                .properties
                .correlation_id
                .as_deref()
                .map(CorrelationId::from),
            routing_key: String::new(),
        };
        if let Err(e) = self
            .send("", reply_to, timeout_reply_body(&message.payload), options)
            .await
        {
            warn!(target: "gw.amqp.broker", error = %e, "Failed to send timeout reply");
        }
    }

    async fn on_link_lost(&self) {
        self.reply_queue.write().await.take();
        self.registry.invalidate().await;
    }
}

#[async_trait]
impl ConsumerReleaser for MessageBroker {
    async fn release(&self, handles: &[QueueHandle]) -> Result<(), GatewayError> {
        let mut first_error = None;
        for handle in handles {
            if let Err(e) = self.registry.remove_queue_consumer(Some(handle)).await {
                warn!(
                    target: "gw.amqp.broker",
                    queue = %handle.queue,
                    error = %e,
                    "Failed to release consumer"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Settles pending calls from messages on the reply queue.
struct ReplyQueueListener {
    pending: Arc<PendingCallTable>,
}

#[async_trait]
impl QueueListener for ReplyQueueListener {
    async fn on_message(&self, message: QueueMessage) -> Result<(), GatewayError> {
        if let Some(id) = message.options.correlation_id.as_deref() {
            if !self.pending.resolve(id, message.payload.clone()).await {
                debug!(target: "gw.amqp.broker", correlation_id = %id, "Reply without pending call");
            }
        }
        // The reply queue never nacks.
        message.ack(true).await?;
        message.done();
        Ok(())
    }
}
