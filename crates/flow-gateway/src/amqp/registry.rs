//! Registry of queue and exchange consumers.
//!
//! Resolves requested names (tenant prefix, access check), asserts the
//! queue or exchange, starts the consumer and records it. Entries are keyed
//! by broker consumer tag.
//!
//! Invariants:
//! - A resolved queue name has at most one active consumer registration.
//! - An exchange binding and its backing queue consumer are removed together.
//! - When the broker link is lost every entry is dropped; the broker has
//!   already discarded the consumers. Stale handles then remove as no-ops.

use crate::amqp::connection::BrokerConnection;
use crate::amqp::dispatch::{start_consumer, QueueListener};
use crate::amqp::naming::QueueNameResolver;
use crate::amqp::transport::{ExchangeKind, ExchangeOptions, QueueOptions};
use crate::errors::GatewayError;
use crate::observability::metrics;
use common::types::{ConsumerTag, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Handle to a registered queue consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    /// Name as requested by the caller.
    pub requested: String,
    /// Name on the broker (broker-assigned for anonymous queues).
    pub queue: String,
    pub consumer_tag: ConsumerTag,
}

/// Handle to a registered exchange consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeHandle {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub routing_key: String,
    /// Backing anonymous queue bound to the exchange.
    pub queue: QueueHandle,
}

#[derive(Debug, Clone)]
struct QueueConsumer {
    handle: QueueHandle,
    owner: Option<SessionId>,
}

#[derive(Default)]
struct RegistryState {
    queues: HashMap<ConsumerTag, QueueConsumer>,
    exchanges: HashMap<ConsumerTag, ExchangeHandle>,
}

impl RegistryState {
    fn publish_gauges(&self) {
        metrics::set_consumers_active("queue", self.queues.len());
        metrics::set_consumers_active("exchange", self.exchanges.len());
    }
}

/// Queue/exchange consumer registry.
pub struct QueueConsumerRegistry {
    connection: Arc<BrokerConnection>,
    resolver: QueueNameResolver,
    dlx: Option<String>,
    state: Mutex<RegistryState>,
    // Serializes name-uniqueness check through insert.
    registration: Mutex<()>,
}

impl QueueConsumerRegistry {
    pub fn new(
        connection: Arc<BrokerConnection>,
        resolver: QueueNameResolver,
        dlx: Option<String>,
    ) -> Self {
        Self {
            connection,
            resolver,
            dlx,
            state: Mutex::new(RegistryState::default()),
            registration: Mutex::new(()),
        }
    }

    /// Default options for asserted queues: durable, dead-lettered to the
    /// configured exchange.
    pub fn default_queue_options(&self) -> QueueOptions {
        QueueOptions {
            dead_letter_exchange: self.dlx.clone(),
            ..QueueOptions::default()
        }
    }

    /// Register a consumer on `requested` for the holder of `token`.
    #[instrument(skip_all, fields(requested = %requested))]
    pub async fn add_queue_consumer(
        &self,
        requested: &str,
        options: Option<QueueOptions>,
        token: Option<&str>,
        owner: Option<SessionId>,
        listener: Arc<dyn QueueListener>,
    ) -> Result<QueueHandle, GatewayError> {
        self.register_queue(requested, options, token, owner, listener, "queue")
            .await
    }

    async fn register_queue(
        &self,
        requested: &str,
        options: Option<QueueOptions>,
        token: Option<&str>,
        owner: Option<SessionId>,
        listener: Arc<dyn QueueListener>,
        kind: &'static str,
    ) -> Result<QueueHandle, GatewayError> {
        let channel = self.connection.require_channel().await?;
        let resolved = self.resolver.resolve_queue(requested, token).await?;

        let mut options = options.unwrap_or_else(|| self.default_queue_options());
        if resolved.is_empty() {
            options.exclusive = true;
        }

        let _registration = self.registration.lock().await;
        if !resolved.is_empty() && self.is_queue_active(&resolved).await {
            return Err(GatewayError::Conflict(format!(
                "queue '{resolved}' already has an active consumer"
            )));
        }

        let started = start_consumer(channel, &resolved, &options, listener, kind).await?;

        let handle = QueueHandle {
            requested: requested.to_string(),
            queue: started.queue,
            consumer_tag: started.consumer_tag,
        };
        let mut state = self.state.lock().await;
        state.queues.insert(
            handle.consumer_tag.clone(),
            QueueConsumer {
                handle: handle.clone(),
                owner,
            },
        );
        state.publish_gauges();

        info!(
            target: "gw.amqp.registry",
            queue = %handle.queue,
            consumer_tag = %handle.consumer_tag,
            "Added queue consumer"
        );
        Ok(handle)
    }

    /// Register a consumer on `exchange` through a fresh anonymous queue.
    #[instrument(skip_all, fields(exchange = %exchange, kind = %kind))]
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
        let channel = self.connection.require_channel().await?;
        let resolved = self.resolver.resolve_exchange(exchange, token)?;
        let is_dlx = self.dlx.as_deref() == Some(resolved.as_str());

        let mut exchange_options = options.unwrap_or_default();
        if !is_dlx {
            exchange_options.auto_delete = true;
        }
        channel
            .assert_exchange(&resolved, kind, &exchange_options)
            .await
            .map_err(|e| {
                GatewayError::Broker(format!("failed asserting exchange '{resolved}': {}", e.message))
            })?;

        // The dead-letter exchange's own queue must not dead-letter to itself.
        let queue_options = is_dlx.then(QueueOptions::default);
        let queue = self
            .register_queue("", queue_options, token, owner, listener, "exchange")
            .await?;

        if let Err(e) = channel.bind_queue(&queue.queue, &resolved, routing_key).await {
            warn!(
                target: "gw.amqp.registry",
                exchange = %resolved,
                error = %e,
                "Binding exchange queue failed, removing consumer"
            );
            self.remove_queue_consumer(Some(&queue)).await?;
            return Err(e.into());
        }

        let handle = ExchangeHandle {
            exchange: resolved,
            kind,
            routing_key: routing_key.to_string(),
            queue,
        };
        let mut state = self.state.lock().await;
        state
            .exchanges
            .insert(handle.queue.consumer_tag.clone(), handle.clone());
        state.publish_gauges();

        info!(
            target: "gw.amqp.registry",
            exchange = %handle.exchange,
            queue = %handle.queue.queue,
            "Added exchange consumer"
        );
        Ok(handle)
    }

    /// Remove a consumer and any exchange binding on it.
    ///
    /// `None` and handles that are no longer registered are no-ops.
    pub async fn remove_queue_consumer(
        &self,
        handle: Option<&QueueHandle>,
    ) -> Result<(), GatewayError> {
        let Some(handle) = handle else {
            return Ok(());
        };

        let (consumer, binding) = {
            let mut state = self.state.lock().await;
            let consumer = state.queues.remove(&handle.consumer_tag);
            let binding = state.exchanges.remove(&handle.consumer_tag);
            state.publish_gauges();
            (consumer, binding)
        };
        if consumer.is_none() {
            return Ok(());
        }

        // No channel means the link died and took the consumer with it.
        let Some(channel) = self.connection.channel().await else {
            return Ok(());
        };

        if let Some(binding) = &binding {
            if let Err(e) = channel
                .unbind_queue(&binding.queue.queue, &binding.exchange, &binding.routing_key)
                .await
            {
                warn!(target: "gw.amqp.registry", exchange = %binding.exchange, error = %e, "Unbind failed");
            }
        }

        channel.cancel(&handle.consumer_tag).await?;
        info!(
            target: "gw.amqp.registry",
            queue = %handle.queue,
            consumer_tag = %handle.consumer_tag,
            "Removed queue consumer"
        );
        Ok(())
    }

    /// Drop every entry. Called when the broker link is lost.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        let dropped = state.queues.len();
        state.queues.clear();
        state.exchanges.clear();
        state.publish_gauges();
        if dropped > 0 {
            info!(target: "gw.amqp.registry", dropped = dropped, "Dropped consumers of lost link");
        }
    }

    pub async fn is_queue_active(&self, resolved: &str) -> bool {
        self.state
            .lock()
            .await
            .queues
            .values()
            .any(|c| c.handle.queue == resolved)
    }

    pub async fn contains(&self, tag: &ConsumerTag) -> bool {
        self.state.lock().await.queues.contains_key(tag)
    }

    pub async fn queue_count(&self) -> usize {
        self.state.lock().await.queues.len()
    }

    pub async fn exchange_count(&self) -> usize {
        self.state.lock().await.exchanges.len()
    }

    /// Handles owned by `owner`.
    pub async fn owned_by(&self, owner: SessionId) -> Vec<QueueHandle> {
        self.state
            .lock()
            .await
            .queues
            .values()
            .filter(|c| c.owner == Some(owner))
            .map(|c| c.handle.clone())
            .collect()
    }
}
