//! In-process broker.
//!
//! Implements [`BrokerTransport`] with the AMQP behaviour the gateway relies
//! on: named and generated queues, fanout/direct/topic exchanges, manual
//! acks with requeue, dead-lettering, per-message TTL and mandatory returns.
//! Connections can be dropped or refused on demand to exercise the
//! reconnect path.

use async_trait::async_trait;
use common::types::ConsumerTag;
use flow_gateway::amqp::naming::RESERVED_QUEUE_PREFIX;
use flow_gateway::amqp::transport::{
    BrokerChannel, BrokerLink, BrokerTransport, ChannelEvent, ConsumerStream, Delivery,
    ExchangeKind, ExchangeOptions, MessageProperties, OutboundMessage, QueueOptions,
    ReturnedMessage,
};
use flow_gateway::errors::{BrokerError, AMQP_NOT_FOUND};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// AMQP reply code for an unroutable mandatory message.
pub const AMQP_NO_ROUTE: u16 = 312;
/// AMQP reply code for a broker-initiated connection close.
pub const AMQP_CONNECTION_FORCED: u16 = 320;
const AMQP_ACCESS_REFUSED: u16 = 403;
const AMQP_RESOURCE_LOCKED: u16 = 405;
const AMQP_PRECONDITION_FAILED: u16 = 406;

/// How a delivery was settled by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    payload: Vec<u8>,
    redelivered: bool,
    expires_at: Option<Instant>,
}

struct MemQueue {
    options: QueueOptions,
    owner: Option<u64>,
    backlog: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerTag>,
    next_consumer: usize,
}

struct MemExchange {
    kind: ExchangeKind,
    options: ExchangeOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct MemConsumer {
    queue: String,
    connection: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Unacked {
    connection: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>,
    next_id: u64,
    fail_connects: usize,
    connect_attempts: usize,
    queues: HashMap<String, MemQueue>,
    exchanges: HashMap<String, MemExchange>,
    bindings: Vec<Binding>,
    consumers: HashMap<ConsumerTag, MemConsumer>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<OutboundMessage>,
    settlements: Vec<(u64, Settlement)>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn require_open(&self, connection: u64) -> Result<(), BrokerError> {
        if self.connections.contains_key(&connection) {
            Ok(())
        } else {
            Err(BrokerError::new("channel is closed"))
        }
    }

    fn require_queue(&self, queue: &str) -> Result<(), BrokerError> {
        if self.queues.contains_key(queue) {
            Ok(())
        } else {
            Err(BrokerError::with_code(
                AMQP_NOT_FOUND,
                format!("no queue '{queue}'"),
            ))
        }
    }

    /// Queues a message published to `exchange` with `routing_key` reaches.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }
        let Some(target) = self.exchanges.get(exchange) else {
            return Err(BrokerError::with_code(
                AMQP_NOT_FOUND,
                format!("no exchange '{exchange}'"),
            ));
        };

        let mut queues: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match target.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    fn publish(&mut self, connection: u64, message: OutboundMessage) -> Result<(), BrokerError> {
        self.require_open(connection)?;
        self.published.push(message.clone());

        let targets = self.route(&message.exchange, &message.routing_key)?;
        if targets.is_empty() {
            if message.mandatory {
                debug!(target: "gw.test.memory_broker", routing_key = %message.routing_key, "Returning unroutable message");
                if let Some(events) = self.connections.get(&connection) {
                    let _ = events.send(ChannelEvent::Returned(ReturnedMessage {
                        reply_code: AMQP_NO_ROUTE,
                        reply_text: "NO_ROUTE".to_string(),
                        exchange: message.exchange,
                        routing_key: message.routing_key,
                        properties: message.properties,
                        payload: message.payload,
                    }));
                }
            }
            return Ok(());
        }

        let expires_at = message
            .properties
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let stored = StoredMessage {
            exchange: message.exchange,
            routing_key: message.routing_key,
            properties: message.properties,
            payload: message.payload,
            redelivered: false,
            expires_at,
        };
        for queue in targets {
            self.enqueue(&queue, stored.clone(), false);
        }
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage, front: bool) {
        let Some(target) = self.queues.get_mut(queue) else {
            return;
        };
        if front {
            target.backlog.push_front(message);
        } else {
            target.backlog.push_back(message);
        }
        self.drain(queue);
    }

    /// Push backlog messages to consumers until one side runs out.
    fn drain(&mut self, queue: &str) {
        loop {
            let now = Instant::now();
            let Some(target) = self.queues.get_mut(queue) else {
                return;
            };
            if target.consumers.is_empty() {
                return;
            }
            let Some(message) = target.backlog.pop_front() else {
                return;
            };
            if message.expires_at.is_some_and(|at| at <= now) {
                let dlx = target.options.dead_letter_exchange.clone();
                self.dead_letter(dlx.as_deref(), message);
                continue;
            }

            let index = target.next_consumer % target.consumers.len();
            target.next_consumer = target.next_consumer.wrapping_add(1);
            let Some(tag) = target.consumers.get(index).cloned() else {
                return;
            };

            let delivery_tag = self.next_id();
            let delivery = Delivery {
                delivery_tag,
                consumer_tag: tag.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                payload: message.payload.clone(),
            };
            let sent = self
                .consumers
                .get(&tag)
                .and_then(|c| c.tx.send(delivery).ok().map(|()| c.connection));

            match sent {
                Some(connection) => {
                    self.unacked.insert(
                        delivery_tag,
                        Unacked {
                            connection,
                            queue: queue.to_string(),
                            message,
                        },
                    );
                }
                None => {
                    // Receiver gone: forget the consumer and retry the message.
                    self.consumers.remove(&tag);
                    if let Some(target) = self.queues.get_mut(queue) {
                        target.consumers.retain(|t| t != &tag);
                        target.backlog.push_front(message);
                    }
                }
            }
        }
    }

    fn dead_letter(&mut self, dlx: Option<&str>, message: StoredMessage) {
        let Some(dlx) = dlx else {
            debug!(target: "gw.test.memory_broker", routing_key = %message.routing_key, "Message dropped");
            return;
        };
        let Ok(targets) = self.route(dlx, &message.routing_key) else {
            return;
        };
        let dead = StoredMessage {
            exchange: dlx.to_string(),
            redelivered: false,
            expires_at: None,
            ..message
        };
        for queue in targets {
            self.enqueue(&queue, dead.clone(), false);
        }
    }

    fn settle(&mut self, delivery_tag: u64, outcome: Settlement) -> Result<(), BrokerError> {
        let Some(entry) = self.unacked.remove(&delivery_tag) else {
            return Err(BrokerError::with_code(
                AMQP_PRECONDITION_FAILED,
                format!("unknown delivery tag {delivery_tag}"),
            ));
        };
        self.settlements.push((delivery_tag, outcome));

        match outcome {
            Settlement::Ack => {}
            Settlement::Nack { requeue: true } => {
                let message = StoredMessage {
                    redelivered: true,
                    ..entry.message
                };
                self.enqueue(&entry.queue, message, true);
            }
            Settlement::Nack { requeue: false } => {
                let dlx = self
                    .queues
                    .get(&entry.queue)
                    .and_then(|q| q.options.dead_letter_exchange.clone());
                self.dead_letter(dlx.as_deref(), entry.message);
            }
        }
        Ok(())
    }

    fn cancel_consumer(&mut self, tag: &ConsumerTag) {
        let Some(consumer) = self.consumers.remove(tag) else {
            return;
        };
        let delete = match self.queues.get_mut(&consumer.queue) {
            Some(queue) => {
                queue.consumers.retain(|t| t != tag);
                queue.options.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };
        if delete {
            self.delete_queue(&consumer.queue);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        let Some(queue) = self.queues.remove(name) else {
            return;
        };
        for tag in &queue.consumers {
            self.consumers.remove(tag);
        }
        let exchanges: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.queue == name)
            .map(|b| b.exchange.clone())
            .collect();
        self.bindings.retain(|b| b.queue != name);
        for exchange in exchanges {
            self.prune_exchange(&exchange);
        }
    }

    /// Delete an auto-delete exchange once nothing is bound to it.
    fn prune_exchange(&mut self, name: &str) {
        let unused = !self.bindings.iter().any(|b| b.exchange == name);
        if unused
            && self
                .exchanges
                .get(name)
                .is_some_and(|e| e.options.auto_delete)
        {
            self.exchanges.remove(name);
        }
    }

    /// Drop a connection with everything scoped to it.
    fn teardown(&mut self, connection: u64) {
        self.connections.remove(&connection);

        let tags: Vec<ConsumerTag> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in &tags {
            self.cancel_consumer(tag);
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        let mut touched = Vec::new();
        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    queue.backlog.push_front(StoredMessage {
                        redelivered: true,
                        ..entry.message
                    });
                    touched.push(entry.queue);
                }
            }
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }

        for queue in touched {
            self.drain(&queue);
        }
    }
}

/// Match an AMQP topic pattern (`*` one word, `#` zero or more).
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    topic_words_match(&pattern, &words)
}

fn topic_words_match(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.split_first(), words.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_words_match(rest, words)
                || words
                    .split_first()
                    .is_some_and(|(_, tail)| topic_words_match(pattern, tail))
        }
        (Some((&word, rest)), Some((&actual, tail))) => {
            (word == "*" || word == actual) && topic_words_match(rest, tail)
        }
        _ => false,
    }
}

/// In-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Fault injection
    // ========================================================================

    /// Close every open connection from the broker side.
    pub async fn drop_connection(&self) {
        let mut state = self.state.lock().await;
        let connections: Vec<u64> = state.connections.keys().copied().collect();
        for connection in connections {
            if let Some(events) = state.connections.get(&connection) {
                let _ = events.send(ChannelEvent::ConnectionClosed {
                    code: Some(AMQP_CONNECTION_FORCED),
                    reason: "CONNECTION_FORCED - broker forced connection closure".to_string(),
                });
            }
            state.teardown(connection);
        }
    }

    /// Close the channel of every open connection with `code`.
    pub async fn close_channel(&self, code: u16, reason: &str) {
        let mut state = self.state.lock().await;
        let connections: Vec<u64> = state.connections.keys().copied().collect();
        for connection in connections {
            if let Some(events) = state.connections.get(&connection) {
                let _ = events.send(ChannelEvent::ChannelClosed {
                    code: Some(code),
                    reason: reason.to_string(),
                });
            }
            state.teardown(connection);
        }
    }

    /// Refuse the next `attempts` connection attempts.
    pub async fn fail_connects(&self, attempts: usize) {
        self.state.lock().await.fail_connects = attempts;
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub async fn connect_attempts(&self) -> usize {
        self.state.lock().await.connect_attempts
    }

    pub async fn open_connections(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().await.queues.contains_key(name)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dead-letter exchange configured on `queue`.
    pub async fn queue_dead_letter_exchange(&self, queue: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .and_then(|q| q.options.dead_letter_exchange.clone())
    }

    pub async fn exchange_exists(&self, name: &str) -> bool {
        self.state.lock().await.exchanges.contains_key(name)
    }

    pub async fn binding_exists(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        let wanted = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        self.state.lock().await.bindings.contains(&wanted)
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Messages waiting in `queue` for a consumer.
    pub async fn message_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.backlog.len())
    }

    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Every message published, routable or not, in order.
    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.published.clone()
    }

    pub async fn settlements(&self) -> Vec<Settlement> {
        self.state
            .lock()
            .await
            .settlements
            .iter()
            .map(|(_, outcome)| *outcome)
            .collect()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(&self) -> Result<BrokerLink, BrokerError> {
        let mut state = self.state.lock().await;
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BrokerError::new("connection refused"));
        }

        let connection = state.next_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        state.connections.insert(connection, events_tx);
        debug!(target: "gw.test.memory_broker", connection = connection, "Connection opened");

        Ok(BrokerLink {
            channel: Arc::new(MemoryChannel {
                state: Arc::clone(&self.state),
                connection,
            }),
            events: events_rx,
        })
    }
}

/// Channel of one in-memory connection.
struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    connection: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<String, BrokerError> {
        let mut state = self.state.lock().await;
        state.require_open(self.connection)?;

        let name = if name.is_empty() {
            format!("{RESERVED_QUEUE_PREFIX}gen-{}", Uuid::new_v4().simple())
        } else if name.starts_with(RESERVED_QUEUE_PREFIX) {
            return Err(BrokerError::with_code(
                AMQP_ACCESS_REFUSED,
                format!("queue name '{name}' contains reserved prefix"),
            ));
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != self.connection) {
                return Err(BrokerError::with_code(
                    AMQP_RESOURCE_LOCKED,
                    format!("queue '{name}' is exclusive to another connection"),
                ));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            MemQueue {
                options: options.clone(),
                owner: options.exclusive.then_some(self.connection),
                backlog: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(name)
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.require_open(self.connection)?;
        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind {
                return Err(BrokerError::with_code(
                    AMQP_PRECONDITION_FAILED,
                    format!("exchange '{name}' exists with type {}", existing.kind),
                ));
            }
            return Ok(());
        }
        state.exchanges.insert(
            name.to_string(),
            MemExchange {
                kind,
                options: options.clone(),
            },
        );
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.require_open(self.connection)?;
        state.require_queue(queue)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::with_code(
                AMQP_NOT_FOUND,
                format!("no exchange '{exchange}'"),
            ));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.require_open(self.connection)?;
        state.bindings.retain(|b| {
            !(b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
        });
        state.prune_exchange(exchange);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<ConsumerStream, BrokerError> {
        let mut state = self.state.lock().await;
        state.require_open(self.connection)?;
        state.require_queue(queue)?;

        let tag = ConsumerTag::new(format!("amq.ctag-{}", Uuid::new_v4().simple()));
        let (tx, rx) = mpsc::unbounded_channel();
        state.consumers.insert(
            tag.clone(),
            MemConsumer {
                queue: queue.to_string(),
                connection: self.connection,
                tx,
            },
        );
        if let Some(target) = state.queues.get_mut(queue) {
            target.consumers.push(tag.clone());
        }
        state.drain(queue);

        Ok(ConsumerStream {
            tag,
            deliveries: rx,
        })
    }

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.require_open(self.connection)?;
        state.cancel_consumer(tag);
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        self.state.lock().await.publish(self.connection, message)
    }

    async fn publish_confirmed(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        self.state.lock().await.publish(self.connection, message)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.require_open(self.connection)?;
        state.settle(delivery_tag, Settlement::Ack)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.require_open(self.connection)?;
        state.settle(delivery_tag, Settlement::Nack { requeue })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.connections.contains_key(&self.connection) {
            state.teardown(self.connection);
            debug!(target: "gw.test.memory_broker", connection = self.connection, "Connection closed");
        }
        Ok(())
    }
}
