//! Broker transport abstraction.
//!
//! A [`BrokerTransport`] opens one physical connection with one
//! confirm-enabled channel and hands back a [`BrokerLink`]: the channel
//! handle plus a stream of asynchronous channel events (returns, closes,
//! errors). Everything above this module talks to the broker only through
//! these traits, so the in-memory broker and the AMQP adapter are
//! interchangeable.

use crate::errors::BrokerError;
use async_trait::async_trait;
use common::types::ConsumerTag;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Queue argument naming the dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Exchange routing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Fanout,
    Direct,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fanout" => Ok(ExchangeKind::Fanout),
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(format!("unsupported exchange type '{other}'")),
        }
    }
}

/// Options for asserting a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Value for [`DEAD_LETTER_EXCHANGE_ARG`].
    pub dead_letter_exchange: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
        }
    }
}

/// Options for asserting an exchange. Non-durable by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

/// Message properties the gateway reads or writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, as the decimal string AMQP expects.
    pub expiration: Option<String>,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    pub mandatory: bool,
}

/// A message delivered to a consumer. Must be acked or nacked by tag.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub consumer_tag: ConsumerTag,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

/// A mandatory message the broker could not route.
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

/// Asynchronous events raised on an open link.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Returned(ReturnedMessage),
    /// Channel-level error that did not close anything.
    Error(BrokerError),
    ChannelClosed { code: Option<u16>, reason: String },
    ConnectionClosed { code: Option<u16>, reason: String },
}

/// An active consumer and its delivery stream.
pub struct ConsumerStream {
    pub tag: ConsumerTag,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Operations on the single confirm-enabled channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue. An empty name asks the broker for a generated one;
    /// the actual name is returned.
    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<String, BrokerError>;

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<ConsumerStream, BrokerError>;

    async fn cancel(&self, tag: &ConsumerTag) -> Result<(), BrokerError>;

    /// Publish without waiting for the broker.
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    /// Publish and wait for the broker's confirm.
    ///
    /// A mandatory message that cannot be routed is still confirmed; the
    /// bounce arrives separately as [`ChannelEvent::Returned`].
    async fn publish_confirmed(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Close the channel and its parent connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// An open connection: its channel and event stream.
pub struct BrokerLink {
    pub channel: Arc<dyn BrokerChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Opens broker connections.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self) -> Result<BrokerLink, BrokerError>;
}
