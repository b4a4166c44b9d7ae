//! Message broker integration.
//!
//! Layering, bottom up:
//!
//! - `transport`: broker-neutral channel traits, implemented by
//!   `lapin_transport` (AMQP).
//! - `connection`: link supervisor with reconnect.
//! - `naming`: tenant prefixing and queue access checks.
//! - `dispatch` and `registry`: consumers and their bookkeeping.
//! - `pending`: correlation table for request/reply.
//! - `management`: the broker's management HTTP API.
//! - `broker`: the [`MessageBroker`] facade over all of the above.

pub mod broker;
pub mod connection;
pub mod dispatch;
pub mod lapin_transport;
pub mod management;
pub mod naming;
pub mod pending;
pub mod registry;
pub mod transport;

pub use broker::{MessageBroker, SendOptions};
pub use connection::{BrokerEvent, ConnectionState};
pub use dispatch::{listener_fn, AckHandle, QueueListener, QueueMessage, QueueMessageOptions};
pub use lapin_transport::LapinTransport;
pub use management::{ManagementClient, QueueInfo};
pub use pending::{PendingCallTable, PendingReply};
pub use registry::{ExchangeHandle, QueueHandle};
pub use transport::{BrokerTransport, ExchangeKind, ExchangeOptions, QueueOptions};
