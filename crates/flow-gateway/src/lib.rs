//! Flow Gateway Core Library
//!
//! Connectivity core of the workflow gateway:
//!
//! - Supervision of connected clients: heartbeat tracking, short-lived token
//!   refresh, pruning of dead sessions and release of their broker consumers
//! - Request/reply messaging over an AMQP broker with correlation ids and a
//!   per-process reply queue
//! - Tenant-scoped queue and exchange naming with access checks
//! - Automatic broker reconnect
//!
//! # Architecture
//!
//! ```text
//! Gateway (composition root)
//! ├── MessageBroker
//! │   ├── BrokerConnection (link supervisor, reconnect timer)
//! │   ├── QueueConsumerRegistry (naming, access checks, consumers)
//! │   ├── PendingCallTable (correlation id -> waiting caller)
//! │   └── reply queue consumer
//! └── ConnectionRegistry
//!     ├── N ClientSessions
//!     └── sweep task (refresh, timeout, ping, prune)
//! ```
//!
//! # Modules
//!
//! - [`amqp`] - Broker link, consumers, request/reply, transports
//! - [`sessions`] - Client sessions and the sweep
//! - [`auth`] - Client token decode/verify/issue
//! - [`services`] - Store and sign-in collaborator boundaries
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types
//! - [`observability`] - Tracing and metrics setup

pub mod amqp;
pub mod auth;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod services;
pub mod sessions;

pub use gateway::{Collaborators, Gateway, GatewayHandle};
