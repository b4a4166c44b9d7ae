//! # Flow Gateway Test Utilities
//!
//! Fakes for exercising the gateway without external infrastructure.
//!
//! - `memory_broker` - in-process AMQP broker with fault injection
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flow_gateway_test_utils::InMemoryBroker;
//!
//! let memory = InMemoryBroker::new();
//! let broker = MessageBroker::new(Arc::new(memory.clone()), tokens, store, config);
//! broker.connect().await?;
//!
//! memory.drop_connection().await;
//! ```

pub mod memory_broker;

pub use memory_broker::{InMemoryBroker, Settlement};
