//! Collaborator boundaries the gateway core depends on.
//!
//! Persistence and sign-in live outside this crate. Each trait here has a
//! `mock` module for tests.

pub mod signin;
pub mod store;

pub use signin::SigninService;
pub use store::{HeartbeatUpdate, Store};
