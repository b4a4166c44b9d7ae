//! Common utilities and types shared across the flow gateway crates.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for user token claims and size limits
pub mod jwt;
