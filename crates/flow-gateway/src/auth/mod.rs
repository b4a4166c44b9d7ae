//! Client token handling.

pub mod tokens;

pub use tokens::{JwtTokenService, TokenService};
