//! User token claims shared between the gateway and its token service.
//!
//! A client token is an HS256 JWT whose claims carry the signed-in user's
//! profile: subject id, username and the role set used for queue access
//! decisions.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - `sub` and `username` are redacted in Debug output

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Larger tokens are rejected before any base64 decoding or signature work.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Seconds before expiry at which a session token is refreshed.
pub const DEFAULT_REFRESH_THRESHOLD_SECONDS: i64 = 60;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while checking or decoding a user token.
///
/// Messages are deliberately generic; details go to debug logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    #[error("The access token is invalid or expired")]
    TokenTooLarge,
}

// =============================================================================
// Claims Types
// =============================================================================

/// Reference to a role the user is a member of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

/// User profile embedded in a token and pushed to clients on refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<RoleRef>,
}

impl fmt::Debug for TokenUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenUser")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("username", &"[REDACTED]")
            .field("roles", &self.roles.len())
            .finish()
    }
}

impl TokenUser {
    /// True if `id` is this user's own id or one of its role ids.
    #[must_use]
    pub fn is_subject_or_member_of(&self, id: &str) -> bool {
        self.id == id || self.roles.iter().any(|r| r.id == id)
    }
}

/// Claims carried by a client token.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// Subject (user id) - redacted in Debug output.
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,

    pub user: TokenUser,
}

impl fmt::Debug for UserClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClaims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("user", &self.user)
            .finish()
    }
}

impl UserClaims {
    /// Build claims for `user` valid from `now` for `ttl_seconds`.
    #[must_use]
    pub fn for_user(user: TokenUser, now: DateTime<Utc>, ttl_seconds: i64) -> Self {
        let iat = now.timestamp();
        Self {
            sub: user.id.clone(),
            exp: iat.saturating_add(ttl_seconds),
            iat,
            user,
        }
    }

    /// Seconds remaining until expiry. Negative once expired.
    #[must_use]
    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.exp.saturating_sub(now.timestamp())
    }

    /// True when the token expires in less than `threshold_seconds`.
    #[must_use]
    pub fn expires_within(&self, now: DateTime<Utc>, threshold_seconds: i64) -> bool {
        self.seconds_until_expiry(now) < threshold_seconds
    }

    /// Access rule for resource-id shaped names: own id or a role id.
    #[must_use]
    pub fn grants_direct_access_to(&self, resource_id: &str) -> bool {
        self.sub == resource_id || self.user.is_subject_or_member_of(resource_id)
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Reject tokens larger than [`MAX_JWT_SIZE_BYTES`] before any parsing.
///
/// # Errors
///
/// Returns `JwtValidationError::TokenTooLarge` when the limit is exceeded.
pub fn check_token_size(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user() -> TokenUser {
        TokenUser {
            id: "5f1a2b3c4d5e6f7a8b9c0d1e".to_string(),
            name: "Alice".to_string(),
            username: "alice@example.com".to_string(),
            roles: vec![RoleRef {
                id: "aaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
                name: "robots".to_string(),
            }],
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    #[test]
    fn test_debug_redacts_subject_and_username() {
        let claims = UserClaims::for_user(user(), at(1_000), 300);
        let debug = format!("{claims:?}");

        assert!(debug.contains("sub: \"[REDACTED]\""));
        assert!(!debug.contains("alice@example.com"));
    }

    #[test]
    fn test_expiry_window() {
        let claims = UserClaims::for_user(user(), at(1_000), 90);

        assert_eq!(claims.seconds_until_expiry(at(1_000)), 90);
        assert!(!claims.expires_within(at(1_000), 60));
        assert!(claims.expires_within(at(1_060), 60));
        assert!(claims.expires_within(at(2_000), 60));
    }

    #[test]
    fn test_direct_access_by_subject_or_role() {
        let claims = UserClaims::for_user(user(), at(0), 60);

        assert!(claims.grants_direct_access_to("5f1a2b3c4d5e6f7a8b9c0d1e"));
        assert!(claims.grants_direct_access_to("aaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(!claims.grants_direct_access_to("bbbbbbbbbbbbbbbbbbbbbbbb"));
    }

    #[test]
    fn test_token_size_limit() {
        assert!(check_token_size("a.b.c").is_ok());
        let oversized = "a".repeat(MAX_JWT_SIZE_BYTES + 1);
        assert_eq!(
            check_token_size(&oversized),
            Err(JwtValidationError::TokenTooLarge)
        );
    }

    #[test]
    fn test_user_roles_default_to_empty() {
        let json = r#"{"_id": "u1", "name": "Bob", "username": "bob"}"#;
        let parsed: Result<TokenUser, _> = serde_json::from_str(json);
        assert!(matches!(parsed, Ok(u) if u.roles.is_empty()));
    }
}
