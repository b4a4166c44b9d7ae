//! Tenant-scoped queue and exchange naming.
//!
//! Resolution rules for a requested queue name:
//!
//! - Empty, or starting with `amq.`: broker-assigned anonymous queue.
//! - Exactly 24 characters: treated as a resource id (user, role, robot or
//!   workflow). The caller must be that subject, hold that role, or be able
//!   to see a record with that id in the store.
//! - Anything else: used verbatim.
//!
//! When queue prefixing is enabled, an accepted name becomes
//! `sanitize(username) + name`. A prefixed result that is itself 24
//! characters gets [`COLLISION_SUFFIX`] appended so it cannot be mistaken
//! for a resource id.
//!
//! The 24-character rule is a heuristic for database ids; an application
//! queue that happens to be 24 characters long is access-checked too.

use crate::auth::TokenService;
use crate::errors::GatewayError;
use crate::observability::metrics;
use crate::services::Store;
use common::jwt::UserClaims;
use serde_json::json;
use std::sync::Arc;

/// Length of a resource-id shaped queue name.
pub const RESOURCE_ID_LEN: usize = 24;

/// Broker-reserved queue name prefix.
pub const RESERVED_QUEUE_PREFIX: &str = "amq.";

/// Appended to a prefixed name that would otherwise be 24 characters.
pub const COLLISION_SUFFIX: char = '1';

/// Collections searched, in order, when deciding access to a resource id.
pub const ACCESS_CHECK_COLLECTIONS: [&str; 3] = ["users", "openrpa", "workflow"];

/// How a requested queue name is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueNameKind {
    Anonymous,
    ResourceId,
    Plain,
}

pub fn classify(name: &str) -> QueueNameKind {
    if name.is_empty() || name.starts_with(RESERVED_QUEUE_PREFIX) {
        QueueNameKind::Anonymous
    } else if name.chars().count() == RESOURCE_ID_LEN {
        QueueNameKind::ResourceId
    } else {
        QueueNameKind::Plain
    }
}

/// Lower-case `username` with `@` and `.` removed.
pub fn sanitize_username(username: &str) -> String {
    username
        .chars()
        .filter(|c| *c != '@' && *c != '.')
        .flat_map(char::to_lowercase)
        .collect()
}

/// `name` in the tenant namespace of `username`.
pub fn tenant_prefixed(username: &str, name: &str) -> String {
    let mut prefixed = sanitize_username(username);
    prefixed.push_str(name);
    if prefixed.chars().count() == RESOURCE_ID_LEN {
        prefixed.push(COLLISION_SUFFIX);
    }
    prefixed
}

/// Feature switches for name resolution.
#[derive(Debug, Clone, Copy)]
pub struct NamingPolicy {
    pub force_queue_prefix: bool,
    pub force_exchange_prefix: bool,
    pub access_check: bool,
}

/// Resolves requested names into access-checked broker names.
pub struct QueueNameResolver {
    tokens: Arc<dyn TokenService>,
    store: Arc<dyn Store>,
    policy: NamingPolicy,
}

impl QueueNameResolver {
    pub fn new(tokens: Arc<dyn TokenService>, store: Arc<dyn Store>, policy: NamingPolicy) -> Self {
        Self {
            tokens,
            store,
            policy,
        }
    }

    /// Resolve a requested queue name for the holder of `token`.
    ///
    /// Returns an empty string for broker-assigned queues. Without a token
    /// the requested name is used verbatim, except that an id-shaped name
    /// under the access check is refused.
    pub async fn resolve_queue(
        &self,
        requested: &str,
        token: Option<&str>,
    ) -> Result<String, GatewayError> {
        let kind = classify(requested);
        if kind == QueueNameKind::Anonymous {
            return Ok(String::new());
        }

        let needs_access_check = kind == QueueNameKind::ResourceId && self.policy.access_check;
        let token = match token.filter(|t| !t.is_empty()) {
            Some(token) if needs_access_check || self.policy.force_queue_prefix => token,
            None if needs_access_check => {
                metrics::record_access_denied();
                tracing::warn!(
                    target: "gw.amqp.naming",
                    queue = %requested,
                    "Access denied creating consumer without a token"
                );
                return Err(GatewayError::AccessDenied(format!(
                    "access denied creating consumer for {requested}"
                )));
            }
            _ => return Ok(requested.to_string()),
        };

        let claims = self.tokens.verify(token)?;

        if needs_access_check {
            self.check_access(requested, &claims, token).await?;
        }

        if self.policy.force_queue_prefix {
            Ok(tenant_prefixed(&claims.user.username, requested))
        } else {
            Ok(requested.to_string())
        }
    }

    /// Resolve an exchange name. Exchanges are prefixed whenever exchange
    /// prefixing is on and a token is present; there is no id heuristic.
    pub fn resolve_exchange(
        &self,
        requested: &str,
        token: Option<&str>,
    ) -> Result<String, GatewayError> {
        if requested.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "exchange name cannot be empty".to_string(),
            ));
        }
        match token.filter(|t| !t.is_empty()) {
            Some(token) if self.policy.force_exchange_prefix => {
                let claims = self.tokens.verify(token)?;
                Ok(tenant_prefixed(&claims.user.username, requested))
            }
            _ => Ok(requested.to_string()),
        }
    }

    async fn check_access(
        &self,
        resource_id: &str,
        claims: &UserClaims,
        token: &str,
    ) -> Result<(), GatewayError> {
        if claims.grants_direct_access_to(resource_id) {
            return Ok(());
        }

        for collection in ACCESS_CHECK_COLLECTIONS {
            let records = self
                .store
                .find(
                    json!({ "_id": resource_id }),
                    json!({ "name": 1 }),
                    collection,
                    token,
                )
                .await?;
            if !records.is_empty() {
                tracing::debug!(
                    target: "gw.amqp.naming",
                    collection = collection,
                    "Queue access granted by store lookup"
                );
                return Ok(());
            }
        }

        metrics::record_access_denied();
        tracing::warn!(
            target: "gw.amqp.naming",
            queue = %resource_id,
            "Access denied creating consumer"
        );
        Err(GatewayError::AccessDenied(format!(
            "access denied creating consumer for {resource_id}"
        )))
    }
}
