//! Client protocol envelope.
//!
//! Only the commands the gateway core itself produces or consumes are
//! modelled. The business dispatcher owns the rest of the protocol and
//! treats `data` as opaque.

use crate::errors::GatewayError;
use common::jwt::TokenUser;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Commands handled by the gateway core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Ping,
    Pong,
    #[serde(rename = "refreshtoken")]
    RefreshToken,
    Timeout,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::RefreshToken => "refreshtoken",
            Command::Timeout => "timeout",
            Command::Error => "error",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol message to or from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replyto: Option<String>,
    pub command: Command,
    /// Serialized command payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
}

impl Message {
    fn new(command: Command, data: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            replyto: None,
            command,
            data,
            jwt: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(Command::Ping, None)
    }

    /// Push a freshly issued token and the user's profile to the client.
    pub fn refresh_token(payload: &RefreshTokenPayload) -> Result<Self, GatewayError> {
        let data = serde_json::to_string(payload)
            .map_err(|e| GatewayError::Internal(format!("encoding refreshtoken payload: {e}")))?;
        Ok(Self::new(Command::RefreshToken, Some(data)))
    }

    /// Answer request `id` with `command`.
    pub fn reply_to(id: &str, command: Command, data: Option<String>) -> Self {
        Self {
            replyto: Some(id.to_string()),
            ..Self::new(command, data)
        }
    }

    /// Decode `data` as `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| GatewayError::InvalidArgument(format!("{} has no data", self.command)))?;
        serde_json::from_str(data)
            .map_err(|e| GatewayError::InvalidArgument(format!("malformed {} data: {e}", self.command)))
    }

    pub fn to_json(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self)
            .map_err(|e| GatewayError::Internal(format!("encoding message: {e}")))
    }

    pub fn from_json(raw: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(raw)
            .map_err(|e| GatewayError::InvalidArgument(format!("malformed message: {e}")))
    }
}

/// Payload of [`Command::RefreshToken`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenPayload {
    pub jwt: String,
    pub user: TokenUser,
}

impl fmt::Debug for RefreshTokenPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTokenPayload")
            .field("jwt", &"[REDACTED]")
            .field("user", &self.user)
            .finish()
    }
}
