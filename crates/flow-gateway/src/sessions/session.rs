//! Per-connection client state.

use crate::amqp::QueueHandle;
use chrono::{DateTime, Utc};
use common::jwt::TokenUser;
use common::secret::{ExposeSecret, SecretString};
use common::types::SessionId;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// What the sign-in collaborator sees of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub user: Option<TokenUser>,
    pub client_agent: Option<String>,
    pub client_version: Option<String>,
}

struct SessionState {
    token: Option<SecretString>,
    user: Option<TokenUser>,
    last_heartbeat: Instant,
    last_seen: DateTime<Utc>,
    consumers: Vec<QueueHandle>,
    watch_count: usize,
}

/// One connected client.
///
/// Owned by the connection registry. The socket itself lives behind the
/// `SocketTransport` and is addressed by [`ClientSession::id`].
pub struct ClientSession {
    id: SessionId,
    client_agent: Option<String>,
    client_version: Option<String>,
    connected_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl ClientSession {
    pub fn new(id: SessionId) -> Self {
        Self::with_client(id, None, None)
    }

    pub fn with_client(
        id: SessionId,
        client_agent: Option<String>,
        client_version: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            client_agent,
            client_version,
            connected_at: now,
            state: Mutex::new(SessionState {
                token: None,
                user: None,
                last_heartbeat: Instant::now(),
                last_seen: now,
                consumers: Vec::new(),
                watch_count: 0,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client_agent(&self) -> Option<&str> {
        self.client_agent.as_deref()
    }

    pub fn client_version(&self) -> Option<&str> {
        self.client_version.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Attach (or replace) the session's token and user.
    pub async fn authenticate(&self, token: SecretString, user: TokenUser) {
        let mut state = self.state.lock().await;
        state.token = Some(token);
        state.user = Some(user);
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.user.is_some()
    }

    /// The raw token, for decoding.
    pub async fn token(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .token
            .as_ref()
            .map(|t| t.expose_secret().to_string())
    }

    pub async fn user(&self) -> Option<TokenUser> {
        self.state.lock().await.user.clone()
    }

    /// Inbound protocol ping.
    pub async fn record_heartbeat(&self) {
        let mut state = self.state.lock().await;
        state.last_heartbeat = Instant::now();
        state.last_seen = Utc::now();
    }

    pub async fn heartbeat_elapsed(&self) -> Duration {
        self.state.lock().await.last_heartbeat.elapsed()
    }

    pub async fn last_seen(&self) -> DateTime<Utc> {
        self.state.lock().await.last_seen
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            user: self.user().await,
            client_agent: self.client_agent.clone(),
            client_version: self.client_version.clone(),
        }
    }

    /// Record a broker consumer owned by this session.
    pub async fn add_consumer(&self, handle: QueueHandle) {
        let mut state = self.state.lock().await;
        if !state.consumers.contains(&handle) {
            state.consumers.push(handle);
        }
    }

    /// Forget a consumer the client released itself.
    pub async fn remove_consumer(&self, handle: &QueueHandle) -> bool {
        let mut state = self.state.lock().await;
        let before = state.consumers.len();
        state.consumers.retain(|h| h != handle);
        state.consumers.len() != before
    }

    pub async fn consumers(&self) -> Vec<QueueHandle> {
        self.state.lock().await.consumers.clone()
    }

    pub async fn consumer_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }

    pub async fn add_watch(&self) -> usize {
        let mut state = self.state.lock().await;
        state.watch_count += 1;
        state.watch_count
    }

    pub async fn remove_watch(&self) -> usize {
        let mut state = self.state.lock().await;
        state.watch_count = state.watch_count.saturating_sub(1);
        state.watch_count
    }

    pub async fn watch_count(&self) -> usize {
        self.state.lock().await.watch_count
    }
}
