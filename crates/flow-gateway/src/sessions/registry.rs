//! Connection registry and health sweep.
//!
//! The sweep is the only place that decides a session is dead. Per session,
//! newest first:
//!
//! 1. A token expiring within the refresh threshold is refreshed through the
//!    sign-in collaborator and pushed to the client. A refusal or a token
//!    that cannot be evaluated closes the session.
//! 2. A session silent for at least the heartbeat timeout is closed.
//! 3. An open socket is pinged.
//! 4. A closed and drained socket has its broker consumers released, then
//!    the session is removed. If release fails the session stays and the
//!    next sweep retries.
//!
//! Heartbeat timestamps of the remaining authenticated sessions are written
//! to the store in one batch after the pass. A failure on one session is
//! logged and the pass continues.

use crate::amqp::QueueHandle;
use crate::auth::TokenService;
use crate::config::SweepConfig;
use crate::errors::GatewayError;
use crate::observability::metrics;
use crate::services::{HeartbeatUpdate, SigninService, Store};
use crate::sessions::messages::{Message, RefreshTokenPayload};
use crate::sessions::session::ClientSession;
use crate::sessions::socket::SocketTransport;
use async_trait::async_trait;
use chrono::Utc;
use common::secret::SecretString;
use common::types::SessionId;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Releases the broker consumers a removed session owned.
#[async_trait]
pub trait ConsumerReleaser: Send + Sync {
    async fn release(&self, handles: &[QueueHandle]) -> Result<(), GatewayError>;
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub refreshed: usize,
    pub closed: usize,
    pub pinged: usize,
    pub removed: usize,
    pub failed: usize,
    pub heartbeat_updates: usize,
}

enum RefreshOutcome {
    NotDue,
    Refreshed,
    Refused,
}

/// Live client sessions.
pub struct ConnectionRegistry {
    sessions: RwLock<Vec<Arc<ClientSession>>>,
    tokens: Arc<dyn TokenService>,
    signin: Arc<dyn SigninService>,
    store: Arc<dyn Store>,
    socket: Arc<dyn SocketTransport>,
    releaser: Arc<dyn ConsumerReleaser>,
    config: SweepConfig,
    sweep_lock: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new(
        config: SweepConfig,
        tokens: Arc<dyn TokenService>,
        signin: Arc<dyn SigninService>,
        store: Arc<dyn Store>,
        socket: Arc<dyn SocketTransport>,
        releaser: Arc<dyn ConsumerReleaser>,
    ) -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
            tokens,
            signin,
            store,
            socket,
            releaser,
            config,
            sweep_lock: Mutex::new(()),
        }
    }

    /// Register a newly accepted connection.
    pub async fn add(&self, session: Arc<ClientSession>) {
        let mut sessions = self.sessions.write().await;
        sessions.push(session);
        metrics::set_sessions_active(sessions.len());
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    /// Drop a session without releasing anything.
    pub async fn remove(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        let mut sessions = self.sessions.write().await;
        let index = sessions.iter().position(|s| s.id() == id)?;
        let removed = sessions.remove(index);
        metrics::set_sessions_active(sessions.len());
        Some(removed)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.iter().map(|s| s.id()).collect()
    }

    /// Inbound ping from `id`. False if the session is unknown.
    pub async fn record_heartbeat(&self, id: SessionId) -> bool {
        match self.get(id).await {
            Some(session) => {
                session.record_heartbeat().await;
                true
            }
            None => false,
        }
    }

    /// One pass over every session. Sweeps never overlap.
    #[instrument(skip_all)]
    pub async fn sweep(&self) -> SweepReport {
        let _serial = self.sweep_lock.lock().await;
        let started = Instant::now();
        let snapshot: Vec<Arc<ClientSession>> = self.sessions.read().await.clone();
        let mut report = SweepReport {
            sessions: snapshot.len(),
            ..SweepReport::default()
        };

        for session in snapshot.iter().rev() {
            if let Err(e) = self.sweep_session(session, &mut report).await {
                report.failed += 1;
                warn!(
                    target: "gw.sessions.sweep",
                    session_id = %session.id(),
                    error = %e,
                    "Session sweep step failed"
                );
            }
        }

        report.heartbeat_updates = self.write_heartbeats().await;

        metrics::record_sweep_duration(started.elapsed());
        debug!(
            target: "gw.sessions.sweep",
            sessions = report.sessions,
            refreshed = report.refreshed,
            closed = report.closed,
            removed = report.removed,
            "Sweep complete"
        );
        report
    }

    async fn sweep_session(
        &self,
        session: &Arc<ClientSession>,
        report: &mut SweepReport,
    ) -> Result<(), GatewayError> {
        let id = session.id();
        let mut close_reason: Option<&'static str> = None;

        if let Some(token) = session.token().await {
            match self.refresh_if_expiring(session, &token).await {
                Ok(RefreshOutcome::NotDue) => {}
                Ok(RefreshOutcome::Refreshed) => {
                    metrics::record_token_refresh("success");
                    report.refreshed += 1;
                }
                Ok(RefreshOutcome::Refused) => {
                    metrics::record_token_refresh("refused");
                    info!(target: "gw.sessions.sweep", session_id = %id, "Token refresh refused, closing session");
                    close_reason = Some("refresh_refused");
                }
                Err(e) => {
                    metrics::record_token_refresh("error");
                    warn!(target: "gw.sessions.sweep", session_id = %id, error = %e, "Token refresh failed, closing session");
                    close_reason = Some("token_error");
                }
            }
        }

        let elapsed = session.heartbeat_elapsed().await;
        let timeout_seconds = u64::try_from(self.config.heartbeat_timeout_seconds).unwrap_or(0);
        if elapsed.as_secs() >= timeout_seconds {
            let authenticated = session.is_authenticated().await;
            info!(
                target: "gw.sessions.sweep",
                session_id = %id,
                authenticated = authenticated,
                silent_seconds = elapsed.as_secs(),
                "Heartbeat timeout, closing session"
            );
            close_reason.get_or_insert("heartbeat_timeout");
        }

        if let Some(reason) = close_reason {
            metrics::record_session_closed(reason);
            report.closed += 1;
            if let Err(e) = self.socket.close(id).await {
                warn!(target: "gw.sessions.sweep", session_id = %id, error = %e, "Socket close failed");
            }
        }

        if self.socket.is_open(id).await {
            self.socket.send(id, &Message::ping()).await?;
            report.pinged += 1;
            return Ok(());
        }

        if self.socket.pending_outbound_count(id).await > 0 {
            return Ok(());
        }

        let handles = session.consumers().await;
        self.releaser.release(&handles).await?;
        if self.remove(id).await.is_some() {
            metrics::record_session_removed();
            report.removed += 1;
            info!(
                target: "gw.sessions.sweep",
                session_id = %id,
                released = handles.len(),
                "Session removed"
            );
        }
        Ok(())
    }

    async fn refresh_if_expiring(
        &self,
        session: &ClientSession,
        token: &str,
    ) -> Result<RefreshOutcome, GatewayError> {
        let claims = self.tokens.decode(token)?;
        if !claims.expires_within(Utc::now(), self.config.refresh_threshold_seconds) {
            return Ok(RefreshOutcome::NotDue);
        }

        let snapshot = session.snapshot().await;
        let Some(user) = self.signin.refresh(&snapshot).await? else {
            return Ok(RefreshOutcome::Refused);
        };

        let jwt = self.tokens.issue(&user, self.config.short_token_ttl_seconds)?;
        let message = Message::refresh_token(&RefreshTokenPayload {
            jwt: jwt.clone(),
            user: user.clone(),
        })?;
        session.authenticate(SecretString::from(jwt), user).await;
        self.socket.send(session.id(), &message).await?;
        Ok(RefreshOutcome::Refreshed)
    }

    /// One bulk write for every authenticated session still registered.
    async fn write_heartbeats(&self) -> usize {
        let sessions: Vec<Arc<ClientSession>> = self.sessions.read().await.clone();
        let mut updates = Vec::new();
        for session in &sessions {
            if let Some(user) = session.user().await {
                updates.push(HeartbeatUpdate {
                    user_id: user.id,
                    last_seen: session.last_seen().await,
                    client_agent: session.client_agent().map(str::to_string),
                    client_version: session.client_version().map(str::to_string),
                });
            }
        }
        if updates.is_empty() {
            return 0;
        }

        let count = updates.len();
        match self.store.bulk_update_heartbeats(updates).await {
            Ok(()) => {
                metrics::record_heartbeat_updates(count);
                count
            }
            Err(e) => {
                warn!(target: "gw.sessions.sweep", rows = count, error = %e, "Heartbeat bulk update failed");
                0
            }
        }
    }

    /// Run the sweep every interval until `cancel` fires.
    ///
    /// Each pass runs on its own task; a panicking pass is logged and the
    /// loop re-arms.
    pub fn spawn_sweep_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.config.interval;
        tokio::spawn(async move {
            info!(
                target: "gw.sessions.sweep",
                interval_ms = interval.as_millis() as u64,
                "Sweep task started"
            );
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let pass = Arc::clone(&registry);
                match tokio::spawn(async move { pass.sweep().await }).await {
                    Ok(_) => {}
                    Err(join_error) if join_error.is_panic() => {
                        error!(target: "gw.sessions.sweep", "Sweep pass panicked, re-arming");
                    }
                    Err(join_error) => {
                        warn!(target: "gw.sessions.sweep", error = %join_error, "Sweep pass aborted");
                    }
                }
            }
            info!(target: "gw.sessions.sweep", "Sweep task stopped");
        })
    }
}
