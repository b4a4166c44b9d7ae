//! Composition root.
//!
//! Builds one [`MessageBroker`] and one [`ConnectionRegistry`] per process
//! and hands them out through a [`GatewayHandle`]. Nothing here is global:
//! embedders pass the handle to whatever needs the broker.

use crate::amqp::{BrokerEvent, BrokerTransport, LapinTransport, ManagementClient, MessageBroker};
use crate::auth::{JwtTokenService, TokenService};
use crate::config::Config;
use crate::errors::GatewayError;
use crate::services::{SigninService, Store};
use crate::sessions::{ConnectionRegistry, SocketTransport};
use common::secret::{ExposeSecret, SecretString};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// External systems the core talks to.
pub struct Collaborators {
    pub transport: Arc<dyn BrokerTransport>,
    pub store: Arc<dyn Store>,
    pub signin: Arc<dyn SigninService>,
    pub socket: Arc<dyn SocketTransport>,
}

impl Collaborators {
    /// Collaborators with the AMQP transport for `config.amqp_url`.
    pub fn with_amqp(
        config: &Config,
        store: Arc<dyn Store>,
        signin: Arc<dyn SigninService>,
        socket: Arc<dyn SocketTransport>,
    ) -> Self {
        let url = SecretString::from(config.amqp_url.expose_secret().to_string());
        Self {
            transport: Arc::new(LapinTransport::new(url)),
            store,
            signin,
            socket,
        }
    }
}

pub struct Gateway;

impl Gateway {
    /// Wire the core together, connect the broker and start the sweep.
    ///
    /// A failed first connect is not fatal; the broker keeps retrying in
    /// the background.
    pub async fn start(
        config: &Config,
        collaborators: Collaborators,
    ) -> Result<GatewayHandle, GatewayError> {
        let Collaborators {
            transport,
            store,
            signin,
            socket,
        } = collaborators;

        let management = Arc::new(ManagementClient::from_config(config)?);
        let tokens: Arc<dyn TokenService> = Arc::new(JwtTokenService::new(&config.signing_secret));
        let broker = MessageBroker::new(transport, Arc::clone(&tokens), Arc::clone(&store), config.broker());
        let registry = Arc::new(ConnectionRegistry::new(
            config.sweep(),
            Arc::clone(&tokens),
            signin,
            store,
            socket,
            broker.clone(),
        ));

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(log_broker_events(
            broker.subscribe(),
            cancel.child_token(),
        )));

        if let Err(e) = broker.connect().await {
            warn!(
                target: "gw.gateway",
                error = %e,
                "Initial broker connect failed, retrying in background"
            );
        }

        tasks.push(registry.spawn_sweep_task(cancel.child_token()));

        info!(target: "gw.gateway", gateway_id = %config.gateway_id, "Gateway started");
        Ok(GatewayHandle {
            gateway_id: config.gateway_id.clone(),
            broker,
            registry,
            tokens,
            management,
            cancel,
            tasks,
        })
    }
}

/// Running gateway core.
pub struct GatewayHandle {
    gateway_id: String,
    broker: Arc<MessageBroker>,
    registry: Arc<ConnectionRegistry>,
    tokens: Arc<dyn TokenService>,
    management: Arc<ManagementClient>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayHandle {
    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn broker(&self) -> &Arc<MessageBroker> {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn tokens(&self) -> &Arc<dyn TokenService> {
        &self.tokens
    }

    /// Management API client for the configured broker.
    pub fn management(&self) -> &Arc<ManagementClient> {
        &self.management
    }

    /// Stop the sweep, stop reconnecting and close the broker link.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(target: "gw.gateway", error = %e, "Background task ended abnormally");
            }
        }
        self.broker.shutdown().await;
        info!(target: "gw.gateway", gateway_id = %self.gateway_id, "Gateway stopped");
    }
}

async fn log_broker_events(
    mut events: broadcast::Receiver<BrokerEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(BrokerEvent::Connected) => {
                    info!(target: "gw.gateway", "Message broker connected");
                }
                Ok(BrokerEvent::Disconnected) => {
                    warn!(target: "gw.gateway", "Message broker disconnected");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "gw.gateway", skipped = skipped, "Broker events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
