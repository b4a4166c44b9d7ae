//! Broker connection supervisor.
//!
//! Owns the single link (connection + confirm channel) to the broker and
//! keeps it alive:
//!
//! - `connect()` is idempotent and serialized. On failure it schedules a
//!   retry after a fixed delay.
//! - A connection close clears the link and schedules a reconnect.
//! - A channel close also closes the parent connection so recovery always
//!   starts from a clean connection.
//! - At most one reconnect timer exists; scheduling a new one aborts the old.
//!
//! Every link gets a generation number. Events from an older link are
//! ignored, so a late close from a replaced link cannot tear down the new
//! one.
//!
//! Components that need to react to the lifecycle subscribe to
//! [`BrokerEvent`]s or watch [`ConnectionState`]. Work that must happen on
//! every fresh channel (the reply queue) goes through [`ChannelSetup`].

use crate::amqp::transport::{
    BrokerChannel, BrokerTransport, ChannelEvent, MessageProperties, OutboundMessage,
    ReturnedMessage,
};
use crate::errors::{BrokerError, GatewayError};
use crate::observability::metrics;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle state of the broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Disconnected,
}

/// Hooks run by the supervisor on link transitions.
#[async_trait]
pub trait ChannelSetup: Send + Sync {
    /// Runs on every fresh channel before the link is reported connected.
    /// An error tears the link down and schedules a reconnect.
    async fn on_channel_open(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), GatewayError>;

    /// A mandatory message bounced.
    async fn on_returned(&self, message: ReturnedMessage);

    /// The link was lost. Broker-side consumers are gone.
    async fn on_link_lost(&self);
}

struct Link {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
}

/// Supervises the broker link.
pub struct BrokerConnection {
    transport: Arc<dyn BrokerTransport>,
    reconnect_delay: Duration,
    link: RwLock<Option<Link>>,
    connect_lock: Mutex<()>,
    generation: AtomicU64,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<BrokerEvent>,
    setup: OnceLock<Weak<dyn ChannelSetup>>,
    shutdown: CancellationToken,
}

impl BrokerConnection {
    pub fn new(transport: Arc<dyn BrokerTransport>, reconnect_delay: Duration) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport,
            reconnect_delay,
            link: RwLock::new(None),
            connect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            reconnect_timer: Mutex::new(None),
            state_tx,
            events_tx,
            setup: OnceLock::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Install the channel setup hooks. Only the first call takes effect.
    pub fn set_channel_setup(&self, setup: Weak<dyn ChannelSetup>) {
        if self.setup.set(setup).is_err() {
            warn!(target: "gw.amqp.connection", "Channel setup already installed, ignoring");
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events_tx.subscribe()
    }

    /// Current channel, if connected.
    pub async fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.link
            .read()
            .await
            .as_ref()
            .map(|link| Arc::clone(&link.channel))
    }

    /// Current channel, or `NotConnected`.
    pub async fn require_channel(&self) -> Result<Arc<dyn BrokerChannel>, GatewayError> {
        self.channel().await.ok_or(GatewayError::NotConnected)
    }

    /// True while a reconnect timer is scheduled.
    pub async fn has_pending_reconnect(&self) -> bool {
        self.reconnect_timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Open the link if there is none.
    #[instrument(skip_all)]
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        let _guard = self.connect_lock.lock().await;

        if self.shutdown.is_cancelled() {
            return Err(GatewayError::NotConnected);
        }
        if self.link.read().await.is_some() {
            return Ok(());
        }

        self.cancel_reconnect_timer().await;
        self.state_tx.send_replace(ConnectionState::Connecting);

        let link = match self.transport.connect().await {
            Ok(link) => link,
            Err(e) => {
                log_broker_error(&e, "Broker connect failed");
                self.mark_disconnected();
                self.schedule_reconnect().await;
                return Err(e.into());
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.link.write().await = Some(Link {
            generation,
            channel: Arc::clone(&link.channel),
        });
        tokio::spawn(run_event_loop(Arc::downgrade(self), generation, link.events));

        if let Some(setup) = self.setup_hooks() {
            if let Err(e) = setup.on_channel_open(Arc::clone(&link.channel)).await {
                error!(
                    target: "gw.amqp.connection",
                    error = %e,
                    "Channel setup failed, dropping connection"
                );
                self.generation.fetch_add(1, Ordering::SeqCst);
                self.link.write().await.take();
                if let Err(close_err) = link.channel.close().await {
                    debug!(target: "gw.amqp.connection", error = %close_err, "Close after failed setup");
                }
                self.mark_disconnected();
                self.schedule_reconnect().await;
                return Err(e);
            }
        }

        self.state_tx.send_replace(ConnectionState::Connected);
        metrics::set_broker_connected(true);
        let _ = self.events_tx.send(BrokerEvent::Connected);
        info!(target: "gw.amqp.connection", generation = generation, "Connected to broker");
        Ok(())
    }

    /// Publish a message.
    ///
    /// Sends to the default exchange (`exchange == ""`) go straight to a
    /// queue and wait for the broker confirm. Exchange sends are not
    /// confirmed. Both are mandatory so unroutable messages come back.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), GatewayError> {
        let channel = self.require_channel().await?;
        let message = OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            properties,
            mandatory: true,
        };
        if exchange.is_empty() {
            channel.publish_confirmed(message).await?;
        } else {
            channel.publish(message).await?;
        }
        Ok(())
    }

    /// Stop reconnecting and close the current link.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancel_reconnect_timer().await;
        let link = {
            let _guard = self.connect_lock.lock().await;
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.link.write().await.take()
        };
        if let Some(link) = link {
            if let Err(e) = link.channel.close().await {
                debug!(target: "gw.amqp.connection", error = %e, "Close on shutdown failed");
            }
            self.mark_disconnected();
        }
        info!(target: "gw.amqp.connection", "Broker connection shut down");
    }

    fn setup_hooks(&self) -> Option<Arc<dyn ChannelSetup>> {
        self.setup.get().and_then(Weak::upgrade)
    }

    fn mark_disconnected(&self) {
        self.state_tx.send_replace(ConnectionState::Disconnected);
        metrics::set_broker_connected(false);
        let _ = self.events_tx.send(BrokerEvent::Disconnected);
    }

    async fn cancel_reconnect_timer(&self) {
        if let Some(handle) = self.reconnect_timer.lock().await.take() {
            handle.abort();
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut timer = self.reconnect_timer.lock().await;
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        metrics::record_reconnect_scheduled();
        debug!(
            target: "gw.amqp.connection",
            delay_ms = self.reconnect_delay.as_millis() as u64,
            "Reconnect scheduled"
        );

        let weak = Arc::downgrade(self);
        let delay = self.reconnect_delay;
        let shutdown = self.shutdown.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(connection) = weak.upgrade() {
                        connection.reconnect_attempt().await;
                    }
                }
            }
        }));
    }

    /// Runs from the timer task. Boxed because it re-enters `connect`,
    /// which may schedule another timer.
    fn reconnect_attempt(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            // This timer has fired; detach it so connect() does not abort
            // the task running it.
            self.reconnect_timer.lock().await.take();
            info!(target: "gw.amqp.connection", "Reconnecting to broker");
            if let Err(e) = self.connect().await {
                debug!(target: "gw.amqp.connection", error = %e, "Reconnect attempt failed");
            }
        }
        .boxed()
    }

    /// Tear down the link of `generation` after a close.
    async fn handle_link_lost(self: &Arc<Self>, generation: u64, close_connection: bool) {
        let link = {
            let _guard = self.connect_lock.lock().await;
            let mut slot = self.link.write().await;
            match slot.as_ref() {
                Some(current) if current.generation == generation => {
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    slot.take()
                }
                _ => return,
            }
        };

        if close_connection {
            if let Some(link) = &link {
                if let Err(e) = link.channel.close().await {
                    debug!(target: "gw.amqp.connection", error = %e, "Closing parent connection failed");
                }
            }
        }

        if let Some(setup) = self.setup_hooks() {
            setup.on_link_lost().await;
        }
        self.mark_disconnected();
        self.schedule_reconnect().await;
    }
}

fn log_broker_error(err: &BrokerError, message: &'static str) {
    if err.is_not_found() {
        debug!(target: "gw.amqp.connection", error = %err, "{}", message);
    } else {
        error!(target: "gw.amqp.connection", error = %err, "{}", message);
    }
}

async fn run_event_loop(
    connection: Weak<BrokerConnection>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(conn) = connection.upgrade() else {
            return;
        };
        if conn.generation.load(Ordering::SeqCst) != generation {
            debug!(target: "gw.amqp.connection", generation = generation, "Ignoring event from stale link");
            return;
        }

        match event {
            ChannelEvent::Returned(message) => {
                metrics::record_returned_message();
                if let Some(setup) = conn.setup_hooks() {
                    setup.on_returned(message).await;
                }
            }
            ChannelEvent::Error(e) => log_broker_error(&e, "Broker channel error"),
            ChannelEvent::ChannelClosed { code, reason } => {
                log_close("Channel closed", code, &reason);
                conn.handle_link_lost(generation, true).await;
                return;
            }
            ChannelEvent::ConnectionClosed { code, reason } => {
                log_close("Connection closed", code, &reason);
                conn.handle_link_lost(generation, false).await;
                return;
            }
        }
    }

    // Transport dropped its event sender: the connection is gone.
    if let Some(conn) = connection.upgrade() {
        conn.handle_link_lost(generation, false).await;
    }
}

fn log_close(message: &'static str, code: Option<u16>, reason: &str) {
    if code == Some(crate::errors::AMQP_NOT_FOUND) {
        debug!(target: "gw.amqp.connection", code = ?code, reason = %reason, "{}", message);
    } else {
        warn!(target: "gw.amqp.connection", code = ?code, reason = %reason, "{}, reconnecting", message);
    }
}
