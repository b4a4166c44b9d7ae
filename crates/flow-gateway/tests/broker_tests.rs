//! Integration tests for request/reply, consumers and queue access checks.
//!
//! Runs the full `MessageBroker` stack against the in-process broker.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use common::jwt::TokenUser;
use common::secret::SecretString;
use common::types::CorrelationId;
use flow_gateway::amqp::{
    AckHandle, ExchangeKind, MessageBroker, QueueListener, QueueMessage, SendOptions,
};
use flow_gateway::auth::{JwtTokenService, TokenService};
use flow_gateway::config::BrokerConfig;
use flow_gateway::errors::GatewayError;
use flow_gateway::services::store::mock::MockStore;
use flow_gateway_test_utils::{InMemoryBroker, Settlement};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SECRET: &str = "broker-tests-signing-secret-0123456789";
const USER_ID: &str = "5f1a2b3c4d5e6f7a8b9c0d1e";

// ============================================================================
// Helpers
// ============================================================================

fn tokens() -> Arc<JwtTokenService> {
    Arc::new(JwtTokenService::new(&SecretString::from(SECRET.to_string())))
}

fn user() -> TokenUser {
    TokenUser {
        id: USER_ID.to_string(),
        name: "Alice".to_string(),
        username: "alice@example.com".to_string(),
        roles: Vec::new(),
    }
}

async fn connected_broker(memory: &InMemoryBroker, store: Arc<MockStore>) -> Arc<MessageBroker> {
    let broker = MessageBroker::new(
        Arc::new(memory.clone()),
        tokens(),
        store,
        BrokerConfig::default(),
    );
    broker.connect().await.expect("connect should succeed");
    broker
}

async fn wait_for<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Forwards every message to a channel and returns `Ok`.
struct Collector {
    tx: mpsc::UnboundedSender<QueueMessage>,
}

#[async_trait]
impl QueueListener for Collector {
    async fn on_message(&self, message: QueueMessage) -> Result<(), GatewayError> {
        let _ = self.tx.send(message);
        Ok(())
    }
}

fn collector() -> (Arc<dyn QueueListener>, mpsc::UnboundedReceiver<QueueMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Collector { tx }), rx)
}

/// Acks each request and answers it with a fixed body.
struct Responder {
    broker: Arc<MessageBroker>,
    body: &'static str,
}

#[async_trait]
impl QueueListener for Responder {
    async fn on_message(&self, message: QueueMessage) -> Result<(), GatewayError> {
        message.ack(true).await?;
        let Some(reply_to) = message.options.reply_to.clone() else {
            return Ok(());
        };
        let options = SendOptions {
            expiration_ms: 5000,
            correlation_id: message
                .options
                .correlation_id
                .as_deref()
                .map(CorrelationId::from),
            routing_key: String::new(),
        };
        self.broker.send("", &reply_to, self.body, options).await
    }
}

struct Failing;

#[async_trait]
impl QueueListener for Failing {
    async fn on_message(&self, _message: QueueMessage) -> Result<(), GatewayError> {
        Err(GatewayError::Internal("listener blew up".to_string()))
    }
}

// ============================================================================
// Request/reply
// ============================================================================

#[tokio::test]
async fn test_request_reply_round_trip() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;

    // Client A's own anonymous queue gets a broker-assigned name.
    let (listener, _rx) = collector();
    let anonymous = broker
        .add_queue_consumer("", None, None, None, listener)
        .await
        .expect("anonymous queue should register");
    assert!(anonymous.queue.starts_with("amq.gen-"));

    broker
        .add_queue_consumer(
            "Q2",
            None,
            None,
            None,
            Arc::new(Responder {
                broker: Arc::clone(&broker),
                body: r#"{"cmd":"pong"}"#,
            }),
        )
        .await
        .expect("Q2 consumer should register");

    let reply = broker
        .send_with_reply("", "Q2", r#"{"cmd":"ping"}"#, SendOptions::with_expiration(5000))
        .await
        .expect("request should publish");
    let correlation_id = reply.correlation_id().clone();
    assert!(broker.pending_calls().contains(correlation_id.as_str()).await);

    let request = memory
        .published()
        .await
        .into_iter()
        .find(|m| m.routing_key == "Q2")
        .expect("request should be published to Q2");
    assert_eq!(request.properties.reply_to, broker.reply_queue().await);
    assert_eq!(
        request.properties.correlation_id.as_deref(),
        Some(correlation_id.as_str())
    );
    assert_eq!(request.properties.expiration.as_deref(), Some("5000"));
    assert!(request.mandatory);

    let body = tokio::time::timeout(Duration::from_secs(2), reply)
        .await
        .expect("reply should arrive")
        .expect("reply should resolve");
    assert_eq!(body, r#"{"cmd":"pong"}"#);
    assert!(broker.pending_calls().is_empty().await);
}

#[tokio::test]
async fn test_concurrent_replies_match_by_correlation_id() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;
    let reply_queue = broker.reply_queue().await.unwrap();

    let (listener, _rx) = collector();
    broker
        .add_queue_consumer("work", None, None, None, listener)
        .await
        .unwrap();

    let a = broker
        .send_with_reply(
            "",
            "work",
            "a",
            SendOptions {
                correlation_id: Some(CorrelationId::from("call-a")),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();
    let b = broker
        .send_with_reply(
            "",
            "work",
            "b",
            SendOptions {
                correlation_id: Some(CorrelationId::from("call-b")),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    // Answer out of order.
    for (id, body) in [("call-b", "reply-b"), ("call-a", "reply-a")] {
        broker
            .send(
                "",
                &reply_queue,
                body,
                SendOptions {
                    correlation_id: Some(CorrelationId::from(id)),
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
    }

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), a).await.unwrap().unwrap(),
        "reply-a"
    );
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), b).await.unwrap().unwrap(),
        "reply-b"
    );
}

#[tokio::test]
async fn test_duplicate_correlation_id_rejected() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;
    let (listener, _rx) = collector();
    broker
        .add_queue_consumer("work", None, None, None, listener)
        .await
        .unwrap();

    let options = SendOptions {
        correlation_id: Some(CorrelationId::from("same")),
        ..SendOptions::default()
    };
    let _first = broker
        .send_with_reply("", "work", "1", options.clone())
        .await
        .unwrap();
    let second = broker.send_with_reply("", "work", "2", options).await;

    assert!(matches!(second, Err(GatewayError::Conflict(_))));
    assert_eq!(broker.pending_calls().len().await, 1);
}

#[tokio::test]
async fn test_unroutable_request_answered_with_timeout() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;

    let reply = broker
        .send_with_reply(
            "",
            "nobody-listens",
            r#"{"command":"invoke","data":"x"}"#,
            SendOptions::default(),
        )
        .await
        .expect("publish is confirmed even when unroutable");

    let body = tokio::time::timeout(Duration::from_secs(2), reply)
        .await
        .expect("timeout reply should arrive")
        .expect("timeout reply should resolve");
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["command"], "timeout");
    assert_eq!(value["data"], "x");

    let reply_queue = broker.reply_queue().await.unwrap();
    let synthetic = memory
        .published()
        .await
        .into_iter()
        .find(|m| m.routing_key == reply_queue)
        .expect("timeout reply should be published to the reply queue");
    assert_eq!(synthetic.properties.expiration.as_deref(), Some("20000"));
}

#[tokio::test]
async fn test_send_without_connection_fails() {
    let memory = InMemoryBroker::new();
    let broker = MessageBroker::new(
        Arc::new(memory.clone()),
        tokens(),
        Arc::new(MockStore::empty()),
        BrokerConfig::default(),
    );

    let sent = broker.send("", "work", "x", SendOptions::default()).await;
    assert_eq!(sent, Err(GatewayError::NotConnected));

    let requested = broker
        .send_with_reply("", "work", "x", SendOptions::default())
        .await;
    assert!(matches!(requested, Err(GatewayError::NotConnected)));
    assert!(broker.pending_calls().is_empty().await);
}

#[tokio::test]
async fn test_expiration_below_one_uses_default() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;
    let (listener, _rx) = collector();
    broker
        .add_queue_consumer("work", None, None, None, listener)
        .await
        .unwrap();

    broker
        .send("", "work", "x", SendOptions::with_expiration(0))
        .await
        .unwrap();

    let published = memory.published().await;
    let message = published.last().unwrap();
    assert_eq!(message.properties.expiration.as_deref(), Some("10000"));
    assert!(message.properties.correlation_id.is_some());
}

// ============================================================================
// Consumers
// ============================================================================

#[tokio::test]
async fn test_second_consumer_on_same_queue_conflicts() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;

    let (first, _rx1) = collector();
    let handle = broker
        .add_queue_consumer("jobs", None, None, None, first)
        .await
        .unwrap();
    let (second, _rx2) = collector();
    let result = broker
        .add_queue_consumer("jobs", None, None, None, second)
        .await;
    assert!(matches!(result, Err(GatewayError::Conflict(_))));
    assert_eq!(memory.consumer_count("jobs").await, 1);

    // Once released the name is free again, with a fresh consumer tag.
    broker.remove_queue_consumer(Some(&handle)).await.unwrap();
    let (third, _rx3) = collector();
    let again = broker
        .add_queue_consumer("jobs", None, None, None, third)
        .await
        .unwrap();
    assert_ne!(again.consumer_tag, handle.consumer_tag);
}

#[tokio::test]
async fn test_remove_consumer_is_idempotent() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;
    let (listener, _rx) = collector();
    let handle = broker
        .add_queue_consumer("jobs", None, None, None, listener)
        .await
        .unwrap();

    broker.remove_queue_consumer(Some(&handle)).await.unwrap();
    broker.remove_queue_consumer(Some(&handle)).await.unwrap();
    broker.remove_queue_consumer(None).await.unwrap();
    assert_eq!(memory.consumer_count("jobs").await, 0);
}

#[tokio::test]
async fn test_queues_carry_dead_letter_exchange() {
    let memory = InMemoryBroker::new();
    let broker = MessageBroker::new(
        Arc::new(memory.clone()),
        tokens(),
        Arc::new(MockStore::empty()),
        BrokerConfig {
            dlx: Some("openflow-dlx".to_string()),
            ..BrokerConfig::default()
        },
    );
    broker.connect().await.unwrap();

    let (listener, _rx) = collector();
    broker
        .add_queue_consumer("jobs", None, None, None, listener)
        .await
        .unwrap();
    assert_eq!(
        memory.queue_dead_letter_exchange("jobs").await.as_deref(),
        Some("openflow-dlx")
    );

    // The dead-letter exchange is not auto-deleted and its queue does not
    // dead-letter to itself.
    let (listener, _rx) = collector();
    let dlx = broker
        .add_exchange_consumer("openflow-dlx", ExchangeKind::Fanout, "", None, None, None, listener)
        .await
        .unwrap();
    assert_eq!(memory.queue_dead_letter_exchange(&dlx.queue.queue).await, None);
    broker.remove_queue_consumer(Some(&dlx.queue)).await.unwrap();
    assert!(memory.exchange_exists("openflow-dlx").await);
}

#[tokio::test]
async fn test_exchange_consumer_receives_and_releases_binding() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;

    let (listener, mut rx) = collector();
    let handle = broker
        .add_exchange_consumer("events", ExchangeKind::Topic, "wf.*", None, None, None, listener)
        .await
        .expect("exchange consumer should register");
    assert!(memory
        .binding_exists(&handle.queue.queue, "events", "wf.*")
        .await);

    broker
        .send(
            "events",
            "",
            "started",
            SendOptions {
                routing_key: "wf.started".to_string(),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.payload, "started");
    assert_eq!(message.options.exchange, "events");
    assert_eq!(message.options.routing_key, "wf.started");

    broker.remove_queue_consumer(Some(&handle.queue)).await.unwrap();
    assert_eq!(broker.registry().exchange_count().await, 0);
    assert!(!memory
        .binding_exists(&handle.queue.queue, "events", "wf.*")
        .await);
    // Auto-delete exchange goes with its last binding.
    assert!(!memory.exchange_exists("events").await);
}

#[tokio::test]
async fn test_empty_exchange_name_rejected() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;
    let (listener, _rx) = collector();
    let result = broker
        .add_exchange_consumer("", ExchangeKind::Fanout, "", None, None, None, listener)
        .await;
    assert!(matches!(result, Err(GatewayError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_nack_redelivers_then_ack_settles() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    struct NackFirst {
        tx: mpsc::UnboundedSender<bool>,
    }
    #[async_trait]
    impl QueueListener for NackFirst {
        async fn on_message(&self, message: QueueMessage) -> Result<(), GatewayError> {
            let _ = self.tx.send(message.redelivered);
            if !message.redelivered {
                message.ack(false).await?;
            }
            Ok(())
        }
    }
    broker
        .add_queue_consumer("jobs", None, None, None, Arc::new(NackFirst { tx }))
        .await
        .unwrap();
    broker
        .send("", "jobs", "x", SendOptions::default())
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!((first, second), (Some(false), Some(true)));

    let memory = &memory;
    assert!(wait_for(|| async move { memory.settlements().await.len() == 2 }).await);
    assert_eq!(
        memory.settlements().await,
        vec![Settlement::Nack { requeue: true }, Settlement::Ack]
    );
}

/// Hands each message's ack handle out and returns without settling.
struct Deferring {
    tx: mpsc::UnboundedSender<(String, AckHandle)>,
}

#[async_trait]
impl QueueListener for Deferring {
    async fn on_message(&self, message: QueueMessage) -> Result<(), GatewayError> {
        let _ = self.tx.send((message.payload.clone(), message.ack_handle()));
        Ok(())
    }
}

#[tokio::test]
async fn test_deferred_nack_is_not_overridden() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .add_queue_consumer("jobs", None, None, None, Arc::new(Deferring { tx }))
        .await
        .unwrap();
    broker
        .send("", "jobs", "x", SendOptions::default())
        .await
        .unwrap();

    let (_, handle) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    // Give the dispatcher time to observe the listener's return.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(memory.settlements().await.is_empty());
    assert!(!handle.is_settled());

    handle.ack(false).await.unwrap();

    // The requeued copy is delivered again; settle it for good.
    let (_, redelivered) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    redelivered.ack(true).await.unwrap();

    assert_eq!(
        memory.settlements().await,
        vec![Settlement::Nack { requeue: true }, Settlement::Ack]
    );
}

#[tokio::test]
async fn test_unsettled_message_does_not_block_next_delivery() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    broker
        .add_queue_consumer("jobs", None, None, None, Arc::new(Deferring { tx }))
        .await
        .unwrap();
    for body in ["first", "second"] {
        broker
            .send("", "jobs", body, SendOptions::default())
            .await
            .unwrap();
    }

    let (first, first_handle) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let (second, second_handle) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("first", "second"));
    assert!(memory.settlements().await.is_empty());

    second_handle.ack(true).await.unwrap();
    first_handle.ack(true).await.unwrap();
    assert_eq!(
        memory.settlements().await,
        vec![Settlement::Ack, Settlement::Ack]
    );
    assert_eq!(memory.unacked_count().await, 0);
}

#[tokio::test]
async fn test_failing_listener_message_is_rejected() {
    let memory = InMemoryBroker::new();
    let broker = connected_broker(&memory, Arc::new(MockStore::empty())).await;
    broker
        .add_queue_consumer("jobs", None, None, None, Arc::new(Failing))
        .await
        .unwrap();
    broker
        .send("", "jobs", "poison", SendOptions::default())
        .await
        .unwrap();

    let memory = &memory;
    assert!(wait_for(|| async move { !memory.settlements().await.is_empty() }).await);
    assert_eq!(
        memory.settlements().await,
        vec![Settlement::Nack { requeue: false }]
    );
    assert_eq!(memory.unacked_count().await, 0);
}

// ============================================================================
// Access checks
// ============================================================================

#[tokio::test]
async fn test_resource_id_queue_denied_without_any_grant() {
    let memory = InMemoryBroker::new();
    let store = Arc::new(MockStore::empty());
    let broker = connected_broker(&memory, Arc::clone(&store)).await;
    let token = tokens().issue(&user(), 3600).unwrap();
    let queues_before = memory.queue_names().await;

    let (listener, _rx) = collector();
    let result = broker
        .add_queue_consumer(
            "secret123456789012345678",
            None,
            Some(token.as_str()),
            None,
            listener,
        )
        .await;

    assert!(matches!(result, Err(GatewayError::AccessDenied(_))));
    assert!(!memory.queue_exists("secret123456789012345678").await);
    assert_eq!(memory.queue_names().await, queues_before);
    assert_eq!(broker.registry().queue_count().await, 0);

    let collections: Vec<String> = store
        .find_calls()
        .await
        .into_iter()
        .map(|c| c.collection)
        .collect();
    assert_eq!(collections, vec!["users", "openrpa", "workflow"]);
}

#[tokio::test]
async fn test_resource_id_queue_denied_without_token() {
    let memory = InMemoryBroker::new();
    let store = Arc::new(MockStore::empty());
    let broker = connected_broker(&memory, Arc::clone(&store)).await;

    let (listener, _rx) = collector();
    let result = broker
        .add_queue_consumer("secret123456789012345678", None, None, None, listener)
        .await;

    assert!(matches!(result, Err(GatewayError::AccessDenied(_))));
    assert!(!memory.queue_exists("secret123456789012345678").await);
    assert_eq!(broker.registry().queue_count().await, 0);
    assert!(store.find_calls().await.is_empty());
}

#[tokio::test]
async fn test_own_id_queue_granted_without_store_lookup() {
    let memory = InMemoryBroker::new();
    let store = Arc::new(MockStore::empty());
    let broker = connected_broker(&memory, Arc::clone(&store)).await;
    let token = tokens().issue(&user(), 3600).unwrap();

    let (listener, _rx) = collector();
    broker
        .add_queue_consumer(USER_ID, None, Some(token.as_str()), None, listener)
        .await
        .expect("own queue should be granted");

    assert!(memory.queue_exists(USER_ID).await);
    assert!(store.find_calls().await.is_empty());
}

#[tokio::test]
async fn test_store_grant_allows_resource_queue() {
    let memory = InMemoryBroker::new();
    let store = Arc::new(MockStore::empty());
    store
        .insert(
            "openrpa",
            serde_json::json!({ "_id": "cccccccccccccccccccccccc", "name": "robot" }),
        )
        .await;
    let broker = connected_broker(&memory, Arc::clone(&store)).await;
    let token = tokens().issue(&user(), 3600).unwrap();

    let (listener, _rx) = collector();
    broker
        .add_queue_consumer(
            "cccccccccccccccccccccccc",
            None,
            Some(token.as_str()),
            None,
            listener,
        )
        .await
        .expect("store-visible resource should be granted");
    assert_eq!(store.find_calls().await.len(), 2);
}

#[tokio::test]
async fn test_forced_prefix_is_deterministic() {
    let memory = InMemoryBroker::new();
    let broker = MessageBroker::new(
        Arc::new(memory.clone()),
        tokens(),
        Arc::new(MockStore::empty()),
        BrokerConfig {
            force_queue_prefix: true,
            ..BrokerConfig::default()
        },
    );
    broker.connect().await.unwrap();
    let token = tokens().issue(&user(), 3600).unwrap();

    let (listener, _rx) = collector();
    let first = broker
        .add_queue_consumer("inbox", None, Some(token.as_str()), None, listener)
        .await
        .unwrap();
    broker.remove_queue_consumer(Some(&first)).await.unwrap();

    let (listener, _rx) = collector();
    let second = broker
        .add_queue_consumer("inbox", None, Some(token.as_str()), None, listener)
        .await
        .unwrap();

    assert_ne!(first.queue, "inbox");
    assert_eq!(first.queue, second.queue);
    assert_eq!(first.requested, "inbox");
}

// ============================================================================
// Error metrics
// ============================================================================

#[test]
fn test_failures_counted_by_operation_and_type() {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    metrics::with_local_recorder(&recorder, || {
        runtime.block_on(async {
            let memory = InMemoryBroker::new();
            let broker = MessageBroker::new(
                Arc::new(memory.clone()),
                tokens(),
                Arc::new(MockStore::empty()),
                BrokerConfig::default(),
            );

            let sent = broker.send("", "jobs", "x", SendOptions::default()).await;
            assert_eq!(sent, Err(GatewayError::NotConnected));

            broker.connect().await.unwrap();
            let (listener, _rx) = collector();
            let added = broker
                .add_queue_consumer(USER_ID, None, None, None, listener)
                .await;
            assert!(matches!(added, Err(GatewayError::AccessDenied(_))));
        });
    });

    let entries = snapshotter.snapshot().into_vec();
    let count_for = |operation: &str, error_type: &str| {
        entries.iter().find_map(|(key, _, _, value)| {
            let key = key.key();
            let matches = key.name() == "gw_errors_total"
                && key.labels().any(|l| l.key() == "operation" && l.value() == operation)
                && key.labels().any(|l| l.key() == "type" && l.value() == error_type);
            match (matches, value) {
                (true, DebugValue::Counter(n)) => Some(*n),
                _ => None,
            }
        })
    };

    assert_eq!(count_for("send", "not_connected"), Some(1));
    assert_eq!(count_for("register", "access_denied"), Some(1));
}
