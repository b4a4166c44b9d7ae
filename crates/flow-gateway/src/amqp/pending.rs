//! Correlation table for request/reply over the broker.
//!
//! One entry per outstanding call, keyed by correlation id. Settling an
//! entry (resolve or reject) removes it, so a second reply for the same id
//! finds nothing and is dropped silently.
//!
//! Entries never expire on their own. A request whose reply is lost without
//! a broker return stays here until the process exits; callers bound their
//! wait with their own timeout and call [`PendingCallTable::remove`].

use crate::errors::GatewayError;
use crate::observability::metrics;
use common::types::CorrelationId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

/// Outcome delivered to a waiting caller: the raw reply body.
pub type ReplyResult = Result<String, GatewayError>;

struct PendingCall {
    created_at: Instant,
    reply_tx: oneshot::Sender<ReplyResult>,
}

/// Map from correlation id to the continuation awaiting its reply.
#[derive(Default)]
pub struct PendingCallTable {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call. Fails if `id` already has an outstanding call.
    pub async fn register(&self, id: &CorrelationId) -> Result<PendingReply, GatewayError> {
        let mut calls = self.calls.lock().await;
        if calls.contains_key(id.as_str()) {
            return Err(GatewayError::Conflict(format!(
                "correlation id {id} already has a pending call"
            )));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        calls.insert(
            id.as_str().to_string(),
            PendingCall {
                created_at: Instant::now(),
                reply_tx,
            },
        );
        metrics::set_pending_calls(calls.len());
        Ok(PendingReply {
            correlation_id: id.clone(),
            reply_rx,
        })
    }

    /// Settle `id` with a reply body. Returns false if nothing was pending.
    pub async fn resolve(&self, id: &str, body: String) -> bool {
        self.settle(id, Ok(body)).await
    }

    /// Settle `id` with an error. Returns false if nothing was pending.
    pub async fn reject(&self, id: &str, error: GatewayError) -> bool {
        self.settle(id, Err(error)).await
    }

    /// Drop the entry for `id` without settling it.
    pub async fn remove(&self, id: &str) -> bool {
        let mut calls = self.calls.lock().await;
        let removed = calls.remove(id).is_some();
        metrics::set_pending_calls(calls.len());
        removed
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.calls.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.calls.lock().await.is_empty()
    }

    /// Age of the longest-waiting call.
    pub async fn oldest_age(&self) -> Option<Duration> {
        self.calls
            .lock()
            .await
            .values()
            .map(|call| call.created_at.elapsed())
            .max()
    }

    async fn settle(&self, id: &str, outcome: ReplyResult) -> bool {
        let call = {
            let mut calls = self.calls.lock().await;
            let call = calls.remove(id);
            metrics::set_pending_calls(calls.len());
            call
        };
        match call {
            Some(call) => {
                // Caller may have stopped waiting; the entry is gone either way.
                if call.reply_tx.send(outcome).is_err() {
                    tracing::debug!(
                        target: "gw.amqp.pending",
                        correlation_id = %id,
                        "Reply arrived after caller stopped waiting"
                    );
                }
                true
            }
            None => false,
        }
    }
}

/// Future returned by a request/reply send. Resolves with the reply body.
#[must_use = "a pending reply does nothing unless awaited"]
pub struct PendingReply {
    correlation_id: CorrelationId,
    reply_rx: oneshot::Receiver<ReplyResult>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Future for PendingReply {
    type Output = ReplyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.reply_rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(GatewayError::ReplyDropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}
