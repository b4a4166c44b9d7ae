//! Client socket boundary.
//!
//! The websocket server lives outside the core. The sweep only needs to
//! send envelopes, close a socket and ask whether it is open and drained.

use crate::errors::GatewayError;
use crate::sessions::messages::Message;
use async_trait::async_trait;
use common::types::SessionId;

/// Operations on client sockets, addressed by session.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn send(&self, session: SessionId, message: &Message) -> Result<(), GatewayError>;

    async fn close(&self, session: SessionId) -> Result<(), GatewayError>;

    async fn is_open(&self, session: SessionId) -> bool;

    /// Messages queued for the client but not yet written.
    async fn pending_outbound_count(&self, session: SessionId) -> usize;
}

/// Mock socket transport for testing.
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct SocketState {
        open: HashSet<SessionId>,
        outbound: HashMap<SessionId, usize>,
        failing_sends: HashSet<SessionId>,
        sent: Vec<(SessionId, Message)>,
        closed: Vec<SessionId>,
    }

    /// Records traffic; sockets are closed until opened.
    #[derive(Default)]
    pub struct MockSocketTransport {
        state: Mutex<SocketState>,
    }

    impl MockSocketTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn open(&self, session: SessionId) {
            self.state.lock().await.open.insert(session);
        }

        /// Simulate the client going away without a close from our side.
        pub async fn disconnect(&self, session: SessionId) {
            self.state.lock().await.open.remove(&session);
        }

        pub async fn set_outbound(&self, session: SessionId, count: usize) {
            self.state.lock().await.outbound.insert(session, count);
        }

        pub async fn fail_sends(&self, session: SessionId) {
            self.state.lock().await.failing_sends.insert(session);
        }

        /// Messages sent to `session`, oldest first.
        pub async fn sent_to(&self, session: SessionId) -> Vec<Message> {
            self.state
                .lock()
                .await
                .sent
                .iter()
                .filter(|(id, _)| *id == session)
                .map(|(_, message)| message.clone())
                .collect()
        }

        /// Sessions closed through [`SocketTransport::close`], in order.
        pub async fn closed(&self) -> Vec<SessionId> {
            self.state.lock().await.closed.clone()
        }
    }

    #[async_trait]
    impl SocketTransport for MockSocketTransport {
        async fn send(&self, session: SessionId, message: &Message) -> Result<(), GatewayError> {
            let mut state = self.state.lock().await;
            if state.failing_sends.contains(&session) {
                return Err(GatewayError::Transport(format!("send to {session} failed")));
            }
            if !state.open.contains(&session) {
                return Err(GatewayError::Transport(format!("socket {session} is closed")));
            }
            state.sent.push((session, message.clone()));
            Ok(())
        }

        async fn close(&self, session: SessionId) -> Result<(), GatewayError> {
            let mut state = self.state.lock().await;
            state.open.remove(&session);
            state.closed.push(session);
            Ok(())
        }

        async fn is_open(&self, session: SessionId) -> bool {
            self.state.lock().await.open.contains(&session)
        }

        async fn pending_outbound_count(&self, session: SessionId) -> usize {
            self.state
                .lock()
                .await
                .outbound
                .get(&session)
                .copied()
                .unwrap_or(0)
        }
    }
}
