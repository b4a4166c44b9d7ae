//! Persistent store boundary.
//!
//! The gateway only needs two things from the store: visibility lookups for
//! queue access checks, and a batched heartbeat write once per sweep.

use crate::errors::GatewayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Heartbeat timestamp for one authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatUpdate {
    pub user_id: String,
    pub last_seen: DateTime<Utc>,
    pub client_agent: Option<String>,
    pub client_version: Option<String>,
}

/// Store operations used by the gateway.
#[async_trait]
pub trait Store: Send + Sync {
    /// Records in `collection` matching `filter` that are visible to the
    /// holder of `token`.
    async fn find(
        &self,
        filter: Value,
        projection: Value,
        collection: &str,
        token: &str,
    ) -> Result<Vec<Value>, GatewayError>;

    /// Write all heartbeat timestamps in one round trip.
    async fn bulk_update_heartbeats(&self, updates: Vec<HeartbeatUpdate>)
        -> Result<(), GatewayError>;
}

/// Mock store for testing.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// A `find` call as seen by the mock.
    #[derive(Debug, Clone)]
    pub struct FindCall {
        pub collection: String,
        pub filter: Value,
    }

    /// In-memory store returning canned records per collection.
    #[derive(Default)]
    pub struct MockStore {
        records: Mutex<HashMap<String, Vec<Value>>>,
        find_calls: Mutex<Vec<FindCall>>,
        heartbeat_batches: Mutex<Vec<Vec<HeartbeatUpdate>>>,
        fail_finds: AtomicBool,
        fail_heartbeats: AtomicBool,
    }

    impl MockStore {
        /// Store with no records in any collection.
        pub fn empty() -> Self {
            Self::default()
        }

        /// Store that errors on every `find`.
        pub fn failing() -> Self {
            let store = Self::default();
            store.fail_finds.store(true, Ordering::SeqCst);
            store
        }

        /// Make `record` visible in `collection` (to any filter).
        pub async fn insert(&self, collection: &str, record: Value) {
            self.records
                .lock()
                .await
                .entry(collection.to_string())
                .or_default()
                .push(record);
        }

        pub fn set_fail_heartbeats(&self, fail: bool) {
            self.fail_heartbeats.store(fail, Ordering::SeqCst);
        }

        pub async fn find_calls(&self) -> Vec<FindCall> {
            self.find_calls.lock().await.clone()
        }

        pub async fn heartbeat_batches(&self) -> Vec<Vec<HeartbeatUpdate>> {
            self.heartbeat_batches.lock().await.clone()
        }
    }

    #[async_trait]
    impl Store for MockStore {
        async fn find(
            &self,
            filter: Value,
            _projection: Value,
            collection: &str,
            _token: &str,
        ) -> Result<Vec<Value>, GatewayError> {
            self.find_calls.lock().await.push(FindCall {
                collection: collection.to_string(),
                filter,
            });
            if self.fail_finds.load(Ordering::SeqCst) {
                return Err(GatewayError::Store("mock store unavailable".to_string()));
            }
            Ok(self
                .records
                .lock()
                .await
                .get(collection)
                .cloned()
                .unwrap_or_default())
        }

        async fn bulk_update_heartbeats(
            &self,
            updates: Vec<HeartbeatUpdate>,
        ) -> Result<(), GatewayError> {
            if self.fail_heartbeats.load(Ordering::SeqCst) {
                return Err(GatewayError::Store("mock bulk write failed".to_string()));
            }
            self.heartbeat_batches.lock().await.push(updates);
            Ok(())
        }
    }
}
