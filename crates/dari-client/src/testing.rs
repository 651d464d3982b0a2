//! Test doubles shared by the controller and sweeper tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dari_shared::constants::CALLS_COLLECTION;
use dari_shared::IceServer;
use dari_store::{
    Document, DocumentChange, DocumentStore, Precondition, SqliteMailbox, StoreError, Subscription,
};
use tokio::sync::{broadcast, Notify, Semaphore};

use crate::events::CallEvent;
use crate::relay::{RelayCredentialSource, RelayError};

pub(crate) fn stun_only() -> Vec<String> {
    vec!["stun:stun.example.org:3478".to_string()]
}

/// Next event matching `pred`, skipping others. Panics after five seconds.
pub(crate) async fn wait_for(
    events: &mut broadcast::Receiver<CallEvent>,
    pred: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for call event")
}

/// Counts writes per collection.
pub(crate) struct CountingStore {
    inner: Arc<SqliteMailbox>,
    writes: Mutex<HashMap<(String, &'static str), usize>>,
}

impl CountingStore {
    pub(crate) fn new(inner: Arc<SqliteMailbox>) -> Self {
        Self {
            inner,
            writes: Mutex::new(HashMap::new()),
        }
    }

    fn count(&self, collection: &str, op: &'static str) {
        *self
            .writes
            .lock()
            .unwrap()
            .entry((collection.to_string(), op))
            .or_default() += 1;
    }

    /// Every create, update and delete so far.
    pub(crate) fn writes(&self) -> usize {
        self.writes.lock().unwrap().values().sum()
    }

    pub(crate) fn deletes_in(&self, collection: &str) -> usize {
        self.writes
            .lock()
            .unwrap()
            .get(&(collection.to_string(), "delete"))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn create(&self, collection: &str, data: serde_json::Value) -> Result<String, StoreError> {
        self.count(collection, "create");
        self.inner.create(collection, data).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get(collection, id).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
        precondition: Precondition,
    ) -> Result<Document, StoreError> {
        self.count(collection, "update");
        self.inner.update(collection, id, patch, precondition).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let deleted = self.inner.delete(collection, id).await?;
        if deleted {
            self.count(collection, "delete");
        }
        Ok(deleted)
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.inner.list(collection).await
    }

    async fn watch_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Subscription<Option<Document>>, StoreError> {
        self.inner.watch_document(collection, id).await
    }

    async fn watch_collection(
        &self,
        collection: &str,
    ) -> Result<Subscription<DocumentChange>, StoreError> {
        self.inner.watch_collection(collection).await
    }
}

/// Holds the first call record creation until released.
pub(crate) struct GatedStore {
    inner: Arc<SqliteMailbox>,
    armed: AtomicBool,
    entered: Notify,
    gate: Semaphore,
}

impl GatedStore {
    pub(crate) fn new(inner: Arc<SqliteMailbox>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    /// Resolves once the gated create is waiting.
    pub(crate) async fn entered(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl DocumentStore for GatedStore {
    async fn create(&self, collection: &str, data: serde_json::Value) -> Result<String, StoreError> {
        if collection == CALLS_COLLECTION && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            let _permit = self.gate.acquire().await;
        }
        self.inner.create(collection, data).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get(collection, id).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
        precondition: Precondition,
    ) -> Result<Document, StoreError> {
        self.inner.update(collection, id, patch, precondition).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(collection, id).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.inner.list(collection).await
    }

    async fn watch_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Subscription<Option<Document>>, StoreError> {
        self.inner.watch_document(collection, id).await
    }

    async fn watch_collection(
        &self,
        collection: &str,
    ) -> Result<Subscription<DocumentChange>, StoreError> {
        self.inner.watch_collection(collection).await
    }
}

pub(crate) struct StaticRelay(pub Vec<IceServer>);

#[async_trait]
impl RelayCredentialSource for StaticRelay {
    async fn fetch(&self) -> Result<Vec<IceServer>, RelayError> {
        Ok(self.0.clone())
    }
}

/// Always answers with a server error.
pub(crate) struct FailingRelay;

#[async_trait]
impl RelayCredentialSource for FailingRelay {
    async fn fetch(&self) -> Result<Vec<IceServer>, RelayError> {
        Err(RelayError::Status(reqwest::StatusCode::BAD_GATEWAY))
    }
}
