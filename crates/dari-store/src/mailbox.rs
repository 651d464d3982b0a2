//! The mailbox seam and its SQLite implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{validate_collection, validate_id, Document, DocumentChange, Precondition};
use crate::watch::{Subscription, Watchers};

/// Document database with change notifications.
///
/// Subscriptions deliver the current state first and every later change
/// after it, with no gap between the two. Changes made by a single writer
/// are delivered in write order.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document with a store-assigned id and return that id.
    async fn create(&self, collection: &str, data: serde_json::Value) -> Result<String>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Merge top-level fields into an existing document. Fails with
    /// [`StoreError::NotFound`] or [`StoreError::PreconditionFailed`].
    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
        precondition: Precondition,
    ) -> Result<Document>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// All documents of a collection, oldest first.
    async fn list(&self, collection: &str) -> Result<Vec<Document>>;

    /// Current snapshot of one document (`None` while absent), then one item
    /// per later write or deletion.
    async fn watch_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Subscription<Option<Document>>>;

    /// Every existing document as [`DocumentChange::Added`], then live changes.
    async fn watch_collection(&self, collection: &str) -> Result<Subscription<DocumentChange>>;
}

struct Inner {
    db: Database,
    watchers: Watchers,
}

/// [`DocumentStore`] backed by a local SQLite database.
///
/// Notifications are delivered to subscribers within this process.
pub struct SqliteMailbox {
    inner: Mutex<Inner>,
}

impl SqliteMailbox {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Mutex::new(Inner {
                db,
                watchers: Watchers::default(),
            }),
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn new_document_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl DocumentStore for SqliteMailbox {
    async fn create(&self, collection: &str, data: serde_json::Value) -> Result<String> {
        validate_collection(collection)?;
        let id = new_document_id();
        let mut inner = self.lock()?;
        let doc = inner.db.insert_document(collection, &id, &data)?;
        inner
            .watchers
            .notify(collection, &DocumentChange::Added(doc));
        debug!(collection, id = %id, "document created");
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        validate_collection(collection)?;
        validate_id(id)?;
        self.lock()?.db.find_document(collection, id)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
        precondition: Precondition,
    ) -> Result<Document> {
        validate_collection(collection)?;
        validate_id(id)?;
        let mut inner = self.lock()?;
        let doc = inner
            .db
            .update_document(collection, id, patch, &precondition)?;
        inner
            .watchers
            .notify(collection, &DocumentChange::Modified(doc.clone()));
        debug!(collection, id, "document updated");
        Ok(doc)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        validate_collection(collection)?;
        validate_id(id)?;
        let mut inner = self.lock()?;
        let deleted = inner.db.delete_document(collection, id)?;
        if deleted {
            inner.watchers.notify(
                collection,
                &DocumentChange::Removed { id: id.to_string() },
            );
            debug!(collection, id, "document deleted");
        }
        Ok(deleted)
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        validate_collection(collection)?;
        self.lock()?.db.list_documents(collection)
    }

    async fn watch_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Subscription<Option<Document>>> {
        validate_collection(collection)?;
        validate_id(id)?;
        let (tx, subscription) = Subscription::channel();
        let mut inner = self.lock()?;
        let current = inner.db.find_document(collection, id)?;
        // Receiver is alive: it is returned below.
        let _ = tx.send(current);
        inner.watchers.add_document(collection, id, tx);
        Ok(subscription)
    }

    async fn watch_collection(&self, collection: &str) -> Result<Subscription<DocumentChange>> {
        validate_collection(collection)?;
        let (tx, subscription) = Subscription::channel();
        let mut inner = self.lock()?;
        for doc in inner.db.list_documents(collection)? {
            let _ = tx.send(DocumentChange::Added(doc));
        }
        inner.watchers.add_collection(collection, tx);
        Ok(subscription)
    }
}
