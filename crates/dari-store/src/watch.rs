//! Change subscriptions.
//!
//! A [`Subscription`] is a stream of items fed by the store. Dropping it
//! unsubscribes: the store notices the closed channel on its next write and
//! forgets the watcher.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::models::{Document, DocumentChange};

/// Stream of snapshots or changes from one watch.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Create a subscription together with the sender that feeds it.
    ///
    /// Store implementations keep the sender and push items into it.
    pub fn channel() -> (mpsc::UnboundedSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next item. `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next item if one is already queued.
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

struct DocumentWatcher {
    collection: String,
    id: String,
    tx: mpsc::UnboundedSender<Option<Document>>,
}

struct CollectionWatcher {
    collection: String,
    tx: mpsc::UnboundedSender<DocumentChange>,
}

/// Registry of live watchers. Owned by the store next to its database so a
/// write and its notification happen under the same lock.
#[derive(Default)]
pub(crate) struct Watchers {
    documents: Vec<DocumentWatcher>,
    collections: Vec<CollectionWatcher>,
}

impl Watchers {
    pub(crate) fn add_document(
        &mut self,
        collection: &str,
        id: &str,
        tx: mpsc::UnboundedSender<Option<Document>>,
    ) {
        self.documents.push(DocumentWatcher {
            collection: collection.to_string(),
            id: id.to_string(),
            tx,
        });
    }

    pub(crate) fn add_collection(
        &mut self,
        collection: &str,
        tx: mpsc::UnboundedSender<DocumentChange>,
    ) {
        self.collections.push(CollectionWatcher {
            collection: collection.to_string(),
            tx,
        });
    }

    /// Fan a change out to everyone watching the collection or the document,
    /// dropping watchers whose subscription was dropped.
    pub(crate) fn notify(&mut self, collection: &str, change: &DocumentChange) {
        let snapshot = match change {
            DocumentChange::Added(doc) | DocumentChange::Modified(doc) => Some(doc.clone()),
            DocumentChange::Removed { .. } => None,
        };

        self.documents.retain(|w| {
            if w.collection != collection || w.id != change.id() {
                return !w.tx.is_closed();
            }
            w.tx.send(snapshot.clone()).is_ok()
        });

        self.collections.retain(|w| {
            if w.collection != collection {
                return !w.tx.is_closed();
            }
            w.tx.send(change.clone()).is_ok()
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.documents.len() + self.collections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn doc(id: &str) -> Document {
        Document {
            id: id.to_string(),
            data: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_notify_routes_by_collection_and_id() {
        let mut watchers = Watchers::default();
        let (tx, mut calls) = Subscription::channel();
        watchers.add_collection("calls", tx);
        let (tx, mut one) = Subscription::channel();
        watchers.add_document("calls", "a", tx);

        watchers.notify("calls", &DocumentChange::Added(doc("b")));
        watchers.notify("other", &DocumentChange::Added(doc("a")));
        watchers.notify("calls", &DocumentChange::Removed { id: "a".into() });

        assert_eq!(calls.next().await.unwrap().id(), "b");
        assert_eq!(calls.next().await.unwrap().id(), "a");
        assert_eq!(one.next().await, Some(None));
        assert!(one.try_next().is_none());
    }

    #[test]
    fn test_dropped_subscriptions_are_pruned() {
        let mut watchers = Watchers::default();
        let (tx, sub) = Subscription::<DocumentChange>::channel();
        watchers.add_collection("calls", tx);
        assert_eq!(watchers.len(), 1);

        drop(sub);
        watchers.notify("elsewhere", &DocumentChange::Removed { id: "x".into() });
        assert_eq!(watchers.len(), 0);
    }
}
