//! # dari-store
//!
//! The shared mailbox that carries call signaling between two browsers or
//! clients that cannot otherwise find each other.
//!
//! [`DocumentStore`] is the seam the signaling layer depends on: documents
//! grouped in collections (with per-document subcollections addressed by
//! path), create/read/update/delete, and subscriptions that deliver the
//! current snapshot followed by live changes. [`SqliteMailbox`] implements it
//! on top of a local SQLite database.

pub mod database;
pub mod documents;
pub mod mailbox;
pub mod migrations;
pub mod models;
pub mod watch;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use mailbox::{DocumentStore, SqliteMailbox};
pub use models::*;
pub use watch::Subscription;
