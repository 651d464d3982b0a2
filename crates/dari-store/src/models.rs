//! Document model shared by the SQLite helpers and the [`DocumentStore`] trait.
//!
//! [`DocumentStore`]: crate::DocumentStore

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// A stored JSON object plus its store-assigned identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One change delivered to a collection subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    Added(Document),
    Modified(Document),
    Removed { id: String },
}

impl DocumentChange {
    pub fn id(&self) -> &str {
        match self {
            DocumentChange::Added(doc) | DocumentChange::Modified(doc) => &doc.id,
            DocumentChange::Removed { id } => id,
        }
    }
}

/// Condition a document must satisfy for an update to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Apply whenever the document exists.
    Exists,
    /// Apply only if the named top-level field is absent or null.
    FieldAbsent(String),
}

impl Precondition {
    pub(crate) fn check(&self, current: &serde_json::Value) -> Result<()> {
        match self {
            Precondition::Exists => Ok(()),
            Precondition::FieldAbsent(field) => match current.get(field) {
                None | Some(serde_json::Value::Null) => Ok(()),
                Some(_) => Err(StoreError::PreconditionFailed(format!(
                    "field '{field}' already set"
                ))),
            },
        }
    }
}

/// Path of a subcollection nested under one document.
pub fn subcollection(collection: &str, id: &str, name: &str) -> String {
    format!("{collection}/{id}/{name}")
}

/// Collection paths alternate collection and document segments and therefore
/// always have an odd number of non-empty segments.
pub fn validate_collection(path: &str) -> Result<()> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) || segments.len() % 2 == 0 {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') {
        return Err(StoreError::InvalidPath(format!("bad document id '{id}'")));
    }
    Ok(())
}

/// Shallow-merge `patch` into `target`, the way a field update behaves.
pub(crate) fn merge_fields(
    target: &mut serde_json::Value,
    patch: serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    let object = target
        .as_object_mut()
        .ok_or_else(|| StoreError::PreconditionFailed("document is not an object".into()))?;
    for (key, value) in patch {
        object.insert(key, value);
    }
    Ok(())
}
