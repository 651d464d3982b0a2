//! CRUD operations for [`Document`] rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{merge_fields, Document, Precondition};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new document. Fails if `(collection, id)` already exists.
    pub fn insert_document(
        &self,
        collection: &str,
        id: &str,
        data: &serde_json::Value,
    ) -> Result<Document> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO documents (collection, id, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![collection, id, serde_json::to_string(data)?, now.to_rfc3339()],
        )?;
        Ok(Document {
            id: id.to_string(),
            data: data.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single document.
    pub fn get_document(&self, collection: &str, id: &str) -> Result<Document> {
        self.find_document(collection, id)?
            .ok_or(StoreError::NotFound)
    }

    /// Fetch a single document, `None` if absent.
    pub fn find_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, data, created_at, updated_at
                 FROM documents
                 WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                read_row,
            )
            .optional()?;
        row.map(row_to_document).transpose()
    }

    /// All documents of a collection in insertion order.
    pub fn list_documents(&self, collection: &str) -> Result<Vec<Document>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, data, created_at, updated_at
             FROM documents
             WHERE collection = ?1
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![collection], read_row)?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(row_to_document(row?)?);
        }
        Ok(documents)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Merge top-level fields into an existing document if `precondition`
    /// holds. Returns the updated document.
    pub fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
        precondition: &Precondition,
    ) -> Result<Document> {
        let mut doc = self.get_document(collection, id)?;
        precondition.check(&doc.data)?;
        merge_fields(&mut doc.data, patch)?;

        let now = Utc::now();
        self.conn().execute(
            "UPDATE documents SET data = ?1, updated_at = ?2
             WHERE collection = ?3 AND id = ?4",
            params![serde_json::to_string(&doc.data)?, now.to_rfc3339(), collection, id],
        )?;
        doc.updated_at = now;
        Ok(doc)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete one document. Returns `false` if it did not exist.
    pub fn delete_document(&self, collection: &str, id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(affected > 0)
    }
}

type RawRow = (String, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn row_to_document((id, data, created_at, updated_at): RawRow) -> Result<Document> {
    Ok(Document {
        id,
        data: serde_json::from_str(&data)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}
