//! v001 -- Document table.
//!
//! Every document of every collection lives in one table. Subcollections are
//! ordinary collections whose path embeds the parent document
//! (`calls/<id>/offerCandidates`). `seq` preserves insertion order, which is
//! the order change subscribers observe.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    collection  TEXT NOT NULL,               -- e.g. "calls", "calls/<id>/offerCandidates"
    id          TEXT NOT NULL,               -- store-assigned document id
    data        TEXT NOT NULL,               -- JSON object
    created_at  TEXT NOT NULL,               -- RFC-3339
    updated_at  TEXT NOT NULL,

    UNIQUE (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection_seq
    ON documents(collection, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
