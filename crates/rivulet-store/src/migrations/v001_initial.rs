//! v001 -- Initial schema creation.
//!
//! Two cache tables: `streams` and `messages`. Rows keep the record as the
//! JSON the service sent, next to the key columns used for lookups.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Streams
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS streams (
    publisher_id TEXT NOT NULL,
    stream_name  TEXT NOT NULL,
    fields_json  TEXT NOT NULL,               -- StreamFields as JSON
    cached_at    TEXT NOT NULL,               -- RFC-3339

    PRIMARY KEY (publisher_id, stream_name)
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    publisher_id TEXT NOT NULL,
    stream_name  TEXT NOT NULL,
    ordinal      INTEGER NOT NULL,
    message_json TEXT NOT NULL,               -- Message as JSON
    cached_at    TEXT NOT NULL,

    -- no FK: a pushed message may be cached before its stream
    PRIMARY KEY (publisher_id, stream_name, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_messages_stream_ordinal
    ON messages(publisher_id, stream_name, ordinal DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
