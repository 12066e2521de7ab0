use chrono::Utc;
use rusqlite::params;

use rivulet_shared::models::Message;
use rivulet_shared::types::StreamKey;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Insert or overwrite the message at its ordinal.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO messages
                 (publisher_id, stream_name, ordinal, message_json, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.publisher_id.as_str(),
                message.stream_name.as_str(),
                message.ordinal as i64,
                json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The newest `limit` messages of a stream, in ascending ordinal order.
    pub fn messages_for_stream(&self, key: &StreamKey, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_json FROM messages
             WHERE publisher_id = ?1 AND stream_name = ?2
             ORDER BY ordinal DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![key.publisher_id.as_str(), key.stream_name.as_str(), limit],
            |row| row.get::<_, String>(0),
        )?;

        let mut messages = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str::<Message>(&json) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable cached message"),
            }
        }
        messages.reverse();
        Ok(messages)
    }
}
