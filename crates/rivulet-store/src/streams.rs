use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use rivulet_shared::models::StreamFields;
use rivulet_shared::types::StreamKey;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// A stream row as last cached.
#[derive(Debug, Clone)]
pub struct StoredStream {
    pub fields: StreamFields,
    pub cached_at: DateTime<Utc>,
}

impl Database {
    pub fn upsert_stream(&self, fields: &StreamFields) -> Result<()> {
        let json = serde_json::to_string(fields)?;
        self.conn().execute(
            "INSERT INTO streams (publisher_id, stream_name, fields_json, cached_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(publisher_id, stream_name)
             DO UPDATE SET fields_json = excluded.fields_json, cached_at = excluded.cached_at",
            params![
                fields.publisher_id.as_str(),
                fields.name.as_str(),
                json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_stream(&self, key: &StreamKey) -> Result<StoredStream> {
        self.conn()
            .query_row(
                "SELECT fields_json, cached_at FROM streams
                 WHERE publisher_id = ?1 AND stream_name = ?2",
                params![key.publisher_id.as_str(), key.stream_name.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
            .ok_or(StoreError::NotFound)
            .and_then(|(json, ts)| decode_stream(&json, &ts))
    }

    /// Most recently cached first, at most `limit` rows.
    pub fn recent_streams(&self, limit: usize) -> Result<Vec<StoredStream>> {
        let mut stmt = self.conn().prepare(
            "SELECT fields_json, cached_at FROM streams
             ORDER BY cached_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut streams = Vec::new();
        for row in rows {
            let (json, ts) = row?;
            match decode_stream(&json, &ts) {
                Ok(stream) => streams.push(stream),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable cached stream"),
            }
        }
        Ok(streams)
    }

    /// Forget a stream and its messages.
    pub fn delete_stream(&self, key: &StreamKey) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM streams WHERE publisher_id = ?1 AND stream_name = ?2",
            params![key.publisher_id.as_str(), key.stream_name.as_str()],
        )?;
        self.conn().execute(
            "DELETE FROM messages WHERE publisher_id = ?1 AND stream_name = ?2",
            params![key.publisher_id.as_str(), key.stream_name.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn decode_stream(json: &str, cached_at: &str) -> Result<StoredStream> {
    let fields: StreamFields = serde_json::from_str(json)?;
    let cached_at = DateTime::parse_from_rfc3339(cached_at)?.with_timezone(&Utc);
    Ok(StoredStream { fields, cached_at })
}
