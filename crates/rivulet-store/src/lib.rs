//! # rivulet-store
//!
//! Optional on-disk tier for the stream and message caches, backed by
//! SQLite. The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for both tables.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod streams;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use streams::StoredStream;
