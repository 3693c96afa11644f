//! Persistence for contacts, conversation history and style exemplars

mod sqlite;

pub use sqlite::SqliteStorage;
