//! Session module - credential ownership and its persistence

pub mod kv_store;
pub mod session_store;

pub use kv_store::{InMemoryKvStore, KvStore, SqliteKvStore, TOKEN_KEY, USERNAME_KEY};
pub use session_store::{Session, SessionStore, FALLBACK_IDENTITY};
