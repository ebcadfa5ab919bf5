// sqlmaster/crates/sqlmaster-client/src/lib.rs

pub mod api;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod export;
pub mod ingestion;
pub mod schema_cache;
pub mod session;
pub mod shared_state;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use api::ApiClient;
pub use config::Config;
pub use conversation::{AssistantEntry, ChatEntry, ConversationLog, Role, Row};
pub use dispatcher::{
    ClarificationTemplate, DispatchPhase, PendingClarification, QueryDispatcher, RejectReason,
    TurnOutcome,
};
pub use error::{ClientError, ClientResult, ValidationError};
pub use export::{download_query_csv, export_rows, export_transcript};
pub use ingestion::{IngestOutcome, IngestionClient, PendingFile};
pub use schema_cache::{SchemaCache, SchemaSnapshot, TableDescription};
pub use session::{InMemoryKvStore, KvStore, Session, SessionStore, SqliteKvStore};
pub use shared_state::ClientState;
