//! Shared client state
//!
//! Wires the components together around one [`ApiClient`], one
//! [`SessionStore`] and one [`ConversationLog`]. Every component is `Send +
//! Sync` and handed out through `Arc`, so a front end can drive ingestion and
//! questions from separate tasks.

use anyhow::Context;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::{
    api::ApiClient,
    config::Config,
    conversation::ConversationLog,
    dispatcher::{ClarificationTemplate, QueryDispatcher},
    error::ClientResult,
    export,
    ingestion::IngestionClient,
    schema_cache::SchemaCache,
    session::{KvStore, SessionStore, SqliteKvStore},
};

pub struct ClientState {
    pub config: Arc<Config>,
    pub api: ApiClient,
    pub session: Arc<SessionStore>,
    pub schema: Arc<SchemaCache>,
    pub log: ConversationLog,
    pub ingestion: Arc<IngestionClient>,
    pub dispatcher: Arc<QueryDispatcher>,
}

impl ClientState {
    /// Opens the SQLite session file named in `config` and restores any
    /// persisted session.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let kv = SqliteKvStore::new(&config.session_db_path).with_context(|| {
            format!(
                "failed to open session store at {}",
                config.session_db_path.display()
            )
        })?;
        Ok(Self::with_store(config, Arc::new(kv))?)
    }

    pub fn with_store(config: Config, kv: Arc<dyn KvStore>) -> ClientResult<Self> {
        let api = ApiClient::from_config(&config)?;
        let session = Arc::new(SessionStore::open(api.clone(), kv)?);
        let log = ConversationLog::new();
        let schema = Arc::new(SchemaCache::new(
            api.clone(),
            Arc::clone(&session),
            log.clone(),
        ));
        let ingestion = Arc::new(IngestionClient::new(
            api.clone(),
            Arc::clone(&session),
            Arc::clone(&schema),
            log.clone(),
        ));
        let dispatcher = Arc::new(QueryDispatcher::new(
            api.clone(),
            Arc::clone(&session),
            log.clone(),
            ClarificationTemplate::new(config.clarification_template.clone()),
        ));

        info!("Client state initialized against {}", api.base_url());
        Ok(Self {
            config: Arc::new(config),
            api,
            session,
            schema,
            log,
            ingestion,
            dispatcher,
        })
    }

    /// Signs out and forgets everything tied to the previous session.
    pub fn sign_out(&self) -> ClientResult<()> {
        self.dispatcher.clear();
        self.ingestion.clear_selection();
        self.session.sign_out()
    }

    /// Writes the rows of the most recent answer to `path`, or to a
    /// timestamped file in the export directory.
    pub fn export_latest_rows(&self, path: Option<&Path>) -> ClientResult<Option<PathBuf>> {
        let Some(rows) = self.log.latest_rows() else {
            return Ok(None);
        };
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => self.export_path("results", "csv"),
        };
        export::export_rows(&rows, target)
    }

    pub fn save_transcript(&self, path: Option<&Path>) -> ClientResult<PathBuf> {
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => self.export_path("conversation", "json"),
        };
        export::export_transcript(&self.log, target)
    }

    pub async fn download_query_csv(&self, sql: &str, path: Option<&Path>) -> ClientResult<PathBuf> {
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => self.export_path("query", "csv"),
        };
        export::download_query_csv(&self.api, &self.session, sql, target).await
    }

    fn export_path(&self, stem: &str, extension: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        self.config
            .export_dir
            .join(format!("{}-{}.{}", stem, stamp, extension))
    }
}

