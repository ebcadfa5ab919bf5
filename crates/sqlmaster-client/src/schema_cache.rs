//! Schema Cache
//!
//! Holds the most recent catalog of ingested sources. A refresh replaces the
//! snapshot wholesale; a failed refresh leaves the previous one in place.

use arc_swap::ArcSwap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::api::{ApiClient, SchemaPayload};
use crate::conversation::{ChatEntry, ConversationLog, SESSION_EXPIRED_NOTICE};
use crate::error::{ClientError, ClientResult, ValidationError};
use crate::session::SessionStore;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableDescription {
    pub name: String,
    /// Free-text column/type listing, one column per line.
    #[serde(default, deserialize_with = "columns_text")]
    pub columns: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableDescription>,
}

impl SchemaSnapshot {
    pub fn from_payload(payload: Option<SchemaPayload>) -> Self {
        match payload {
            Some(SchemaPayload::Tables(tables)) => Self { tables },
            Some(SchemaPayload::Text(text)) => Self::parse_text(&text),
            None => Self::default(),
        }
    }

    /// Parses the service's text catalog: a `Table: <name>` header per table
    /// followed by its column lines. Anything before the first header is ignored.
    pub fn parse_text(text: &str) -> Self {
        let mut tables: Vec<TableDescription> = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(name) = trimmed.strip_prefix("Table:") {
                tables.push(TableDescription {
                    name: name.trim().to_string(),
                    columns: String::new(),
                });
                continue;
            }
            if trimmed.is_empty() {
                continue;
            }
            if let Some(current) = tables.last_mut() {
                if !current.columns.is_empty() {
                    current.columns.push('\n');
                }
                current.columns.push_str(trimmed.trim_start_matches(['-', '*', ' ']));
            }
        }
        tables.retain(|t| !t.name.is_empty());
        Self { tables }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn table(&self, name: &str) -> Option<&TableDescription> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table(name).is_some()
    }
}

impl fmt::Display for SchemaSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tables.is_empty() {
            return write!(f, "No data sources connected yet.");
        }
        for (i, table) in self.tables.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "Table: {}", table.name)?;
            for column in table.columns.lines() {
                writeln!(f, "  - {}", column)?;
            }
        }
        Ok(())
    }
}

/// Accepts a string, or a list of strings / `{name, type}` objects.
fn columns_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                Value::Object(obj) => {
                    let name = obj.get("name").and_then(Value::as_str).unwrap_or("?");
                    match obj.get("type").and_then(Value::as_str) {
                        Some(kind) => format!("{} ({})", name, kind),
                        None => name.to_string(),
                    }
                }
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    })
}

pub struct SchemaCache {
    api: ApiClient,
    session: Arc<SessionStore>,
    log: ConversationLog,
    snapshot: ArcSwap<SchemaSnapshot>,
    issued: AtomicU64,
    applied: Mutex<u64>,
}

impl SchemaCache {
    pub fn new(api: ApiClient, session: Arc<SessionStore>, log: ConversationLog) -> Self {
        Self {
            api,
            session,
            log,
            snapshot: ArcSwap::from_pointee(SchemaSnapshot::default()),
            issued: AtomicU64::new(0),
            applied: Mutex::new(0),
        }
    }

    /// Fetches the catalog and replaces the cached snapshot. When refreshes
    /// overlap, a response older than the one already applied is dropped.
    /// A 401 ends the session and leaves one notice in the conversation.
    pub async fn refresh(&self) -> ClientResult<Arc<SchemaSnapshot>> {
        let Some(token) = self.session.current_credential() else {
            warn!("Schema refresh skipped: not signed in");
            return Err(ValidationError::NotSignedIn.into());
        };
        let seq = self.issued.fetch_add(1, Ordering::SeqCst) + 1;

        match self.api.fetch_schema(&token).await {
            Ok(payload) => {
                let fresh = Arc::new(SchemaSnapshot::from_payload(payload));
                let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
                if seq > *applied {
                    *applied = seq;
                    self.snapshot.store(Arc::clone(&fresh));
                    info!("Schema refreshed: {} table(s)", fresh.len());
                } else {
                    debug!("Dropping schema response #{} (already applied #{})", seq, *applied);
                }
                Ok(fresh)
            }
            Err(ClientError::AuthenticationExpired) => {
                warn!("Schema refresh rejected: session expired");
                self.session.expire();
                self.log.append(ChatEntry::assistant(SESSION_EXPIRED_NOTICE));
                Err(ClientError::AuthenticationExpired)
            }
            Err(e) => {
                warn!("Error fetching schema: {}", e);
                Err(e)
            }
        }
    }

    pub fn current(&self) -> Arc<SchemaSnapshot> {
        self.snapshot.load_full()
    }

    pub fn contains(&self, source_name: &str) -> bool {
        self.snapshot.load().contains(source_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InMemoryKvStore, KvStore, TOKEN_KEY, USERNAME_KEY};
    use std::time::Duration;

    const TEXT_CATALOG: &str = "Database Schema:\n\nTable: orders\n - id (integer)\n - placed_at (date)\n\nTable: sales\n - region (text)\n";

    fn signed_in_cache(server: &mockito::ServerGuard) -> (SchemaCache, Arc<SessionStore>) {
        let kv = InMemoryKvStore::new();
        kv.apply(&[(TOKEN_KEY, "tok"), (USERNAME_KEY, "ada")], &[]).unwrap();
        let api = ApiClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let session = Arc::new(SessionStore::open(api.clone(), Arc::new(kv)).unwrap());
        let cache = SchemaCache::new(api, Arc::clone(&session), ConversationLog::new());
        (cache, session)
    }

    #[test]
    fn parses_text_catalog() {
        let snapshot = SchemaSnapshot::parse_text(TEXT_CATALOG);
        assert_eq!(snapshot.names(), vec!["orders", "sales"]);
        assert_eq!(snapshot.tables[0].columns, "id (integer)\nplaced_at (date)");
        assert!(snapshot.contains("SALES"));
    }

    #[test]
    fn text_without_tables_is_empty() {
        assert!(SchemaSnapshot::parse_text("Could not connect to database.").is_empty());
        assert!(SchemaSnapshot::parse_text("").is_empty());
    }

    #[test]
    fn structured_columns_are_rendered_as_text() {
        let table: TableDescription = serde_json::from_value(serde_json::json!({
            "name": "sales",
            "columns": [{"name": "id", "type": "integer"}, "region (text)"]
        }))
        .unwrap();
        assert_eq!(table.columns, "id (integer)\nregion (text)");
    }

    #[test]
    fn display_lists_tables() {
        let snapshot = SchemaSnapshot::parse_text(TEXT_CATALOG);
        let rendered = snapshot.to_string();
        assert!(rendered.starts_with("Table: orders\n  - id (integer)\n"));
        assert_eq!(SchemaSnapshot::default().to_string(), "No data sources connected yet.");
    }

    #[tokio::test]
    async fn refresh_replaces_snapshot() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/schema")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(serde_json::json!({ "schema": TEXT_CATALOG }).to_string())
            .create_async()
            .await;
        let (cache, _) = signed_in_cache(&server);
        assert!(cache.current().is_empty());

        cache.refresh().await.unwrap();
        assert_eq!(cache.current().names(), vec!["orders", "sales"]);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/schema")
            .with_status(200)
            .with_body(r#"{"schema": "Table: sales\n - id (integer)"}"#)
            .create_async()
            .await;
        let (cache, session) = signed_in_cache(&server);
        cache.refresh().await.unwrap();
        ok.remove_async().await;

        let _down = server
            .mock("GET", "/schema")
            .with_status(500)
            .with_body(r#"{"detail": "database offline"}"#)
            .create_async()
            .await;
        let err = cache.refresh().await.unwrap_err();
        assert_eq!(err.user_detail(), "database offline");
        assert_eq!(cache.current().names(), vec!["sales"]);
        assert!(session.is_signed_in());
        assert!(cache.log.is_empty());
    }

    #[tokio::test]
    async fn unauthorized_refresh_expires_session() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/schema")
            .with_status(401)
            .with_body(r#"{"detail": "Invalid session"}"#)
            .create_async()
            .await;
        let (cache, session) = signed_in_cache(&server);

        let err = cache.refresh().await.unwrap_err();
        assert!(err.is_auth_expired());
        assert_eq!(session.current_credential(), None);
        assert!(cache.current().is_empty());
        assert_eq!(cache.log.len(), 1);
        assert_eq!(cache.log.last().unwrap().content(), SESSION_EXPIRED_NOTICE);
    }

    #[tokio::test]
    async fn refresh_without_session_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let never = server.mock("GET", "/schema").expect(0).create_async().await;
        let api = ApiClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let session = Arc::new(SessionStore::open(api.clone(), Arc::new(InMemoryKvStore::new())).unwrap());
        let cache = SchemaCache::new(api, session, ConversationLog::new());

        let err = cache.refresh().await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(ValidationError::NotSignedIn)));
        never.assert_async().await;
    }
}
