//! Ingestion Client
//!
//! Uploads the selected file under a normalized source name. Each attempt that
//! reaches the network appends exactly one entry to the conversation log;
//! locally rejected attempts append nothing.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::conversation::{ChatEntry, ConversationLog};
use crate::error::{ClientError, ClientResult, ValidationError};
use crate::schema_cache::SchemaCache;
use crate::session::SessionStore;
use crate::utils::TextUtils;

pub const ACCEPTED_EXTENSIONS: &[&str] = &["csv", "xlsx", "xls"];

#[derive(Clone)]
pub struct PendingFile {
    id: u64,
    pub file_name: String,
    pub bytes: Arc<Vec<u8>>,
}

impl fmt::Debug for PendingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingFile")
            .field("file_name", &self.file_name)
            .field("size", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested { source_name: String, file_name: String },
    SessionExpired,
    Failed { reason: String },
}

pub struct IngestionClient {
    api: ApiClient,
    session: Arc<SessionStore>,
    schema: Arc<SchemaCache>,
    log: ConversationLog,
    pending: Mutex<Option<PendingFile>>,
    next_selection: AtomicU64,
    uploading: AtomicBool,
}

/// Releases the single-upload slot however the upload future ends.
struct UploadSlot<'a>(&'a AtomicBool);

impl Drop for UploadSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl IngestionClient {
    pub fn new(
        api: ApiClient,
        session: Arc<SessionStore>,
        schema: Arc<SchemaCache>,
        log: ConversationLog,
    ) -> Self {
        Self {
            api,
            session,
            schema,
            log,
            pending: Mutex::new(None),
            next_selection: AtomicU64::new(1),
            uploading: AtomicBool::new(false),
        }
    }

    /// Records the file to ingest, replacing any earlier selection, and returns
    /// the source name suggested by its file name.
    pub fn select_file(&self, file_name: impl Into<String>, bytes: Vec<u8>) -> String {
        let file_name = file_name.into();
        let suggested = TextUtils::suggest_source_name(&file_name);
        info!("Selected '{}' ({} bytes), suggested source '{}'", file_name, bytes.len(), suggested);
        let selection = PendingFile {
            id: self.next_selection.fetch_add(1, Ordering::SeqCst),
            file_name,
            bytes: Arc::new(bytes),
        };
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(selection);
        suggested
    }

    pub async fn select_path(&self, path: &Path) -> ClientResult<String> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(self.select_file(file_name, bytes))
    }

    pub fn pending_file(&self) -> Option<PendingFile> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_selection(&self) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading.load(Ordering::SeqCst)
    }

    pub async fn ingest(&self, source_name: &str) -> Result<IngestOutcome, ValidationError> {
        let file = self.pending_file().ok_or(ValidationError::NoFileSelected)?;
        validate_file(&file)?;
        let source_name = TextUtils::normalize_source_name(source_name);
        if source_name.is_empty() {
            return Err(ValidationError::EmptySourceName);
        }

        if self
            .uploading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ValidationError::UploadInProgress);
        }
        let _slot = UploadSlot(&self.uploading);

        info!("Ingesting '{}' as '{}'", file.file_name, source_name);
        let token = self.session.current_credential();
        let result = self
            .api
            .upload(token.as_deref(), &file.file_name, file.bytes.to_vec(), &source_name)
            .await;

        let outcome = match result {
            Ok(()) => {
                self.log.append(ChatEntry::assistant(format!(
                    "I have successfully learned the data from \"{}\" as '{}'. You can now ask me questions like \"Summarize this table\" or \"What are the top 5 values?\".",
                    file.file_name, source_name
                )));
                if let Err(e) = self.schema.refresh().await {
                    warn!("Schema refresh after ingesting '{}' failed: {}", source_name, e);
                }
                self.clear_if_selected(file.id);
                IngestOutcome::Ingested {
                    source_name,
                    file_name: file.file_name,
                }
            }
            Err(ClientError::AuthenticationExpired) => {
                self.session.expire();
                self.log.append(ChatEntry::assistant(
                    "Upload failed: your session has expired. Please sign in again.",
                ));
                IngestOutcome::SessionExpired
            }
            Err(e) => {
                warn!("Ingestion of '{}' failed: {}", file.file_name, e);
                let reason = e.user_detail();
                self.log
                    .append(ChatEntry::assistant(format!("Upload failed: {}", reason)));
                IngestOutcome::Failed { reason }
            }
        };
        Ok(outcome)
    }

    fn clear_if_selected(&self, id: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.as_ref().is_some_and(|p| p.id == id) {
            *pending = None;
        }
    }
}

fn validate_file(file: &PendingFile) -> Result<(), ValidationError> {
    if file.bytes.is_empty() {
        return Err(ValidationError::EmptyFile);
    }
    let extension = Path::new(&file.file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !ACCEPTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ValidationError::UnsupportedFileType(file.file_name.clone()));
    }
    Ok(())
}
