//! Exports: query results to CSV, the conversation to JSON, and server-side
//! query results fetched through `/export`.

use chrono::Utc;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::conversation::{ConversationLog, Row};
use crate::error::{ClientError, ClientResult, ValidationError};
use crate::session::SessionStore;

/// Renders `rows` as CSV. The header is the key order of the first row; rows
/// are joined by `\n` with no trailing terminator.
pub fn rows_to_csv(rows: &[Row]) -> ClientResult<String> {
    let Some(first) = rows.first() else {
        return Ok(String::new());
    };
    let header: Vec<&str> = first.keys().map(String::as_str).collect();

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(&header).map_err(csv_error)?;
    for row in rows {
        let record: Vec<String> = header
            .iter()
            .map(|key| cell_text(row.get(*key).unwrap_or(&Value::Null)))
            .collect();
        writer.write_record(&record).map_err(csv_error)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ClientError::Io(e.into_error()))?;

    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(text)
}

/// Writes `rows` to `path`. Returns `None` without touching the filesystem
/// when there is nothing to export.
pub fn export_rows(rows: &[Row], path: impl AsRef<Path>) -> ClientResult<Option<PathBuf>> {
    if rows.is_empty() {
        info!("No rows to export");
        return Ok(None);
    }
    let path = path.as_ref();
    let text = rows_to_csv(rows)?;
    write_creating_parent(path, text.as_bytes())?;
    info!("Exported {} row(s) to {}", rows.len(), path.display());
    Ok(Some(path.to_path_buf()))
}

pub fn export_transcript(log: &ConversationLog, path: impl AsRef<Path>) -> ClientResult<PathBuf> {
    let path = path.as_ref();
    let entries = log.entries();
    let document = json!({
        "exported_at": Utc::now().to_rfc3339(),
        "entries": entries,
    });
    let text = serde_json::to_string_pretty(&document)
        .map_err(|e| ClientError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    write_creating_parent(path, text.as_bytes())?;
    info!("Saved {} chat entr(ies) to {}", entries.len(), path.display());
    Ok(path.to_path_buf())
}

/// Runs `sql` on the service and writes the returned CSV to `path`.
pub async fn download_query_csv(
    api: &ApiClient,
    session: &SessionStore,
    sql: &str,
    path: impl AsRef<Path>,
) -> ClientResult<PathBuf> {
    let path = path.as_ref();
    let Some(token) = session.current_credential() else {
        return Err(ValidationError::NotSignedIn.into());
    };
    if sql.trim().is_empty() {
        return Err(ValidationError::EmptyQuery.into());
    }

    let body = match api.export_csv(&token, sql.trim()).await {
        Ok(body) => body,
        Err(ClientError::AuthenticationExpired) => {
            session.expire();
            return Err(ClientError::AuthenticationExpired);
        }
        Err(e) => {
            warn!("Server-side export failed: {}", e);
            return Err(e);
        }
    };
    tokio::fs::create_dir_all(parent_dir(path)).await?;
    tokio::fs::write(path, body.as_bytes()).await?;
    info!("Downloaded query results to {}", path.display());
    Ok(path.to_path_buf())
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn csv_error(e: csv::Error) -> ClientError {
    match e.into_kind() {
        csv::ErrorKind::Io(io) => ClientError::Io(io),
        other => ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{:?}", other),
        )),
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn write_creating_parent(path: &Path, bytes: &[u8]) -> ClientResult<()> {
    std::fs::create_dir_all(parent_dir(path))?;
    std::fs::write(path, bytes)?;
    Ok(())
}
