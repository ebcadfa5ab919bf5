//! Response bodies of the remote service

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::conversation::Row;
use crate::schema_cache::TableDescription;

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SchemaResponse {
    #[serde(default)]
    pub schema: Option<SchemaPayload>,
}

/// `/schema` returns either the free-text catalog or a list of tables.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SchemaPayload {
    Tables(Vec<TableDescription>),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub data: Option<Vec<Row>>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub plan: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub reflection: Option<String>,
    #[serde(default)]
    pub is_ambiguous: Option<bool>,
    #[serde(default)]
    pub potential_matches: Option<Vec<String>>,
}

impl ChatResponse {
    pub fn ambiguous(&self) -> bool {
        self.is_ambiguous.unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Value,
}

/// Rationale fields are free text; structured values are kept as compact JSON.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}
