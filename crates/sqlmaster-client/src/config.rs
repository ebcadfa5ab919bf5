// sqlmaster/crates/sqlmaster-client/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_CLARIFICATION_TEMPLATE: &str = "In the table(s) [{sources}], {question}";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub session_db_path: PathBuf,
    pub request_timeout_seconds: u64,
    pub clarification_template: String,
    pub export_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            session_db_path: PathBuf::from("./data/session.db"),
            request_timeout_seconds: 120,
            clarification_template: DEFAULT_CLARIFICATION_TEMPLATE.to_string(),
            export_dir: PathBuf::from("./exports"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source; missing keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_base_url = lookup("API_BASE_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base_url);
        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(anyhow::anyhow!(
                "API_BASE_URL must start with http:// or https://, got: {}",
                api_base_url
            ));
        }

        let request_timeout_seconds = match lookup("REQUEST_TIMEOUT_SECONDS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("REQUEST_TIMEOUT_SECONDS is not a number: {}", raw))?,
            None => defaults.request_timeout_seconds,
        };
        if request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("REQUEST_TIMEOUT_SECONDS must be greater than zero"));
        }

        let clarification_template = lookup("CLARIFICATION_TEMPLATE")
            .unwrap_or(defaults.clarification_template);
        if !clarification_template.contains("{question}") {
            return Err(anyhow::anyhow!(
                "CLARIFICATION_TEMPLATE must contain the {{question}} placeholder"
            ));
        }

        Ok(Self {
            api_base_url,
            session_db_path: lookup("SESSION_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.session_db_path),
            request_timeout_seconds,
            clarification_template,
            export_dir: lookup("EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API Base URL: {}", self.api_base_url);
        info!("- Session DB: {}", self.session_db_path.display());
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
        info!("- Clarification Template: {}", self.clarification_template);
        info!("- Export Dir: {}", self.export_dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ===== Defaults =====

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.api_base_url, "http://localhost:8000");
        assert_eq!(config.session_db_path, PathBuf::from("./data/session.db"));
        assert_eq!(config.request_timeout_seconds, 120);
        assert_eq!(config.clarification_template, DEFAULT_CLARIFICATION_TEMPLATE);
        assert_eq!(config.export_dir, PathBuf::from("./exports"));
    }

    #[test]
    fn test_request_timeout_duration() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
    }

    // ===== Overrides =====

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let config = Config::from_lookup(lookup_from(&[("API_BASE_URL", "https://nl2sql.example.com/")])).unwrap();
        assert_eq!(config.api_base_url, "https://nl2sql.example.com");
    }

    #[test]
    fn test_paths_and_timeout_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("SESSION_DB_PATH", "/tmp/s.db"),
            ("EXPORT_DIR", "/tmp/out"),
            ("REQUEST_TIMEOUT_SECONDS", " 30 "),
        ]))
        .unwrap();

        assert_eq!(config.session_db_path, PathBuf::from("/tmp/s.db"));
        assert_eq!(config.export_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.request_timeout_seconds, 30);
    }

    // ===== Rejections =====

    #[test]
    fn test_base_url_without_scheme_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[("API_BASE_URL", "localhost:8000")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_non_numeric_timeout_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[("REQUEST_TIMEOUT_SECONDS", "soon")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[("REQUEST_TIMEOUT_SECONDS", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_template_without_question_placeholder_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[("CLARIFICATION_TEMPLATE", "Use {sources}")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_custom_template_is_kept() {
        let config = Config::from_lookup(lookup_from(&[(
            "CLARIFICATION_TEMPLATE",
            "Only look at {sources}: {question}",
        )]))
        .unwrap();
        assert_eq!(config.clarification_template, "Only look at {sources}: {question}");
    }
}
