//! Gateway configuration from environment variables.
//!
//! A `.env` file in the working directory is read first (see `main`); real
//! environment variables take precedence over it.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

const OPENAI_KEY_PLACEHOLDER: &str = "YOUR_OPENAI_API_KEY";
const DEEPGRAM_KEY_PLACEHOLDER: &str = "YOUR_DEEPGRAM_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid snapshot path: {0}")]
    InvalidPath(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// OpenAI / OpenAI-compatible chat completions endpoint used for extraction
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// `None` disables extraction
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    /// Extra attempts after the first failed one
    pub max_retries: u32,
}

/// Deepgram pre-recorded transcription endpoint
#[derive(Debug, Clone)]
pub struct DeepgramConfig {
    /// `None` disables transcription
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub language: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub openai: OpenAiConfig,
    pub deepgram: DeepgramConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; lets tests avoid touching the process env
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            openai: OpenAiConfig {
                api_key: api_key(lookup("OPENAI_API_KEY"), OPENAI_KEY_PLACEHOLDER),
                base_url: get("OPENAI_BASE_URL", "https://api.openai.com/v1"),
                model: get("OPENAI_MODEL", "gpt-4o"),
                timeout_seconds: parse_or(lookup("OPENAI_TIMEOUT_SECONDS"), 60),
                max_retries: parse_or(lookup("OPENAI_MAX_RETRIES"), 3),
            },
            deepgram: DeepgramConfig {
                api_key: api_key(lookup("DEEPGRAM_API_KEY"), DEEPGRAM_KEY_PLACEHOLDER),
                base_url: get("DEEPGRAM_BASE_URL", "https://api.deepgram.com/v1"),
                model: get("DEEPGRAM_MODEL", "nova-2"),
                language: get("DEEPGRAM_LANGUAGE", "en-US"),
                timeout_seconds: parse_or(lookup("DEEPGRAM_TIMEOUT_SECONDS"), 120),
            },
        }
    }
}

/// Parse into the target type directly; out of range or malformed values
/// fall back to the default
fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Blank keys and the template placeholder count as missing
fn api_key(raw: Option<String>, placeholder: &str) -> Option<String> {
    raw.map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty() && k != placeholder)
}

/// `<data_local_dir>/rolodex/knowledge_graph.db`, or the working directory
/// when the platform has no data dir
pub fn default_db_path() -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("rolodex");
    path.push("knowledge_graph.db");
    path
}

/// Validate snapshot path to prevent path traversal attacks
pub fn validate_db_path(path: &Path) -> Result<PathBuf, ConfigError> {
    // Check file extension FIRST (before any filesystem operations)
    match path.extension().and_then(|e| e.to_str()) {
        Some("db") | Some("json") => {}
        Some(_) => return Err(ConfigError::InvalidPath("extension must be .db or .json".into())),
        None => return Err(ConfigError::InvalidPath("missing .db or .json extension".into())),
    }

    // Canonicalize path to resolve .. and symlinks
    let canonical = match path.canonicalize() {
        Ok(canonical) => canonical,
        Err(_) => {
            // File doesn't exist yet: canonicalize parent and append filename
            let filename = path
                .file_name()
                .ok_or_else(|| ConfigError::InvalidPath("no filename".into()))?;
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(parent)?;
            parent.canonicalize()?.join(filename)
        }
    };

    if !canonical.is_absolute() {
        return Err(ConfigError::InvalidPath("path must be absolute".into()));
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = GatewayConfig::from_lookup(lookup(&[]));
        assert!(config.openai.api_key.is_none());
        assert_eq!(config.openai.model, "gpt-4o");
        assert_eq!(config.openai.base_url, "https://api.openai.com/v1");
        assert_eq!(config.openai.timeout_seconds, 60);
        assert_eq!(config.openai.max_retries, 3);
        assert!(config.deepgram.api_key.is_none());
        assert_eq!(config.deepgram.model, "nova-2");
        assert_eq!(config.deepgram.language, "en-US");
    }

    #[test]
    fn placeholders_count_as_missing() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "YOUR_OPENAI_API_KEY"),
            ("DEEPGRAM_API_KEY", "  "),
        ]));
        assert!(config.openai.api_key.is_none());
        assert!(config.deepgram.api_key.is_none());
    }

    #[test]
    fn overrides_apply() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_MODEL", "gpt-4o-mini"),
            ("OPENAI_MAX_RETRIES", "0"),
            ("OPENAI_TIMEOUT_SECONDS", "not a number"),
            ("DEEPGRAM_API_KEY", "dg-test"),
        ]));
        assert_eq!(config.openai.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.openai.model, "gpt-4o-mini");
        assert_eq!(config.openai.max_retries, 0);
        assert_eq!(config.openai.timeout_seconds, 60);
        assert_eq!(config.deepgram.api_key.as_deref(), Some("dg-test"));
    }

    #[test]
    fn out_of_range_numbers_use_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("OPENAI_MAX_RETRIES", "4294967296"),
            ("OPENAI_TIMEOUT_SECONDS", "-5"),
            ("DEEPGRAM_TIMEOUT_SECONDS", " 30 "),
        ]));
        assert_eq!(config.openai.max_retries, 3);
        assert_eq!(config.openai.timeout_seconds, 60);
        assert_eq!(config.deepgram.timeout_seconds, 30);
    }

    #[test]
    fn db_path_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("kg.json");
        let valid = validate_db_path(&path).unwrap();
        assert!(valid.is_absolute());
        assert!(valid.ends_with("sub/kg.json"));

        assert!(validate_db_path(&dir.path().join("kg.txt")).is_err());
        assert!(validate_db_path(&dir.path().join("kg")).is_err());
    }

    #[test]
    fn default_path_is_sqlite() {
        assert!(default_db_path().ends_with("rolodex/knowledge_graph.db"));
    }
}
