//! Pipeline configuration.
//!
//! Tunables come from an optional JSON config file with environment
//! variables taking precedence, so a deployment can pin the backend in a
//! file and still swap keys per environment.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API key for the completion backend.
    pub api_key: String,
    /// Base URL of the OpenAI-compatible backend, including version prefix.
    pub base_url: String,
    /// Preferred models in failover order. Models deployed on the backend
    /// but absent from this list are appended after it.
    pub model_allowlist: Vec<String>,
    /// Delay between page requests, milliseconds. Politeness, not
    /// correctness.
    pub page_delay_ms: u64,
    /// Retry budget for a single page request.
    pub page_retries: u32,
    /// Delay between single-page retries, milliseconds.
    pub page_retry_delay_ms: u64,
    /// Maximum reconciliation passes before an integrity failure.
    pub max_passes: u32,
    /// Per-request timeout for the announcement source, seconds.
    pub source_timeout_secs: u64,
    /// Round budget for the agent loop.
    pub max_rounds: u32,
    /// Transport retry attempts per completion call.
    pub completion_attempts: u32,
    /// How far before the delisting date the announcement window opens,
    /// days.
    pub lookback_days: i64,
    /// Maximum document text length fed to a round, bytes.
    pub max_doc_len: usize,
    /// Endpoint of the document-conversion service.
    pub converter_url: String,
    /// Per-request timeout for document conversion, seconds.
    pub converter_timeout_secs: u64,
    /// Path of the checkpoint ledger.
    pub checkpoint_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "http://127.0.0.1:23333/v1".to_string(),
            model_allowlist: Vec::new(),
            page_delay_ms: 300,
            page_retries: 5,
            page_retry_delay_ms: 5_000,
            max_passes: 10,
            source_timeout_secs: 15,
            max_rounds: 8,
            completion_attempts: 3,
            lookback_days: 540,
            max_doc_len: 6_000,
            converter_url: "http://127.0.0.1:8008/convert".to_string(),
            converter_timeout_secs: 60,
            checkpoint_path: PathBuf::from("progress.json"),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the config file if given, then
    /// environment variables.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut config = match config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.api_key = key;
        }
        if let Ok(url) = env::var("LLM_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(url) = env::var("CONVERTER_URL") {
            config.converter_url = url;
        }
        if let Ok(models) = env::var("LLM_MODELS") {
            config.model_allowlist = models
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
        }

        Ok(config)
    }
}
