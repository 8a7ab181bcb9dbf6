use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::entity::{Entity, EntityMap};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Process configuration, loaded once at startup from a TOML file.
/// Secrets may be overridden by environment variables so the file can be
/// committed without them.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub bank: BankSettings,
    pub approval: ApprovalSettings,
    pub llm: LlmSettings,
    pub embedder: EmbedderSettings,
    pub slack: SlackSettings,
    pub batch: BatchSettings,
    #[serde(rename = "match")]
    pub matching: MatchSettings,
    pub pattern: PatternSettings,
    pub gl: GlSettings,
    pub session: SessionSettings,
    pub scheduler: SchedulerSettings,
    #[serde(rename = "entity")]
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tally.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BankSettings {
    pub api_base: String,
    pub token: String,
    pub private_key_path: Option<PathBuf>,
    pub rate_per_sec: f64,
}

impl Default for BankSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.transferwise.com".into(),
            token: String::new(),
            private_key_path: None,
            rate_per_sec: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    pub base_url: String,
    pub api_key: String,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8800".into(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub enabled: bool,
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: "https://api.anthropic.com".into(),
            api_key: String::new(),
            model: "claude-3-haiku-20240307".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbedderSettings {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub dimension: usize,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com".into(),
            api_key: String::new(),
            model: "text-embedding-3-small".into(),
            dimension: 1536,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlackSettings {
    pub webhook_url: Option<String>,
    /// Quarantined records per batch above which a discrepancy alert fires.
    pub quarantine_alert_threshold: usize,
    /// Absolute amount above which a single unmatched transaction alerts.
    pub large_amount_threshold: f64,
    pub digest_hour: u32,
}

impl Default for SlackSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            quarantine_alert_threshold: 5,
            large_amount_threshold: 50_000.0,
            digest_hour: 9,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub max_tx_per_run: usize,
    pub deadline_secs: u64,
    pub tx_deadline_secs: u64,
    pub worker_pool: usize,
    pub lease_ttl_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_tx_per_run: 500,
            deadline_secs: 30 * 60,
            tx_deadline_secs: 5 * 60,
            worker_pool: 8,
            lease_ttl_secs: 2 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchSettings {
    pub date_window_days: i64,
    pub fuzzy_similarity_min: f64,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            date_window_days: 7,
            fuzzy_similarity_min: 0.85,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternSettings {
    pub similarity_min: f64,
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self {
            similarity_min: 0.85,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlSettings {
    pub cache_ttl_secs: u64,
}

impl Default for GlSettings {
    fn default() -> Self {
        Self { cache_ttl_secs: 600 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Five-field cron expression for reconciliation runs.
    pub cron: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            cron: "0 */3 * * *".into(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut settings: Settings = toml::from_str(&raw)?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Secrets come from the environment when present, so the config file
    /// never needs to hold them.
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("TALLY_BANK_TOKEN") {
            self.bank.token = token;
        }
        if let Ok(key) = std::env::var("TALLY_APPROVAL_API_KEY") {
            self.approval.api_key = key;
        }
        if let Ok(key) = std::env::var("TALLY_LLM_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(key) = std::env::var("TALLY_EMBEDDER_API_KEY") {
            self.embedder.api_key = key;
        }
        if let Ok(url) = std::env::var("TALLY_SLACK_WEBHOOK_URL") {
            self.slack.webhook_url = Some(url);
        }
    }

    pub fn entity_map(&self) -> EntityMap {
        EntityMap::new(self.entities.clone())
    }
}
