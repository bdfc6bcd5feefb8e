use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Diary ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiaryConfig {
    /// IANA timezone name used to derive a user's diary date from event
    /// timestamps.  Falls back to UTC when the name is unrecognised.
    pub timezone: String,
    /// Per-user overrides keyed by platform user id (Feishu open id).
    pub user_timezones: BTreeMap<String, String>,
    /// Prefix for generated document titles, e.g. `"Diary - 2025-03-14"`.
    pub title_prefix: String,
    /// Answer each diary entry with a short model-written follow-up question
    /// instead of a plain acknowledgement.
    pub follow_up_questions: bool,
    /// Upper bound for a follow-up call; a slow model gets the plain
    /// acknowledgement.
    pub follow_up_timeout_secs: u64,
}

impl Default for DiaryConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Shanghai".to_string(),
            user_timezones: BTreeMap::new(),
            title_prefix: "Diary".to_string(),
            follow_up_questions: true,
            follow_up_timeout_secs: 10,
        }
    }
}

// ── LLM ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `openai` (any OpenAI-compatible chat completions endpoint) or `ollama`.
    pub provider: String,
    pub model: String,
    /// Base URL of the OpenAI-compatible API.  Overridden by `LLM_API_BASE`.
    pub api_base: String,
    /// Bearer key for the OpenAI-compatible API.  Overridden by `LLM_API_KEY`.
    pub api_key: String,
    pub ollama_model: String,
    /// Overridden at runtime by `OLLAMA_BASE_URL` when set.
    pub ollama_base_url: String,
    pub temperature: f32,
    /// Upper bound for a single model call.  A timed-out call is transient.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            ollama_model: "llama3.1:8b".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            temperature: 0.7,
            timeout_secs: 30,
        }
    }
}

// ── Feishu ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeishuConfig {
    pub app_id: String,
    pub app_secret: String,
    pub base_url: String,
    /// Document links are rendered as `document_url_base + document_id`.
    pub document_url_base: String,
    /// Optional drive folder new diary documents are created in.
    pub folder_token: String,
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            base_url: "https://open.feishu.cn/open-apis".to_string(),
            document_url_base: "https://www.feishu.cn/docx/".to_string(),
            folder_token: String::new(),
        }
    }
}

impl FeishuConfig {
    pub fn has_credentials(&self) -> bool {
        !self.app_id.trim().is_empty() && !self.app_secret.trim().is_empty()
    }
}

// ── Storage ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// redb file holding the sessions and documents tables.
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: ".diarist/diarist.redb".to_string(),
        }
    }
}

// ── Sync ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempt cap shared by summarizer retries and pending-document
    /// reconciliation.  The first try counts as attempt 1.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub remote_timeout_secs: u64,
    pub db_timeout_ms: u64,
    /// How often the background reconciliation sweep runs.  `0` disables it.
    pub sweep_interval_secs: u64,
    /// A session left `aggregating` longer than this is recovered by the
    /// sweep.  Keep it above the summarizer's worst-case retry time.
    pub stale_aggregation_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            remote_timeout_secs: 15,
            db_timeout_ms: 2_000,
            sweep_interval_secs: 60,
            stale_aggregation_secs: 900,
        }
    }
}

// ── Ingest ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Platform event ids seen within this window are treated as redeliveries.
    pub dedupe_ttl_secs: u64,
    pub dedupe_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedupe_ttl_secs: 300,
            dedupe_capacity: 4_096,
        }
    }
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Directory for daily-rolling log files.  Empty disables file logging.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub diary: DiaryConfig,
    pub llm: LlmConfig,
    pub feishu: FeishuConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub ingest: IngestConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut String); 6] = [
            ("LLM_API_KEY", &mut self.llm.api_key),
            ("LLM_API_BASE", &mut self.llm.api_base),
            ("OLLAMA_BASE_URL", &mut self.llm.ollama_base_url),
            ("FEISHU_APP_ID", &mut self.feishu.app_id),
            ("FEISHU_APP_SECRET", &mut self.feishu.app_secret),
            ("DIARIST_DB_PATH", &mut self.storage.database_path),
        ];
        for (name, slot) in overrides {
            if let Ok(value) = env::var(name) {
                if !value.trim().is_empty() {
                    *slot = value;
                }
            }
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn active_model(&self) -> &str {
        if self.llm.provider.eq_ignore_ascii_case("ollama") {
            &self.llm.ollama_model
        } else {
            &self.llm.model
        }
    }

    /// Timezone name for `user_id`, falling back to the diary default.
    pub fn timezone_for(&self, user_id: &str) -> &str {
        self.diary
            .user_timezones
            .get(user_id)
            .map(String::as_str)
            .unwrap_or(&self.diary.timezone)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // ── Defaults ───────────────────────────────────────────────────────────

    #[test]
    fn sync_defaults_bound_retries() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.sync.max_attempts, 3, "attempt cap must default to 3");
        assert!(cfg.sync.base_backoff_ms <= cfg.sync.max_backoff_ms);
        assert!(cfg.sync.remote_timeout_secs > 0);
        assert!(cfg.sync.db_timeout_ms > 0);
    }

    #[test]
    fn cosmetic_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.diary.timezone, "Asia/Shanghai");
        assert_eq!(cfg.diary.title_prefix, "Diary");
        assert_eq!(cfg.llm.provider, "openai");
        assert_eq!(cfg.llm.timeout_secs, 30);
        assert_eq!(cfg.feishu.base_url, "https://open.feishu.cn/open-apis");
        assert_eq!(cfg.storage.database_path, ".diarist/diarist.redb");
        assert_eq!(cfg.ingest.dedupe_ttl_secs, 300);
        assert_eq!(cfg.telemetry.log_level, "info");
        assert!(cfg.telemetry.log_dir.is_empty());
        assert!(!cfg.feishu.has_credentials());
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.diary.timezone, "Asia/Shanghai");
        assert_eq!(cfg.sync.max_attempts, 3);
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[diary]
timezone = "Europe/Berlin"
title_prefix = "Tagebuch"

[diary.user_timezones]
ou_alice = "America/New_York"

[llm]
provider = "ollama"
ollama_model = "qwen2.5:7b"

[sync]
max_attempts = 5
sweep_interval_secs = 0
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.diary.timezone, "Europe/Berlin");
        assert_eq!(cfg.diary.title_prefix, "Tagebuch");
        assert_eq!(cfg.timezone_for("ou_alice"), "America/New_York");
        assert_eq!(cfg.timezone_for("ou_bob"), "Europe/Berlin");
        assert_eq!(cfg.active_model(), "qwen2.5:7b");
        assert_eq!(cfg.sync.max_attempts, 5);
        assert_eq!(cfg.sync.sweep_interval_secs, 0);
        // Unspecified keys keep their defaults
        assert_eq!(cfg.sync.remote_timeout_secs, 15);
        assert_eq!(cfg.sync.stale_aggregation_secs, 900);
        assert!(cfg.diary.follow_up_questions);
        assert_eq!(cfg.storage.database_path, ".diarist/diarist.redb");
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.diary.timezone = "UTC".to_string();
        cfg.diary
            .user_timezones
            .insert("ou_x".to_string(), "Asia/Tokyo".to_string());
        cfg.feishu.folder_token = "fldcn123".to_string();
        cfg.sync.base_backoff_ms = 50;

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.diary.timezone, "UTC");
        assert_eq!(loaded.timezone_for("ou_x"), "Asia/Tokyo");
        assert_eq!(loaded.feishu.folder_token, "fldcn123");
        assert_eq!(loaded.sync.base_backoff_ms, 50);
    }

    // ── active_model ───────────────────────────────────────────────────────

    #[test]
    fn active_model_defaults_to_openai_model() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.active_model(), "gpt-4o-mini");
    }

    #[test]
    fn active_model_case_insensitive() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "Ollama".to_string();
        assert_eq!(cfg.active_model(), "llama3.1:8b");
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_feishu_secret_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feishu.toml");
        fs::write(
            &path,
            r#"
[feishu]
app_id = "cli_from_file"
app_secret = "from-file"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("FEISHU_APP_SECRET", "from-env") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.feishu.app_id, "cli_from_file");
        assert_eq!(cfg.feishu.app_secret, "from-env");
        assert!(cfg.feishu.has_credentials());
        unsafe { env::remove_var("FEISHU_APP_SECRET") };
    }

    #[test]
    fn blank_env_value_does_not_clobber_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("llm.toml");
        fs::write(
            &path,
            r#"
[llm]
api_key = "sk-from-file"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("LLM_API_KEY", "   ") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.llm.api_key, "sk-from-file");
        unsafe { env::remove_var("LLM_API_KEY") };
    }
}
