use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// 顺序即稳定的 api_index（0..N-1），进程生命周期内不重排
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub model: String,
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_questions")]
    pub questions: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_reschedule_secs")]
    pub reschedule_secs: i64,
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_questions() -> Vec<String> {
    ["Hi", "How are you", "Ok"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_interval_secs() -> u64 {
    300
}

fn default_reschedule_secs() -> i64 {
    60
}

fn default_history_limit() -> i64 {
    50
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            questions: default_questions(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            interval_secs: default_interval_secs(),
            reschedule_secs: default_reschedule_secs(),
            history_limit: default_history_limit(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// 单次调用的重试策略（由配置提供，传入引擎）
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl KeepaliveConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "data/keeper.db".to_string(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = Self::find_config_file()?;
        let config_content = std::fs::read_to_string(&config_path)?;
        Self::parse(&config_content)
    }

    pub fn parse(content: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.providers.is_empty() {
            return Err("At least one [[providers]] entry is required".into());
        }
        if self.keepalive.questions.is_empty() {
            return Err("keepalive.questions must not be empty".into());
        }
        Ok(())
    }

    fn find_config_file() -> Result<String, Box<dyn std::error::Error>> {
        let possible_names = ["custom-config.toml", "config.toml"];

        for name in &possible_names {
            if Path::new(name).exists() {
                return Ok(name.to_string());
            }
        }

        Err("Configuration file not found. Please create custom-config.toml or config.toml".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[providers]]
        name = "示例API"
        model = "gpt-4o-mini"
        url = "https://api.example.com/v1/chat/completions"
        api_key = "sk-test"
    "#;

    #[test]
    fn parse_applies_defaults() {
        let settings = Settings::parse(MINIMAL).unwrap();
        assert_eq!(settings.providers.len(), 1);
        assert_eq!(settings.keepalive.max_retries, 3);
        assert_eq!(settings.keepalive.base_delay_ms, 1000);
        assert_eq!(settings.keepalive.reschedule_secs, 60);
        assert_eq!(settings.keepalive.history_limit, 50);
        assert_eq!(settings.keepalive.questions, vec!["Hi", "How are you", "Ok"]);
        assert_eq!(settings.server.port, 8000);
    }

    #[test]
    fn parse_rejects_empty_providers() {
        assert!(Settings::parse("providers = []").is_err());
    }

    #[test]
    fn parse_rejects_empty_question_pool() {
        let content = format!("{MINIMAL}\n[keepalive]\nquestions = []\n");
        assert!(Settings::parse(&content).is_err());
    }

    #[test]
    fn parse_overrides_tunables() {
        let content = format!(
            "{MINIMAL}\n[keepalive]\nmax_retries = 1\nbase_delay_ms = 10\ninterval_secs = 30\n"
        );
        let settings = Settings::parse(&content).unwrap();
        assert_eq!(settings.keepalive.max_retries, 1);
        assert_eq!(settings.keepalive.base_delay_ms, 10);
        assert_eq!(settings.keepalive.interval_secs, 30);
    }
}
