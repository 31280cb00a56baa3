use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
    /// Base URL of the GitHub REST API (GitHub Enterprise: https://host/api/v3)
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Directory holding the mounted app secret files
    /// (`github-application-id` and `github-private-key`)
    #[serde(default = "default_secret_dir")]
    pub secret_dir: PathBuf,
    /// Timeout for every GitHub API request in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Page size for listing endpoints, 1 to 100 (default: 100)
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            secret_dir: default_secret_dir(),
            request_timeout_secs: default_request_timeout(),
            per_page: default_per_page(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_secret_dir() -> PathBuf {
    PathBuf::from("/etc/mintauth/github-app")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_per_page() -> u32 {
    100
}

fn default_user_agent() -> String {
    format!("mintauth/{}", env!("CARGO_PKG_VERSION"))
}

/// Installation token lifetime bookkeeping.
///
/// A minted token is assumed valid for `validity_minutes` and is handed out
/// for the first `usage_window_minutes` of that. After that it is renewed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_validity_minutes")]
    pub validity_minutes: u32,
    #[serde(default = "default_usage_window_minutes")]
    pub usage_window_minutes: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            validity_minutes: default_validity_minutes(),
            usage_window_minutes: default_usage_window_minutes(),
        }
    }
}

fn default_validity_minutes() -> u32 {
    60
}

fn default_usage_window_minutes() -> u32 {
    30
}

impl TokenConfig {
    /// Replace unusable values with defaults.
    ///
    /// Zero falls back per field. A usage window that is not shorter than the
    /// validity resets both.
    pub fn validated(mut self) -> Self {
        if self.validity_minutes == 0 {
            self.validity_minutes = default_validity_minutes();
        }
        if self.usage_window_minutes == 0 {
            self.usage_window_minutes = default_usage_window_minutes();
        }

        if self.usage_window_minutes >= self.validity_minutes {
            warn!(
                validity_minutes = self.validity_minutes,
                usage_window_minutes = self.usage_window_minutes,
                "GitHub token usage window must be less than token validity, using defaults"
            );
            return Self::default();
        }

        self
    }

    pub fn validity(&self) -> Duration {
        Duration::minutes(i64::from(self.validity_minutes))
    }

    pub fn usage_window(&self) -> Duration {
        Duration::minutes(i64::from(self.usage_window_minutes))
    }

    /// Minimum remaining lifetime of a token that may still be handed out.
    pub fn renewal_threshold(&self) -> Duration {
        self.validity() - self.usage_window()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).with_context(|| "Failed to parse configuration file")?;
        config.tokens = config.tokens.validated();
        Ok(config)
    }
}
