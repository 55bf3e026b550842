//! Configuration for the VCS service.

use std::env;

const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_GITLAB_API_URL: &str = "https://gitlab.com/api/v4";

/// Service configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,
    /// Whether webhook processing is enabled.
    pub enabled: bool,
    /// Public base URL providers call back to.
    pub webhook_callback_url: String,
    /// GitHub provider settings, if enabled.
    pub github: Option<ProviderConfig>,
    /// GitLab provider settings, if enabled.
    pub gitlab: Option<ProviderConfig>,
    /// Base URL of the records API releases are published to.
    pub records_api_url: String,
    /// Bearer token for the records API.
    pub records_api_token: Option<String>,
}

/// Settings for a single provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// REST API base URL.
    pub api_url: String,
    /// Secret used to sign or authenticate webhook deliveries.
    pub webhook_secret: Option<String>,
}

fn flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.is_empty())
}

impl ProviderConfig {
    /// Provider settings for `prefix` (`GITHUB`, `GITLAB`), unless
    /// `{prefix}_ENABLED` is false.
    fn from_env(prefix: &str, default_api_url: &str) -> Option<Self> {
        if !flag(&format!("{prefix}_ENABLED"), true) {
            return None;
        }
        Some(Self {
            api_url: non_empty(&format!("{prefix}_API_URL"))
                .unwrap_or_else(|| default_api_url.to_string()),
            webhook_secret: non_empty(&format!("{prefix}_WEBHOOK_SECRET")),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: env::var("VCS_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8082),
            enabled: flag("VCS_ENABLED", true),
            webhook_callback_url: non_empty("WEBHOOK_CALLBACK_URL")
                .unwrap_or_else(|| "http://localhost:8082".to_string()),
            github: ProviderConfig::from_env("GITHUB", DEFAULT_GITHUB_API_URL),
            gitlab: ProviderConfig::from_env("GITLAB", DEFAULT_GITLAB_API_URL),
            records_api_url: non_empty("RECORDS_API_URL")
                .unwrap_or_else(|| "http://localhost:5000/api".to_string()),
            records_api_token: non_empty("RECORDS_API_TOKEN"),
        }
    }
}
