use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::FetchOptions;
use crate::taxonomy::EventKind;
use crate::polling::PollingOptions;
use crate::webhook::{TlsOptions, WebhookOptions};

/// Largest batch the Bot API hands out per `getUpdates` call.
const MAX_POLL_LIMIT: u32 = 100;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    #[default]
    Polling,
    Webhook,
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchMode::Polling => write!(f, "polling"),
            LaunchMode::Webhook => write!(f, "webhook"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub mode: LaunchMode,
    /// Discard updates queued while the bot was offline.
    #[serde(default)]
    pub drop_pending_updates: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Long-poll timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub allowed_updates: Vec<String>,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    /// Public host name the Bot API should call, e.g. "bot.example.com".
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default = "default_webhook_path")]
    pub path: String,
    #[serde(default)]
    pub secret_token: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Update kinds requested from `setWebhook`; empty keeps the server default.
    #[serde(default)]
    pub allowed_updates: Vec<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SchedulerConfig {
    /// Six-field cron expression; when set, `tick` is emitted on it.
    #[serde(default)]
    pub tick_cron: Option<String>,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_limit() -> u32 {
    MAX_POLL_LIMIT
}

fn default_timeout() -> u64 {
    30
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_webhook_path() -> String {
    "/".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_limit(),
            timeout: default_timeout(),
            allowed_updates: Vec::new(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            domain: None,
            path: default_webhook_path(),
            secret_token: None,
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            allowed_updates: Vec::new(),
            tls: None,
        }
    }
}

impl PollingConfig {
    pub fn options(&self) -> PollingOptions {
        PollingOptions {
            offset: self.offset,
            fetch: FetchOptions {
                limit: self.limit.clamp(1, MAX_POLL_LIMIT),
                timeout: self.timeout,
                allowed_updates: self.allowed_updates.clone(),
            },
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

impl WebhookConfig {
    pub fn options(&self) -> WebhookOptions {
        WebhookOptions {
            path: self.path.clone(),
            secret_token: self.secret_token.clone(),
            max_body_bytes: self.max_body_bytes,
            tls: self.tls.as_ref().map(|tls| TlsOptions {
                cert_path: tls.cert_path.clone(),
                key_path: tls.key_path.clone(),
            }),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Public URL handed to `setWebhook`. Without `tls` a reverse proxy is
    /// assumed on 443; with it the Bot API must reach `port` directly.
    pub fn public_url(&self) -> Option<String> {
        let domain = self.domain.as_deref()?.trim_end_matches('/');
        let url = match &self.tls {
            Some(_) if self.port != 443 => {
                format!("https://{}:{}{}", domain, self.port, self.path)
            }
            _ => format!("https://{}{}", domain, self.path),
        };
        Some(url)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            bail!("telegram.bot_token must not be empty");
        }

        if !self.webhook.path.starts_with('/') {
            bail!("webhook.path must start with '/'");
        }

        if let Some(secret) = &self.webhook.secret_token {
            let valid_chars = secret
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if secret.is_empty() || secret.len() > 256 || !valid_chars {
                bail!("webhook.secret_token must be 1-256 characters of A-Z, a-z, 0-9, _ and -");
            }
        }

        if let Some(tls) = &self.webhook.tls {
            if tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty() {
                bail!("webhook.tls needs both cert_path and key_path");
            }
        }

        if self.telegram.mode == LaunchMode::Webhook && self.webhook.domain.is_none() {
            bail!("webhook.domain is required when telegram.mode = \"webhook\"");
        }

        let requested = [
            ("polling", &self.polling.allowed_updates),
            ("webhook", &self.webhook.allowed_updates),
        ];
        for (section, kinds) in requested {
            if let Some(bad) = kinds
                .iter()
                .find(|name| EventKind::from_envelope_field(name).is_none())
            {
                bail!("{}.allowed_updates: '{}' is not an update kind", section, bad);
            }
        }

        if self.polling.retry_base_delay_ms > self.polling.retry_max_delay_ms {
            bail!("polling.retry_base_delay_ms must not exceed polling.retry_max_delay_ms");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse("[telegram]\nbot_token = \"123:abc\"\n").unwrap();

        assert_eq!(config.telegram.mode, LaunchMode::Polling);
        assert_eq!(config.telegram.api_base, "https://api.telegram.org");
        assert_eq!(config.polling.limit, 100);
        assert_eq!(config.polling.timeout, 30);
        assert_eq!(config.webhook.path, "/");
        assert_eq!(config.webhook.bind_addr(), "0.0.0.0:8443");
        assert!(config.scheduler.tick_cron.is_none());
    }

    #[test]
    fn test_polling_options_clamp_limit() {
        let config = Config::parse(
            r#"
[telegram]
bot_token = "t"

[polling]
offset = 12
limit = 500
timeout = 5
allowed_updates = ["message", "callback_query"]
retry_base_delay_ms = 10
retry_max_delay_ms = 20
"#,
        )
        .unwrap();

        let options = config.polling.options();
        assert_eq!(options.offset, 12);
        assert_eq!(options.fetch.limit, 100);
        assert_eq!(options.fetch.timeout, 5);
        assert_eq!(options.fetch.allowed_updates, vec!["message", "callback_query"]);
        assert_eq!(options.retry_max_delay, Duration::from_millis(20));
    }

    #[test]
    fn test_webhook_mode_requires_domain() {
        let err = Config::parse("[telegram]\nbot_token = \"t\"\nmode = \"webhook\"\n").unwrap_err();
        assert!(err.to_string().contains("webhook.domain"));

        let config = Config::parse(
            r#"
[telegram]
bot_token = "t"
mode = "webhook"

[webhook]
domain = "bot.example.com"
path = "/hook"
secret_token = "abc_DEF-123"
port = 8080
"#,
        )
        .unwrap();
        assert_eq!(
            config.webhook.public_url().as_deref(),
            Some("https://bot.example.com/hook")
        );
        assert_eq!(config.webhook.options().secret_token.as_deref(), Some("abc_DEF-123"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let cases = [
            "[webhook]\npath = \"hook\"\n",
            "[webhook]\nsecret_token = \"has space\"\n",
            "[webhook]\nsecret_token = \"\"\n",
            "[webhook.tls]\ncert_path = \"\"\nkey_path = \"k\"\n",
            "[webhook.tls]\ncert_path = \"c\"\n",
            "[polling]\nretry_base_delay_ms = 10\nretry_max_delay_ms = 1\n",
            "[polling]\nallowed_updates = [\"message\", \"reply\"]\n",
            "[webhook]\nallowed_updates = [\"tick\"]\n",
        ];
        for case in cases {
            let content = format!("[telegram]\nbot_token = \"t\"\n{case}");
            assert!(Config::parse(&content).is_err(), "accepted: {case}");
        }

        assert!(Config::parse("[telegram]\nbot_token = \"  \"\n").is_err());
        assert!(Config::parse("[polling]\nlimit = 10\n").is_err());
    }

    #[test]
    fn test_tls_is_passed_to_webhook_options() {
        let config = Config::parse(
            r#"
[telegram]
bot_token = "t"
mode = "webhook"

[webhook]
domain = "bot.example.com"
path = "/hook"

[webhook.tls]
cert_path = "/etc/updraft/cert.pem"
key_path = "/etc/updraft/key.pem"
"#,
        )
        .unwrap();

        let tls = config.webhook.options().tls.unwrap();
        assert_eq!(tls.cert_path, PathBuf::from("/etc/updraft/cert.pem"));
        assert_eq!(tls.key_path, PathBuf::from("/etc/updraft/key.pem"));
        assert_eq!(
            config.webhook.public_url().as_deref(),
            Some("https://bot.example.com:8443/hook")
        );

        let mut on_443 = config.webhook.clone();
        on_443.port = 443;
        assert_eq!(on_443.public_url().as_deref(), Some("https://bot.example.com/hook"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[telegram]\nbot_token = \"from-file\"\n[scheduler]\ntick_cron = \"0 * * * * *\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.telegram.bot_token, "from-file");
        assert_eq!(config.scheduler.tick_cron.as_deref(), Some("0 * * * * *"));

        let missing = Config::load(Path::new("/nonexistent/updraft.toml")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read config file"));
    }
}
