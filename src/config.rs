use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_RELAY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_DASHBOARD_PATH: &str = "/telegram-chat";

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: Option<String>,
    /// Telegram chat that receives visitor messages and sends replies.
    pub operator_chat_id: Option<i64>,
    /// Public origin of the site, used for dashboard deep links and webhook registration.
    pub public_base_url: Option<String>,
    pub dashboard_path: String,
    pub webhook_secret: Option<String>,
    pub register_webhook: bool,
    pub db_path: PathBuf,
    pub port: u16,
    pub relay_timeout: Duration,
    pub notify_unmatched_replies: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_token: None,
            operator_chat_id: None,
            public_base_url: None,
            dashboard_path: DEFAULT_DASHBOARD_PATH.to_string(),
            webhook_secret: None,
            register_webhook: false,
            db_path: default_db_path(),
            port: DEFAULT_PORT,
            relay_timeout: Duration::from_secs(DEFAULT_RELAY_TIMEOUT_SECS),
            notify_unmatched_replies: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = Self::default();

        let operator_chat_id = get("TELEGRAM_CHAT_ID")
            .map(|v| v.parse::<i64>())
            .transpose()
            .context("TELEGRAM_CHAT_ID must be a numeric chat id")?;

        let port = get("PORT")
            .map(|v| v.parse::<u16>())
            .transpose()
            .context("PORT must be a valid port number")?
            .unwrap_or(defaults.port);

        let relay_timeout = get("RELAY_TIMEOUT_SECS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("RELAY_TIMEOUT_SECS must be a whole number of seconds")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.relay_timeout);

        Ok(Self {
            bot_token: get("TELEGRAM_BOT_TOKEN").or_else(|| get("TELOXIDE_TOKEN")),
            operator_chat_id,
            public_base_url: get("PUBLIC_BASE_URL"),
            dashboard_path: get("DASHBOARD_PATH").unwrap_or(defaults.dashboard_path),
            webhook_secret: get("TELEGRAM_WEBHOOK_SECRET"),
            register_webhook: get("TELEGRAM_REGISTER_WEBHOOK")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.register_webhook),
            db_path: get("CHATRELAY_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port,
            relay_timeout,
            notify_unmatched_replies: get("NOTIFY_UNMATCHED_REPLIES")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.notify_unmatched_replies),
        })
    }

    /// Operator dashboard link that pre-selects `session_id`.
    pub fn dashboard_link(&self, session_id: &str) -> Option<String> {
        let base = self.public_base_url.as_deref()?.trim_end_matches('/');
        let path = self.dashboard_path.trim_start_matches('/');
        Some(format!("{base}/{path}#{session_id}"))
    }

    pub fn webhook_url(&self) -> Option<String> {
        let base = self.public_base_url.as_deref()?.trim_end_matches('/');
        Some(format!("{base}/telegram/webhook"))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_db_path() -> PathBuf {
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home_dir)
        .join(".chatrelay")
        .join("chatrelay.db")
}
