/// Alert delivery. Best-effort: a failed delivery is logged and never affects
/// the restart decision.
use crate::config::NotifyConfig;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Outbound sink for human-readable alerts.
pub trait Notifier: Send + Sync {
    fn send(&self, text: &str) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Deliver `text`, logging instead of propagating failures.
pub async fn notify_best_effort<N: Notifier>(notifier: &N, text: &str) {
    if let Err(e) = notifier.send(text).await {
        tracing::warn!(error = %e, "failed to deliver notification");
    }
}

/// Sends messages through the Telegram Bot API.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Http { source: e })?;
        Ok(Self {
            client,
            api_base: TELEGRAM_API.to_string(),
            token,
            chat_id,
        })
    }

    /// Point at a different API host.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.token
        )
    }
}

impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        let response = self
            .client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Http { source: e })?;

        let status = response.status();
        let parsed: Option<TelegramResponse> = response.json().await.ok();
        match parsed {
            Some(r) if r.ok && status.is_success() => Ok(()),
            Some(r) => Err(NotifyError::Rejected {
                status: status.as_u16(),
                description: r.description.unwrap_or_default(),
            }),
            None => Err(NotifyError::Rejected {
                status: status.as_u16(),
                description: "unparseable response".to_string(),
            }),
        }
    }
}

/// Fallback when no delivery channel is configured: alerts only reach the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        tracing::info!(alert = %text, "notification");
        Ok(())
    }
}

/// The notifier selected by configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredNotifier {
    Telegram(TelegramNotifier),
    Log(LogNotifier),
}

impl ConfiguredNotifier {
    /// Telegram when both token and chat id are set (config first, then the
    /// `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID` environment), otherwise log only.
    pub fn from_config(config: &NotifyConfig) -> Self {
        let pick = |value: &Option<String>, var: &str| {
            value
                .clone()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        };
        let token = pick(&config.telegram_bot_token, "TELEGRAM_BOT_TOKEN");
        let chat_id = pick(&config.telegram_chat_id, "TELEGRAM_CHAT_ID");

        match (token, chat_id) {
            (Some(token), Some(chat_id)) => {
                match TelegramNotifier::new(token, chat_id, Duration::from_secs(config.timeout_secs)) {
                    Ok(n) => ConfiguredNotifier::Telegram(n.with_api_base(&config.api_base)),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to build Telegram client, alerts go to the log only");
                        ConfiguredNotifier::Log(LogNotifier)
                    }
                }
            }
            _ => {
                tracing::info!("Telegram not configured, alerts go to the log only");
                ConfiguredNotifier::Log(LogNotifier)
            }
        }
    }
}

impl Notifier for ConfiguredNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        match self {
            ConfiguredNotifier::Telegram(n) => n.send(text).await,
            ConfiguredNotifier::Log(n) => n.send(text).await,
        }
    }
}

/// Errors from notification delivery.
#[derive(Debug)]
pub enum NotifyError {
    Http { source: reqwest::Error },
    Rejected { status: u16, description: String },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Http { source } => write!(f, "notification request failed: {source}"),
            NotifyError::Rejected {
                status,
                description,
            } => write!(f, "notification rejected (HTTP {status}): {description}"),
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Http { source } => Some(source),
            NotifyError::Rejected { .. } => None,
        }
    }
}
