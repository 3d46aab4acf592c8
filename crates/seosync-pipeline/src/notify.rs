//! Run summary text and best-effort chat delivery.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use seosync_core::RunSummary;
use seosync_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

const ERROR_EXCERPT_CHARS: usize = 200;

#[derive(Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("messaging endpoint returned status {0}")]
    Status(u16),
    #[error("invalid messaging endpoint: {0}")]
    Endpoint(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

pub struct TelegramSink {
    http: HttpFetcher,
    config: TelegramConfig,
    api_base: String,
}

impl TelegramSink {
    pub fn new(http: HttpFetcher, config: TelegramConfig) -> Self {
        Self {
            http,
            config,
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn endpoint(&self) -> Result<Url, NotifyError> {
        let raw = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.config.bot_token
        );
        Url::parse(&raw).map_err(|e| NotifyError::Endpoint(e.to_string()))
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let form = [
            ("chat_id", self.config.chat_id.as_str()),
            ("text", text),
            ("disable_web_page_preview", "true"),
        ];
        let status = self
            .http
            .post_form(self.endpoint()?, &form, NOTIFY_TIMEOUT)
            .await?;
        if status != StatusCode::OK {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() > ERROR_EXCERPT_CHARS {
        let head: String = message.chars().take(ERROR_EXCERPT_CHARS).collect();
        format!("{head}…")
    } else {
        message.to_string()
    }
}

pub fn build_summary_text(summary: &RunSummary, lookback_days: u32, now: DateTime<Utc>) -> String {
    let status = if summary.success { "OK" } else { "ERROR" };
    let mut lines = vec![
        format!("SEO Pipeline | {status}"),
        format!(
            "Target: {} (lookback={lookback_days})",
            summary.target_date.format("%Y-%m-%d")
        ),
        format!("GSC rows: {}", summary.search_rows),
        format!("GA4 rows: {}", summary.analytics_rows),
        format!("UTC run: {}", now.format("%Y-%m-%d %H:%M:%SZ")),
    ];

    match summary.error.as_deref().filter(|e| !e.is_empty()) {
        Some(error) => lines.push(format!("Error: {}", truncate_error(error))),
        None if summary.analytics_rows == 0 => lines.push("Notice: GA4 returned no rows".to_string()),
        None => {}
    }

    lines.join("\n")
}

/// Builds the run summary and hands it to the sink, if any. Never fails.
pub struct Notifier {
    sink: Option<Box<dyn NotificationSink>>,
    lookback_days: u32,
}

impl Notifier {
    pub fn new(sink: Option<Box<dyn NotificationSink>>, lookback_days: u32) -> Self {
        Self {
            sink,
            lookback_days,
        }
    }

    pub fn telegram(http: &HttpFetcher, config: Option<TelegramConfig>, lookback_days: u32) -> Self {
        let sink = config
            .map(|c| Box::new(TelegramSink::new(http.clone(), c)) as Box<dyn NotificationSink>);
        Self::new(sink, lookback_days)
    }

    /// Returns whether the message was delivered.
    pub async fn notify(&self, summary: &RunSummary) -> bool {
        let text = build_summary_text(summary, self.lookback_days, Utc::now());
        let Some(sink) = &self.sink else {
            debug!("pipeline notification not sent; messaging is not configured");
            return false;
        };
        match sink.send(&text).await {
            Ok(()) => {
                info!(sink = sink.name(), "pipeline notification sent");
                true
            }
            Err(err) => {
                warn!(sink = sink.name(), error = %err, "pipeline notification failed");
                false
            }
        }
    }
}
