use std::{error::Error, fmt::Display, future::Future, pin::Pin, sync::OnceLock, time::Duration};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::{NormalizedEmail, TelegramConfig};

/// Maximum number of body characters carried by a notification.
pub const NOTICE_BODY_LIMIT: usize = 3000;

/// Result type for notification operations.
pub type NotifyResult<T> = Result<T, NotifyError>;

/// Boxed future type for notifiers, enabling object safety.
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = NotifyResult<()>> + Send + 'a>>;

#[derive(Debug)]
pub enum NotifyError {
    /// The channel could not be reached.
    Connection(String),
    /// The channel answered with a failure status.
    Rejected(String),
}

impl Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Connection(msg) => write!(f, "Connection error: {msg}"),
            NotifyError::Rejected(msg) => write!(f, "Notification rejected: {msg}"),
        }
    }
}

impl Error for NotifyError {}

/// Summary of a newly received email sent to notification channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub subject: String,
    pub from_name: String,
    pub from_address: String,
    pub recipient: String,
    pub received_at: DateTime<Utc>,

    /// Plain text body, already truncated to [`NOTICE_BODY_LIMIT`].
    pub body: String,
}

impl Notice {
    pub fn from_email(normalized: &NormalizedEmail) -> Self {
        let email = &normalized.email;
        let body = match email.body_text.trim().is_empty() {
            true => strip_tags(&email.body_html),
            false => email.body_text.clone(),
        };
        Self {
            subject: email.subject.clone(),
            from_name: email.from_name.clone(),
            from_address: email.from_address.clone(),
            recipient: email.to_address.clone(),
            received_at: email.received_at,
            body: truncate_chars(body.trim(), NOTICE_BODY_LIMIT),
        }
    }

    /// Renders the notice as Telegram flavoured HTML.
    pub fn to_html(&self) -> String {
        format!(
            "<b>{}</b>\n\nFrom: {} &lt;{}&gt;\nTo: {}\nTime: {}\n\n{}",
            escape_html(&self.subject),
            escape_html(&self.from_name),
            escape_html(&self.from_address),
            escape_html(&self.recipient),
            self.received_at.format("%Y-%m-%d %H:%M:%S UTC"),
            escape_html(&self.body),
        )
    }
}

/// Escapes the characters Telegram HTML parsing reserves.
///
/// ```rust
/// assert_eq!(prefixmail_core::escape_html("<a & b>"), "&lt;a &amp; b&gt;");
/// ```
pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn tag_regex() -> &'static Regex {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").unwrap())
}

fn strip_tags(html: &str) -> String {
    tag_regex().replace_all(html, " ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(value: &str, limit: usize) -> String {
    match value.char_indices().nth(limit) {
        Some((index, _)) => format!("{}...", &value[..index]),
        None => value.to_string(),
    }
}

/// Trait for new mail notification channels.
pub trait Notifier: Send + Sync {
    /// Sends `notice` to one target of the channel.
    fn notify<'a>(&'a self, target: &'a str, notice: &'a Notice) -> NotifyFuture<'a>;

    /// Returns the name of this channel.
    fn name(&self) -> &str;
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Notifier posting to the Telegram Bot API `sendMessage` method, the
/// targets being chat ids.
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, api_base: &str, timeout: Duration) -> NotifyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), bot_token),
        })
    }

    /// Builds the notifier from configuration, `None` when no bot token
    /// is configured.
    pub fn from_config(config: &TelegramConfig) -> NotifyResult<Option<Self>> {
        let Some(token) = config.bot_token.as_deref().filter(|token| !token.is_empty()) else {
            return Ok(None);
        };
        Self::new(token, &config.api_base, Duration::from_secs(config.timeout_secs)).map(Some)
    }
}

impl Notifier for TelegramNotifier {
    fn notify<'a>(&'a self, target: &'a str, notice: &'a Notice) -> NotifyFuture<'a> {
        Box::pin(async move {
            let payload = SendMessage {
                chat_id: target,
                text: notice.to_html(),
                parse_mode: "HTML",
                disable_web_page_preview: true,
            };
            let response = self
                .client
                .post(&self.endpoint)
                .json(&payload)
                .send()
                .await
                .map_err(|e| NotifyError::Connection(e.without_url().to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(NotifyError::Rejected(format!("{status}: {body}")));
            }
            debug!(chat_id = %target, "Telegram notification sent");
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "telegram"
    }
}
