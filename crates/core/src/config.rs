use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::{IngestSettings, MatchMode, NoOwnerPolicy};

/// Top-level configuration for Prefixmail.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub imap: ImapConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub forward: ForwardConfig,

    #[serde(default)]
    pub access: AccessConfig,
}

impl Config {
    /// Builds the immutable settings snapshot used by one ingestion run.
    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            receive: self.ingest.receive,
            strip_plus_tag: self.ingest.strip_plus_tag,
            no_owner: self.ingest.no_owner,
            match_mode: self.ingest.match_mode,
            allowed_domains: self.ingest.allowed_domains.clone(),
            rule_addresses: self.ingest.rule_addresses.clone(),
            message_id_domain: self.ingest.message_id_domain.clone(),
            attachment_url: self.ingest.attachment_url.clone(),
            stale_saving: Duration::from_secs(self.ingest.stale_saving_secs),
            notify_targets: self.notify.telegram.chat_ids.clone(),
            forward_targets: self.forward.targets.clone(),
        }
    }
}

/// IMAP mailbox polled for new messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ImapConfig {
    #[serde(default = "default_imap_host")]
    pub host: String,

    #[serde(default = "default_imap_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_mailbox")]
    pub mailbox: String,

    #[serde(default = "default_true")]
    pub tls: bool,

    /// PEM bundle of trusted roots, the webpki roots are used when unset.
    pub ca_file: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Messages fetched and ingested per batch within a cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: default_imap_host(),
            port: default_imap_port(),
            username: String::new(),
            password: String::new(),
            mailbox: default_mailbox(),
            tls: true,
            ca_file: None,
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path of the SQLite database.
    #[serde(default = "default_database")]
    pub database: String,

    /// Directory holding attachment contents.
    #[serde(default = "default_attachments")]
    pub attachments: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            attachments: default_attachments(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Global receive switch, `false` drops every incoming message.
    #[serde(default = "default_true")]
    pub receive: bool,

    #[serde(default = "default_true")]
    pub strip_plus_tag: bool,

    #[serde(default)]
    pub no_owner: NoOwnerPolicy,

    #[serde(default)]
    pub match_mode: MatchMode,

    /// Recipient domains eligible for prefix matching, empty accepts all.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Recipients whose mail is fanned out, empty fans out everything.
    #[serde(default)]
    pub rule_addresses: Vec<String>,

    /// Domain of synthesized Message-ID values.
    #[serde(default = "default_message_id_domain")]
    pub message_id_domain: String,

    /// Base URL replacing `cid:` references of inline attachments.
    pub attachment_url: Option<String>,

    #[serde(default = "default_stale_saving_secs")]
    pub stale_saving_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            receive: true,
            strip_plus_tag: true,
            no_owner: NoOwnerPolicy::default(),
            match_mode: MatchMode::default(),
            allowed_domains: Vec::new(),
            rule_addresses: Vec::new(),
            message_id_domain: default_message_id_domain(),
            attachment_url: None,
            stale_saving_secs: default_stale_saving_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

/// Telegram bot used for new mail notifications, disabled without token.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,

    #[serde(default)]
    pub chat_ids: Vec<String>,

    #[serde(default = "default_telegram_api")]
    pub api_base: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_ids: Vec::new(),
            api_base: default_telegram_api(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// SMTP relay used to forward the original message, disabled without host.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    pub host: Option<String>,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Envelope sender of forwarded messages.
    #[serde(default = "default_forward_from")]
    pub from: String,

    /// Upgrade a plain connection with STARTTLS instead of implicit TLS.
    #[serde(default = "default_true")]
    pub starttls: bool,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub targets: Vec<String>,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_smtp_port(),
            username: None,
            password: None,
            from: default_forward_from(),
            starttls: true,
            timeout_secs: default_timeout_secs(),
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
        }
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    Io(std::io::Error),
    /// A parse error occurred deserializing TOML.
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "Config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_imap_host() -> String {
    "127.0.0.1".to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    900
}

fn default_batch_size() -> usize {
    50
}

fn default_database() -> String {
    "data/prefixmail.db".to_string()
}

fn default_attachments() -> String {
    "data/attachments".to_string()
}

fn default_message_id_domain() -> String {
    "prefixmail.local".to_string()
}

fn default_stale_saving_secs() -> u64 {
    600
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_forward_from() -> String {
    "prefixmail@localhost".to_string()
}

fn default_max_page_size() -> usize {
    30
}

fn default_true() -> bool {
    true
}
