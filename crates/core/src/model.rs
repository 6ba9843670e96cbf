//! Records persisted by the [`EmailStore`](crate::EmailStore).
//!
//! A [`PrefixRecord`] owns an access scope (the local-part of a catch-all
//! address) and a [`StoredEmail`] is one ingested message. The relation
//! between both is implicit: an email belongs to a prefix when its
//! `to_address` starts with `prefix@`, so prefixes created after the fact
//! still see the mail already received for their local-part.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of an access prefix.
pub const MAX_PREFIX_LEN: usize = 50;

/// Owner id written on emails that no prefix claimed.
pub const NO_OWNER_ID: i64 = 0;

/// One access scope of the catch-all mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixRecord {
    pub id: i64,

    /// Lowercase local-part, unique across the directory.
    pub prefix: String,

    /// PHC formatted hash of the access password.
    pub password_hash: String,

    pub user_id: i64,
    pub account_id: i64,

    /// Deactivation is a soft flag, records are never removed.
    pub is_active: bool,

    pub last_access_time: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values required to register a new prefix.
#[derive(Debug, Clone)]
pub struct NewPrefix {
    pub prefix: String,
    pub password_hash: String,
    pub user_id: i64,
    pub account_id: i64,
}

/// Lifecycle of a stored email.
///
/// Rows are inserted as [`Saving`](EmailStatus::Saving) and flipped once to
/// a terminal value after their attachments are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    Saving,
    Received,
    NoOwner,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Saving => "SAVING",
            EmailStatus::Received => "RECEIVED",
            EmailStatus::NoOwner => "NO_OWNER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SAVING" => Some(EmailStatus::Saving),
            "RECEIVED" => Some(EmailStatus::Received),
            "NO_OWNER" => Some(EmailStatus::NoOwner),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EmailStatus::Saving)
    }
}

/// Metadata of an attachment, the content itself lives in a
/// [`BlobStore`](crate::BlobStore) under `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub filename: String,
    pub content_type: String,
    pub size: u64,

    /// Content-addressed storage key, `sha256(content) + extension`.
    pub key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,

    /// Referenced from the HTML body through a `cid:` URL.
    pub inline: bool,
}

/// One entry of an address list header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// An email ready to be inserted, as produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEmail {
    pub message_id: String,
    pub from_address: String,
    pub from_name: String,
    pub to_address: String,
    pub to_name: String,

    /// Every `To` entry as written, independent of the resolved recipient.
    pub recipients: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,

    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub in_reply_to: String,
    pub references: String,
    pub received_at: DateTime<Utc>,
    pub user_id: i64,
    pub account_id: i64,
}

/// A persisted email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEmail {
    pub id: i64,
    pub message_id: String,
    pub from_address: String,
    pub from_name: String,
    pub to_address: String,
    pub to_name: String,
    pub recipients: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub in_reply_to: String,
    pub references: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentMeta>,
    pub user_id: i64,
    pub account_id: i64,
    pub status: EmailStatus,
    pub is_read: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredEmail {
    /// Builds the stored form of `email` as it looks right after insertion.
    pub fn from_new(id: i64, email: &NewEmail, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            message_id: email.message_id.clone(),
            from_address: email.from_address.clone(),
            from_name: email.from_name.clone(),
            to_address: email.to_address.clone(),
            to_name: email.to_name.clone(),
            recipients: email.recipients.clone(),
            cc: email.cc.clone(),
            bcc: email.bcc.clone(),
            subject: email.subject.clone(),
            body_text: email.body_text.clone(),
            body_html: email.body_html.clone(),
            in_reply_to: email.in_reply_to.clone(),
            references: email.references.clone(),
            received_at: email.received_at,
            attachments: Vec::new(),
            user_id: email.user_id,
            account_id: email.account_id,
            status: EmailStatus::Saving,
            is_read: false,
            is_deleted: false,
            created_at,
        }
    }
}

/// Normalizes a prefix for storage, returning `None` when it is not a
/// valid local-part (empty, too long, containing `@` or whitespace).
///
/// ```rust
/// assert_eq!(prefixmail_core::normalize_prefix(" Support "), Some("support".to_string()));
/// assert_eq!(prefixmail_core::normalize_prefix("a@b"), None);
/// ```
pub fn normalize_prefix(prefix: &str) -> Option<String> {
    let prefix = prefix.trim().to_lowercase();
    let valid = !prefix.is_empty()
        && prefix.chars().count() <= MAX_PREFIX_LEN
        && !prefix.chars().any(|c| c == '@' || c.is_whitespace());
    valid.then_some(prefix)
}
