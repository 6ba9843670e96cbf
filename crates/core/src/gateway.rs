//! Prefix and password gated read access to stored emails.
//!
//! Every read first authenticates the prefix, then only ever queries the
//! emails whose recipient starts with `prefix@`. Records leave the
//! gateway as [`EmailView`] values, which carry no owner ids.

use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    normalize_prefix, AccessConfig, AttachmentMeta, EmailStatus, EmailStore, Mailbox, NewPrefix,
    PasswordHasher, PrefixListing, PrefixRecord, SortDirection, StorageError, StoredEmail,
};

/// Window of the `recent` counter of [`PrefixStats`].
pub const RECENT_WINDOW_DAYS: i64 = 7;

/// Password verified against the decoy hash, for unknown prefixes.
const DECOY_PASSWORD: &str = "prefixmail-decoy-password";

/// Result type for access operations.
pub type AccessResult<T> = Result<T, AccessError>;

#[derive(Debug)]
pub enum AccessError {
    /// Unknown or inactive prefix, or wrong password.
    Unauthorized,
    NotFound,
    /// The request was rejected by validation.
    Invalid(String),
    /// An internal failure, its detail is only logged.
    Internal(String),
}

impl Display for AccessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::Unauthorized => write!(f, "Invalid prefix or password"),
            AccessError::NotFound => write!(f, "Email not found"),
            AccessError::Invalid(msg) => write!(f, "Invalid request: {msg}"),
            AccessError::Internal(_) => write!(f, "Internal error"),
        }
    }
}

impl Error for AccessError {}

impl From<StorageError> for AccessError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => AccessError::NotFound,
            StorageError::Conflict(msg) | StorageError::Invalid(msg) => AccessError::Invalid(msg),
            e => {
                warn!(error = %e, "Storage failure while serving access request");
                AccessError::Internal(e.to_string())
            }
        }
    }
}

/// Page request over the emails of a prefix. A zero `size` asks for the
/// largest page allowed.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub page: u32,
    pub size: usize,
    pub cursor: Option<i64>,
    pub direction: SortDirection,
}

/// Email as returned to prefix holders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailView {
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
    pub status: EmailStatus,
    pub is_read: bool,
}

impl From<StoredEmail> for EmailView {
    fn from(email: StoredEmail) -> Self {
        Self {
            id: email.id,
            message_id: email.message_id,
            from_address: email.from_address,
            from_name: email.from_name,
            to_address: email.to_address,
            to_name: email.to_name,
            recipients: email.recipients,
            cc: email.cc,
            bcc: email.bcc,
            subject: email.subject,
            body_text: email.body_text,
            body_html: email.body_html,
            in_reply_to: email.in_reply_to,
            references: email.references,
            received_at: email.received_at,
            attachments: email.attachments,
            status: email.status,
            is_read: email.is_read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPage {
    pub items: Vec<EmailView>,
    pub total: u64,
    pub page: u32,
    pub size: usize,
    pub has_more: bool,

    /// Cursor of the following page, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrefixStats {
    pub total: u64,
    pub recent: u64,
}

pub struct AccessGateway<S, H> {
    store: Arc<S>,
    hasher: H,
    max_page_size: usize,

    /// Hash checked when the prefix is unknown, so that both failure
    /// paths cost one verification.
    decoy_hash: String,
}

impl<S: EmailStore, H: PasswordHasher + Clone + 'static> AccessGateway<S, H> {
    pub fn new(store: Arc<S>, hasher: H, max_page_size: usize) -> AccessResult<Self> {
        let decoy_hash = hasher
            .hash(DECOY_PASSWORD)
            .map_err(|e| AccessError::Internal(e.to_string()))?;
        Ok(Self {
            store,
            hasher,
            max_page_size: max_page_size.max(1),
            decoy_hash,
        })
    }

    /// Builds a gateway sized by the `[access]` configuration section.
    pub fn from_config(store: Arc<S>, hasher: H, config: &AccessConfig) -> AccessResult<Self> {
        Self::new(store, hasher, config.max_page_size)
    }

    /// Authenticates a prefix and password pair, counting the access.
    pub async fn authenticate(&self, prefix: &str, password: &str) -> AccessResult<PrefixRecord> {
        let record = self.verify(prefix, password).await?;
        self.touch(&record).await;
        Ok(record)
    }

    pub async fn list_emails(
        &self,
        prefix: &str,
        password: &str,
        request: &ListRequest,
    ) -> AccessResult<EmailPage> {
        let record = self.verify(prefix, password).await?;
        let size = match request.size {
            0 => self.max_page_size,
            size => size.min(self.max_page_size),
        };
        let listing = PrefixListing {
            prefix: record.prefix.clone(),
            cursor: request.cursor,
            direction: request.direction,
            limit: size + 1,
        };

        let (_, emails, total) = tokio::join!(
            self.touch(&record),
            self.store.list_prefix_emails(&listing),
            self.store.count_prefix_emails(&record.prefix, None)
        );
        let mut emails = emails?;
        let has_more = emails.len() > size;
        emails.truncate(size);

        Ok(EmailPage {
            next_cursor: has_more.then(|| emails.last().map(|email| email.id)).flatten(),
            items: emails.into_iter().map(EmailView::from).collect(),
            total: total?,
            page: request.page,
            size,
            has_more,
        })
    }

    pub async fn get_detail(&self, prefix: &str, password: &str, email_id: i64) -> AccessResult<EmailView> {
        let record = self.verify(prefix, password).await?;
        let (_, email) = tokio::join!(
            self.touch(&record),
            self.store.prefix_email(&record.prefix, email_id)
        );
        email?.map(EmailView::from).ok_or(AccessError::NotFound)
    }

    pub async fn mark_read(&self, prefix: &str, password: &str, email_id: i64) -> AccessResult<()> {
        let record = self.verify(prefix, password).await?;
        match self.store.mark_email_read(&record.prefix, email_id).await? {
            true => Ok(()),
            false => Err(AccessError::NotFound),
        }
    }

    /// Soft deletes an email, it disappears from listings and details.
    pub async fn delete_email(&self, prefix: &str, password: &str, email_id: i64) -> AccessResult<()> {
        let record = self.verify(prefix, password).await?;
        match self.store.soft_delete_email(&record.prefix, email_id).await? {
            true => {
                info!(prefix = %record.prefix, email_id = email_id, "Email deleted");
                Ok(())
            }
            false => Err(AccessError::NotFound),
        }
    }

    pub async fn stats(&self, prefix: &str, password: &str) -> AccessResult<PrefixStats> {
        let record = self.verify(prefix, password).await?;
        let since = Utc::now() - Duration::days(RECENT_WINDOW_DAYS);
        let (total, recent) = tokio::join!(
            self.store.count_prefix_emails(&record.prefix, None),
            self.store.count_prefix_emails(&record.prefix, Some(since))
        );
        Ok(PrefixStats {
            total: total?,
            recent: recent?,
        })
    }

    /// Registers a prefix, storing a hash of `password`.
    pub async fn create_prefix(
        &self,
        prefix: &str,
        password: &str,
        user_id: i64,
        account_id: i64,
    ) -> AccessResult<PrefixRecord> {
        let name = normalize_prefix(prefix)
            .ok_or_else(|| AccessError::Invalid(format!("prefix '{prefix}'")))?;
        if password.is_empty() {
            return Err(AccessError::Invalid("empty password".to_string()));
        }
        let password_hash = self.hash(password).await?;
        let record = self
            .store
            .create_prefix(NewPrefix {
                prefix: name,
                password_hash,
                user_id,
                account_id,
            })
            .await?;
        info!(prefix = %record.prefix, id = record.id, "Prefix created");
        Ok(record)
    }

    pub async fn change_password(&self, prefix: &str, password: &str) -> AccessResult<()> {
        if password.is_empty() {
            return Err(AccessError::Invalid("empty password".to_string()));
        }
        let record = self.find(prefix).await?;
        let password_hash = self.hash(password).await?;
        self.store
            .update_prefix_password(record.id, &password_hash)
            .await?;
        info!(prefix = %record.prefix, "Prefix password changed");
        Ok(())
    }

    /// Activates or deactivates a prefix, its emails are kept either way.
    pub async fn set_active(&self, prefix: &str, is_active: bool) -> AccessResult<()> {
        let record = self.find(prefix).await?;
        self.store.set_prefix_active(record.id, is_active).await?;
        info!(prefix = %record.prefix, active = is_active, "Prefix state changed");
        Ok(())
    }

    async fn find(&self, prefix: &str) -> AccessResult<PrefixRecord> {
        let name = normalize_prefix(prefix).ok_or(AccessError::NotFound)?;
        self.store
            .find_prefix(&name)
            .await?
            .ok_or(AccessError::NotFound)
    }

    /// Checks the credentials, failing the same way whether the prefix is
    /// unknown, inactive or the password wrong.
    async fn verify(&self, prefix: &str, password: &str) -> AccessResult<PrefixRecord> {
        let record = match normalize_prefix(prefix) {
            Some(name) => self.store.find_prefix(&name).await?,
            None => None,
        }
        .filter(|record| record.is_active);

        let hash = record
            .as_ref()
            .map_or_else(|| self.decoy_hash.clone(), |record| record.password_hash.clone());
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AccessError::Internal(e.to_string()))?;

        match (record, verified) {
            (Some(record), true) => Ok(record),
            _ => {
                debug!(prefix = %prefix, "Access denied");
                Err(AccessError::Unauthorized)
            }
        }
    }

    async fn hash(&self, password: &str) -> AccessResult<String> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AccessError::Internal(e.to_string()))?
            .map_err(|e| AccessError::Internal(e.to_string()))
    }

    /// Counts an access, a failure never fails the read it belongs to.
    async fn touch(&self, record: &PrefixRecord) {
        if let Err(e) = self.store.record_access(record.id, Utc::now()).await {
            warn!(prefix = %record.prefix, error = %e, "Failed to record prefix access");
        }
    }
}
