//! Persistence of prefixes, emails and fetch watermarks.
//!
//! [`EmailStore`] is the single seam between the pipeline, the poller and
//! the access gateway on one side and a storage engine on the other.
//! [`SqliteStore`] is the production engine, [`MemoryStore`] backs tests
//! and embedded uses.

use std::{
    fmt::{self, Display, Formatter},
    io,
};

use chrono::{DateTime, Utc};

use crate::{AttachmentMeta, EmailStatus, NewEmail, NewPrefix, PrefixRecord, StoredEmail};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// The targeted record does not exist.
    NotFound,
    /// A uniqueness constraint was violated.
    Conflict(String),
    /// The given value can not be stored.
    Invalid(String),
    /// An I/O error occurred.
    Io(io::Error),
    /// A storage engine error occurred.
    Engine(String),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound => write!(f, "Record not found"),
            StorageError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            StorageError::Invalid(msg) => write!(f, "Invalid value: {msg}"),
            StorageError::Io(e) => write!(f, "I/O error: {e}"),
            StorageError::Engine(msg) => write!(f, "Storage error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound
        } else {
            StorageError::Io(e)
        }
    }
}

/// Outcome of [`EmailStore::insert_email`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was created with the given id.
    Inserted(i64),
    /// A row with the same Message-ID already exists.
    Duplicate(i64),
}

/// Order of a prefix listing, by email id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

/// A page request over the emails of one prefix.
#[derive(Debug, Clone)]
pub struct PrefixListing {
    pub prefix: String,

    /// Exclusive bound on the email id, `None` starts from the edge.
    pub cursor: Option<i64>,

    pub direction: SortDirection,
    pub limit: usize,
}

/// Trait for storage engines.
///
/// Email queries scoped by a prefix only ever return rows whose
/// `to_address` starts with `prefix@` (case-insensitive), that are not
/// soft-deleted and that reached a terminal status.
pub trait EmailStore: Send + Sync {
    /// Registers a new prefix, failing with [`StorageError::Conflict`] when
    /// the (lowercased) prefix already exists.
    fn create_prefix(
        &self,
        prefix: NewPrefix,
    ) -> impl std::future::Future<Output = StorageResult<PrefixRecord>> + Send;

    /// Looks up a prefix by name regardless of its active flag.
    fn find_prefix(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = StorageResult<Option<PrefixRecord>>> + Send;

    /// Lists the active prefixes.
    fn active_prefixes(
        &self,
    ) -> impl std::future::Future<Output = StorageResult<Vec<PrefixRecord>>> + Send;

    fn update_prefix_password(
        &self,
        prefix_id: i64,
        password_hash: &str,
    ) -> impl std::future::Future<Output = StorageResult<()>> + Send;

    fn set_prefix_active(
        &self,
        prefix_id: i64,
        is_active: bool,
    ) -> impl std::future::Future<Output = StorageResult<()>> + Send;

    /// Increments the access counter and sets the last access time, as a
    /// single atomic update.
    fn record_access(
        &self,
        prefix_id: i64,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = StorageResult<()>> + Send;

    fn find_email_by_message_id(
        &self,
        message_id: &str,
    ) -> impl std::future::Future<Output = StorageResult<Option<StoredEmail>>> + Send;

    /// Inserts an email in the `SAVING` status. Concurrent inserts of the
    /// same Message-ID create exactly one row, the others observe
    /// [`InsertOutcome::Duplicate`].
    fn insert_email(
        &self,
        email: &NewEmail,
    ) -> impl std::future::Future<Output = StorageResult<InsertOutcome>> + Send;

    /// Records attachment metadata, in order, for an email.
    fn add_attachments(
        &self,
        email_id: i64,
        attachments: &[AttachmentMeta],
    ) -> impl std::future::Future<Output = StorageResult<()>> + Send;

    /// Moves an email out of `SAVING` into `status`, optionally replacing
    /// its HTML body. Returns `false` when the email is not in `SAVING`.
    fn finalize_email(
        &self,
        email_id: i64,
        status: EmailStatus,
        body_html: Option<&str>,
    ) -> impl std::future::Future<Output = StorageResult<bool>> + Send;

    /// Deletes emails stuck in `SAVING` that were created before `before`,
    /// together with their attachment metadata. Returns the number of
    /// emails removed.
    fn purge_stale_saving(
        &self,
        before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = StorageResult<usize>> + Send;

    fn list_prefix_emails(
        &self,
        listing: &PrefixListing,
    ) -> impl std::future::Future<Output = StorageResult<Vec<StoredEmail>>> + Send;

    /// Counts the visible emails of a prefix, optionally only those
    /// received at or after `since`.
    fn count_prefix_emails(
        &self,
        prefix: &str,
        since: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = StorageResult<u64>> + Send;

    fn prefix_email(
        &self,
        prefix: &str,
        email_id: i64,
    ) -> impl std::future::Future<Output = StorageResult<Option<StoredEmail>>> + Send;

    /// Returns `false` when the email is not visible to the prefix.
    fn mark_email_read(
        &self,
        prefix: &str,
        email_id: i64,
    ) -> impl std::future::Future<Output = StorageResult<bool>> + Send;

    /// Returns `false` when the email is not visible to the prefix.
    fn soft_delete_email(
        &self,
        prefix: &str,
        email_id: i64,
    ) -> impl std::future::Future<Output = StorageResult<bool>> + Send;

    /// Returns the last successful fetch time of a mail source.
    fn fetch_watermark(
        &self,
        source: &str,
    ) -> impl std::future::Future<Output = StorageResult<Option<DateTime<Utc>>>> + Send;

    fn set_fetch_watermark(
        &self,
        source: &str,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = StorageResult<()>> + Send;
}
