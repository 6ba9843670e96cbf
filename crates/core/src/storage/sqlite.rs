use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::{
    normalize_prefix, AttachmentMeta, EmailStatus, EmailStore, InsertOutcome, Mailbox, NewEmail,
    NewPrefix, PrefixListing, PrefixRecord, SortDirection, StorageError, StorageResult, StoredEmail,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS prefixes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prefix TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    user_id INTEGER NOT NULL DEFAULT 0,
    account_id INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_access_time INTEGER,
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS emails (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL UNIQUE,
    from_address TEXT NOT NULL,
    from_name TEXT NOT NULL,
    to_address TEXT NOT NULL,
    to_name TEXT NOT NULL,
    recipients TEXT NOT NULL DEFAULT '[]',
    cc TEXT NOT NULL DEFAULT '[]',
    bcc TEXT NOT NULL DEFAULT '[]',
    subject TEXT NOT NULL,
    body_text TEXT NOT NULL,
    body_html TEXT NOT NULL,
    in_reply_to TEXT NOT NULL,
    refs TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    account_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_emails_to_address ON emails (to_address);
CREATE INDEX IF NOT EXISTS idx_emails_status ON emails (status, created_at);
CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    filename TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    storage_key TEXT NOT NULL,
    content_id TEXT,
    inline INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attachments_email ON attachments (email_id);
CREATE TABLE IF NOT EXISTS fetch_state (
    source TEXT PRIMARY KEY,
    last_fetch INTEGER NOT NULL
);
";

const PREFIX_COLUMNS: &str = "id, prefix, password_hash, user_id, account_id, is_active, \
    last_access_time, access_count, created_at, updated_at";

const EMAIL_COLUMNS: &str = "id, message_id, from_address, from_name, to_address, to_name, \
    subject, body_text, body_html, in_reply_to, refs, received_at, user_id, account_id, \
    status, is_read, is_deleted, created_at, recipients, cc, bcc";

/// Emails visible to a prefix scope, `?1` being the escaped LIKE pattern.
const VISIBLE_IN_SCOPE: &str =
    r"to_address LIKE ?1 ESCAPE '\' AND is_deleted = 0 AND status != 'SAVING'";

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound,
            other => StorageError::Engine(other.to_string()),
        }
    }
}

/// SQLite backed [`EmailStore`].
///
/// All statements run on a blocking thread through
/// [`tokio::task::spawn_blocking`], the connection is shared behind a
/// mutex so that check-then-write sequences are atomic.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (creating when missing) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StorageError::Engine("connection lock poisoned".to_string()))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Engine(e.to_string()))?
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Builds the `LIKE` pattern matching `prefix@...`, escaping wildcards.
fn scope_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 2);
    for c in prefix.to_lowercase().chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str("@%");
    pattern
}

fn prefix_from_row(row: &Row<'_>) -> rusqlite::Result<PrefixRecord> {
    Ok(PrefixRecord {
        id: row.get(0)?,
        prefix: row.get(1)?,
        password_hash: row.get(2)?,
        user_id: row.get(3)?,
        account_id: row.get(4)?,
        is_active: row.get(5)?,
        last_access_time: row.get::<_, Option<i64>>(6)?.map(from_millis),
        access_count: row.get(7)?,
        created_at: from_millis(row.get(8)?),
        updated_at: from_millis(row.get(9)?),
    })
}

fn email_from_row(row: &Row<'_>) -> rusqlite::Result<StoredEmail> {
    let status: String = row.get(14)?;
    Ok(StoredEmail {
        id: row.get(0)?,
        message_id: row.get(1)?,
        from_address: row.get(2)?,
        from_name: row.get(3)?,
        to_address: row.get(4)?,
        to_name: row.get(5)?,
        subject: row.get(6)?,
        body_text: row.get(7)?,
        body_html: row.get(8)?,
        in_reply_to: row.get(9)?,
        references: row.get(10)?,
        received_at: from_millis(row.get(11)?),
        attachments: Vec::new(),
        user_id: row.get(12)?,
        account_id: row.get(13)?,
        // unknown values stay hidden from every scope
        status: EmailStatus::parse(&status).unwrap_or(EmailStatus::Saving),
        is_read: row.get(15)?,
        is_deleted: row.get(16)?,
        created_at: from_millis(row.get(17)?),
        recipients: mailboxes_from_json(&row.get::<_, String>(18)?),
        cc: mailboxes_from_json(&row.get::<_, String>(19)?),
        bcc: mailboxes_from_json(&row.get::<_, String>(20)?),
    })
}

/// Address lists are stored as JSON arrays of `{address, name}`.
fn mailboxes_to_json(mailboxes: &[Mailbox]) -> StorageResult<String> {
    serde_json::to_string(mailboxes).map_err(|e| StorageError::Invalid(e.to_string()))
}

fn mailboxes_from_json(json: &str) -> Vec<Mailbox> {
    serde_json::from_str(json).unwrap_or_else(|e| {
        warn!(error = %e, "Unreadable address list, treated as empty");
        Vec::new()
    })
}

fn load_attachments(conn: &Connection, email_id: i64) -> rusqlite::Result<Vec<AttachmentMeta>> {
    let mut statement = conn.prepare_cached(
        "SELECT filename, content_type, size, storage_key, content_id, inline \
         FROM attachments WHERE email_id = ?1 ORDER BY position ASC, id ASC",
    )?;
    let rows = statement.query_map(params![email_id], |row| {
        Ok(AttachmentMeta {
            filename: row.get(0)?,
            content_type: row.get(1)?,
            size: row.get::<_, i64>(2)?.max(0) as u64,
            key: row.get(3)?,
            content_id: row.get(4)?,
            inline: row.get(5)?,
        })
    })?;
    rows.collect()
}

fn with_attachments(conn: &Connection, mut email: StoredEmail) -> rusqlite::Result<StoredEmail> {
    email.attachments = load_attachments(conn, email.id)?;
    Ok(email)
}

fn require_changed(changed: usize) -> StorageResult<()> {
    match changed {
        0 => Err(StorageError::NotFound),
        _ => Ok(()),
    }
}

impl EmailStore for SqliteStore {
    async fn create_prefix(&self, prefix: NewPrefix) -> StorageResult<PrefixRecord> {
        let name = normalize_prefix(&prefix.prefix)
            .ok_or_else(|| StorageError::Invalid(format!("prefix '{}'", prefix.prefix)))?;
        self.run(move |conn| {
            let now = to_millis(Utc::now());
            let changed = conn.execute(
                "INSERT INTO prefixes (prefix, password_hash, user_id, account_id, is_active, \
                 access_count, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?5) \
                 ON CONFLICT(prefix) DO NOTHING",
                params![name, prefix.password_hash, prefix.user_id, prefix.account_id, now],
            )?;
            if changed == 0 {
                return Err(StorageError::Conflict(format!("prefix '{name}' already exists")));
            }
            let id = conn.last_insert_rowid();
            let record = conn.query_row(
                &format!("SELECT {PREFIX_COLUMNS} FROM prefixes WHERE id = ?1"),
                params![id],
                prefix_from_row,
            )?;
            Ok(record)
        })
        .await
    }

    async fn find_prefix(&self, prefix: &str) -> StorageResult<Option<PrefixRecord>> {
        let name = prefix.trim().to_lowercase();
        self.run(move |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {PREFIX_COLUMNS} FROM prefixes WHERE prefix = ?1"),
                    params![name],
                    prefix_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn active_prefixes(&self) -> StorageResult<Vec<PrefixRecord>> {
        self.run(|conn| {
            let mut statement = conn.prepare_cached(&format!(
                "SELECT {PREFIX_COLUMNS} FROM prefixes WHERE is_active = 1 ORDER BY id ASC"
            ))?;
            let records = statement
                .query_map([], prefix_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn update_prefix_password(&self, prefix_id: i64, password_hash: &str) -> StorageResult<()> {
        let password_hash = password_hash.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE prefixes SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
                params![password_hash, to_millis(Utc::now()), prefix_id],
            )?;
            require_changed(changed)
        })
        .await
    }

    async fn set_prefix_active(&self, prefix_id: i64, is_active: bool) -> StorageResult<()> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE prefixes SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![is_active, to_millis(Utc::now()), prefix_id],
            )?;
            require_changed(changed)
        })
        .await
    }

    async fn record_access(&self, prefix_id: i64, at: DateTime<Utc>) -> StorageResult<()> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE prefixes SET access_count = access_count + 1, last_access_time = ?1 \
                 WHERE id = ?2",
                params![to_millis(at), prefix_id],
            )?;
            require_changed(changed)
        })
        .await
    }

    async fn find_email_by_message_id(&self, message_id: &str) -> StorageResult<Option<StoredEmail>> {
        let message_id = message_id.to_string();
        self.run(move |conn| {
            let email = conn
                .query_row(
                    &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE message_id = ?1"),
                    params![message_id],
                    email_from_row,
                )
                .optional()?;
            match email {
                Some(email) => Ok(Some(with_attachments(conn, email)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn insert_email(&self, email: &NewEmail) -> StorageResult<InsertOutcome> {
        let email = email.clone();
        let recipients = mailboxes_to_json(&email.recipients)?;
        let cc = mailboxes_to_json(&email.cc)?;
        let bcc = mailboxes_to_json(&email.bcc)?;
        self.run(move |conn| {
            let changed = conn.execute(
                "INSERT INTO emails (message_id, from_address, from_name, to_address, to_name, \
                 subject, body_text, body_html, in_reply_to, refs, received_at, user_id, \
                 account_id, status, is_read, is_deleted, created_at, recipients, cc, bcc) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 0, 0, ?15, \
                 ?16, ?17, ?18) \
                 ON CONFLICT(message_id) DO NOTHING",
                params![
                    email.message_id,
                    email.from_address,
                    email.from_name,
                    email.to_address,
                    email.to_name,
                    email.subject,
                    email.body_text,
                    email.body_html,
                    email.in_reply_to,
                    email.references,
                    to_millis(email.received_at),
                    email.user_id,
                    email.account_id,
                    EmailStatus::Saving.as_str(),
                    to_millis(Utc::now()),
                    recipients,
                    cc,
                    bcc,
                ],
            )?;
            if changed == 1 {
                return Ok(InsertOutcome::Inserted(conn.last_insert_rowid()));
            }
            let existing: i64 = conn.query_row(
                "SELECT id FROM emails WHERE message_id = ?1",
                params![email.message_id],
                |row| row.get(0),
            )?;
            debug!(message_id = %email.message_id, email_id = existing, "Message-ID already stored");
            Ok(InsertOutcome::Duplicate(existing))
        })
        .await
    }

    async fn add_attachments(&self, email_id: i64, attachments: &[AttachmentMeta]) -> StorageResult<()> {
        let attachments = attachments.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let offset: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM attachments WHERE email_id = ?1",
                    params![email_id],
                    |row| row.get(0),
                )?;
                let mut statement = tx.prepare_cached(
                    "INSERT INTO attachments (email_id, position, filename, content_type, size, \
                     storage_key, content_id, inline) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for (position, attachment) in attachments.iter().enumerate() {
                    statement.execute(params![
                        email_id,
                        offset + position as i64,
                        attachment.filename,
                        attachment.content_type,
                        attachment.size as i64,
                        attachment.key,
                        attachment.content_id,
                        attachment.inline,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn finalize_email(
        &self,
        email_id: i64,
        status: EmailStatus,
        body_html: Option<&str>,
    ) -> StorageResult<bool> {
        if !status.is_terminal() {
            return Err(StorageError::Invalid("finalize to SAVING".to_string()));
        }
        let body_html = body_html.map(str::to_string);
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE emails SET status = ?1, body_html = COALESCE(?2, body_html) \
                 WHERE id = ?3 AND status = 'SAVING'",
                params![status.as_str(), body_html, email_id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn purge_stale_saving(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let before = to_millis(before);
            tx.execute(
                "DELETE FROM attachments WHERE email_id IN \
                 (SELECT id FROM emails WHERE status = 'SAVING' AND created_at < ?1)",
                params![before],
            )?;
            let removed = tx.execute(
                "DELETE FROM emails WHERE status = 'SAVING' AND created_at < ?1",
                params![before],
            )?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn list_prefix_emails(&self, listing: &PrefixListing) -> StorageResult<Vec<StoredEmail>> {
        let pattern = scope_pattern(&listing.prefix);
        let (comparison, order, edge) = match listing.direction {
            SortDirection::Ascending => (">", "ASC", 0),
            SortDirection::Descending => ("<", "DESC", i64::MAX),
        };
        let cursor = listing.cursor.unwrap_or(edge);
        let limit = listing.limit as i64;
        self.run(move |conn| {
            let mut statement = conn.prepare_cached(&format!(
                "SELECT {EMAIL_COLUMNS} FROM emails WHERE {VISIBLE_IN_SCOPE} \
                 AND id {comparison} ?2 ORDER BY id {order} LIMIT ?3"
            ))?;
            let emails = statement
                .query_map(params![pattern, cursor, limit], email_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let emails = emails
                .into_iter()
                .map(|email| with_attachments(conn, email))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(emails)
        })
        .await
    }

    async fn count_prefix_emails(&self, prefix: &str, since: Option<DateTime<Utc>>) -> StorageResult<u64> {
        let pattern = scope_pattern(prefix);
        let since = since.map(to_millis).unwrap_or(i64::MIN);
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM emails WHERE {VISIBLE_IN_SCOPE} AND received_at >= ?2"
                ),
                params![pattern, since],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn prefix_email(&self, prefix: &str, email_id: i64) -> StorageResult<Option<StoredEmail>> {
        let pattern = scope_pattern(prefix);
        self.run(move |conn| {
            let email = conn
                .query_row(
                    &format!(
                        "SELECT {EMAIL_COLUMNS} FROM emails WHERE {VISIBLE_IN_SCOPE} AND id = ?2"
                    ),
                    params![pattern, email_id],
                    email_from_row,
                )
                .optional()?;
            match email {
                Some(email) => Ok(Some(with_attachments(conn, email)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn mark_email_read(&self, prefix: &str, email_id: i64) -> StorageResult<bool> {
        let pattern = scope_pattern(prefix);
        self.run(move |conn| {
            let changed = conn.execute(
                &format!("UPDATE emails SET is_read = 1 WHERE {VISIBLE_IN_SCOPE} AND id = ?2"),
                params![pattern, email_id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn soft_delete_email(&self, prefix: &str, email_id: i64) -> StorageResult<bool> {
        let pattern = scope_pattern(prefix);
        self.run(move |conn| {
            let changed = conn.execute(
                &format!("UPDATE emails SET is_deleted = 1 WHERE {VISIBLE_IN_SCOPE} AND id = ?2"),
                params![pattern, email_id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn fetch_watermark(&self, source: &str) -> StorageResult<Option<DateTime<Utc>>> {
        let source = source.to_string();
        self.run(move |conn| {
            let millis: Option<i64> = conn
                .query_row(
                    "SELECT last_fetch FROM fetch_state WHERE source = ?1",
                    params![source],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(millis.map(from_millis))
        })
        .await
    }

    async fn set_fetch_watermark(&self, source: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let source = source.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO fetch_state (source, last_fetch) VALUES (?1, ?2) \
                 ON CONFLICT(source) DO UPDATE SET last_fetch = excluded.last_fetch",
                params![source, to_millis(at)],
            )?;
            Ok(())
        })
        .await
    }
}
