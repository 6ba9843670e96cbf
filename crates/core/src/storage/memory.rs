use std::{
    collections::{BTreeMap, HashMap},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};

use crate::{
    belongs_to_prefix, normalize_prefix, AttachmentMeta, EmailStatus, EmailStore, InsertOutcome,
    NewEmail, NewPrefix, PrefixListing, PrefixRecord, SortDirection, StorageError, StorageResult,
    StoredEmail,
};

#[derive(Debug, Default)]
struct MemoryState {
    prefixes: BTreeMap<i64, PrefixRecord>,
    emails: BTreeMap<i64, StoredEmail>,

    /// Message-ID -> email id
    message_ids: HashMap<String, i64>,

    watermarks: HashMap<String, DateTime<Utc>>,
    next_prefix_id: i64,
    next_email_id: i64,
}

impl MemoryState {
    fn visible(&self, prefix: &str, email_id: i64) -> Option<&StoredEmail> {
        self.emails
            .get(&email_id)
            .filter(|email| is_visible(email, prefix))
    }

    fn visible_mut(&mut self, prefix: &str, email_id: i64) -> Option<&mut StoredEmail> {
        self.emails
            .get_mut(&email_id)
            .filter(|email| is_visible(email, prefix))
    }
}

fn is_visible(email: &StoredEmail, prefix: &str) -> bool {
    !email.is_deleted && email.status.is_terminal() && belongs_to_prefix(&email.to_address, prefix)
}

/// In-memory [`EmailStore`].
///
/// Keeps prefixes and emails in ordered maps behind a single lock, so
/// every operation is atomic with respect to the others. Useful for
/// testing and development.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Creates a new empty MemoryStore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of emails stored, in any status.
    pub fn email_count(&self) -> usize {
        self.state
            .read()
            .map(|state| state.emails.len())
            .unwrap_or_default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| StorageError::Engine("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| StorageError::Engine("memory store lock poisoned".to_string()))
    }

    fn update_prefix<F>(&self, prefix_id: i64, update: F) -> StorageResult<()>
    where
        F: FnOnce(&mut PrefixRecord),
    {
        let mut state = self.write()?;
        let record = state
            .prefixes
            .get_mut(&prefix_id)
            .ok_or(StorageError::NotFound)?;
        update(record);
        Ok(())
    }
}

impl EmailStore for MemoryStore {
    async fn create_prefix(&self, prefix: NewPrefix) -> StorageResult<PrefixRecord> {
        let name = normalize_prefix(&prefix.prefix)
            .ok_or_else(|| StorageError::Invalid(format!("prefix '{}'", prefix.prefix)))?;
        let mut state = self.write()?;
        if state.prefixes.values().any(|record| record.prefix == name) {
            return Err(StorageError::Conflict(format!("prefix '{name}' already exists")));
        }
        state.next_prefix_id += 1;
        let now = Utc::now();
        let record = PrefixRecord {
            id: state.next_prefix_id,
            prefix: name,
            password_hash: prefix.password_hash,
            user_id: prefix.user_id,
            account_id: prefix.account_id,
            is_active: true,
            last_access_time: None,
            access_count: 0,
            created_at: now,
            updated_at: now,
        };
        state.prefixes.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_prefix(&self, prefix: &str) -> StorageResult<Option<PrefixRecord>> {
        let name = prefix.trim().to_lowercase();
        let state = self.read()?;
        Ok(state
            .prefixes
            .values()
            .find(|record| record.prefix == name)
            .cloned())
    }

    async fn active_prefixes(&self) -> StorageResult<Vec<PrefixRecord>> {
        let state = self.read()?;
        Ok(state
            .prefixes
            .values()
            .filter(|record| record.is_active)
            .cloned()
            .collect())
    }

    async fn update_prefix_password(&self, prefix_id: i64, password_hash: &str) -> StorageResult<()> {
        self.update_prefix(prefix_id, |record| {
            record.password_hash = password_hash.to_string();
            record.updated_at = Utc::now();
        })
    }

    async fn set_prefix_active(&self, prefix_id: i64, is_active: bool) -> StorageResult<()> {
        self.update_prefix(prefix_id, |record| {
            record.is_active = is_active;
            record.updated_at = Utc::now();
        })
    }

    async fn record_access(&self, prefix_id: i64, at: DateTime<Utc>) -> StorageResult<()> {
        self.update_prefix(prefix_id, |record| {
            record.access_count += 1;
            record.last_access_time = Some(at);
        })
    }

    async fn find_email_by_message_id(&self, message_id: &str) -> StorageResult<Option<StoredEmail>> {
        let state = self.read()?;
        Ok(state
            .message_ids
            .get(message_id)
            .and_then(|id| state.emails.get(id))
            .cloned())
    }

    async fn insert_email(&self, email: &NewEmail) -> StorageResult<InsertOutcome> {
        let mut state = self.write()?;
        if let Some(existing) = state.message_ids.get(&email.message_id) {
            return Ok(InsertOutcome::Duplicate(*existing));
        }
        state.next_email_id += 1;
        let id = state.next_email_id;
        state
            .emails
            .insert(id, StoredEmail::from_new(id, email, Utc::now()));
        state.message_ids.insert(email.message_id.clone(), id);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn add_attachments(&self, email_id: i64, attachments: &[AttachmentMeta]) -> StorageResult<()> {
        let mut state = self.write()?;
        let email = state
            .emails
            .get_mut(&email_id)
            .ok_or(StorageError::NotFound)?;
        email.attachments.extend_from_slice(attachments);
        Ok(())
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
        let mut state = self.write()?;
        let Some(email) = state
            .emails
            .get_mut(&email_id)
            .filter(|email| email.status == EmailStatus::Saving)
        else {
            return Ok(false);
        };
        email.status = status;
        if let Some(body_html) = body_html {
            email.body_html = body_html.to_string();
        }
        Ok(true)
    }

    async fn purge_stale_saving(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut state = self.write()?;
        let stale: Vec<(i64, String)> = state
            .emails
            .values()
            .filter(|email| email.status == EmailStatus::Saving && email.created_at < before)
            .map(|email| (email.id, email.message_id.clone()))
            .collect();
        for (id, message_id) in &stale {
            state.emails.remove(id);
            state.message_ids.remove(message_id);
        }
        Ok(stale.len())
    }

    async fn list_prefix_emails(&self, listing: &PrefixListing) -> StorageResult<Vec<StoredEmail>> {
        let state = self.read()?;
        let visible = state
            .emails
            .values()
            .filter(|email| is_visible(email, &listing.prefix));
        let emails = match (listing.direction, listing.cursor) {
            (SortDirection::Ascending, cursor) => visible
                .filter(|email| cursor.map_or(true, |cursor| email.id > cursor))
                .take(listing.limit)
                .cloned()
                .collect(),
            (SortDirection::Descending, cursor) => visible
                .rev()
                .filter(|email| cursor.map_or(true, |cursor| email.id < cursor))
                .take(listing.limit)
                .cloned()
                .collect(),
        };
        Ok(emails)
    }

    async fn count_prefix_emails(&self, prefix: &str, since: Option<DateTime<Utc>>) -> StorageResult<u64> {
        let state = self.read()?;
        let count = state
            .emails
            .values()
            .filter(|email| is_visible(email, prefix))
            .filter(|email| since.map_or(true, |since| email.received_at >= since))
            .count();
        Ok(count as u64)
    }

    async fn prefix_email(&self, prefix: &str, email_id: i64) -> StorageResult<Option<StoredEmail>> {
        let state = self.read()?;
        Ok(state.visible(prefix, email_id).cloned())
    }

    async fn mark_email_read(&self, prefix: &str, email_id: i64) -> StorageResult<bool> {
        let mut state = self.write()?;
        Ok(state
            .visible_mut(prefix, email_id)
            .map(|email| email.is_read = true)
            .is_some())
    }

    async fn soft_delete_email(&self, prefix: &str, email_id: i64) -> StorageResult<bool> {
        let mut state = self.write()?;
        Ok(state
            .visible_mut(prefix, email_id)
            .map(|email| email.is_deleted = true)
            .is_some())
    }

    async fn fetch_watermark(&self, source: &str) -> StorageResult<Option<DateTime<Utc>>> {
        let state = self.read()?;
        Ok(state.watermarks.get(source).copied())
    }

    async fn set_fetch_watermark(&self, source: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let mut state = self.write()?;
        state.watermarks.insert(source.to_string(), at);
        Ok(())
    }
}
