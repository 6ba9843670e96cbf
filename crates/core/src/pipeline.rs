//! Ingestion pipeline driving one raw message to a terminal outcome.
//!
//! A message goes through parse, recipient resolution, prefix matching,
//! dedupe, a two-phase commit (row in `SAVING`, attachment blobs, flip to
//! `RECEIVED` or `NO_OWNER`) and finally the notification and forwarding
//! fan-out. Routine conditions surface as [`IngestOutcome`] values, only
//! storage failures are errors.

use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use mail_parser::MessageParser;
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    rewrite_cid_references, BlobStore, EmailStatus, EmailStore, Forwarder, InsertOutcome,
    MatchMode, NormalizedEmail, Normalizer, Notice, Notifier, PrefixMatcher, PrefixRecord,
    RawMessage, RecipientResolver, StorageError,
};

/// What to do with a message whose recipient no prefix owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOwnerPolicy {
    /// Persist it with the `NO_OWNER` status and sentinel owner ids.
    #[default]
    Store,
    /// Drop it without persisting anything.
    Drop,
}

/// Immutable settings snapshot, taken once per ingestion.
#[derive(Debug, Clone, Default)]
pub struct IngestSettings {
    pub receive: bool,
    pub strip_plus_tag: bool,
    pub no_owner: NoOwnerPolicy,
    pub match_mode: MatchMode,
    pub allowed_domains: Vec<String>,
    pub rule_addresses: Vec<String>,
    pub message_id_domain: String,
    pub attachment_url: Option<String>,
    pub stale_saving: Duration,
    pub notify_targets: Vec<String>,
    pub forward_targets: Vec<String>,
}

impl IngestSettings {
    /// Tests if mail for `recipient` passes the rule filter. An empty
    /// rule list lets everything through.
    pub fn fan_out_allowed(&self, recipient: &str) -> bool {
        self.rule_addresses.is_empty()
            || self
                .rule_addresses
                .iter()
                .any(|address| address.trim().eq_ignore_ascii_case(recipient))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ReceiveDisabled,
    Unparseable,
    Unresolvable,
    NoOwner,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::ReceiveDisabled => "receive_disabled",
            DropReason::Unparseable => "unparseable",
            DropReason::Unresolvable => "unresolvable",
            DropReason::NoOwner => "no_owner",
        }
    }
}

impl Display for DropReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { email_id: i64, status: EmailStatus },
    Duplicate { email_id: i64 },
    Dropped(DropReason),
}

/// Result type for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug)]
pub enum IngestError {
    /// The store failed, the message must be retried later.
    Persistence(StorageError),
    /// Another ingestion of the same Message-ID has not finalized yet.
    InProgress { email_id: i64 },
}

impl Display for IngestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Persistence(e) => write!(f, "Persistence error: {e}"),
            IngestError::InProgress { email_id } => {
                write!(f, "Email {email_id} is still being saved")
            }
        }
    }
}

impl Error for IngestError {}

impl From<StorageError> for IngestError {
    fn from(e: StorageError) -> Self {
        IngestError::Persistence(e)
    }
}

/// A message ready for the commit phase.
struct Prepared {
    normalized: NormalizedEmail,
    status: EmailStatus,
}

pub struct IngestPipeline<S, B> {
    store: Arc<S>,
    blobs: Arc<B>,
    notifier: Option<Arc<dyn Notifier>>,
    forwarder: Option<Arc<dyn Forwarder>>,
}

impl<S: EmailStore, B: BlobStore> IngestPipeline<S, B> {
    pub fn new(store: Arc<S>, blobs: Arc<B>) -> Self {
        Self {
            store,
            blobs,
            notifier: None,
            forwarder: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        info!(channel = %notifier.name(), "Notification channel enabled");
        self.notifier = Some(notifier);
        self
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        info!(relay = %forwarder.name(), "Forwarding relay enabled");
        self.forwarder = Some(forwarder);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Ingests `raw` under the `settings` snapshot.
    ///
    /// Re-ingesting a message whose Message-ID is already finalized is a
    /// no-op returning [`IngestOutcome::Duplicate`]. Fan-out failures are
    /// logged and never change the outcome.
    pub async fn ingest(
        &self,
        raw: &RawMessage,
        settings: &IngestSettings,
    ) -> IngestResult<IngestOutcome> {
        if !settings.receive {
            debug!(size = raw.len(), "Receiving disabled, message ignored");
            return Ok(IngestOutcome::Dropped(DropReason::ReceiveDisabled));
        }

        let prefixes = self.store.active_prefixes().await?;
        let Prepared { normalized, status } = match prepare(raw, settings, &prefixes) {
            Ok(prepared) => prepared,
            Err(reason) => return Ok(IngestOutcome::Dropped(reason)),
        };
        let message_id = normalized.email.message_id.clone();

        if let Some(existing) = self.store.find_email_by_message_id(&message_id).await? {
            return existing_outcome(&message_id, existing.id, existing.status);
        }

        let email_id = match self.store.insert_email(&normalized.email).await? {
            InsertOutcome::Inserted(email_id) => email_id,
            InsertOutcome::Duplicate(email_id) => {
                let status = self
                    .store
                    .find_email_by_message_id(&message_id)
                    .await?
                    .map_or(EmailStatus::Saving, |existing| existing.status);
                return existing_outcome(&message_id, email_id, status);
            }
        };

        if let Err(e) = self.commit(email_id, &normalized, status, settings).await {
            error!(
                message_id = %message_id,
                email_id = email_id,
                error = %e,
                "Failed to commit email, left in SAVING"
            );
            return Err(e);
        }
        info!(
            message_id = %message_id,
            email_id = email_id,
            to = %normalized.email.to_address,
            status = %status.as_str(),
            attachments = normalized.attachments.len(),
            "Email stored"
        );

        if settings.fan_out_allowed(&normalized.email.to_address) {
            self.fan_out(raw, &normalized, settings).await;
        } else {
            debug!(
                message_id = %message_id,
                to = %normalized.email.to_address,
                "Recipient not in rule list, fan-out skipped"
            );
        }

        Ok(IngestOutcome::Stored { email_id, status })
    }

    /// Stores the attachment blobs and metadata, then flips the row to its
    /// terminal status.
    async fn commit(
        &self,
        email_id: i64,
        normalized: &NormalizedEmail,
        status: EmailStatus,
        settings: &IngestSettings,
    ) -> IngestResult<()> {
        for blob in &normalized.attachments {
            self.blobs.put(&blob.meta.key, &blob.content).await?;
        }
        let metas = normalized.metas();
        if !metas.is_empty() {
            self.store.add_attachments(email_id, &metas).await?;
        }

        let body_html = match (&settings.attachment_url, normalized.inline().next()) {
            (Some(base_url), Some(_)) => Some(rewrite_cid_references(
                &normalized.email.body_html,
                &metas,
                base_url,
            )),
            _ => None,
        };

        let finalized = self
            .store
            .finalize_email(email_id, status, body_html.as_deref())
            .await?;
        if !finalized {
            return Err(IngestError::Persistence(StorageError::Conflict(format!(
                "email {email_id} is no longer in SAVING"
            ))));
        }
        Ok(())
    }

    /// Sends the notification and forwarding side effects, one task per
    /// target, and waits for all of them.
    async fn fan_out(&self, raw: &RawMessage, normalized: &NormalizedEmail, settings: &IngestSettings) {
        let mut tasks = JoinSet::new();

        if let Some(notifier) = &self.notifier {
            let notice = Arc::new(Notice::from_email(normalized));
            for target in &settings.notify_targets {
                let notifier = notifier.clone();
                let notice = notice.clone();
                let target = target.clone();
                tasks.spawn(async move {
                    let result = notifier.notify(&target, &notice).await;
                    (notifier.name().to_string(), target, result.map_err(|e| e.to_string()))
                });
            }
        }

        if let Some(forwarder) = &self.forwarder {
            if !settings.forward_targets.is_empty() {
                let data: Arc<[u8]> = Arc::from(raw.data());
                for target in &settings.forward_targets {
                    let forwarder = forwarder.clone();
                    let data = data.clone();
                    let target = target.clone();
                    tasks.spawn(async move {
                        let result = forwarder.forward(&data, &target).await;
                        (forwarder.name().to_string(), target, result.map_err(|e| e.to_string()))
                    });
                }
            }
        }

        let message_id = &normalized.email.message_id;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((channel, target, Ok(()))) => {
                    debug!(message_id = %message_id, channel = %channel, target = %target, "Fan-out delivered");
                }
                Ok((channel, target, Err(e))) => {
                    warn!(
                        message_id = %message_id,
                        channel = %channel,
                        target = %target,
                        error = %e,
                        "Fan-out failed"
                    );
                }
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "Fan-out task aborted");
                }
            }
        }
    }

    /// Removes emails stuck in `SAVING` for longer than `older_than`, so
    /// that their source messages can be ingested again.
    pub async fn sweep_stale(&self, older_than: Duration) -> IngestResult<usize> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };
        let removed = self.store.purge_stale_saving(cutoff).await?;
        if removed > 0 {
            warn!(removed = removed, before = %cutoff, "Swept stale SAVING emails");
        }
        Ok(removed)
    }
}

/// Parses, resolves, matches and normalizes `raw` without touching
/// storage.
fn prepare(
    raw: &RawMessage,
    settings: &IngestSettings,
    prefixes: &[PrefixRecord],
) -> Result<Prepared, DropReason> {
    let Some(message) = MessageParser::default().parse(raw.data()) else {
        warn!(size = raw.len(), "Unparseable message dropped");
        return Err(DropReason::Unparseable);
    };

    let resolver = RecipientResolver::new(settings.strip_plus_tag);
    let recipient = match resolver.resolve(raw.headers(), raw.envelope_recipient()) {
        Ok(recipient) => recipient,
        Err(e) => {
            warn!(
                message_id = %message.message_id().unwrap_or_default(),
                error = %e,
                "Message dropped"
            );
            return Err(DropReason::Unresolvable);
        }
    };

    let matcher = PrefixMatcher::new(settings.match_mode)
        .with_allowed_domains(settings.allowed_domains.clone());
    let owner = matcher.find(&recipient, prefixes);
    if owner.is_none() && settings.no_owner == NoOwnerPolicy::Drop {
        info!(
            to = %recipient.address,
            source = %recipient.source,
            "No prefix owns recipient, message dropped"
        );
        return Err(DropReason::NoOwner);
    }

    let normalizer = Normalizer::new(settings.message_id_domain.as_str(), settings.strip_plus_tag);
    let normalized = normalizer.normalize(&message, raw, &recipient, owner, Utc::now());
    debug!(
        message_id = %normalized.email.message_id,
        to = %recipient.address,
        source = %recipient.source,
        prefix = %owner.map_or("", |owner| owner.prefix.as_str()),
        "Message prepared"
    );

    Ok(Prepared {
        normalized,
        status: match owner {
            Some(_) => EmailStatus::Received,
            None => EmailStatus::NoOwner,
        },
    })
}

fn existing_outcome(message_id: &str, email_id: i64, status: EmailStatus) -> IngestResult<IngestOutcome> {
    if status.is_terminal() {
        debug!(message_id = %message_id, email_id = email_id, "Duplicate message skipped");
        Ok(IngestOutcome::Duplicate { email_id })
    } else {
        Err(IngestError::InProgress { email_id })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;
    use crate::{
        ForwardError, ForwardFuture, MemoryBlobStore, MemoryStore, NewPrefix, NotifyError,
        NotifyFuture, PrefixListing, SortDirection,
    };

    /// Notifier recording every target, failing those listed in `failing`.
    #[derive(Default)]
    struct RecordingNotifier {
        targets: Mutex<Vec<String>>,
        failing: Vec<String>,
    }

    impl Notifier for RecordingNotifier {
        fn notify<'a>(&'a self, target: &'a str, _notice: &'a Notice) -> NotifyFuture<'a> {
            Box::pin(async move {
                self.targets.lock().unwrap().push(target.to_string());
                if self.failing.iter().any(|failing| failing == target) {
                    return Err(NotifyError::Rejected("chat not found".to_string()));
                }
                Ok(())
            })
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[derive(Default)]
    struct CountingForwarder {
        calls: AtomicUsize,
    }

    impl Forwarder for CountingForwarder {
        fn forward<'a>(&'a self, raw: &'a [u8], _target: &'a str) -> ForwardFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                assert!(!raw.is_empty());
                Err(ForwardError::Delivery("relay down".to_string()))
            })
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            receive: true,
            strip_plus_tag: true,
            message_id_domain: "ids.example.com".to_string(),
            stale_saving: Duration::from_secs(600),
            ..IngestSettings::default()
        }
    }

    fn raw(message_id: &str, to: &str) -> RawMessage {
        let source = format!(
            "From: Alice <alice@example.org>\r\nTo: {to}\r\nSubject: Hello\r\nMessage-ID: <{message_id}>\r\n\r\nBody\r\n"
        );
        RawMessage::new(source.into_bytes(), None)
    }

    async fn pipeline() -> IngestPipeline<MemoryStore, MemoryBlobStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_prefix(NewPrefix {
                prefix: "support".to_string(),
                password_hash: "hash".to_string(),
                user_id: 5,
                account_id: 6,
            })
            .await
            .unwrap();
        IngestPipeline::new(store, Arc::new(MemoryBlobStore::new()))
    }

    #[tokio::test]
    async fn test_ingest_owned_message() {
        let pipeline = pipeline().await;
        let outcome = pipeline
            .ingest(&raw("a@x", "Support+t1@Example.com"), &settings())
            .await
            .unwrap();
        let IngestOutcome::Stored { email_id, status } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(status, EmailStatus::Received);

        let email = pipeline.store().prefix_email("support", email_id).await.unwrap().unwrap();
        assert_eq!(email.to_address, "support@example.com");
        assert_eq!(email.user_id, 5);
        assert_eq!(email.status, EmailStatus::Received);
    }

    #[tokio::test]
    async fn test_ingest_twice_is_duplicate() {
        let pipeline = pipeline().await;
        let first = pipeline.ingest(&raw("dup@x", "support@example.com"), &settings()).await.unwrap();
        let second = pipeline.ingest(&raw("dup@x", "support@example.com"), &settings()).await.unwrap();
        let IngestOutcome::Stored { email_id, .. } = first else {
            panic!("unexpected outcome {first:?}");
        };
        assert_eq!(second, IngestOutcome::Duplicate { email_id });
        assert_eq!(pipeline.store().email_count(), 1);
    }

    #[tokio::test]
    async fn test_ingest_in_progress() {
        let pipeline = pipeline().await;
        let raw = raw("busy@x", "support@example.com");
        let prepared = prepare(&raw, &settings(), &[]).unwrap();
        let InsertOutcome::Inserted(id) = pipeline
            .store()
            .insert_email(&prepared.normalized.email)
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };

        let result = pipeline.ingest(&raw, &settings()).await;
        assert!(matches!(result, Err(IngestError::InProgress { email_id }) if email_id == id));
    }

    #[tokio::test]
    async fn test_ingest_drop_reasons() {
        let pipeline = pipeline().await;

        let disabled = IngestSettings {
            receive: false,
            ..settings()
        };
        let outcome = pipeline.ingest(&raw("r@x", "support@example.com"), &disabled).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Dropped(DropReason::ReceiveDisabled));

        let nobody = RawMessage::new(b"Subject: nobody\r\n\r\nBody\r\n".to_vec(), None);
        let outcome = pipeline.ingest(&nobody, &settings()).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Dropped(DropReason::Unresolvable));

        let drop = IngestSettings {
            no_owner: NoOwnerPolicy::Drop,
            ..settings()
        };
        let outcome = pipeline.ingest(&raw("u@x", "unknown@example.com"), &drop).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Dropped(DropReason::NoOwner));
        assert_eq!(pipeline.store().email_count(), 0);
    }

    #[tokio::test]
    async fn test_ingest_no_owner_stored() {
        let pipeline = pipeline().await;
        let outcome = pipeline
            .ingest(&raw("n@x", "unknown@example.com"), &settings())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Stored {
                status: EmailStatus::NoOwner,
                ..
            }
        ));
        let email = pipeline.store().find_email_by_message_id("n@x").await.unwrap().unwrap();
        assert_eq!(email.user_id, crate::NO_OWNER_ID);
        assert_eq!(email.account_id, crate::NO_OWNER_ID);
    }

    #[tokio::test]
    async fn test_fan_out_failures_isolated() {
        let notifier = Arc::new(RecordingNotifier {
            failing: vec!["bad".to_string()],
            ..RecordingNotifier::default()
        });
        let forwarder = Arc::new(CountingForwarder::default());
        let pipeline = pipeline()
            .await
            .with_notifier(notifier.clone())
            .with_forwarder(forwarder.clone());
        let settings = IngestSettings {
            notify_targets: vec!["bad".to_string(), "good".to_string()],
            forward_targets: vec!["a@relay.example".to_string(), "b@relay.example".to_string()],
            ..settings()
        };

        let outcome = pipeline.ingest(&raw("f@x", "support@example.com"), &settings).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { .. }));
        let mut targets = notifier.targets.lock().unwrap().clone();
        targets.sort();
        assert_eq!(targets, vec!["bad", "good"]);
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rule_filter_skips_fan_out() {
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = pipeline().await.with_notifier(notifier.clone());
        let settings = IngestSettings {
            notify_targets: vec!["chat".to_string()],
            rule_addresses: vec!["Alerts@Example.com".to_string()],
            ..settings()
        };

        pipeline.ingest(&raw("s@x", "support@example.com"), &settings).await.unwrap();
        assert!(notifier.targets.lock().unwrap().is_empty());

        pipeline.ingest(&raw("t@x", "alerts@example.com"), &settings).await.unwrap();
        assert_eq!(*notifier.targets.lock().unwrap(), vec!["chat"]);
        assert_eq!(pipeline.store().email_count(), 2);
    }

    #[tokio::test]
    async fn test_inline_attachment_cid_rewritten() {
        let source = concat!(
            "From: alice@example.org\r\n",
            "To: support@example.com\r\n",
            "Subject: Logo\r\n",
            "Message-ID: <cid-test@example.org>\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/related; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<img src=\"cid:logo@x\">\r\n",
            "--b\r\n",
            "Content-Type: image/png; name=\"logo.png\"\r\n",
            "Content-ID: <logo@x>\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "iVBORw0KGgo=\r\n",
            "--b--\r\n",
        );
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestPipeline::new(store.clone(), blobs.clone());
        let settings = IngestSettings {
            attachment_url: Some("https://files.example.com/att/".to_string()),
            ..settings()
        };

        pipeline
            .ingest(&RawMessage::new(source.as_bytes().to_vec(), None), &settings)
            .await
            .unwrap();
        let listing = PrefixListing {
            prefix: "support".to_string(),
            cursor: None,
            direction: SortDirection::Descending,
            limit: 10,
        };
        let emails = store.list_prefix_emails(&listing).await.unwrap();
        assert_eq!(emails.len(), 1);
        let key = &emails[0].attachments[0].key;
        assert!(blobs.contains(key));
        assert!(emails[0]
            .body_html
            .contains(&format!("https://files.example.com/att/{key}")));
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let pipeline = pipeline().await;
        let raw = raw("stale@x", "support@example.com");
        let prepared = prepare(&raw, &settings(), &[]).unwrap();
        pipeline.store().insert_email(&prepared.normalized.email).await.unwrap();

        assert_eq!(pipeline.sweep_stale(Duration::from_secs(600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pipeline.sweep_stale(Duration::ZERO).await.unwrap(), 1);
        let outcome = pipeline.ingest(&raw, &settings()).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Stored { .. }));
    }

    #[test]
    fn test_fan_out_allowed() {
        let mut settings = settings();
        assert!(settings.fan_out_allowed("any@example.com"));
        settings.rule_addresses = vec![" ops@example.com ".to_string()];
        assert!(settings.fan_out_allowed("ops@example.com"));
        assert!(!settings.fan_out_allowed("dev@example.com"));
    }
}
