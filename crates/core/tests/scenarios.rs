use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use prefixmail_core::{
    AccessConfig, AccessError, AccessGateway, Argon2Hasher, BlobStore, DropReason, EmailStatus,
    EmailStore, FileBlobStore, IngestOutcome, IngestPipeline, IngestSettings, ListRequest,
    NoOwnerPolicy, Notice, Notifier, NotifyError, NotifyFuture, RawMessage, SqliteStore,
};
use tempfile::TempDir;

struct Deployment {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    blobs: Arc<FileBlobStore>,
    pipeline: IngestPipeline<SqliteStore, FileBlobStore>,
    gateway: AccessGateway<SqliteStore, Argon2Hasher>,
}

async fn deployment() -> Deployment {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("db/prefixmail.db")).unwrap());
    let blobs = Arc::new(FileBlobStore::new(dir.path().join("attachments")));
    let pipeline = IngestPipeline::new(store.clone(), blobs.clone());
    let gateway =
        AccessGateway::from_config(store.clone(), Argon2Hasher, &AccessConfig::default()).unwrap();
    gateway.create_prefix("support", "pw1", 100, 200).await.unwrap();
    Deployment {
        _dir: dir,
        store,
        blobs,
        pipeline,
        gateway,
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

fn message(message_id: &str, headers: &str) -> RawMessage {
    let source = format!(
        "From: \"Customer\" <customer@example.org>\r\n{headers}Subject: Ticket\r\nMessage-ID: <{message_id}>\r\n\r\nPlease help\r\n"
    );
    RawMessage::new(source.into_bytes(), None)
}

/// Notifier failing for every target, counting the attempts.
#[derive(Default)]
struct BrokenNotifier {
    attempts: AtomicUsize,
}

impl Notifier for BrokenNotifier {
    fn notify<'a>(&'a self, _target: &'a str, _notice: &'a Notice) -> NotifyFuture<'a> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::Connection("unreachable".to_string()))
        })
    }

    fn name(&self) -> &str {
        "broken"
    }
}

#[tokio::test]
async fn test_plus_tagged_message_reaches_prefix_holder() {
    let deployment = deployment().await;
    let raw = message("a1@example.org", "To: Support+ticket42@Domain.com\r\n");

    let outcome = deployment.pipeline.ingest(&raw, &settings()).await.unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Stored {
            status: EmailStatus::Received,
            ..
        }
    ));

    let page = deployment
        .gateway
        .list_emails("support", "pw1", &ListRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].to_address, "support@domain.com");
    assert_eq!(page.items[0].from_name, "Customer");

    let denied = deployment
        .gateway
        .list_emails("support", "wrong", &ListRequest::default())
        .await;
    assert!(matches!(denied, Err(AccessError::Unauthorized)));
}

#[tokio::test]
async fn test_reingestion_stores_one_row() {
    let deployment = deployment().await;
    let raw = message("b1@example.org", "To: support@domain.com\r\n");

    let first = deployment.pipeline.ingest(&raw, &settings()).await.unwrap();
    let second = deployment.pipeline.ingest(&raw, &settings()).await.unwrap();
    let IngestOutcome::Stored { email_id, .. } = first else {
        panic!("unexpected outcome {first:?}");
    };
    assert_eq!(second, IngestOutcome::Duplicate { email_id });
    assert_eq!(
        deployment
            .store
            .count_prefix_emails("support", None)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_unknown_recipient_dropped_by_policy() {
    let deployment = deployment().await;
    let settings = IngestSettings {
        no_owner: NoOwnerPolicy::Drop,
        ..settings()
    };
    let raw = message("c1@example.org", "To: unknown@domain.com\r\n");

    let outcome = deployment.pipeline.ingest(&raw, &settings).await.unwrap();
    assert_eq!(outcome, IngestOutcome::Dropped(DropReason::NoOwner));
    assert!(deployment
        .store
        .find_email_by_message_id("c1@example.org")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_original_to_header_wins() {
    let deployment = deployment().await;
    let raw = RawMessage::new(
        concat!(
            "Delivered-To: catchall@domain.com\r\n",
            "X-Original-To: Support@Domain.com\r\n",
            "From: customer@example.org\r\n",
            "To: someone-else@domain.com\r\n",
            "Subject: Forwarded\r\n",
            "Message-ID: <d1@example.org>\r\n",
            "\r\n",
            "Body\r\n",
        )
        .as_bytes()
        .to_vec(),
        Some("envelope@domain.com".to_string()),
    );

    deployment.pipeline.ingest(&raw, &settings()).await.unwrap();
    let email = deployment
        .store
        .find_email_by_message_id("d1@example.org")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(email.to_address, "support@domain.com");
    assert_eq!(email.user_id, 100);
    assert_eq!(email.account_id, 200);
}

#[tokio::test]
async fn test_longest_prefix_owns_message() {
    let deployment = deployment().await;
    deployment.gateway.create_prefix("sup", "pw2", 1, 2).await.unwrap();
    let raw = message("e1@example.org", "To: support@domain.com\r\n");

    deployment.pipeline.ingest(&raw, &settings()).await.unwrap();
    let email = deployment
        .store
        .find_email_by_message_id("e1@example.org")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(email.user_id, 100);

    let sup = deployment
        .gateway
        .list_emails("sup", "pw2", &ListRequest::default())
        .await
        .unwrap();
    assert!(sup.items.is_empty());
}

#[tokio::test]
async fn test_attachments_persisted_with_metadata() {
    let deployment = deployment().await;
    let raw = RawMessage::new(
        concat!(
            "From: customer@example.org\r\n",
            "To: support@domain.com\r\n",
            "Subject: Logs\r\n",
            "Message-ID: <f1@example.org>\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"m\"\r\n",
            "\r\n",
            "--m\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "See attached\r\n",
            "--m\r\n",
            "Content-Type: text/plain; name=\"app.log\"\r\n",
            "Content-Disposition: attachment; filename=\"app.log\"\r\n",
            "\r\n",
            "line one\r\n",
            "--m--\r\n",
        )
        .as_bytes()
        .to_vec(),
        None,
    );

    let outcome = deployment.pipeline.ingest(&raw, &settings()).await.unwrap();
    let IngestOutcome::Stored { email_id, .. } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    let detail = deployment
        .gateway
        .get_detail("support", "pw1", email_id)
        .await
        .unwrap();
    assert_eq!(detail.attachments.len(), 1);
    let attachment = &detail.attachments[0];
    assert_eq!(attachment.filename, "app.log");
    assert!(attachment.key.ends_with(".log"));
    let content = deployment.blobs.get(&attachment.key).await.unwrap();
    assert_eq!(content.len() as u64, attachment.size);
}

#[tokio::test]
async fn test_notification_failure_keeps_email() {
    let notifier = Arc::new(BrokenNotifier::default());
    let Deployment {
        _dir,
        store,
        blobs,
        gateway,
        ..
    } = deployment().await;
    let pipeline = IngestPipeline::new(store, blobs).with_notifier(notifier.clone());
    let settings = IngestSettings {
        notify_targets: vec!["1".to_string(), "2".to_string(), "3".to_string()],
        ..settings()
    };

    let outcome = pipeline
        .ingest(&message("g1@example.org", "To: support@domain.com\r\n"), &settings)
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Stored { .. }));
    assert_eq!(notifier.attempts.load(Ordering::SeqCst), 3);

    let page = gateway
        .list_emails("support", "pw1", &ListRequest::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn test_receive_disabled_stores_nothing() {
    let deployment = deployment().await;
    let settings = IngestSettings {
        receive: false,
        ..settings()
    };
    let outcome = deployment
        .pipeline
        .ingest(&message("h1@example.org", "To: support@domain.com\r\n"), &settings)
        .await
        .unwrap();
    assert_eq!(outcome, IngestOutcome::Dropped(DropReason::ReceiveDisabled));
    assert_eq!(
        deployment
            .store
            .count_prefix_emails("support", None)
            .await
            .unwrap(),
        0
    );
}
