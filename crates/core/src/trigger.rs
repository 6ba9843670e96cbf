use serde::Serialize;
use tracing::{info, warn};

use crate::{
    BlobStore, EmailStatus, EmailStore, IngestOutcome, IngestPipeline, IngestResult,
    IngestSettings, RawMessage,
};

/// Status reported to the caller of a trigger ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptStatus {
    Received,
    NoOwner,
    Duplicate,
    Dropped,
}

/// Answer to a trigger ingestion, it only tells whether the message
/// reached a terminal outcome, never how the fan-out went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub status: ReceiptStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl From<IngestOutcome> for IngestReceipt {
    fn from(outcome: IngestOutcome) -> Self {
        match outcome {
            IngestOutcome::Stored { email_id, status } => Self {
                status: match status {
                    EmailStatus::NoOwner => ReceiptStatus::NoOwner,
                    _ => ReceiptStatus::Received,
                },
                email_id: Some(email_id),
                reason: None,
            },
            IngestOutcome::Duplicate { email_id } => Self {
                status: ReceiptStatus::Duplicate,
                email_id: Some(email_id),
                reason: None,
            },
            IngestOutcome::Dropped(reason) => Self {
                status: ReceiptStatus::Dropped,
                email_id: None,
                reason: Some(reason.as_str()),
            },
        }
    }
}

/// Ingests one message handed over by an external mail routing layer,
/// synchronously. Invocations share no state besides the store.
///
/// Rows left in `SAVING` for longer than `settings.stale_saving` by an
/// earlier crashed or failed run are swept first, so a retried delivery
/// of the same message is ingested again instead of reported in progress.
pub async fn ingest_trigger<S: EmailStore, B: BlobStore>(
    pipeline: &IngestPipeline<S, B>,
    data: Vec<u8>,
    envelope_recipient: Option<String>,
    settings: &IngestSettings,
) -> IngestResult<IngestReceipt> {
    let raw = RawMessage::new(data, envelope_recipient);
    info!(
        size = raw.len(),
        envelope = %raw.envelope_recipient().unwrap_or("-"),
        "Trigger message received"
    );
    if let Err(e) = pipeline.sweep_stale(settings.stale_saving).await {
        warn!(error = %e, "Failed to sweep stale emails");
    }
    pipeline.ingest(&raw, settings).await.map(IngestReceipt::from)
}
