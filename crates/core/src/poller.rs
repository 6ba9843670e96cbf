//! Polling mode driver.
//!
//! Every cycle sweeps stale `SAVING` rows, searches the unseen messages of
//! the mailbox and fetches them in batches. Each batch is fed one message
//! at a time to the pipeline, then only the messages that reached a
//! terminal outcome are flagged as seen. Transport failures abandon the
//! cycle and stretch the wait before the next one.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    load_config, BlobStore, EmailStore, FetchedMessage, IngestOutcome, IngestPipeline,
    IngestSettings, MailTransport, RawMessage, TransportError,
};

/// Source of the settings snapshot taken at the start of each cycle.
pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> IngestSettings;
}

impl SettingsSource for IngestSettings {
    fn snapshot(&self) -> IngestSettings {
        self.clone()
    }
}

/// Settings re-read from the configuration file on every snapshot,
/// falling back to the last good ones when the file can not be loaded.
pub struct ConfigFileSettings {
    path: PathBuf,
    last: Mutex<IngestSettings>,
}

impl ConfigFileSettings {
    pub fn new(path: impl Into<PathBuf>, initial: IngestSettings) -> Self {
        Self {
            path: path.into(),
            last: Mutex::new(initial),
        }
    }
}

impl SettingsSource for ConfigFileSettings {
    fn snapshot(&self) -> IngestSettings {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match load_config(&self.path) {
            Ok(config) => *last = config.ingest_settings(),
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to reload configuration, keeping previous settings"
            ),
        }
        last.clone()
    }
}

/// Counters of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Unseen messages found by the search.
    pub found: usize,
    pub fetched: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub dropped: usize,

    /// Messages left unseen for the next cycle, including those that
    /// could not be fetched.
    pub failed: usize,

    /// The cycle stopped early on shutdown.
    pub interrupted: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Stored { .. } => self.stored += 1,
            IngestOutcome::Duplicate { .. } => self.duplicates += 1,
            IngestOutcome::Dropped(_) => self.dropped += 1,
        }
    }

    /// Tests if every fetched message was settled.
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }
}

/// Default number of messages held in memory at once by a cycle.
pub const DEFAULT_BATCH_SIZE: usize = 50;

pub struct Poller<T, S, B> {
    transport: T,
    pipeline: Arc<IngestPipeline<S, B>>,
    interval: Duration,
    max_backoff: Duration,
    batch_size: usize,
}

impl<T: MailTransport, S: EmailStore, B: BlobStore> Poller<T, S, B> {
    pub fn new(transport: T, pipeline: Arc<IngestPipeline<S, B>>, interval: Duration) -> Self {
        Self {
            transport,
            pipeline,
            interval,
            max_backoff: interval,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.interval);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Runs a single polling cycle.
    ///
    /// At most one batch of messages is held in memory. The shutdown flag
    /// is checked between batches and between messages, so a message whose
    /// ingestion started is always carried to its end.
    pub async fn poll_once(
        &self,
        settings: &IngestSettings,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport, TransportError> {
        let started = Utc::now();
        if let Err(e) = self.pipeline.sweep_stale(settings.stale_saving).await {
            warn!(error = %e, "Failed to sweep stale emails");
        }

        let source = self.transport.source();
        let since = self
            .pipeline
            .store()
            .fetch_watermark(source)
            .await
            .unwrap_or_else(|e| {
                warn!(source = %source, error = %e, "Failed to read fetch watermark");
                None
            });

        let uids = self.transport.search_unseen(since).await?;
        let mut report = CycleReport {
            found: uids.len(),
            ..CycleReport::default()
        };

        for batch in uids.chunks(self.batch_size) {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }
            let messages = self.transport.fetch(batch).await?;
            report.fetched += messages.len();
            report.failed += batch.len().saturating_sub(messages.len());
            self.ingest_batch(messages, settings, shutdown, &mut report).await;
            if report.interrupted {
                break;
            }
        }

        if report.is_complete() {
            if let Err(e) = self.pipeline.store().set_fetch_watermark(source, started).await {
                warn!(source = %source, error = %e, "Failed to store fetch watermark");
            }
        }
        Ok(report)
    }

    /// Ingests one fetched batch, then flags its settled messages as seen.
    async fn ingest_batch(
        &self,
        messages: Vec<FetchedMessage>,
        settings: &IngestSettings,
        shutdown: &watch::Receiver<bool>,
        report: &mut CycleReport,
    ) {
        let source = self.transport.source();
        let mut seen = Vec::with_capacity(messages.len());
        for message in messages {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }
            let raw = RawMessage::new(message.data, None);
            match self.pipeline.ingest(&raw, settings).await {
                Ok(outcome) => {
                    debug!(
                        source = %source,
                        uid = message.uid,
                        outcome = ?outcome,
                        "Message settled"
                    );
                    report.record(outcome);
                    seen.push(message.uid);
                }
                Err(e) => {
                    warn!(
                        source = %source,
                        uid = message.uid,
                        error = %e,
                        "Message left unseen for retry"
                    );
                    report.failed += 1;
                }
            }
        }

        if let Err(e) = self.transport.mark_seen(&seen).await {
            warn!(source = %source, count = seen.len(), error = %e, "Failed to flag messages as seen");
            report.failed += seen.len();
        }
    }

    /// Polls until `shutdown` turns `true` or its sender is dropped.
    pub async fn run(&self, settings: &impl SettingsSource, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        info!(
            source = %self.transport.source(),
            interval_secs = self.interval.as_secs(),
            "Poller started"
        );

        while !*shutdown.borrow() {
            let snapshot = settings.snapshot();
            let wait = match self.poll_once(&snapshot, &shutdown).await {
                Ok(report) => {
                    failures = 0;
                    info!(
                        source = %self.transport.source(),
                        found = report.found,
                        fetched = report.fetched,
                        stored = report.stored,
                        duplicates = report.duplicates,
                        dropped = report.dropped,
                        failed = report.failed,
                        "Polling cycle finished"
                    );
                    self.interval
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let wait = backoff_delay(self.interval, self.max_backoff, failures);
                    error!(
                        source = %self.transport.source(),
                        error = %e,
                        failures = failures,
                        retry_in_secs = wait.as_secs(),
                        "Polling cycle failed"
                    );
                    wait
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(source = %self.transport.source(), "Poller stopped");
    }
}

/// Wait after `failures` consecutive failed cycles, doubling from
/// `interval` and capped at `max`.
pub fn backoff_delay(interval: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    interval
        .checked_mul(1 << exponent)
        .map_or(max, |delay| delay.min(max))
}
