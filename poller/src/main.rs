use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use prefixmail_core::{
    load_config, ConfigFileSettings, FileBlobStore, ImapTransport, IngestPipeline, Poller,
    SettingsSource, SmtpForwarder, SqliteStore, TelegramNotifier,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "PREFIXMAIL_CONFIG", default_value = "prefixmail.toml")]
    config: PathBuf,

    /// Runs a single polling cycle and exits
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;

    let store = Arc::new(SqliteStore::open(&config.storage.database)?);
    let blobs = Arc::new(FileBlobStore::new(&config.storage.attachments));
    let mut pipeline = IngestPipeline::new(store, blobs);
    if let Some(notifier) = TelegramNotifier::from_config(&config.notify.telegram)? {
        pipeline = pipeline.with_notifier(Arc::new(notifier));
    }
    if let Some(forwarder) = SmtpForwarder::from_config(&config.forward)? {
        pipeline = pipeline.with_forwarder(Arc::new(forwarder));
    }

    let transport = ImapTransport::new(config.imap.clone())?;
    let poller = Poller::new(
        transport,
        Arc::new(pipeline),
        Duration::from_secs(config.imap.poll_interval_secs),
    )
    .with_max_backoff(Duration::from_secs(config.imap.max_backoff_secs))
    .with_batch_size(config.imap.batch_size);
    let settings = ConfigFileSettings::new(&args.config, config.ingest_settings());
    let (tx, rx) = watch::channel(false);

    if args.once {
        let report = poller.poll_once(&settings.snapshot(), &rx).await?;
        info!(
            found = report.found,
            fetched = report.fetched,
            stored = report.stored,
            duplicates = report.duplicates,
            dropped = report.dropped,
            failed = report.failed,
            "Single cycle finished"
        );
        return Ok(());
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing the current message");
                tx.send(true).ok();
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for the shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    });

    poller.run(&settings, rx).await;
    Ok(())
}
