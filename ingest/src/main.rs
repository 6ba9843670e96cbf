use std::{error::Error, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use prefixmail_core::{
    ingest_trigger, load_config, FileBlobStore, IngestPipeline, SmtpForwarder, SqliteStore,
    TelegramNotifier,
};
use tokio::io::AsyncReadExt;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Exit status asking the MTA to retry the delivery later.
const EX_TEMPFAIL: u8 = 75;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "PREFIXMAIL_CONFIG", default_value = "prefixmail.toml")]
    config: PathBuf,

    /// Envelope recipient given by the MTA
    #[arg(short, long)]
    recipient: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Args::parse()).await {
        Ok(receipt) => {
            println!("{receipt}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Message not ingested, delivery deferred");
            ExitCode::from(EX_TEMPFAIL)
        }
    }
}

/// Ingests the message read from stdin, returning the JSON receipt.
async fn run(args: Args) -> Result<String, Box<dyn Error>> {
    let config = load_config(&args.config)?;

    let mut data = Vec::new();
    tokio::io::stdin().read_to_end(&mut data).await?;

    let store = Arc::new(SqliteStore::open(&config.storage.database)?);
    let blobs = Arc::new(FileBlobStore::new(&config.storage.attachments));
    let mut pipeline = IngestPipeline::new(store, blobs);
    if let Some(notifier) = TelegramNotifier::from_config(&config.notify.telegram)? {
        pipeline = pipeline.with_notifier(Arc::new(notifier));
    }
    if let Some(forwarder) = SmtpForwarder::from_config(&config.forward)? {
        pipeline = pipeline.with_forwarder(Arc::new(forwarder));
    }

    let receipt = ingest_trigger(&pipeline, data, args.recipient, &config.ingest_settings()).await?;
    Ok(serde_json::to_string(&receipt)?)
}
