//! IMAP mail transport for the polling mode.
//!
//! The `imap` client is synchronous, so every operation opens its own
//! session on a blocking thread, with connect, read and write timeouts on
//! the socket. Unseen UIDs are searched first and fetched in batches with
//! `BODY.PEEK[]`, so they are only flagged `\Seen` through
//! [`MailTransport::mark_seen`].

use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    future::Future,
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use rustls::{pki_types::ServerName, ClientConfig, ClientConnection, StreamOwned};
use tracing::{debug, info, warn};

use crate::{load_tls_client_config, ImapConfig};

const SINCE_SLACK_DAYS: i64 = 1;

/// Result type for mail transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Boxed future type for mail transports, enabling object safety.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = TransportResult<T>> + Send + 'a>>;

/// A message as fetched from the mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub uid: u32,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum TransportError {
    Connect(String),
    Tls(String),
    Login(String),
    Select(String),
    Search(String),
    Fetch(String),
    /// A network operation exceeded the configured timeout.
    Timeout(String),
    /// The blocking worker failed.
    Task(String),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "Connection error: {msg}"),
            TransportError::Tls(msg) => write!(f, "TLS error: {msg}"),
            TransportError::Login(msg) => write!(f, "Login error: {msg}"),
            TransportError::Select(msg) => write!(f, "Select error: {msg}"),
            TransportError::Search(msg) => write!(f, "Search error: {msg}"),
            TransportError::Fetch(msg) => write!(f, "Fetch error: {msg}"),
            TransportError::Timeout(msg) => write!(f, "Timeout: {msg}"),
            TransportError::Task(msg) => write!(f, "Task error: {msg}"),
        }
    }
}

impl Error for TransportError {}

/// Trait for mailboxes the poller reads from.
pub trait MailTransport: Send + Sync {
    /// Lists the UIDs of unseen messages in ascending order, restricted
    /// to those received around or after `since` when given.
    fn search_unseen(&self, since: Option<DateTime<Utc>>) -> TransportFuture<'_, Vec<u32>>;

    /// Fetches the messages with the given UIDs without flagging them.
    /// A message that can not be fetched on its own is left out.
    fn fetch<'a>(&'a self, uids: &'a [u32]) -> TransportFuture<'a, Vec<FetchedMessage>>;

    /// Flags the given messages as `\Seen`.
    fn mark_seen<'a>(&'a self, uids: &'a [u32]) -> TransportFuture<'a, ()>;

    /// Identifies the mailbox, used as the key of its fetch watermark.
    fn source(&self) -> &str;
}

trait ImapStream: Read + Write + Send {}

impl<T: Read + Write + Send> ImapStream for T {}

type ImapSession = ::imap::Session<Box<dyn ImapStream>>;

pub struct ImapTransport {
    config: Arc<ImapConfig>,
    tls: Option<Arc<ClientConfig>>,
    source: String,
}

impl ImapTransport {
    pub fn new(config: ImapConfig) -> TransportResult<Self> {
        let tls = match config.tls {
            true => Some(Arc::new(
                load_tls_client_config(config.ca_file.as_deref())
                    .map_err(|e| TransportError::Tls(e.to_string()))?,
            )),
            false => None,
        };
        let source = format!("{}/{}", config.host, config.mailbox);
        info!(
            host = %config.host,
            port = config.port,
            mailbox = %config.mailbox,
            tls = config.tls,
            "IMAP transport initialized"
        );
        Ok(Self {
            config: Arc::new(config),
            tls,
            source,
        })
    }

    async fn blocking<T, F>(&self, op: F) -> TransportResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ImapConfig, Option<&Arc<ClientConfig>>) -> TransportResult<T> + Send + 'static,
    {
        let config = self.config.clone();
        let tls = self.tls.clone();
        tokio::task::spawn_blocking(move || op(&config, tls.as_ref()))
            .await
            .map_err(|e| TransportError::Task(e.to_string()))?
    }
}

impl MailTransport for ImapTransport {
    fn search_unseen(&self, since: Option<DateTime<Utc>>) -> TransportFuture<'_, Vec<u32>> {
        Box::pin(async move {
            let uids = self
                .blocking(move |config, tls| {
                    let mut session = selected_session(config, tls)?;
                    let mut uids: Vec<u32> = session
                        .uid_search(search_query(since))
                        .map_err(|e| classify(e, TransportError::Search))?
                        .into_iter()
                        .collect();
                    uids.sort_unstable();
                    session.logout().ok();
                    Ok(uids)
                })
                .await?;
            debug!(
                host = %self.config.host,
                mailbox = %self.config.mailbox,
                count = uids.len(),
                "Found unseen messages"
            );
            Ok(uids)
        })
    }

    fn fetch<'a>(&'a self, uids: &'a [u32]) -> TransportFuture<'a, Vec<FetchedMessage>> {
        Box::pin(async move {
            if uids.is_empty() {
                return Ok(Vec::new());
            }
            let uids = uids.to_vec();
            self.blocking(move |config, tls| fetch_blocking(config, tls, &uids))
                .await
        })
    }

    fn mark_seen<'a>(&'a self, uids: &'a [u32]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if uids.is_empty() {
                return Ok(());
            }
            let sequence = uid_sequence(uids);
            self.blocking(move |config, tls| {
                let mut session = selected_session(config, tls)?;
                session
                    .uid_store(&sequence, "+FLAGS (\\Seen)")
                    .map_err(|e| classify(e, TransportError::Fetch))?;
                session.logout().ok();
                Ok(())
            })
            .await
        })
    }

    fn source(&self) -> &str {
        &self.source
    }
}

fn fetch_blocking(
    config: &ImapConfig,
    tls: Option<&Arc<ClientConfig>>,
    uids: &[u32],
) -> TransportResult<Vec<FetchedMessage>> {
    let mut session = selected_session(config, tls)?;
    let mut messages = Vec::with_capacity(uids.len());
    for &uid in uids {
        let fetches = match session.uid_fetch(uid.to_string(), "(UID BODY.PEEK[])") {
            Ok(fetches) => fetches,
            Err(e) => match classify(e, TransportError::Fetch) {
                TransportError::Fetch(msg) => {
                    warn!(
                        mailbox = %config.mailbox,
                        uid = uid,
                        error = %msg,
                        "Failed to fetch message"
                    );
                    continue;
                }
                error => return Err(error),
            },
        };
        for fetch in fetches.iter() {
            match fetch.body() {
                Some(body) => messages.push(FetchedMessage {
                    uid: fetch.uid.unwrap_or(uid),
                    data: body.to_vec(),
                }),
                None => warn!(mailbox = %config.mailbox, uid = uid, "Fetched message has no body"),
            }
        }
    }

    session.logout().ok();
    Ok(messages)
}

fn selected_session(config: &ImapConfig, tls: Option<&Arc<ClientConfig>>) -> TransportResult<ImapSession> {
    let mut session = open_session(config, tls)?;
    session
        .select(&config.mailbox)
        .map_err(|e| classify(e, TransportError::Select))?;
    Ok(session)
}

fn open_session(config: &ImapConfig, tls: Option<&Arc<ClientConfig>>) -> TransportResult<ImapSession> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let address = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect(format!("{}:{}: {e}", config.host, config.port)))?
        .next()
        .ok_or_else(|| TransportError::Connect(format!("{} did not resolve", config.host)))?;

    let tcp = TcpStream::connect_timeout(&address, timeout)
        .map_err(|e| io_error(e, TransportError::Connect))?;
    tcp.set_read_timeout(Some(timeout))
        .and_then(|_| tcp.set_write_timeout(Some(timeout)))
        .map_err(|e| io_error(e, TransportError::Connect))?;

    let stream: Box<dyn ImapStream> = match tls {
        Some(tls) => {
            let server_name = ServerName::try_from(config.host.clone())
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            let connection = ClientConnection::new(tls.clone(), server_name)
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            Box::new(StreamOwned::new(connection, tcp))
        }
        None => Box::new(tcp),
    };

    let mut client = ::imap::Client::new(stream);
    client
        .read_greeting()
        .map_err(|e| classify(e, TransportError::Connect))?;
    client
        .login(&config.username, &config.password)
        .map_err(|(e, _)| classify(e, TransportError::Login))
}

/// Maps an `imap` error, setting apart socket timeouts.
fn classify(error: ::imap::error::Error, wrap: fn(String) -> TransportError) -> TransportError {
    match error {
        ::imap::error::Error::Io(e) => io_error(e, wrap),
        error => wrap(error.to_string()),
    }
}

fn io_error(error: io::Error, wrap: fn(String) -> TransportError) -> TransportError {
    match error.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout(error.to_string()),
        _ => wrap(error.to_string()),
    }
}

/// Builds the `UID SEARCH` criteria.
///
/// `SINCE` compares dates in the server's own timezone, which may lag
/// UTC, so the search starts one day before the watermark. The overlap
/// is absorbed by Message-ID dedupe.
fn search_query(since: Option<DateTime<Utc>>) -> String {
    match since {
        Some(since) => {
            let day = since
                .checked_sub_signed(chrono::Duration::days(SINCE_SLACK_DAYS))
                .unwrap_or(since);
            format!("UNSEEN SINCE {}", day.format("%d-%b-%Y"))
        }
        None => "UNSEEN".to_string(),
    }
}

fn uid_sequence(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use chrono::TimeZone;

    use super::*;

    fn plain_config(port: u16) -> ImapConfig {
        ImapConfig {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
            timeout_secs: 1,
            ..ImapConfig::default()
        }
    }

    #[test]
    fn test_search_query() {
        assert_eq!(search_query(None), "UNSEEN");
        let since = Utc.with_ymd_and_hms(2026, 3, 7, 23, 59, 0).unwrap();
        assert_eq!(search_query(Some(since)), "UNSEEN SINCE 06-Mar-2026");

        // 07-Mar 18:00 at UTC-8 is already 08-Mar in UTC
        let since = Utc.with_ymd_and_hms(2026, 3, 8, 1, 5, 0).unwrap();
        assert_eq!(search_query(Some(since)), "UNSEEN SINCE 07-Mar-2026");
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap();
        assert_eq!(search_query(Some(since)), "UNSEEN SINCE 31-Dec-2025");
    }

    #[test]
    fn test_uid_sequence() {
        assert_eq!(uid_sequence(&[3, 1, 20]), "3,1,20");
    }

    #[test]
    fn test_transport_source() {
        let transport = ImapTransport::new(ImapConfig {
            host: "imap.example.com".to_string(),
            mailbox: "Archive".to_string(),
            ..ImapConfig::default()
        })
        .unwrap();
        assert_eq!(transport.source(), "imap.example.com/Archive");
        assert!(transport.tls.is_some());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = ImapTransport::new(plain_config(port)).unwrap();
        let result = transport.search_unseen(None).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(3));
            drop(socket);
        });

        let transport = ImapTransport::new(plain_config(port)).unwrap();
        let result = transport.search_unseen(None).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_empty_uid_lists_skip_the_server() {
        let transport = ImapTransport::new(plain_config(1)).unwrap();
        assert!(transport.mark_seen(&[]).await.is_ok());
        assert!(transport.fetch(&[]).await.unwrap().is_empty());
    }
}
