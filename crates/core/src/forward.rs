use std::{error::Error, fmt::Display, future::Future, pin::Pin, time::Duration};

use lettre::{
    address::Envelope, transport::smtp::authentication::Credentials, Address, AsyncSmtpTransport,
    AsyncTransport, Tokio1Executor,
};
use tracing::{debug, info};

use crate::ForwardConfig;

/// Result type for forwarding operations.
pub type ForwardResult<T> = Result<T, ForwardError>;

/// Boxed future type for forwarders, enabling object safety.
pub type ForwardFuture<'a> = Pin<Box<dyn Future<Output = ForwardResult<()>> + Send + 'a>>;

#[derive(Debug)]
pub enum ForwardError {
    /// An address of the envelope is not valid.
    Address(String),
    /// The relay could not be configured.
    Config(String),
    /// The relay refused or failed the delivery.
    Delivery(String),
}

impl Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Address(msg) => write!(f, "Invalid address: {msg}"),
            ForwardError::Config(msg) => write!(f, "Relay configuration error: {msg}"),
            ForwardError::Delivery(msg) => write!(f, "Delivery error: {msg}"),
        }
    }
}

impl Error for ForwardError {}

/// Trait for relays re-delivering the original message bytes.
pub trait Forwarder: Send + Sync {
    /// Forwards `raw`, untouched, to the `target` address.
    fn forward<'a>(&'a self, raw: &'a [u8], target: &'a str) -> ForwardFuture<'a>;

    /// Returns the name of this forwarder.
    fn name(&self) -> &str;
}

/// Forwarder relaying through an SMTP submission server.
pub struct SmtpForwarder {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Address,
}

impl SmtpForwarder {
    /// Builds the forwarder from configuration, `None` when no relay host
    /// is configured.
    pub fn from_config(config: &ForwardConfig) -> ForwardResult<Option<Self>> {
        let Some(host) = config.host.as_deref().filter(|host| !host.is_empty()) else {
            return Ok(None);
        };
        let from = config
            .from
            .parse::<Address>()
            .map_err(|e| ForwardError::Address(format!("{}: {e}", config.from)))?;

        let invalid_host = |e: lettre::transport::smtp::Error| {
            ForwardError::Config(format!("invalid SMTP host '{host}': {e}"))
        };
        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(invalid_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host).map_err(invalid_host)?
        };

        let mut builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        info!(
            host = %host,
            port = config.port,
            starttls = config.starttls,
            "SMTP forwarder initialized"
        );
        Ok(Some(Self {
            transport: builder.build(),
            from,
        }))
    }
}

impl Forwarder for SmtpForwarder {
    fn forward<'a>(&'a self, raw: &'a [u8], target: &'a str) -> ForwardFuture<'a> {
        Box::pin(async move {
            let to = target
                .parse::<Address>()
                .map_err(|e| ForwardError::Address(format!("{target}: {e}")))?;
            let envelope = Envelope::new(Some(self.from.clone()), vec![to])
                .map_err(|e| ForwardError::Address(e.to_string()))?;
            let response = self
                .transport
                .send_raw(&envelope, raw)
                .await
                .map_err(|e| ForwardError::Delivery(e.to_string()))?;
            debug!(target = %target, code = %response.code(), "Message forwarded");
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_disabled_without_host() {
        let forwarder = SmtpForwarder::from_config(&ForwardConfig::default()).unwrap();
        assert!(forwarder.is_none());
    }

    #[tokio::test]
    async fn test_from_config_builds_transport() {
        let config = ForwardConfig {
            host: Some("smtp.example.com".to_string()),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            from: "relay@example.com".to_string(),
            ..ForwardConfig::default()
        };
        let forwarder = SmtpForwarder::from_config(&config).unwrap().unwrap();
        assert_eq!(forwarder.name(), "smtp");
        assert_eq!(forwarder.from.to_string(), "relay@example.com");
    }

    #[test]
    fn test_from_config_invalid_sender() {
        let config = ForwardConfig {
            host: Some("smtp.example.com".to_string()),
            from: "not an address".to_string(),
            ..ForwardConfig::default()
        };
        assert!(matches!(
            SmtpForwarder::from_config(&config),
            Err(ForwardError::Address(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_invalid_target() {
        let config = ForwardConfig {
            host: Some("smtp.example.com".to_string()),
            ..ForwardConfig::default()
        };
        let forwarder = SmtpForwarder::from_config(&config).unwrap().unwrap();
        let result = forwarder.forward(b"Subject: x\r\n\r\nbody", "nope").await;
        assert!(matches!(result, Err(ForwardError::Address(_))));
    }
}
