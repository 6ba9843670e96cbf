//! Recovery of the original recipient of a catch-all delivery.
//!
//! Catch-all forwarding rewrites the `To` header, so the address a mail
//! was actually sent to has to be recovered from the headers relays add
//! on the way. [`RECIPIENT_HEADERS`] lists them by decreasing priority.

use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    sync::OnceLock,
};

use regex::Regex;

use crate::header_value;

/// Headers carrying the original recipient, highest priority first.
pub const RECIPIENT_HEADERS: [&str; 6] = [
    "X-Original-To",
    "Original-Recipient",
    "Delivered-To",
    "Envelope-To",
    "X-Receiver",
    "X-Forwarded-To",
];

/// Source name used when the recipient came from the transport envelope.
pub const ENVELOPE_SOURCE: &str = "envelope";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No header nor the fallback yielded a usable address.
    Unresolvable,
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::Unresolvable => write!(f, "No recipient address could be resolved"),
        }
    }
}

impl Error for ResolveError {}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// A normalized recipient address and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipient {
    /// Lowercase `local@domain`, plus-tag removed when configured.
    pub address: String,

    /// Header name the address was extracted from, or
    /// [`ENVELOPE_SOURCE`].
    pub source: String,

    /// Value the address was extracted from, before normalization.
    pub raw_value: String,
}

impl ResolvedRecipient {
    pub fn local_part(&self) -> &str {
        self.address
            .split_once('@')
            .map(|(local, _)| local)
            .unwrap_or(&self.address)
    }

    pub fn domain(&self) -> &str {
        self.address
            .split_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecipientResolver {
    strip_plus_tag: bool,
}

impl RecipientResolver {
    pub fn new(strip_plus_tag: bool) -> Self {
        Self { strip_plus_tag }
    }

    /// Resolves the original recipient from the ordered `headers`.
    ///
    /// The first header of [`RECIPIENT_HEADERS`] that is present and holds
    /// a parseable address wins. When none does, the envelope recipient
    /// and then the `To` header are tried with the same extraction.
    pub fn resolve(
        &self,
        headers: &[(String, String)],
        envelope_recipient: Option<&str>,
    ) -> ResolveResult<ResolvedRecipient> {
        let candidates = RECIPIENT_HEADERS
            .iter()
            .filter_map(|name| header_value(headers, name).map(|value| (*name, value)))
            .chain(envelope_recipient.map(|value| (ENVELOPE_SOURCE, value)))
            .chain(header_value(headers, "To").map(|value| ("To", value)));

        for (source, value) in candidates {
            let Some(address) = extract_address(value)
                .and_then(|address| normalize_address(&address, self.strip_plus_tag))
            else {
                continue;
            };
            return Ok(ResolvedRecipient {
                address,
                source: source.to_string(),
                raw_value: value.to_string(),
            });
        }

        Err(ResolveError::Unresolvable)
    }
}

fn angle_regex() -> &'static Regex {
    static ANGLE: OnceLock<Regex> = OnceLock::new();
    ANGLE.get_or_init(|| Regex::new(r"<\s*([^<>\s]+@[^<>\s]+)\s*>").unwrap())
}

fn bare_regex() -> &'static Regex {
    static BARE: OnceLock<Regex> = OnceLock::new();
    BARE.get_or_init(|| Regex::new(r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[A-Za-z]{2,}").unwrap())
}

/// Extracts the first address of a header value, preferring the content
/// of angle brackets over a bare `local@domain` match.
///
/// ```rust
/// use prefixmail_core::extract_address;
///
/// assert_eq!(extract_address("Support <Support@Example.com>"), Some("Support@Example.com".to_string()));
/// assert_eq!(extract_address("alice@example.com (Alice)"), Some("alice@example.com".to_string()));
/// assert_eq!(extract_address("undisclosed-recipients:;"), None);
/// ```
pub fn extract_address(value: &str) -> Option<String> {
    if let Some(captures) = angle_regex().captures(value) {
        return captures.get(1).map(|found| found.as_str().to_string());
    }
    bare_regex()
        .find(value)
        .map(|found| found.as_str().to_string())
}

/// Lowercases an address and optionally drops the `+tag` of its
/// local-part. Returns `None` when the result is not `local@domain` with
/// both parts non-empty.
///
/// ```rust
/// use prefixmail_core::normalize_address;
///
/// assert_eq!(normalize_address("Foo+Bar@Example.com", true), Some("foo@example.com".to_string()));
/// assert_eq!(normalize_address("Foo+Bar@Example.com", false), Some("foo+bar@example.com".to_string()));
/// assert_eq!(normalize_address("+only@example.com", true), None);
/// ```
pub fn normalize_address(address: &str, strip_plus_tag: bool) -> Option<String> {
    let address = address.trim().to_lowercase();
    let (local, domain) = address.split_once('@')?;
    if domain.is_empty() || domain.contains('@') {
        return None;
    }
    let local = match strip_plus_tag {
        true => local.split('+').next().unwrap_or_default(),
        false => local,
    };
    if local.is_empty() {
        return None;
    }
    Some(format!("{local}@{domain}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_priority_order() {
        let headers = headers(&[
            ("To", "catchall@example.com"),
            ("Delivered-To", "billing@example.com"),
            ("X-Original-To", "<Support+Urgent@Example.com>"),
        ]);
        let resolved = RecipientResolver::new(true)
            .resolve(&headers, Some("envelope@example.com"))
            .unwrap();
        assert_eq!(resolved.address, "support@example.com");
        assert_eq!(resolved.source, "X-Original-To");
        assert_eq!(resolved.raw_value, "<Support+Urgent@Example.com>");
        assert_eq!(resolved.local_part(), "support");
        assert_eq!(resolved.domain(), "example.com");
    }

    #[test]
    fn test_resolve_header_name_case_insensitive() {
        let headers = headers(&[("delivered-to", "Billing@Example.com")]);
        let resolved = RecipientResolver::new(true).resolve(&headers, None).unwrap();
        assert_eq!(resolved.address, "billing@example.com");
        assert_eq!(resolved.source, "Delivered-To");
    }

    #[test]
    fn test_resolve_plus_tag_preserved() {
        let headers = headers(&[("Delivered-To", "foo+bar@example.com")]);
        let resolved = RecipientResolver::new(false)
            .resolve(&headers, None)
            .unwrap();
        assert_eq!(resolved.address, "foo+bar@example.com");
    }

    #[test]
    fn test_resolve_skips_unparseable_header() {
        let headers = headers(&[
            ("X-Original-To", "undisclosed"),
            ("Envelope-To", "team@example.com"),
        ]);
        let resolved = RecipientResolver::new(true).resolve(&headers, None).unwrap();
        assert_eq!(resolved.address, "team@example.com");
        assert_eq!(resolved.source, "Envelope-To");
    }

    #[test]
    fn test_resolve_falls_back_to_envelope_then_to() {
        let only_to = headers(&[("To", "Alice <alice@example.com>, bob@example.com")]);
        let resolver = RecipientResolver::new(true);

        let resolved = resolver.resolve(&only_to, Some("Rcpt@Example.com")).unwrap();
        assert_eq!(resolved.address, "rcpt@example.com");
        assert_eq!(resolved.source, ENVELOPE_SOURCE);

        let resolved = resolver.resolve(&only_to, None).unwrap();
        assert_eq!(resolved.address, "alice@example.com");
        assert_eq!(resolved.source, "To");
    }

    #[test]
    fn test_resolve_unresolvable() {
        let headers = headers(&[("Subject", "no recipients"), ("To", "undisclosed-recipients:;")]);
        assert_eq!(
            RecipientResolver::new(true).resolve(&headers, None),
            Err(ResolveError::Unresolvable)
        );
    }

    #[test]
    fn test_extract_address_bare_inside_text() {
        assert_eq!(
            extract_address("for <x> delivered to foo.bar@mail.example.org; Tue"),
            Some("foo.bar@mail.example.org".to_string())
        );
    }
}
