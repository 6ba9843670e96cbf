//! Raw message wrapper handed to the ingestion pipeline.
//!
//! A [`RawMessage`] is the unparsed RFC 5322 octet stream as fetched from
//! IMAP or delivered by a trigger, together with the envelope recipient
//! when the source knows it. The header section is parsed once on
//! construction so that recipient resolution never needs the full MIME
//! parser.

use sha2::{Digest, Sha256};

use crate::{header_section, header_value, parse_raw_headers};

#[derive(Debug, Clone)]
pub struct RawMessage {
    data: Vec<u8>,

    /// Recipient given by the transport envelope, if any.
    envelope_recipient: Option<String>,

    /// Ordered header list (case-preserved keys, unfolded values).
    headers: Vec<(String, String)>,
}

impl RawMessage {
    pub fn new(data: Vec<u8>, envelope_recipient: Option<String>) -> Self {
        let (headers, _) = parse_raw_headers(&header_section(&data));
        let envelope_recipient = envelope_recipient
            .map(|recipient| recipient.trim().to_string())
            .filter(|recipient| !recipient.is_empty());
        Self {
            data,
            envelope_recipient,
            headers,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn envelope_recipient(&self) -> Option<&str> {
        self.envelope_recipient.as_deref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Hex encoded SHA-256 of the raw bytes.
    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(&self.data))
    }

    /// Message-ID derived from the content, used when the message carries
    /// none. Identical bytes always produce the same identifier, which
    /// keeps re-delivery of such messages idempotent.
    pub fn synthetic_message_id(&self, domain: &str) -> String {
        format!("{}@{}", self.content_hash(), domain)
    }
}

/// Strips the angle brackets and surrounding whitespace of a Message-ID.
///
/// ```rust
/// assert_eq!(prefixmail_core::clean_message_id(" <abc@host> "), "abc@host");
/// assert_eq!(prefixmail_core::clean_message_id("abc@host"), "abc@host");
/// ```
pub fn clean_message_id(value: &str) -> &str {
    let value = value.trim();
    let value = value.strip_prefix('<').unwrap_or(value);
    let value = value.strip_suffix('>').unwrap_or(value);
    value.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_message_headers() {
        let raw = RawMessage::new(
            b"Delivered-To: support@example.com\r\nSubject: Hello\r\n\r\nDelivered-To: x@y.com\r\n"
                .to_vec(),
            Some("  ".to_string()),
        );
        assert_eq!(raw.header("delivered-to"), Some("support@example.com"));
        assert_eq!(raw.headers().len(), 2);
        assert_eq!(raw.envelope_recipient(), None);
    }

    #[test]
    fn test_synthetic_message_id_deterministic() {
        let first = RawMessage::new(b"Subject: a\r\n\r\nbody".to_vec(), None);
        let second = RawMessage::new(b"Subject: a\r\n\r\nbody".to_vec(), None);
        let other = RawMessage::new(b"Subject: b\r\n\r\nbody".to_vec(), None);
        assert_eq!(
            first.synthetic_message_id("prefixmail.local"),
            second.synthetic_message_id("prefixmail.local")
        );
        assert_ne!(
            first.synthetic_message_id("prefixmail.local"),
            other.synthetic_message_id("prefixmail.local")
        );
        assert!(first
            .synthetic_message_id("prefixmail.local")
            .ends_with("@prefixmail.local"));
        assert_eq!(first.content_hash().len(), 64);
    }
}
