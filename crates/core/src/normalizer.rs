//! Conversion of a parsed MIME message into the stored email shape.
//!
//! Normalization is a pure transform: it neither touches storage nor
//! reads the clock, so the same inputs always yield the same
//! [`NormalizedEmail`].

use chrono::{DateTime, Utc};
use mail_parser::{Address, HeaderValue, Message, MessagePart, MimeHeaders, PartType};
use sha2::{Digest, Sha256};

use crate::{
    clean_message_id, normalize_address, AttachmentMeta, Mailbox, NewEmail, PrefixRecord,
    RawMessage, ResolvedRecipient, NO_OWNER_ID,
};

const DEFAULT_ATTACHMENT_NAME: &str = "attachment";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Attachment metadata together with its decoded content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentBlob {
    pub meta: AttachmentMeta,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NormalizedEmail {
    pub email: NewEmail,

    /// Attachments with inline ones first, in message order otherwise.
    pub attachments: Vec<AttachmentBlob>,
}

impl NormalizedEmail {
    pub fn inline(&self) -> impl Iterator<Item = &AttachmentBlob> {
        self.attachments.iter().filter(|blob| blob.meta.inline)
    }

    pub fn metas(&self) -> Vec<AttachmentMeta> {
        self.attachments.iter().map(|blob| blob.meta.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    /// Domain of Message-ID values synthesized for messages without one.
    message_id_domain: String,

    /// Same policy the recipient was resolved with.
    strip_plus_tag: bool,
}

impl Normalizer {
    pub fn new(message_id_domain: impl Into<String>, strip_plus_tag: bool) -> Self {
        Self {
            message_id_domain: message_id_domain.into(),
            strip_plus_tag,
        }
    }

    /// Builds the email record for `message` addressed to `recipient`.
    ///
    /// Ownership ids are copied from `owner`, or set to [`NO_OWNER_ID`]
    /// when no prefix claimed the recipient.
    pub fn normalize(
        &self,
        message: &Message<'_>,
        raw: &RawMessage,
        recipient: &ResolvedRecipient,
        owner: Option<&PrefixRecord>,
        received_at: DateTime<Utc>,
    ) -> NormalizedEmail {
        let message_id = message
            .message_id()
            .map(clean_message_id)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| raw.synthetic_message_id(&self.message_id_domain));

        let sender = message.from().and_then(|from| from.first());
        let from_address = sender
            .and_then(|addr| addr.address())
            .map(|address| address.trim().to_string())
            .unwrap_or_default();
        let from_name = sender
            .and_then(|addr| addr.name())
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| local_part(&from_address).to_string());

        let email = NewEmail {
            message_id,
            from_address,
            from_name,
            to_address: recipient.address.clone(),
            to_name: recipient_name(message, recipient, self.strip_plus_tag),
            recipients: mailboxes(message.to()),
            cc: mailboxes(message.cc()),
            bcc: mailboxes(message.bcc()),
            subject: message.subject().unwrap_or_default().to_string(),
            body_text: message
                .body_text(0)
                .map(|text| text.into_owned())
                .unwrap_or_default(),
            body_html: html_body(message).unwrap_or_default(),
            in_reply_to: first_text(message.in_reply_to()).unwrap_or_default(),
            references: text_list(message.references()).join(" "),
            received_at,
            user_id: owner.map_or(NO_OWNER_ID, |owner| owner.user_id),
            account_id: owner.map_or(NO_OWNER_ID, |owner| owner.account_id),
        };

        let (inline, regular): (Vec<_>, Vec<_>) = message
            .attachments()
            .map(attachment_blob)
            .partition(|blob| blob.meta.inline);

        NormalizedEmail {
            email,
            attachments: inline.into_iter().chain(regular).collect(),
        }
    }
}

fn local_part(address: &str) -> &str {
    address.split_once('@').map_or(address, |(local, _)| local)
}

/// Display name of the `To` entry matching the resolved recipient, both
/// compared under the `strip_plus_tag` policy.
fn recipient_name(
    message: &Message<'_>,
    recipient: &ResolvedRecipient,
    strip_plus_tag: bool,
) -> String {
    let wanted = normalize_address(&recipient.address, strip_plus_tag);
    message
        .to()
        .into_iter()
        .flat_map(|to| to.iter())
        .find(|addr| {
            addr.address()
                .and_then(|address| normalize_address(address, strip_plus_tag))
                .is_some_and(|address| Some(address) == wanted)
        })
        .and_then(|addr| addr.name())
        .map(|name| name.trim().to_string())
        .unwrap_or_default()
}

fn mailboxes(list: Option<&Address<'_>>) -> Vec<Mailbox> {
    list.into_iter()
        .flat_map(|list| list.iter())
        .filter_map(|addr| {
            let address = addr.address()?.trim();
            (!address.is_empty()).then(|| Mailbox {
                address: address.to_string(),
                name: addr.name().map(|name| name.trim().to_string()).unwrap_or_default(),
            })
        })
        .collect()
}

/// Body of the first genuine `text/html` part. Text only messages have
/// none, the parser would otherwise synthesize one from the text body.
fn html_body(message: &Message<'_>) -> Option<String> {
    match &message.html_part(0)?.body {
        PartType::Html(html) => Some(html.to_string()),
        _ => None,
    }
}

fn first_text(value: &HeaderValue<'_>) -> Option<String> {
    match value {
        HeaderValue::Text(text) => Some(clean_message_id(text).to_string()),
        HeaderValue::TextList(list) => list.first().map(|text| clean_message_id(text).to_string()),
        _ => None,
    }
}

fn text_list(value: &HeaderValue<'_>) -> Vec<String> {
    match value {
        HeaderValue::Text(text) => vec![clean_message_id(text).to_string()],
        HeaderValue::TextList(list) => list
            .iter()
            .map(|text| clean_message_id(text).to_string())
            .collect(),
        _ => Vec::new(),
    }
}

fn attachment_blob(part: &MessagePart<'_>) -> AttachmentBlob {
    let content = part.contents().to_vec();
    let filename = part
        .attachment_name()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_ATTACHMENT_NAME)
        .to_string();
    let content_type = part
        .content_type()
        .map(|ct| match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        })
        .map(|ct| ct.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    let content_id = part
        .content_id()
        .map(clean_message_id)
        .filter(|cid| !cid.is_empty())
        .map(str::to_string);

    AttachmentBlob {
        meta: AttachmentMeta {
            key: content_key(&content, &filename),
            size: content.len() as u64,
            inline: content_id.is_some(),
            filename,
            content_type,
            content_id,
        },
        content,
    }
}

/// Storage key of an attachment, the hex SHA-256 of its content followed
/// by the lowercase extension of its filename.
///
/// ```rust
/// let key = prefixmail_core::content_key(b"hello", "Report.PDF");
/// assert_eq!(key, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.pdf");
/// assert!(!prefixmail_core::content_key(b"hello", "noext").contains('.'));
/// ```
pub fn content_key(content: &[u8], filename: &str) -> String {
    let hash = hex::encode(Sha256::digest(content));
    match file_extension(filename) {
        Some(extension) => format!("{hash}.{extension}"),
        None => hash,
    }
}

fn file_extension(filename: &str) -> Option<String> {
    let (stem, extension) = filename.rsplit_once('.')?;
    let valid = !stem.is_empty()
        && !extension.is_empty()
        && extension.len() <= 10
        && extension.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| extension.to_ascii_lowercase())
}

/// Replaces `cid:` references of inline attachments in `html` with
/// `base_url/key`.
///
/// ```rust
/// use prefixmail_core::{rewrite_cid_references, AttachmentMeta};
///
/// let logo = AttachmentMeta {
///     filename: "logo.png".to_string(),
///     content_type: "image/png".to_string(),
///     size: 4,
///     key: "abcd.png".to_string(),
///     content_id: Some("logo@mail".to_string()),
///     inline: true,
/// };
/// let html = rewrite_cid_references("<img src=\"cid:logo@mail\">", &[logo], "https://files/");
/// assert_eq!(html, "<img src=\"https://files/abcd.png\">");
/// ```
pub fn rewrite_cid_references(html: &str, attachments: &[AttachmentMeta], base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    attachments
        .iter()
        .filter(|meta| meta.inline)
        .filter_map(|meta| meta.content_id.as_deref().map(|cid| (cid, &meta.key)))
        .fold(html.to_string(), |html, (cid, key)| {
            html.replace(&format!("cid:{cid}"), &format!("{base_url}/{key}"))
        })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use mail_parser::MessageParser;

    use super::*;

    const MULTIPART: &str = concat!(
        "From: \"Alice Sender\" <alice@example.org>\r\n",
        "To: \"Support Team\" <Support@Example.com>, bob@example.com\r\n",
        "Cc: Ops <ops@example.com>\r\n",
        "Subject: Invoice\r\n",
        "Message-ID: <inv-1@example.org>\r\n",
        "In-Reply-To: <prev@example.org>\r\n",
        "References: <root@example.org> <prev@example.org>\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
        "\r\n",
        "--outer\r\n",
        "Content-Type: multipart/related; boundary=\"inner\"\r\n",
        "\r\n",
        "--inner\r\n",
        "Content-Type: text/html; charset=utf-8\r\n",
        "\r\n",
        "<p>See <img src=\"cid:logo@example.org\"></p>\r\n",
        "--inner\r\n",
        "Content-Type: image/png; name=\"logo.png\"\r\n",
        "Content-ID: <logo@example.org>\r\n",
        "Content-Disposition: inline; filename=\"logo.png\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "iVBORw0KGgo=\r\n",
        "--inner--\r\n",
        "--outer\r\n",
        "Content-Type: application/pdf; name=\"Invoice.PDF\"\r\n",
        "Content-Disposition: attachment; filename=\"Invoice.PDF\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "JVBERi0xLjQ=\r\n",
        "--outer--\r\n",
    );

    fn recipient(address: &str) -> ResolvedRecipient {
        ResolvedRecipient {
            address: address.to_string(),
            source: "Delivered-To".to_string(),
            raw_value: address.to_string(),
        }
    }

    fn owner() -> PrefixRecord {
        PrefixRecord {
            id: 1,
            prefix: "support".to_string(),
            password_hash: String::new(),
            user_id: 42,
            account_id: 43,
            is_active: true,
            last_access_time: None,
            access_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_multipart() {
        let raw = RawMessage::new(MULTIPART.as_bytes().to_vec(), None);
        let message = MessageParser::default().parse(raw.data()).unwrap();
        let received_at = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap();
        let owner = owner();

        let normalized = Normalizer::new("prefixmail.local", true).normalize(
            &message,
            &raw,
            &recipient("support@example.com"),
            Some(&owner),
            received_at,
        );
        let email = &normalized.email;
        assert_eq!(email.message_id, "inv-1@example.org");
        assert_eq!(email.from_address, "alice@example.org");
        assert_eq!(email.from_name, "Alice Sender");
        assert_eq!(email.to_address, "support@example.com");
        assert_eq!(email.to_name, "Support Team");
        assert_eq!(email.recipients.len(), 2);
        assert_eq!(email.recipients[0].address, "Support@Example.com");
        assert_eq!(email.recipients[1].address, "bob@example.com");
        assert!(email.recipients[1].name.is_empty());
        assert_eq!(
            email.cc,
            vec![Mailbox {
                address: "ops@example.com".to_string(),
                name: "Ops".to_string(),
            }]
        );
        assert!(email.bcc.is_empty());
        assert_eq!(email.subject, "Invoice");
        assert!(email.body_html.contains("cid:logo@example.org"));
        assert_eq!(email.in_reply_to, "prev@example.org");
        assert_eq!(email.references, "root@example.org prev@example.org");
        assert_eq!(email.received_at, received_at);
        assert_eq!(email.user_id, 42);
        assert_eq!(email.account_id, 43);

        assert_eq!(normalized.attachments.len(), 2);
        let logo = &normalized.attachments[0];
        assert!(logo.meta.inline);
        assert_eq!(logo.meta.content_id.as_deref(), Some("logo@example.org"));
        assert_eq!(logo.meta.content_type, "image/png");
        assert!(logo.meta.key.ends_with(".png"));
        let pdf = &normalized.attachments[1];
        assert!(!pdf.meta.inline);
        assert_eq!(pdf.meta.filename, "Invoice.PDF");
        assert_eq!(pdf.meta.content_type, "application/pdf");
        assert_eq!(pdf.content, b"%PDF-1.4");
        assert_eq!(pdf.meta.size, 8);
        assert_eq!(pdf.meta.key, content_key(b"%PDF-1.4", "Invoice.PDF"));
        assert_eq!(normalized.inline().count(), 1);
    }

    #[test]
    fn test_normalize_without_message_id_or_owner() {
        let source = "From: carol@example.net\r\nTo: x@example.com\r\nSubject: Hi\r\n\r\nHello there\r\n";
        let raw = RawMessage::new(source.as_bytes().to_vec(), None);
        let message = MessageParser::default().parse(raw.data()).unwrap();
        let normalizer = Normalizer::new("ids.example.com", true);

        let first = normalizer.normalize(
            &message,
            &raw,
            &recipient("x@example.com"),
            None,
            Utc::now(),
        );
        let second = normalizer.normalize(
            &message,
            &raw,
            &recipient("x@example.com"),
            None,
            Utc::now(),
        );
        assert_eq!(first.email.message_id, second.email.message_id);
        assert_eq!(
            first.email.message_id,
            format!("{}@ids.example.com", raw.content_hash())
        );
        assert_eq!(first.email.from_name, "carol");
        assert_eq!(first.email.to_name, "");
        assert_eq!(first.email.user_id, NO_OWNER_ID);
        assert!(first.email.body_text.contains("Hello there"));
        assert!(first.email.body_html.is_empty());
        assert!(first.attachments.is_empty());
    }

    #[test]
    fn test_recipient_name_follows_plus_tag_policy() {
        let source = concat!(
            "From: dave@example.net\r\n",
            "To: \"Tag B\" <foo+b@example.com>, \"Tag A\" <foo+a@example.com>\r\n",
            "Subject: Tags\r\n",
            "Message-ID: <tags@example.net>\r\n",
            "\r\n",
            "Body\r\n",
        );
        let raw = RawMessage::new(source.as_bytes().to_vec(), None);
        let message = MessageParser::default().parse(raw.data()).unwrap();

        let kept = Normalizer::new("ids.example.com", false).normalize(
            &message,
            &raw,
            &recipient("foo+a@example.com"),
            None,
            Utc::now(),
        );
        assert_eq!(kept.email.to_name, "Tag A");

        let stripped = Normalizer::new("ids.example.com", true).normalize(
            &message,
            &raw,
            &recipient("foo@example.com"),
            None,
            Utc::now(),
        );
        assert_eq!(stripped.email.to_name, "Tag B");
    }

    #[test]
    fn test_content_key_extension_rules() {
        let hash = hex::encode(Sha256::digest(b"x"));
        assert_eq!(content_key(b"x", "photo.JPG"), format!("{hash}.jpg"));
        assert_eq!(content_key(b"x", ".bashrc"), hash);
        assert_eq!(content_key(b"x", "archive.tar.gz"), format!("{hash}.gz"));
        assert_eq!(content_key(b"x", "weird.ext/../x"), hash);
    }

    #[test]
    fn test_rewrite_cid_ignores_regular_attachments() {
        let regular = AttachmentMeta {
            filename: "a.txt".to_string(),
            content_type: "text/plain".to_string(),
            size: 1,
            key: "k.txt".to_string(),
            content_id: Some("a".to_string()),
            inline: false,
        };
        let html = "<a href=\"cid:a\">";
        assert_eq!(rewrite_cid_references(html, &[regular], "https://x"), html);
    }
}
