/// Splits the header section off a raw email, returning the ordered list
/// of headers and the remaining content.
///
/// Folded header lines (continuations starting with a space or a tab) are
/// unfolded into the value of the preceding header, as described in
/// RFC 5322 section 2.2.3. Duplicate headers are kept in order.
///
/// # Examples
///
/// ```rust
/// let (headers, content) = prefixmail_core::parse_raw_headers(
///     "From: alice@example.com\r\nTo: bob@example.com\r\n\r\nHello!"
/// );
/// assert_eq!(headers.len(), 2);
/// assert_eq!(headers[0], ("From".to_string(), "alice@example.com".to_string()));
/// assert_eq!(content, "Hello!");
/// ```
///
/// ```rust
/// let (headers, _) = prefixmail_core::parse_raw_headers(
///     "Subject: a long\r\n  subject line\r\n\r\n"
/// );
/// assert_eq!(headers[0].1, "a long subject line");
/// ```
pub fn parse_raw_headers(raw: &str) -> (Vec<(String, String)>, &str) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    for line in raw.lines() {
        let end = pos + line.len();
        let consumed = if raw[end..].starts_with("\r\n") {
            end + 2
        } else if raw[end..].starts_with('\n') {
            end + 1
        } else {
            end
        };

        if line.trim().is_empty() {
            pos = consumed;
            break;
        }

        if line.starts_with([' ', '\t']) {
            match headers.last_mut() {
                Some((_, value)) => {
                    let continuation = line.trim();
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(continuation);
                }
                None => break,
            }
        } else if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        } else {
            // neither a header nor a continuation, content starts here
            break;
        }

        pos = consumed;
    }

    (headers, &raw[pos..])
}

/// Returns the header section of a raw message as text, decoding bytes
/// that are not valid UTF-8 lossily.
///
/// Only the bytes up to the first blank line are decoded, the body of
/// large messages is never copied.
pub fn header_section(raw: &[u8]) -> String {
    let end = find_blank_line(raw).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn find_blank_line(raw: &[u8]) -> Option<usize> {
    let crlf = raw.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = raw.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Looks up the first header named `name`, ignoring case.
///
/// ```rust
/// let headers = vec![("Delivered-To".to_string(), "a@example.com".to_string())];
/// assert_eq!(prefixmail_core::header_value(&headers, "delivered-to"), Some("a@example.com"));
/// assert_eq!(prefixmail_core::header_value(&headers, "to"), None);
/// ```
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
