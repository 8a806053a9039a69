//! Turns a fetched message into a row.
//!
//! The raw bytes are always stored untouched. The convenience columns are
//! extracted by trying a fixed list of parse strategies in order and keeping
//! the first that works.

use mailparse::{DispositionType, MailAddr, MailHeader, MailHeaderMap, ParsedMail};
use tracing::debug;

use crate::adapters::imap::RawMessage;
use crate::adapters::sqlite::messages::StoredMessage;
use crate::error::MirrorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    /// The bytes exactly as fetched
    Raw,
    /// Lossy UTF-8 with NUL bytes removed
    Sanitized,
    /// Header section only, every non-ASCII byte replaced
    Scrubbed,
}

impl ParseStrategy {
    pub const ORDER: [ParseStrategy; 3] = [Self::Raw, Self::Sanitized, Self::Scrubbed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Sanitized => "sanitized",
            Self::Scrubbed => "scrubbed",
        }
    }

    fn extract(&self, body: &[u8]) -> Result<ParsedFields, MirrorError> {
        match self {
            Self::Raw => fields_from_mail(body),
            Self::Sanitized => {
                let text = String::from_utf8_lossy(body).replace('\0', "");
                fields_from_mail(text.as_bytes())
            }
            Self::Scrubbed => {
                let scrubbed: Vec<u8> = header_section(body)
                    .iter()
                    .map(|&b| if b.is_ascii() && b != 0 { b } else { b'?' })
                    .collect();
                let (headers, _) = mailparse::parse_headers(&scrubbed)
                    .map_err(|e| MirrorError::Parse(e.to_string()))?;
                fields_from_headers(&headers, false)
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedFields {
    pub message_id: Option<String>,
    pub date: Option<i64>,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub has_attachments: bool,
}

/// A record plus the strategy its fields came from. `None` means every
/// strategy failed and only the raw bytes and protocol metadata are set.
#[derive(Debug, Clone)]
pub struct BuiltMessage {
    pub message: StoredMessage,
    pub strategy: Option<ParseStrategy>,
}

/// Run the strategies in order. Returns the first success, or the error of
/// the last strategy tried.
pub fn parse_fields(body: &[u8]) -> Result<(ParsedFields, ParseStrategy), MirrorError> {
    let mut last_error = MirrorError::Parse("no parse strategy ran".into());
    for strategy in ParseStrategy::ORDER {
        match strategy.extract(body) {
            Ok(fields) => return Ok((fields, strategy)),
            Err(e) => {
                debug!(strategy = strategy.as_str(), "Parse strategy failed: {}", e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// Build the row for `raw`. When no strategy can parse the message, strict
/// mode fails with [`MirrorError::Parse`]; otherwise the row is kept with
/// empty convenience fields.
pub fn build(
    raw: RawMessage,
    mailbox: &str,
    generation: u32,
    strict: bool,
) -> Result<BuiltMessage, MirrorError> {
    let (fields, strategy) = match parse_fields(&raw.body) {
        Ok((fields, strategy)) => (fields, Some(strategy)),
        Err(e) if strict => {
            return Err(MirrorError::Parse(format!(
                "{} uid {}: {}",
                mailbox,
                raw.uid,
                e
            )))
        }
        Err(_) => (ParsedFields::default(), None),
    };

    Ok(BuiltMessage {
        message: StoredMessage {
            mailbox: mailbox.to_string(),
            uid: raw.uid,
            generation,
            encoded: raw.body,
            message_id: fields.message_id,
            date: fields.date,
            from_address: fields.from_address,
            subject: fields.subject,
            has_attachments: fields.has_attachments,
            imap_flags: raw.flags,
            gmail_labels: raw.gmail_labels,
            gmail_thread_id: raw.gmail_thread_id,
            gmail_message_id: raw.gmail_message_id,
            internal_date: raw.internal_date,
        },
        strategy,
    })
}

fn fields_from_mail(body: &[u8]) -> Result<ParsedFields, MirrorError> {
    let parsed = mailparse::parse_mail(body).map_err(|e| MirrorError::Parse(e.to_string()))?;
    let attachments = has_attachments(&parsed);
    fields_from_headers(&parsed.headers, attachments)
}

fn fields_from_headers(headers: &[MailHeader], has_attachments: bool) -> Result<ParsedFields, MirrorError> {
    if headers.is_empty() {
        return Err(MirrorError::Parse("message has no header section".into()));
    }

    let message_id = headers
        .get_first_value("Message-ID")
        .map(|id| id.trim().trim_matches(|c| c == '<' || c == '>').to_string())
        .filter(|id| !id.is_empty());

    // Unknown dates stay NULL rather than defaulting to epoch
    let date = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|secs| secs.checked_mul(1000));

    let from_address = headers.get_first_value("From").map(|value| first_address(&value));

    let subject = headers.get_first_value("Subject");

    Ok(ParsedFields {
        message_id,
        date,
        from_address,
        subject,
        has_attachments,
    })
}

fn first_address(value: &str) -> String {
    let parsed = mailparse::addrparse(value).ok().and_then(|list| {
        list.iter().find_map(|addr| match addr {
            MailAddr::Single(info) => Some(info.addr.clone()),
            MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
        })
    });
    parsed.unwrap_or_else(|| value.trim().to_string())
}

fn has_attachments(part: &ParsedMail) -> bool {
    if part.get_content_disposition().disposition == DispositionType::Attachment {
        return true;
    }
    part.subparts.iter().any(has_attachments)
}

fn header_section(body: &[u8]) -> &[u8] {
    for sep in [&b"\r\n\r\n"[..], &b"\n\n"[..]] {
        if let Some(pos) = body.windows(sep.len()).position(|w| w == sep) {
            return &body[..pos + sep.len()];
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::imap::testing::sample_message;

    fn raw(uid: u32, body: &[u8]) -> RawMessage {
        RawMessage {
            uid,
            body: body.to_vec(),
            flags: vec!["\\Seen".to_string()],
            internal_date: Some(1_000),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_extracts_fields() {
        let body = sample_message("INBOX", 5);
        let built = build(raw(5, &body), "INBOX", 77, true).expect("Failed to build");

        assert_eq!(built.strategy, Some(ParseStrategy::Raw));
        let msg = built.message;
        assert_eq!(msg.mailbox, "INBOX");
        assert_eq!(msg.uid, 5);
        assert_eq!(msg.generation, 77);
        assert_eq!(msg.encoded, body);
        assert_eq!(msg.message_id.as_deref(), Some("5.INBOX@fake.example"));
        assert_eq!(msg.from_address.as_deref(), Some("alice@example.com"));
        assert_eq!(msg.subject.as_deref(), Some("message 5 in INBOX"));
        // Tue, 1 Jul 2025 10:52:37 +0200
        assert_eq!(msg.date, Some(1_751_359_957_000));
        assert_eq!(msg.imap_flags, vec!["\\Seen"]);
        assert_eq!(msg.internal_date, Some(1_000));
        assert!(!msg.has_attachments);
    }

    #[test]
    fn test_missing_date_is_null() {
        let body = b"Subject: no date\r\nFrom: bob@example.com\r\n\r\nhi\r\n";
        let built = build(raw(1, body), "INBOX", 1, false).unwrap();

        assert_eq!(built.message.date, None);
        assert_eq!(built.message.subject.as_deref(), Some("no date"));
        assert_eq!(built.message.message_id, None);
    }

    #[test]
    fn test_far_future_date_is_null() {
        let body = b"Date: Mon, 1 Jan 4000000000 00:00:00 +0000\r\nSubject: later\r\n\r\nhi\r\n";
        let built = build(raw(1, body), "INBOX", 1, false).unwrap();

        assert_eq!(built.message.date, None);
        assert_eq!(built.message.subject.as_deref(), Some("later"));
        assert_eq!(built.strategy, Some(ParseStrategy::Raw));
    }

    #[test]
    fn test_attachment_disposition_is_detected() {
        let body = b"From: carol@example.com\r\n\
Subject: report\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--XYZ\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
\r\n\
JVBERi0=\r\n\
--XYZ--\r\n";
        let built = build(raw(2, body), "INBOX", 1, true).unwrap();

        assert!(built.message.has_attachments);
    }

    #[test]
    fn test_headerless_message_is_kept_unless_strict() {
        let body = b"\r\njust a body, no headers\r\n";

        let built = build(raw(3, body), "INBOX", 1, false).expect("Lenient build should succeed");
        assert_eq!(built.strategy, None);
        assert_eq!(built.message.encoded, body.to_vec());
        assert_eq!(built.message.subject, None);
        assert_eq!(built.message.date, None);
        assert_eq!(built.message.imap_flags, vec!["\\Seen"]);

        let err = build(raw(3, body), "INBOX", 1, true).expect_err("Strict build should fail");
        assert!(matches!(err, MirrorError::Parse(_)));
    }

    #[test]
    fn test_scrubbed_strategy_reads_headers_only() {
        let body = "Subject: caf\u{e9}\r\nFrom: dave@example.com\r\n\r\nbody\r\n";
        let fields = ParseStrategy::Scrubbed
            .extract(body.as_bytes())
            .expect("Scrubbed parse should succeed");

        assert_eq!(fields.from_address.as_deref(), Some("dave@example.com"));
        assert_eq!(fields.subject.as_deref(), Some("caf??"));
        assert!(!fields.has_attachments);
    }

    #[test]
    fn test_header_section_split() {
        assert_eq!(header_section(b"A: 1\r\n\r\nbody"), b"A: 1\r\n\r\n");
        assert_eq!(header_section(b"A: 1\n\nbody"), b"A: 1\n\n");
        assert_eq!(header_section(b"A: 1"), b"A: 1");
    }
}
