//! Immutable email message extracted from an archive commit.
//!
//! Archives store one RFC 2822 message per commit, with Unix line endings.
//! [`Message`] keeps the raw bytes untouched and carries the small parsed
//! header subset the engine needs for dedup, logging and the blocklist.

use bytes::Bytes;
use mailparse::MailHeaderMap;
use serde::{Deserialize, Serialize};

use super::MessageId;

/// Maximum header line length used when folding the trace header.
const TRACE_WRAP_COLUMN: usize = 75;

/// Identifies the feed and delivery a message is being rendered for.
///
/// Stamped into the trace header so a message in a mailbox can be traced
/// back to the feed and delivery that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTrace {
    /// Name of the feed the message was extracted from.
    pub feed: String,
    /// Name of the delivery it is being rendered for.
    pub delivery: String,
}

/// One email message, immutable once extracted.
///
/// Created by the extractor; ownership passes to the engine and then to a
/// target for the duration of one delivery attempt. The raw bytes are kept
/// as stored in the archive (LF endings); [`Message::for_delivery`] produces
/// the CRLF wire form.
#[derive(Debug, Clone)]
pub struct Message {
    message_id: MessageId,
    thread_id: Option<MessageId>,
    from: Option<String>,
    subject: Option<String>,
    date: Option<String>,
    raw: Bytes,
}

impl Message {
    /// Parses raw message bytes into a [`Message`].
    ///
    /// Returns `None` if the bytes are not parseable as an RFC 2822 message
    /// or carry no Message-ID header. Callers log and skip such commits;
    /// they are never fatal.
    pub fn from_raw(raw: Bytes) -> Option<Self> {
        let parsed = mailparse::parse_mail(&raw).ok()?;

        let message_id = parsed
            .headers
            .get_first_value("Message-ID")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;

        // Thread identity: the root of the References chain, falling back to
        // In-Reply-To, falling back to the message itself.
        let thread_id = parsed
            .headers
            .get_first_value("References")
            .and_then(|refs| refs.split_whitespace().next().map(str::to_string))
            .or_else(|| {
                parsed
                    .headers
                    .get_first_value("In-Reply-To")
                    .map(|v| v.trim().to_string())
            })
            .filter(|v| !v.is_empty())
            .or_else(|| Some(message_id.clone()));

        let from = parsed.headers.get_first_value("From");
        let subject = parsed.headers.get_first_value("Subject");
        let date = parsed.headers.get_first_value("Date");

        Some(Self {
            message_id: MessageId(message_id),
            thread_id: thread_id.map(MessageId),
            from,
            subject,
            date,
            raw,
        })
    }

    /// The Message-ID header value, including angle brackets.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Thread root id, if the message carries threading headers.
    pub fn thread_id(&self) -> Option<&MessageId> {
        self.thread_id.as_ref()
    }

    /// The From header value, verbatim.
    pub fn from_header(&self) -> Option<&str> {
        self.from.as_deref()
    }

    /// The Subject header value, verbatim.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// The Date header value, verbatim.
    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    /// Raw message bytes as stored in the archive.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Renders the message for delivery to a target.
    ///
    /// Normalizes line endings to CRLF as required by mail protocols (git
    /// stores messages with Unix LF endings) and, when a trace context is
    /// given, injects an `X-Loreferry-Trace` header at the end of the
    /// existing headers.
    pub fn for_delivery(&self, trace: Option<&DeliveryTrace>) -> Vec<u8> {
        // Normalize to LF first so injection offsets are stable, then
        // convert the whole message to CRLF at the end.
        let mut normalized = Vec::with_capacity(self.raw.len() + 128);
        let mut iter = self.raw.iter().peekable();
        while let Some(&b) = iter.next() {
            if b == b'\r' && iter.peek() == Some(&&b'\n') {
                continue;
            }
            normalized.push(b);
        }

        if let Some(trace) = trace {
            normalized = inject_trace_header(normalized, trace);
        }

        let mut wire = Vec::with_capacity(normalized.len() + normalized.len() / 40);
        for b in normalized {
            if b == b'\n' {
                wire.push(b'\r');
            }
            wire.push(b);
        }
        wire
    }
}

/// Inserts the trace header just before the header/body boundary.
///
/// Operates on LF-normalized bytes. A message with no blank line gets the
/// header appended at the end.
fn inject_trace_header(message: Vec<u8>, trace: &DeliveryTrace) -> Vec<u8> {
    let date = chrono::Local::now().to_rfc2822();
    let value = format!(
        "from feed={} for delivery={}; v{}; {}",
        trace.feed,
        trace.delivery,
        env!("CARGO_PKG_VERSION"),
        date
    );
    let mut header = wrap_header("X-Loreferry-Trace", &value, TRACE_WRAP_COLUMN);
    header.push('\n');
    let header = header.into_bytes();

    match message.windows(2).position(|w| w == b"\n\n") {
        None => {
            let mut out = message;
            out.extend_from_slice(&header);
            out
        }
        Some(boundary) => {
            let mut out = Vec::with_capacity(message.len() + header.len());
            out.extend_from_slice(&message[..boundary + 1]);
            out.extend_from_slice(&header);
            out.extend_from_slice(&message[boundary + 1..]);
            out
        }
    }
}

/// Folds a header value onto continuation lines at word boundaries.
fn wrap_header(name: &str, value: &str, max_line: usize) -> String {
    let first_line_max = max_line.saturating_sub(name.len() + 2);
    if value.len() <= first_line_max {
        return format!("{}: {}", name, value);
    }

    let mut lines = Vec::new();
    let mut current = format!("{}:", name);
    for word in value.split(' ') {
        let candidate = format!("{} {}", current, word);
        if candidate.len() <= max_line || current.ends_with(':') {
            current = candidate;
        } else {
            lines.push(current);
            current = format!(" {}", word);
        }
    }
    lines.push(current);
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(msgid: &str) -> Bytes {
        Bytes::from(format!(
            "From: Alice <alice@example.com>\n\
             To: list@example.com\n\
             Subject: hello\n\
             Date: Mon, 1 Jan 2024 00:00:00 +0000\n\
             Message-ID: {}\n\
             \n\
             body text\n",
            msgid
        ))
    }

    #[test]
    fn parses_headers() {
        let msg = Message::from_raw(sample("<m1@example.com>")).unwrap();
        assert_eq!(msg.message_id().0, "<m1@example.com>");
        assert_eq!(msg.subject(), Some("hello"));
        assert_eq!(msg.from_header(), Some("Alice <alice@example.com>"));
        assert!(msg.date().is_some());
    }

    #[test]
    fn own_id_is_thread_root_without_references() {
        let msg = Message::from_raw(sample("<m1@example.com>")).unwrap();
        assert_eq!(msg.thread_id().unwrap().0, "<m1@example.com>");
    }

    #[test]
    fn references_root_wins_as_thread_id() {
        let raw = Bytes::from(
            "From: a@example.com\n\
             Message-ID: <reply@example.com>\n\
             In-Reply-To: <parent@example.com>\n\
             References: <root@example.com> <parent@example.com>\n\
             \n\
             body\n",
        );
        let msg = Message::from_raw(raw).unwrap();
        assert_eq!(msg.thread_id().unwrap().0, "<root@example.com>");
    }

    #[test]
    fn missing_message_id_yields_none() {
        let raw = Bytes::from("From: a@example.com\n\nbody\n");
        assert!(Message::from_raw(raw).is_none());
    }

    #[test]
    fn garbage_yields_none() {
        // No headers at all: parse succeeds but there is no Message-ID.
        let raw = Bytes::from_static(b"\x00\x01\x02 not a message");
        assert!(Message::from_raw(raw).is_none());
    }

    #[test]
    fn for_delivery_uses_crlf() {
        let msg = Message::from_raw(sample("<m1@example.com>")).unwrap();
        let wire = msg.for_delivery(None);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("Subject: hello\r\n"));
        assert!(!text.replace("\r\n", "").contains('\r'));
    }

    #[test]
    fn for_delivery_is_stable_for_crlf_input() {
        let raw = Bytes::from(
            "From: a@example.com\r\nMessage-ID: <m@example.com>\r\n\r\nbody\r\n",
        );
        let msg = Message::from_raw(raw).unwrap();
        let wire = msg.for_delivery(None);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.ends_with("\r\nbody\r\n"));
        assert!(!text.contains("\r\r"));
    }

    #[test]
    fn trace_header_lands_before_body() {
        let msg = Message::from_raw(sample("<m1@example.com>")).unwrap();
        let trace = DeliveryTrace {
            feed: "lkml".to_string(),
            delivery: "personal".to_string(),
        };
        let wire = String::from_utf8(msg.for_delivery(Some(&trace))).unwrap();
        let header_pos = wire.find("X-Loreferry-Trace:").unwrap();
        let body_pos = wire.find("\r\n\r\n").unwrap();
        assert!(header_pos < body_pos);
        assert!(wire.contains("from feed=lkml for delivery=personal;"));
    }

    #[test]
    fn wrap_header_folds_long_values() {
        let value = "word ".repeat(30);
        let wrapped = wrap_header("X-Test", value.trim(), 40);
        for line in wrapped.lines() {
            assert!(line.len() <= 40, "line too long: {:?}", line);
        }
        assert!(wrapped.lines().count() > 1);
        // Continuation lines must start with whitespace.
        for line in wrapped.lines().skip(1) {
            assert!(line.starts_with(' '));
        }
    }

    #[test]
    fn wrap_header_short_value_single_line() {
        let wrapped = wrap_header("X-Test", "short", 75);
        assert_eq!(wrapped, "X-Test: short");
    }
}
