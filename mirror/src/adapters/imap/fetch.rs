use async_imap::types::{Fetch, Flag};
use futures::StreamExt;
use tracing::warn;

use super::RawMessage;
use crate::error::MirrorError;

/// BODY.PEEK keeps \Seen untouched.
const FETCH_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[])";
const FETCH_QUERY_GMAIL: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[] X-GM-LABELS X-GM-THRID X-GM-MSGID)";

pub fn fetch_query(has_gmail_ext: bool) -> &'static str {
    if has_gmail_ext {
        FETCH_QUERY_GMAIL
    } else {
        FETCH_QUERY
    }
}

/// Render UIDs as an IMAP sequence set, collapsing runs into ranges:
/// `[1, 2, 3, 7, 9, 10]` becomes `1:3,7,9:10`.
pub fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;

    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        parts.push(range(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range(start, end));

    parts.join(",")
}

fn range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}

/// Collects a FETCH stream, logging and skipping individual responses that
/// fail to parse. Connection failures still abort the collection so the
/// caller can reconnect.
pub async fn collect_tolerant<E>(
    stream: impl futures::Stream<Item = Result<Fetch, E>>,
    context: &str,
) -> Result<Vec<Fetch>, MirrorError>
where
    E: Into<MirrorError>,
{
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => {
                let e: MirrorError = e.into();
                if e.is_transient() {
                    return Err(e);
                }
                warn!(mailbox = %context, "Skipping unparseable IMAP response: {}", e);
            }
        }
    }
    Ok(items)
}

pub fn to_raw_message(fetch: &Fetch) -> Option<RawMessage> {
    let uid = fetch.uid?;
    let Some(body) = fetch.body() else {
        warn!(uid = uid, "FETCH response without body, skipping");
        return None;
    };

    // TODO: fill gmail_labels/thread/msg ids once async-imap's Fetch exposes the X-GM-* attributes.
    Some(RawMessage {
        uid,
        body: body.to_vec(),
        flags: fetch.flags().map(|f| flag_to_string(&f)).collect(),
        internal_date: fetch.internal_date().map(|d| d.timestamp_millis()),
        gmail_labels: Vec::new(),
        gmail_thread_id: None,
        gmail_message_id: None,
    })
}

pub fn flag_to_string(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::Custom(name) => name.to_string(),
        #[allow(unreachable_patterns)]
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_set_collapses_runs() {
        assert_eq!(uid_set(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
        assert_eq!(uid_set(&[42]), "42");
        assert_eq!(uid_set(&[5, 3, 4, 4]), "3:5");
        assert_eq!(uid_set(&[]), "");
    }

    #[test]
    fn test_fetch_query_always_peeks() {
        for gmail in [false, true] {
            let query = fetch_query(gmail);
            assert!(query.contains("BODY.PEEK[]"));
            assert!(!query.contains("BODY[]"));
            assert!(query.contains("FLAGS"));
            assert!(query.contains("INTERNALDATE"));
        }
        assert!(fetch_query(true).contains("X-GM-LABELS"));
        assert!(!fetch_query(false).contains("X-GM-"));
    }

    #[test]
    fn test_flag_rendering() {
        assert_eq!(flag_to_string(&Flag::Seen), "\\Seen");
        assert_eq!(flag_to_string(&Flag::Custom("$Label1".into())), "$Label1");
    }
}
