//! Gmail API response normalization
//!
//! Converts Gmail API messages to the [`Message`] domain model.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};

use super::api::{GmailMessage, MessagePayload};
use crate::models::{EmailAddress, Message, MessageId};

/// Normalize a Gmail API message
///
/// Fails only when the message carries no payload or an unparseable
/// `historyId`; missing headers fall back to empty values.
pub fn normalize_message(gmail_msg: GmailMessage) -> Result<Message> {
    let payload = gmail_msg
        .payload
        .as_ref()
        .with_context(|| format!("Message {} has no payload", gmail_msg.id))?;

    let from = extract_header(payload, "From")
        .map(|s| EmailAddress::parse(&s))
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com"));

    let to = extract_header(payload, "To")
        .map(|s| {
            s.split(',')
                .filter(|a| !a.trim().is_empty())
                .map(EmailAddress::parse)
                .collect()
        })
        .unwrap_or_default();

    let subject = extract_header(payload, "Subject").unwrap_or_default();

    let history_id = match gmail_msg.history_id.as_deref() {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("Invalid historyId {raw:?} on message {}", gmail_msg.id))?,
        None => 0,
    };

    // internalDate is milliseconds since epoch
    let received_at = gmail_msg
        .internal_date
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    Ok(Message::builder(MessageId::new(&gmail_msg.id))
        .thread_id(gmail_msg.thread_id)
        .history_id(history_id)
        .from(from)
        .to(to)
        .subject(subject)
        .snippet(decode_html_entities(&gmail_msg.snippet))
        .received_at(received_at)
        .label_ids(gmail_msg.label_ids.unwrap_or_default())
        .build())
}

fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_ref()?
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Gmail snippets arrive HTML-escaped
fn decode_html_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::api::Header;

    fn gmail_message(history_id: Option<&str>) -> GmailMessage {
        GmailMessage {
            id: "18c1".to_string(),
            thread_id: "18c0".to_string(),
            history_id: history_id.map(str::to_string),
            label_ids: Some(vec!["INBOX".into(), "UNREAD".into()]),
            snippet: "Tom &amp; Jerry &lt;3".to_string(),
            internal_date: "1700000000000".to_string(),
            payload: Some(MessagePayload {
                headers: Some(vec![
                    Header {
                        name: "from".into(),
                        value: "Alice <alice@example.com>".into(),
                    },
                    Header {
                        name: "To".into(),
                        value: "bob@example.com, Carol <carol@example.com>".into(),
                    },
                    Header {
                        name: "Subject".into(),
                        value: "Quarterly numbers".into(),
                    },
                ]),
                mime_type: Some("text/plain".into()),
            }),
        }
    }

    #[test]
    fn test_normalize_message() {
        let msg = normalize_message(gmail_message(Some("4321"))).unwrap();
        assert_eq!(msg.id.as_str(), "18c1");
        assert_eq!(msg.thread_id, "18c0");
        assert_eq!(msg.history_id, 4321);
        assert_eq!(msg.from.email, "alice@example.com");
        assert_eq!(msg.to.len(), 2);
        assert_eq!(msg.to[1].name.as_deref(), Some("Carol"));
        assert_eq!(msg.subject, "Quarterly numbers");
        assert_eq!(msg.snippet, "Tom & Jerry <3");
        assert_eq!(msg.received_at.timestamp_millis(), 1_700_000_000_000);
        assert!(msg.is_unread());
    }

    #[test]
    fn test_bad_history_id_is_an_error() {
        assert!(normalize_message(gmail_message(Some("abc"))).is_err());
    }

    #[test]
    fn test_missing_payload_is_an_error() {
        let mut raw = gmail_message(None);
        raw.payload = None;
        assert!(normalize_message(raw).is_err());
    }
}
