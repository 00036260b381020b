//! Message model for records resolved from the mailbox change stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label Gmail applies to messages that have not been read
pub const UNREAD_LABEL: &str = "UNREAD";

/// Unique identifier for a message (Gmail message ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub email: String,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an address like `"Jane Doe <jane@example.com>"` or a bare address
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let (Some(open), Some(close)) = (s.rfind('<'), s.rfind('>'))
            && open < close
        {
            let name = s[..open].trim().trim_matches('"').trim();
            let email = s[open + 1..close].trim();
            return Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                email: email.to_string(),
            };
        }

        Self::new(s)
    }
}

/// A message resolved from the change stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: String,
    /// Latest change-stream position that touched this message
    pub history_id: u64,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub subject: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    /// Gmail label IDs (e.g., "INBOX", "UNREAD", "Label_12")
    pub label_ids: Vec<String>,
}

impl Message {
    pub fn builder(id: impl Into<MessageId>) -> MessageBuilder {
        MessageBuilder::new(id.into())
    }

    pub fn is_unread(&self) -> bool {
        self.has_label(UNREAD_LABEL)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// Builder for creating Message instances
pub struct MessageBuilder {
    id: MessageId,
    thread_id: Option<String>,
    history_id: u64,
    from: Option<EmailAddress>,
    to: Vec<EmailAddress>,
    subject: String,
    snippet: String,
    received_at: Option<DateTime<Utc>>,
    label_ids: Vec<String>,
}

impl MessageBuilder {
    fn new(id: MessageId) -> Self {
        Self {
            id,
            thread_id: None,
            history_id: 0,
            from: None,
            to: Vec::new(),
            subject: String::new(),
            snippet: String::new(),
            received_at: None,
            label_ids: Vec::new(),
        }
    }

    pub fn thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn history_id(mut self, history_id: u64) -> Self {
        self.history_id = history_id;
        self
    }

    pub fn from(mut self, from: EmailAddress) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.to = to;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn label_ids<I, S>(mut self, label_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_ids = label_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Message {
        let thread_id = self.thread_id.unwrap_or_else(|| self.id.0.clone());
        Message {
            id: self.id,
            thread_id,
            history_id: self.history_id,
            from: self
                .from
                .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com")),
            to: self.to,
            subject: self.subject,
            snippet: self.snippet,
            received_at: self.received_at.unwrap_or_else(Utc::now),
            label_ids: self.label_ids,
        }
    }
}
