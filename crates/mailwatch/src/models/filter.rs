//! Record filter applied to every resolved message

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Message;

/// Predicate over a resolved message
///
/// Every configured criterion must hold for a message to match. An empty
/// filter matches everything. Text criteria are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageFilter {
    /// Substring of the sender's address or display name
    pub from: Option<String>,
    /// Substring of the subject line
    pub subject_contains: Option<String>,
    /// Labels that must all be present
    pub labels: Vec<String>,
    /// Only match unread messages
    pub unread_only: bool,
    /// Inclusive lower bound on the received date
    pub after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the received date
    pub before: Option<DateTime<Utc>>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sender(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn subject_contains(mut self, text: impl Into<String>) -> Self {
        self.subject_contains = Some(text.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn unread_only(mut self) -> Self {
        self.unread_only = true;
        self
    }

    pub fn between(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.after = after;
        self.before = before;
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(from) = &self.from {
            let needle = from.to_lowercase();
            let in_email = message.from.email.to_lowercase().contains(&needle);
            let in_name = message
                .from
                .name
                .as_ref()
                .is_some_and(|n| n.to_lowercase().contains(&needle));
            if !in_email && !in_name {
                return false;
            }
        }

        if let Some(text) = &self.subject_contains
            && !message.subject.to_lowercase().contains(&text.to_lowercase())
        {
            return false;
        }

        if !self.labels.iter().all(|l| message.has_label(l)) {
            return false;
        }

        if self.unread_only && !message.is_unread() {
            return false;
        }

        if self.after.is_some_and(|after| message.received_at < after) {
            return false;
        }

        !self.before.is_some_and(|before| message.received_at >= before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmailAddress;
    use chrono::Duration;

    fn sample() -> Message {
        Message::builder("m1")
            .from(EmailAddress::with_name("Build Bot", "ci@example.com"))
            .subject("Nightly build FAILED")
            .label_ids(["INBOX", "UNREAD", "Label_ci"])
            .received_at(Utc::now() - Duration::hours(1))
            .build()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(MessageFilter::new().matches(&sample()));
    }

    #[test]
    fn test_sender_matches_name_or_address() {
        assert!(MessageFilter::new().from_sender("build bot").matches(&sample()));
        assert!(MessageFilter::new().from_sender("CI@EXAMPLE").matches(&sample()));
        assert!(!MessageFilter::new().from_sender("alice").matches(&sample()));
    }

    #[test]
    fn test_subject_and_labels() {
        let filter = MessageFilter::new()
            .subject_contains("failed")
            .with_label("label_ci");
        assert!(filter.matches(&sample()));

        let filter = MessageFilter::new().with_label("STARRED");
        assert!(!filter.matches(&sample()));
    }

    #[test]
    fn test_unread_only() {
        let read = Message::builder("m2").label_ids(["INBOX"]).build();
        let filter = MessageFilter::new().unread_only();
        assert!(filter.matches(&sample()));
        assert!(!filter.matches(&read));
    }

    #[test]
    fn test_date_range() {
        let now = Utc::now();
        let msg = sample();

        let filter = MessageFilter::new().between(Some(now - Duration::hours(2)), Some(now));
        assert!(filter.matches(&msg));

        let filter = MessageFilter::new().between(Some(now - Duration::minutes(30)), None);
        assert!(!filter.matches(&msg));

        let filter = MessageFilter::new().between(None, Some(msg.received_at));
        assert!(!filter.matches(&msg));
    }
}
