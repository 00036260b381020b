//! Watch registration model
//!
//! A watch registration asks the mailbox to publish change notifications to a
//! Pub/Sub topic until `expiration`. Registrations are persisted so a restarted
//! process can adopt a still-valid watch instead of creating a new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Service type recorded for Gmail watches
pub const GMAIL_SERVICE: &str = "gmail";

/// Storage key: at most one registration exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub service_type: String,
    pub application_name: String,
}

impl WatchKey {
    pub fn new(service_type: impl Into<String>, application_name: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            application_name: application_name.into(),
        }
    }

    /// File name used by the file-backed store
    ///
    /// Both parts are percent-encoded and joined with `+`, which the
    /// encoding never emits, so distinct keys map to distinct files and
    /// no key can escape the state directory.
    pub fn file_name(&self) -> String {
        format!(
            "{}+{}.json",
            urlencoding::encode(&self.service_type),
            urlencoding::encode(&self.application_name)
        )
    }
}

/// A live (or previously live) watch registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchRegistration {
    pub service_type: String,
    pub watch_id: String,
    pub topic_name: String,
    pub application_name: String,
    pub expiration: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Gmail-specific data (history id at creation, label ids, ...)
    #[serde(default)]
    pub service_specific_data: serde_json::Value,
    /// Whether this process created the registration and may tear it down.
    /// Never persisted: a registration loaded from disk is not owned.
    #[serde(skip)]
    pub owned: bool,
}

impl WatchRegistration {
    pub fn key(&self) -> WatchKey {
        WatchKey::new(&self.service_type, &self.application_name)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expiration - now
    }

    /// History id the mailbox reported when the watch was created
    pub fn history_id(&self) -> Option<u64> {
        let value = self.service_specific_data.get("historyId")?;
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registration() -> WatchRegistration {
        WatchRegistration {
            service_type: GMAIL_SERVICE.to_string(),
            watch_id: "4242".to_string(),
            topic_name: "projects/p/topics/t".to_string(),
            application_name: "desk".to_string(),
            expiration: Utc::now() + Duration::days(7),
            created_at: Utc::now(),
            service_specific_data: serde_json::json!({ "historyId": "4242" }),
            owned: true,
        }
    }

    #[test]
    fn test_owned_is_not_persisted() {
        let reg = registration();
        let json = serde_json::to_string(&reg).unwrap();
        assert!(!json.contains("owned"));

        let loaded: WatchRegistration = serde_json::from_str(&json).unwrap();
        assert!(!loaded.owned);
        assert_eq!(loaded.watch_id, reg.watch_id);
        assert_eq!(loaded.history_id(), Some(4242));
    }

    #[test]
    fn test_persisted_field_names() {
        let json = serde_json::to_value(registration()).unwrap();
        for field in [
            "service_type",
            "watch_id",
            "topic_name",
            "application_name",
            "expiration",
            "created_at",
            "service_specific_data",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn test_file_name_is_sanitized() {
        let key = WatchKey::new("gmail", "../etc/passwd");
        assert_eq!(key.file_name(), "gmail+..%2Fetc%2Fpasswd.json");
        assert!(!key.file_name().contains('/'));
    }

    #[test]
    fn test_distinct_keys_get_distinct_files() {
        let names: std::collections::HashSet<String> = [
            WatchKey::new("gmail", "app.x"),
            WatchKey::new("gmail", "app_x"),
            WatchKey::new("gmail", "app/x"),
            WatchKey::new("gmail_app", "x"),
            WatchKey::new("gmail", "app_x+y"),
            WatchKey::new("gmail+app_x", "y"),
        ]
        .iter()
        .map(WatchKey::file_name)
        .collect();
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut reg = registration();
        assert!(!reg.is_expired(now));
        reg.expiration = now - Duration::seconds(1);
        assert!(reg.is_expired(now));
    }
}
