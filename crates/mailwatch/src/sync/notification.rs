//! Gmail push notification payloads

use base64::prelude::*;
use serde::Deserialize;

use crate::error::WatchError;
use crate::gmail::api::u64_from_str_or_number;

/// Body Gmail publishes to the watch topic
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxNotification {
    #[serde(default)]
    pub email_address: String,
    #[serde(deserialize_with = "u64_from_str_or_number")]
    pub history_id: u64,
}

/// Decode a base64 transport payload into a notification
pub fn decode_notification(data: &str) -> Result<MailboxNotification, WatchError> {
    let bytes = BASE64_STANDARD
        .decode(data.trim())
        .or_else(|_| BASE64_URL_SAFE.decode(data.trim()))
        .map_err(|e| WatchError::MalformedNotification(format!("invalid base64: {e}")))?;

    let text = String::from_utf8(bytes)
        .map_err(|e| WatchError::MalformedNotification(format!("payload is not UTF-8: {e}")))?;

    serde_json::from_str(&text)
        .map_err(|e| WatchError::MalformedNotification(format!("invalid notification JSON: {e}")))
}
