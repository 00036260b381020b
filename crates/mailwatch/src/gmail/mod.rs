//! Gmail API integration
//!
//! This module provides:
//! - OAuth2 token provider
//! - The [`MailboxApi`] seam used by the sync engine, with a ureq-backed
//!   client and an in-memory implementation
//! - Response normalization to domain models

mod auth;
mod client;
mod memory;
mod normalize;

pub use auth::{GmailAuth, StaticToken, TokenProvider};
pub use client::GmailClient;
pub use memory::InMemoryMailbox;
pub use normalize::normalize_message;

use anyhow::Result;

use crate::models::MessageId;
use api::{
    GmailMessage, HistoryResponse, ListMessagesResponse, ProfileResponse, WatchRequest,
    WatchResponse,
};

/// Mailbox operations the sync engine depends on
///
/// Calls are synchronous so implementations stay executor-agnostic; async
/// callers run them under `spawn_blocking`.
pub trait MailboxApi: Send + Sync {
    /// List message ids matching an optional Gmail search query
    fn list_messages(
        &self,
        query: Option<&str>,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse>;

    /// Get full message details by id
    fn get_message(&self, id: &MessageId) -> Result<GmailMessage>;

    /// List `messageAdded` history after `start_history_id`
    ///
    /// Fails with [`crate::WatchError::HistoryExpired`] when the start id is
    /// no longer retained.
    fn list_history(&self, start_history_id: u64, page_token: Option<&str>)
    -> Result<HistoryResponse>;

    /// Mailbox profile, including the current history id
    fn get_profile(&self) -> Result<ProfileResponse>;

    /// Register (or replace) the push-notification watch
    fn watch(&self, request: &WatchRequest) -> Result<WatchResponse>;

    /// Stop push notifications for the mailbox
    fn stop_watch(&self) -> Result<()>;
}

/// Gmail API request and response types
pub mod api {
    use serde::{Deserialize, Deserializer, Serialize};

    /// Response from listing messages
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
    }

    /// Full message from the Gmail API
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
        pub history_id: Option<String>,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        #[serde(default)]
        pub internal_date: String,
        pub payload: Option<MessagePayload>,
    }

    /// Message payload; only headers are needed here
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
        pub mime_type: Option<String>,
    }

    /// Email header (name-value pair)
    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// One page of mailbox history
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
        /// Current mailbox history id
        pub history_id: Option<String>,
    }

    /// A single change-stream entry
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub id: String,
        pub messages_added: Option<Vec<HistoryMessageAdded>>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct HistoryMessageAdded {
        pub message: MessageRef,
    }

    /// Response from `users/me/profile`
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProfileResponse {
        pub email_address: String,
        #[serde(deserialize_with = "u64_from_str_or_number")]
        pub history_id: u64,
    }

    /// Body of `users/me/watch`
    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WatchRequest {
        pub topic_name: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub label_ids: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub label_filter_behavior: Option<String>,
    }

    impl WatchRequest {
        pub fn new(topic_name: impl Into<String>, label_ids: Vec<String>) -> Self {
            let label_filter_behavior = (!label_ids.is_empty()).then(|| "include".to_string());
            Self {
                topic_name: topic_name.into(),
                label_ids,
                label_filter_behavior,
            }
        }
    }

    /// Response from `users/me/watch`
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WatchResponse {
        #[serde(deserialize_with = "u64_from_str_or_number")]
        pub history_id: u64,
        /// Milliseconds since the epoch
        #[serde(deserialize_with = "i64_from_str_or_number")]
        pub expiration: i64,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNumber {
        Str(String),
        Number(serde_json::Number),
    }

    /// Accept ids Google serializes either as JSON strings or numbers
    pub fn u64_from_str_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        match StrOrNumber::deserialize(d)? {
            StrOrNumber::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
            StrOrNumber::Number(n) => n
                .as_u64()
                .ok_or_else(|| serde::de::Error::custom(format!("not an unsigned id: {n}"))),
        }
    }

    fn i64_from_str_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        match StrOrNumber::deserialize(d)? {
            StrOrNumber::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
            StrOrNumber::Number(n) => n
                .as_i64()
                .ok_or_else(|| serde::de::Error::custom(format!("not an integer: {n}"))),
        }
    }

}
