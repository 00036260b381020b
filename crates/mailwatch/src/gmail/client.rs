//! Gmail API HTTP client
//!
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use anyhow::{Context, Result};
use log::debug;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use super::api::{
    GmailMessage, HistoryResponse, ListMessagesResponse, ProfileResponse, WatchRequest,
    WatchResponse,
};
use super::{MailboxApi, TokenProvider};
use crate::error::{WatchError, http_error};
use crate::models::MessageId;

const SERVICE: &str = "gmail";

/// Gmail API client for the authenticated user's mailbox
pub struct GmailClient {
    tokens: Arc<dyn TokenProvider>,
    base_url: String,
    max_retries: u32,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    pub fn new(tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            tokens,
            base_url: Self::BASE_URL.to_string(),
            max_retries: 3,
        }
    }

    /// Point the client at a different endpoint (e.g. a local emulator)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn bearer(&self) -> Result<String> {
        Ok(format!("Bearer {}", self.tokens.access_token()?))
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        let mut response = ureq::get(url)
            .header("Authorization", &self.bearer()?)
            .call()
            .map_err(|e| http_error(SERVICE, e, what))?;
        response
            .body_mut()
            .read_json()
            .with_context(|| format!("Failed to parse response: {what}"))
    }

    /// Fetch a message, retrying transient failures with exponential backoff
    fn get_message_with_retry(&self, id: &MessageId) -> Result<GmailMessage> {
        let url = format!(
            "{}/users/me/messages/{}?format=metadata&metadataHeaders=From&metadataHeaders=To&metadataHeaders=Subject",
            self.base_url,
            urlencoding::encode(id.as_str())
        );
        let mut delay = Duration::from_millis(100);
        let mut attempt = 1;

        loop {
            match self.get_json(&url, "get message") {
                Ok(msg) => return Ok(msg),
                Err(e) if attempt < self.max_retries && !crate::error::is_fatal(&e) => {
                    debug!("Retrying message {} after error: {:#}", id, e);
                    std::thread::sleep(delay + jitter());
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.context(format!("Failed to fetch message {id}"))),
            }
        }
    }
}

impl MailboxApi for GmailClient {
    fn list_messages(
        &self,
        query: Option<&str>,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse> {
        let mut url = format!(
            "{}/users/me/messages?maxResults={}",
            self.base_url,
            max_results.clamp(1, 500)
        );
        if let Some(q) = query {
            url.push_str(&format!("&q={}", urlencoding::encode(q)));
        }
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }
        self.get_json(&url, "list messages")
    }

    fn get_message(&self, id: &MessageId) -> Result<GmailMessage> {
        self.get_message_with_retry(id)
    }

    fn list_history(
        &self,
        start_history_id: u64,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={}&historyTypes=messageAdded",
            self.base_url, start_history_id
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let response = ureq::get(&url)
            .header("Authorization", &self.bearer()?)
            .call();

        match response {
            Ok(mut resp) => resp
                .body_mut()
                .read_json()
                .context("Failed to parse history response"),
            Err(ureq::Error::StatusCode(404)) => Err(WatchError::HistoryExpired(start_history_id).into()),
            Err(e) => Err(http_error(SERVICE, e, "list history")),
        }
    }

    fn get_profile(&self) -> Result<ProfileResponse> {
        let url = format!("{}/users/me/profile", self.base_url);
        self.get_json(&url, "get profile")
    }

    fn watch(&self, request: &WatchRequest) -> Result<WatchResponse> {
        let url = format!("{}/users/me/watch", self.base_url);
        let mut response = ureq::post(&url)
            .header("Authorization", &self.bearer()?)
            .send_json(request)
            .map_err(|e| http_error(SERVICE, e, "create watch"))?;
        response
            .body_mut()
            .read_json()
            .context("Failed to parse watch response")
    }

    fn stop_watch(&self) -> Result<()> {
        let url = format!("{}/users/me/stop", self.base_url);
        ureq::post(&url)
            .header("Authorization", &self.bearer()?)
            .send_empty()
            .map_err(|e| http_error(SERVICE, e, "stop watch"))?;
        Ok(())
    }
}

/// Random-ish jitter (0-100ms) without pulling in an RNG
fn jitter() -> Duration {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    Duration::from_millis(hasher.finish() % 100)
}
