//! In-memory mailbox
//!
//! Implements [`MailboxApi`] over a local change stream. Used by tests and
//! for exercising the engine without network access. Failures can be
//! injected per message, per history call, or for authorization.

use anyhow::{Result, anyhow, bail};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::MailboxApi;
use super::api::{
    GmailMessage, Header, HistoryMessageAdded, HistoryRecord, HistoryResponse,
    ListMessagesResponse, MessagePayload, MessageRef, ProfileResponse, WatchRequest,
    WatchResponse,
};
use crate::error::WatchError;
use crate::models::{Message, MessageId};

struct MailboxState {
    email: String,
    history_id: u64,
    messages: HashMap<String, GmailMessage>,
    /// history id -> message ids added at that position
    history: BTreeMap<u64, Vec<String>>,
    page_size: usize,
    over_return: bool,
    failing_messages: HashSet<String>,
    history_failures: u32,
    watch_failures: u32,
    watch_delay: std::time::Duration,
    watch_attempts: usize,
    retained_from: u64,
    unauthorized: bool,
    watch_ttl: Duration,
    watch_requests: Vec<WatchRequest>,
    stop_calls: usize,
    history_starts: Vec<u64>,
}

/// In-memory implementation of [`MailboxApi`]
pub struct InMemoryMailbox {
    state: RwLock<MailboxState>,
}

impl InMemoryMailbox {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(MailboxState {
                email: email.into(),
                history_id: 1,
                messages: HashMap::new(),
                history: BTreeMap::new(),
                page_size: 100,
                over_return: false,
                failing_messages: HashSet::new(),
                history_failures: 0,
                watch_failures: 0,
                watch_delay: std::time::Duration::ZERO,
                watch_attempts: 0,
                retained_from: 0,
                unauthorized: false,
                watch_ttl: Duration::days(7),
                watch_requests: Vec::new(),
                stop_calls: 0,
                history_starts: Vec::new(),
            }),
        }
    }

    /// Add a message at the next history position, returning that position
    pub fn add_message(&self, message: Message) -> u64 {
        let next = self.state.read().history_id + 1;
        self.add_message_at(next, message);
        next
    }

    /// Add a message at an explicit history position
    pub fn add_message_at(&self, history_id: u64, mut message: Message) {
        message.history_id = history_id;
        let mut state = self.state.write();
        state.history_id = state.history_id.max(history_id);
        state
            .history
            .entry(history_id)
            .or_default()
            .push(message.id.0.clone());
        state
            .messages
            .insert(message.id.0.clone(), to_api_message(&message));
    }

    /// Advance the mailbox history id without adding messages
    /// (label changes, deletions, ...)
    pub fn bump_history(&self, history_id: u64) {
        let mut state = self.state.write();
        state.history_id = state.history_id.max(history_id);
    }

    /// Number of history entries returned per page
    pub fn set_page_size(&self, page_size: usize) {
        self.state.write().page_size = page_size.max(1);
    }

    /// Also return entries at or below the requested start id
    pub fn set_over_return(&self, over_return: bool) {
        self.state.write().over_return = over_return;
    }

    pub fn fail_message(&self, id: &str) {
        self.state.write().failing_messages.insert(id.to_string());
    }

    pub fn recover_message(&self, id: &str) {
        self.state.write().failing_messages.remove(id);
    }

    /// Fail the next `times` history calls with a transient error
    pub fn fail_history(&self, times: u32) {
        self.state.write().history_failures = times;
    }

    /// Reject history requests starting before `history_id`
    pub fn expire_history_before(&self, history_id: u64) {
        self.state.write().retained_from = history_id;
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.state.write().unauthorized = unauthorized;
    }

    /// Lifetime of watches created by [`MailboxApi::watch`]
    pub fn set_watch_ttl(&self, ttl: Duration) {
        self.state.write().watch_ttl = ttl;
    }

    /// Fail the next `times` watch calls with a transient error
    pub fn fail_watch(&self, times: u32) {
        self.state.write().watch_failures = times;
    }

    /// Block every subsequent watch call for `delay` before answering
    pub fn set_watch_delay(&self, delay: std::time::Duration) {
        self.state.write().watch_delay = delay;
    }

    /// Watch calls made so far, including failed ones
    pub fn watch_attempts(&self) -> usize {
        self.state.read().watch_attempts
    }

    /// Successful watch requests
    pub fn watch_requests(&self) -> Vec<WatchRequest> {
        self.state.read().watch_requests.clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.state.read().stop_calls
    }

    /// Start ids of every history request made so far
    pub fn history_starts(&self) -> Vec<u64> {
        self.state.read().history_starts.clone()
    }

    pub fn current_history_id(&self) -> u64 {
        self.state.read().history_id
    }

    fn check_auth(state: &MailboxState) -> Result<()> {
        if state.unauthorized {
            return Err(WatchError::Unauthorized {
                service: "gmail",
                status: 401,
            }
            .into());
        }
        Ok(())
    }
}

impl MailboxApi for InMemoryMailbox {
    fn list_messages(
        &self,
        _query: Option<&str>,
        max_results: usize,
        _page_token: Option<&str>,
    ) -> Result<ListMessagesResponse> {
        let state = self.state.read();
        Self::check_auth(&state)?;

        // Newest first, like Gmail
        let refs: Vec<MessageRef> = state
            .history
            .values()
            .rev()
            .flat_map(|ids| ids.iter().rev())
            .take(max_results)
            .filter_map(|id| state.messages.get(id))
            .map(|m| MessageRef {
                id: m.id.clone(),
                thread_id: m.thread_id.clone(),
            })
            .collect();

        Ok(ListMessagesResponse {
            result_size_estimate: Some(refs.len() as u32),
            messages: (!refs.is_empty()).then_some(refs),
            next_page_token: None,
        })
    }

    fn get_message(&self, id: &MessageId) -> Result<GmailMessage> {
        let state = self.state.read();
        Self::check_auth(&state)?;

        if state.failing_messages.contains(id.as_str()) {
            bail!("injected failure fetching message {}", id);
        }
        state
            .messages
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| anyhow!("message {} not found", id))
    }

    fn list_history(
        &self,
        start_history_id: u64,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse> {
        let mut state = self.state.write();
        Self::check_auth(&state)?;
        state.history_starts.push(start_history_id);

        if state.history_failures > 0 {
            state.history_failures -= 1;
            bail!("injected transient history failure");
        }
        if start_history_id < state.retained_from {
            return Err(WatchError::HistoryExpired(start_history_id).into());
        }

        let entries: Vec<HistoryRecord> = state
            .history
            .iter()
            .filter(|(id, _)| state.over_return || **id > start_history_id)
            .map(|(id, message_ids)| HistoryRecord {
                id: id.to_string(),
                messages_added: Some(
                    message_ids
                        .iter()
                        .filter_map(|mid| state.messages.get(mid))
                        .map(|m| HistoryMessageAdded {
                            message: MessageRef {
                                id: m.id.clone(),
                                thread_id: m.thread_id.clone(),
                            },
                        })
                        .collect(),
                ),
            })
            .collect();

        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (offset + state.page_size).min(entries.len());
        let page = entries.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();

        Ok(HistoryResponse {
            history: (!page.is_empty()).then_some(page),
            next_page_token: (end < entries.len()).then(|| end.to_string()),
            history_id: Some(state.history_id.to_string()),
        })
    }

    fn get_profile(&self) -> Result<ProfileResponse> {
        let state = self.state.read();
        Self::check_auth(&state)?;
        Ok(ProfileResponse {
            email_address: state.email.clone(),
            history_id: state.history_id,
        })
    }

    fn watch(&self, request: &WatchRequest) -> Result<WatchResponse> {
        let delay = {
            let mut state = self.state.write();
            state.watch_attempts += 1;
            state.watch_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.write();
        Self::check_auth(&state)?;
        if state.watch_failures > 0 {
            state.watch_failures -= 1;
            bail!("injected transient watch failure");
        }
        state.watch_requests.push(request.clone());
        Ok(WatchResponse {
            history_id: state.history_id,
            expiration: (Utc::now() + state.watch_ttl).timestamp_millis(),
        })
    }

    fn stop_watch(&self) -> Result<()> {
        let mut state = self.state.write();
        Self::check_auth(&state)?;
        state.stop_calls += 1;
        Ok(())
    }
}

/// Render a domain message as the API would return it
fn to_api_message(message: &Message) -> GmailMessage {
    let to = message
        .to
        .iter()
        .map(|a| a.email.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let from = match &message.from.name {
        Some(name) => format!("{} <{}>", name, message.from.email),
        None => message.from.email.clone(),
    };

    GmailMessage {
        id: message.id.0.clone(),
        thread_id: message.thread_id.clone(),
        history_id: Some(message.history_id.to_string()),
        label_ids: Some(message.label_ids.clone()),
        snippet: message.snippet.clone(),
        internal_date: message.received_at.timestamp_millis().to_string(),
        payload: Some(MessagePayload {
            headers: Some(vec![
                Header {
                    name: "From".into(),
                    value: from,
                },
                Header {
                    name: "To".into(),
                    value: to,
                },
                Header {
                    name: "Subject".into(),
                    value: message.subject.clone(),
                },
            ]),
            mime_type: Some("text/plain".into()),
        }),
    }
}
