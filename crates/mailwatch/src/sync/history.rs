//! History window resolution
//!
//! Turns a `(low, high]` watermark range into processed records: list the
//! mailbox history after `low`, keep only entries inside the window (backends
//! may over-return), then fetch and filter each added message lazily.

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use std::collections::{HashSet, VecDeque};

use crate::gmail::{MailboxApi, normalize_message};
use crate::models::{MessageFilter, MessageId, ProcessedRecord};

/// Cap on history pages walked for one window
const MAX_HISTORY_PAGES: usize = 1000;

/// A resolved window whose records are fetched on iteration
///
/// Finite and single-use. A failed fetch yields a `Failed` record for that
/// message only.
pub struct HistoryWindow<'a> {
    mailbox: &'a dyn MailboxApi,
    filter: &'a MessageFilter,
    pending: VecDeque<(u64, MessageId)>,
}

impl HistoryWindow<'_> {
    /// Number of records not yet fetched
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl Iterator for HistoryWindow<'_> {
    type Item = ProcessedRecord;

    fn next(&mut self) -> Option<ProcessedRecord> {
        let (history_id, id) = self.pending.pop_front()?;

        let record = match self.mailbox.get_message(&id).and_then(normalize_message) {
            Ok(message) if self.filter.matches(&message) => {
                debug!("history {} message {} matched", history_id, id);
                ProcessedRecord::matched(history_id, message)
            }
            Ok(message) => ProcessedRecord::filtered(history_id, message),
            Err(e) => {
                warn!("Failed to resolve message {} (history {}): {:#}", id, history_id, e);
                ProcessedRecord::failed(history_id, Some(id), format!("{e:#}"))
            }
        };
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.pending.len(), Some(self.pending.len()))
    }
}

/// Resolve the added messages in `(low, high]`
///
/// Errors listing the history itself (including an expired `low`) propagate;
/// they are retryable on the next cycle.
pub fn resolve_window<'a>(
    mailbox: &'a dyn MailboxApi,
    low: u64,
    high: u64,
    filter: &'a MessageFilter,
) -> Result<HistoryWindow<'a>> {
    let mut entries = if high > low {
        list_entries(mailbox, low, high, MAX_HISTORY_PAGES)?
    } else {
        Vec::new()
    };

    entries.sort_by_key(|(id, _)| *id);

    let mut seen = HashSet::new();
    let pending: VecDeque<(u64, MessageId)> = entries
        .into_iter()
        .flat_map(|(id, added)| added.into_iter().map(move |m| (id, m)))
        .filter(|(_, m)| seen.insert(m.clone()))
        .collect();

    debug!("window ({}, {}] resolved to {} added messages", low, high, pending.len());

    Ok(HistoryWindow {
        mailbox,
        filter,
        pending,
    })
}

/// Walk the history pages after `low`, keeping entries up to `high`
///
/// Fails rather than return a truncated window when `max_pages` runs out.
fn list_entries(
    mailbox: &dyn MailboxApi,
    low: u64,
    high: u64,
    max_pages: usize,
) -> Result<Vec<(u64, Vec<MessageId>)>> {
    let mut entries = Vec::new();
    let mut page_token: Option<String> = None;

    for _ in 0..max_pages {
        let page = mailbox
            .list_history(low, page_token.as_deref())
            .with_context(|| format!("Failed to list history after {low}"))?;

        for record in page.history.unwrap_or_default() {
            let Ok(id) = record.id.parse::<u64>() else {
                warn!("Skipping history entry with non-numeric id {:?}", record.id);
                continue;
            };
            if id <= low || id > high {
                continue;
            }
            let added = record
                .messages_added
                .unwrap_or_default()
                .into_iter()
                .map(|a| MessageId::new(a.message.id))
                .collect();
            entries.push((id, added));
        }

        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => return Ok(entries),
        }
    }

    bail!("History after {low} spans more than {max_pages} pages")
}
