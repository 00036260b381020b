//! Timer-driven polling of the mailbox history

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::history::resolve_window;
use super::session::SyncSession;
use crate::error::{WatchError, is_fatal};
use crate::gmail::{MailboxApi, normalize_message};
use crate::models::{MessageFilter, MessageId, ProcessedRecord, RecordBatch};

/// Default time between poll cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Seed a watermark from the most recent message
///
/// Falls back to the profile's history id for an empty mailbox. The fetched
/// message is only used for its position and is never emitted.
pub async fn bootstrap_watermark(mailbox: Arc<dyn MailboxApi>) -> Result<u64> {
    tokio::task::spawn_blocking(move || -> Result<u64> {
        let latest = mailbox
            .list_messages(None, 1, None)
            .context("Failed to list most recent message")?
            .messages
            .and_then(|m| m.into_iter().next());

        if let Some(latest) = latest {
            let raw = mailbox.get_message(&MessageId::new(latest.id))?;
            let message = normalize_message(raw)?;
            if message.history_id > 0 {
                return Ok(message.history_id);
            }
        }

        Ok(mailbox.get_profile().context("Failed to read mailbox profile")?.history_id)
    })
    .await
    .context("Bootstrap task panicked")?
}

/// Polls the history endpoint on a fixed interval
pub struct PollingEngine {
    mailbox: Arc<dyn MailboxApi>,
    session: Arc<SyncSession>,
    filter: Arc<MessageFilter>,
    interval: Duration,
}

impl PollingEngine {
    pub fn new(
        mailbox: Arc<dyn MailboxApi>,
        session: Arc<SyncSession>,
        filter: Arc<MessageFilter>,
    ) -> Self {
        Self {
            mailbox,
            session,
            filter,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll until cancelled or the receiver is dropped
    ///
    /// Transient failures are logged and retried next cycle; fatal ones end
    /// the loop with an error.
    pub async fn run(
        &self,
        output: mpsc::Sender<RecordBatch>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(
            "Polling every {:?} (session {})",
            self.interval,
            self.session.session_id()
        );

        while !cancel.is_cancelled() {
            let cycle = if self.session.has_watermark() {
                self.poll_once().await.map(Some)
            } else {
                self.bootstrap().await.map(|_| None)
            };

            match cycle {
                Ok(Some(batch)) => {
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = output.send(batch) => sent,
                    };
                    if sent.is_err() {
                        debug!("Poll output closed");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => warn!("Poll cycle failed, retrying in {:?}: {:#}", self.interval, e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Polling stopped at watermark {}", self.session.current_watermark());
        Ok(())
    }

    async fn bootstrap(&self) -> Result<()> {
        let watermark = bootstrap_watermark(Arc::clone(&self.mailbox)).await?;
        self.session.update_watermark(watermark);
        info!("Seeded watermark at {}", watermark);
        Ok(())
    }

    /// Run one cycle: resolve `(watermark, current history id]` and advance
    ///
    /// The returned batch may be empty.
    pub async fn poll_once(&self) -> Result<RecordBatch> {
        let low = self.session.current_watermark();
        let mailbox = Arc::clone(&self.mailbox);
        let filter = Arc::clone(&self.filter);

        let resolved = tokio::task::spawn_blocking(move || -> Result<(u64, Result<Vec<ProcessedRecord>>)> {
            let high = mailbox
                .get_profile()
                .context("Failed to read current history id")?
                .history_id;
            let records = resolve_window(mailbox.as_ref(), low, high, &filter)
                .map(|window| window.collect());
            Ok((high, records))
        })
        .await
        .context("Poll task panicked")??;

        let mut records = match resolved {
            (_, Ok(records)) => records,
            (high, Err(e)) => match e.downcast_ref::<WatchError>() {
                Some(WatchError::HistoryExpired(_)) => {
                    warn!("History after {} expired, skipping ahead to {}", low, high);
                    self.session.update_watermark(high);
                    Vec::new()
                }
                _ => return Err(e),
            },
        };
        // Stop short of the first failed fetch so it is retried next cycle.
        // Later records are left for that cycle too, keeping output in order.
        let retry_from = records.iter().find(|r| r.is_error()).map(|r| r.watermark());
        if let Some(failed_at) = retry_from {
            records.retain(|r| {
                r.watermark() < failed_at || (r.watermark() == failed_at && r.is_error())
            });
            warn!("Retrying history from {} next cycle", failed_at);
        }

        let batch = RecordBatch::new(self.session.next_batch_token(), records);
        let advance_to = match retry_from {
            Some(failed_at) => Some(failed_at.saturating_sub(1)),
            None => batch.max_watermark(),
        };
        if let Some(watermark) = advance_to {
            self.session.update_watermark(watermark);
        }
        debug!("{} produced {} records", batch.token, batch.len());
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::InMemoryMailbox;
    use crate::models::Message;

    fn engine(mailbox: &Arc<InMemoryMailbox>, watermark: u64) -> PollingEngine {
        PollingEngine::new(
            Arc::clone(mailbox) as Arc<dyn MailboxApi>,
            Arc::new(SyncSession::new(watermark)),
            Arc::new(MessageFilter::new()),
        )
        .with_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_poll_once_advances_watermark() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        mailbox.add_message_at(120, Message::builder("a").build());
        mailbox.add_message_at(145, Message::builder("b").build());
        let engine = engine(&mailbox, 100);

        let batch = engine.poll_once().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(engine.session.current_watermark(), 145);

        let batch = engine.poll_once().await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(engine.session.current_watermark(), 145);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_retried_next_cycle() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        mailbox.add_message_at(11, Message::builder("m1").build());
        mailbox.add_message_at(12, Message::builder("m2").build());
        mailbox.fail_message("m1");
        let engine = engine(&mailbox, 10);

        let batch = engine.poll_once().await.unwrap();
        assert_eq!(batch.errors().count(), 1);
        assert_eq!(batch.matched().count(), 0);
        assert_eq!(engine.session.current_watermark(), 10);

        mailbox.recover_message("m1");
        let batch = engine.poll_once().await.unwrap();
        let ids: Vec<String> = batch.matched().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(engine.session.current_watermark(), 12);
        assert_eq!(mailbox.history_starts(), vec![10, 10]);
    }

    #[tokio::test]
    async fn test_expired_history_skips_ahead() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        mailbox.add_message_at(500, Message::builder("a").build());
        mailbox.expire_history_before(300);
        let engine = engine(&mailbox, 100);

        let batch = engine.poll_once().await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(engine.session.current_watermark(), 500);
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_without_emitting() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        mailbox.add_message_at(40, Message::builder("old").build());
        mailbox.add_message_at(42, Message::builder("newest").build());
        let engine = engine(&mailbox, 0);

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            async move {
                let result = engine.run(tx, cancel).await;
                result.map(|_| engine)
            }
        };
        let handle = tokio::spawn(run);

        // The first emitted batch comes from the cycle after bootstrap
        let first = rx.recv().await.unwrap();
        assert!(first.is_empty());

        cancel.cancel();
        let engine = handle.await.unwrap().unwrap();
        assert_eq!(engine.session.current_watermark(), 42);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_polling() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        mailbox.set_unauthorized(true);
        let engine = engine(&mailbox, 10);

        let (tx, _rx) = mpsc::channel(8);
        let err = engine.run(tx, CancellationToken::new()).await.unwrap_err();
        assert!(is_fatal(&err));
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        mailbox.add_message_at(11, Message::builder("a").build());
        mailbox.fail_history(2);
        let engine = engine(&mailbox, 10);

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(tx, cancel).await })
        };

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(mailbox.history_starts(), vec![10, 10, 10]);
    }
}
