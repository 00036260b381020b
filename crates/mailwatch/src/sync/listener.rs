//! Notification listener
//!
//! Bridges a [`DeliveryClient`] into the same batch output as the polling
//! engine. Each envelope gets a batch token on receipt and is then handled
//! on its own task: decode, advance the watermark, resolve the `(previous, received]` window,
//! forward the batch, then ack.
//!
//! Envelopes are acked once their batch has been forwarded, even when
//! processing failed (the failure travels in the batch as an error record).
//! Batches from different envelopes may interleave; records inside one batch
//! are in ascending history-id order.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::history::resolve_window;
use super::notification::decode_notification;
use super::session::SyncSession;
use crate::error::{WatchError, is_fatal};
use crate::gmail::MailboxApi;
use crate::models::{BatchToken, MessageFilter, ProcessedRecord, RecordBatch};
use crate::pubsub::{Delivery, DeliveryClient};

/// Consumes notifications and emits one [`RecordBatch`] per envelope
pub struct NotificationListener {
    mailbox: Arc<dyn MailboxApi>,
    session: Arc<SyncSession>,
    filter: Arc<MessageFilter>,
    queue_depth: usize,
    stop_timeout: Duration,
}

/// State shared by per-envelope tasks
struct Worker {
    mailbox: Arc<dyn MailboxApi>,
    session: Arc<SyncSession>,
    filter: Arc<MessageFilter>,
    output: mpsc::Sender<RecordBatch>,
    failure: Mutex<Option<anyhow::Error>>,
    abort: CancellationToken,
}

impl NotificationListener {
    pub fn new(
        mailbox: Arc<dyn MailboxApi>,
        session: Arc<SyncSession>,
        filter: Arc<MessageFilter>,
    ) -> Self {
        Self {
            mailbox,
            session,
            filter,
            queue_depth: 64,
            stop_timeout: Duration::from_secs(30),
        }
    }

    /// How long to wait for the delivery client when stopping
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Run until `cancel` fires, the delivery client stops, or a fatal error
    ///
    /// In-flight envelopes finish and are forwarded before this returns.
    /// Envelopes still queued at shutdown are dropped unacknowledged.
    pub async fn run(
        &self,
        delivery: &dyn DeliveryClient,
        output: mpsc::Sender<RecordBatch>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(self.queue_depth);
        let handle = delivery.start(tx).context("Failed to start delivery client")?;
        let abort = cancel.child_token();
        let worker = Arc::new(Worker {
            mailbox: Arc::clone(&self.mailbox),
            session: Arc::clone(&self.session),
            filter: Arc::clone(&self.filter),
            output,
            failure: Mutex::new(None),
            abort: abort.clone(),
        });
        let tasks = TaskTracker::new();

        info!(
            "Listening for notifications (session {}, watermark {})",
            self.session.session_id(),
            self.session.current_watermark()
        );

        loop {
            let delivery = tokio::select! {
                _ = abort.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        debug!("Delivery client closed its stream");
                        break;
                    }
                },
            };
            let token = self.session.next_batch_token();
            let worker = Arc::clone(&worker);
            tasks.spawn(async move { worker.handle(token, delivery).await });
        }

        // Queued envelopes nack on drop; in-flight ones settle their replies
        // before the delivery client can finish.
        drop(rx);
        tasks.close();
        let stopped = handle.stop(self.stop_timeout).await;
        tasks.wait().await;

        info!(
            "Listener stopped at watermark {}",
            self.session.current_watermark()
        );

        if let Some(e) = worker.failure.lock().take() {
            return Err(e);
        }
        stopped
    }
}

impl Worker {
    async fn handle(&self, token: BatchToken, delivery: Delivery) {
        let envelope_id = delivery.envelope.message_id.clone();

        let batch = match decode_notification(&delivery.envelope.data) {
            Err(e) => {
                warn!("Envelope {} is malformed: {}", envelope_id, e);
                RecordBatch::new(token, [ProcessedRecord::failed(0, None, e.to_string())])
            }
            Ok(notification) => {
                let received = notification.history_id;
                let previous = self.session.update_watermark(received);
                debug!(
                    "{} from envelope {}: window ({}, {}]",
                    token, envelope_id, previous, received
                );

                if previous == 0 {
                    info!("No prior watermark; seeded at {}", received);
                    RecordBatch::empty(token)
                } else if received <= previous {
                    RecordBatch::empty(token)
                } else {
                    match self.resolve(previous, received).await {
                        Ok(records) => RecordBatch::new(token, records),
                        Err(e) => self.window_failed(token, received, e),
                    }
                }
            }
        };

        if self.output.send(batch).await.is_err() {
            debug!("Output closed; leaving envelope {} unacknowledged", envelope_id);
            delivery.nack();
            return;
        }
        delivery.ack();
    }

    async fn resolve(&self, low: u64, high: u64) -> Result<Vec<ProcessedRecord>> {
        let mailbox = Arc::clone(&self.mailbox);
        let filter = Arc::clone(&self.filter);
        tokio::task::spawn_blocking(move || {
            resolve_window(mailbox.as_ref(), low, high, &filter).map(|window| window.collect())
        })
        .await
        .context("Window task panicked")?
    }

    fn window_failed(&self, token: BatchToken, received: u64, e: anyhow::Error) -> RecordBatch {
        if let Some(WatchError::HistoryExpired(_)) = e.downcast_ref::<WatchError>() {
            warn!("{}: history expired, continuing from {}", token, received);
            return RecordBatch::empty(token);
        }

        if is_fatal(&e) {
            error!("{}: fatal error resolving window: {:#}", token, e);
            let reason = format!("{e:#}");
            self.failure.lock().get_or_insert(e);
            self.abort.cancel();
            return RecordBatch::new(token, [ProcessedRecord::failed(received, None, reason)]);
        }

        warn!("{}: failed to resolve window: {:#}", token, e);
        RecordBatch::new(token, [ProcessedRecord::failed(received, None, format!("{e:#}"))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::InMemoryMailbox;
    use crate::models::Message;
    use crate::pubsub::{AckReply, ChannelDelivery, Envelope};
    use base64::prelude::*;

    fn envelope(id: &str, history_id: u64) -> Envelope {
        let data = BASE64_STANDARD.encode(format!(
            r#"{{"emailAddress":"me@example.com","historyId":{history_id}}}"#
        ));
        Envelope::new(id, data)
    }

    #[tokio::test]
    async fn test_notification_resolves_window() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        mailbox.add_message_at(120, Message::builder("a").build());
        mailbox.add_message_at(145, Message::builder("b").build());
        let session = Arc::new(SyncSession::new(100));
        let listener = NotificationListener::new(
            mailbox.clone(),
            Arc::clone(&session),
            Arc::new(MessageFilter::new()),
        );

        let (delivery, feed) = ChannelDelivery::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        feed.send(envelope("n1", 150)).unwrap();
        drop(feed);

        listener
            .run(&delivery, out_tx, CancellationToken::new())
            .await
            .unwrap();

        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.token, BatchToken(1));
        let ids: Vec<u64> = batch.records.iter().map(|r| r.record.history_id).collect();
        assert_eq!(ids, vec![120, 145]);
        assert!(batch.records.iter().all(|r| r.batch_id == batch.token));
        assert_eq!(session.current_watermark(), 150);
        assert_eq!(mailbox.history_starts(), vec![100]);
        assert_eq!(delivery.replies(), vec![("n1".to_string(), AckReply::Ack)]);
    }

    #[tokio::test]
    async fn test_malformed_envelope_does_not_stop_listener() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        mailbox.add_message_at(11, Message::builder("a").build());
        let session = Arc::new(SyncSession::new(10));
        let listener =
            NotificationListener::new(mailbox, session, Arc::new(MessageFilter::new()));

        let (delivery, feed) = ChannelDelivery::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        feed.send(Envelope::new("bad", "%%% not base64 %%%")).unwrap();
        feed.send(envelope("good", 11)).unwrap();
        drop(feed);

        listener
            .run(&delivery, out_tx, CancellationToken::new())
            .await
            .unwrap();

        let mut batches = Vec::new();
        while let Some(batch) = out_rx.recv().await {
            batches.push(batch);
        }
        batches.sort_by_key(|b| b.token);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert!(batches[0].records[0].record.is_error());
        assert_eq!(batches[1].matched().count(), 1);
        assert!(delivery.replies().iter().all(|(_, r)| *r == AckReply::Ack));
    }

    #[tokio::test]
    async fn test_stale_notification_yields_empty_batch() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        let session = Arc::new(SyncSession::new(200));
        let listener = NotificationListener::new(
            mailbox.clone(),
            Arc::clone(&session),
            Arc::new(MessageFilter::new()),
        );

        let (delivery, feed) = ChannelDelivery::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        feed.send(envelope("old", 150)).unwrap();
        drop(feed);

        listener
            .run(&delivery, out_tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(out_rx.recv().await.unwrap().is_empty());
        assert_eq!(session.current_watermark(), 200);
        assert!(mailbox.history_starts().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_error_stops_listener() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        mailbox.set_unauthorized(true);
        let session = Arc::new(SyncSession::new(10));
        let listener =
            NotificationListener::new(mailbox, session, Arc::new(MessageFilter::new()));

        // Keep the feed open: only the fatal error can end the run
        let (delivery, feed) = ChannelDelivery::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        feed.send(envelope("n1", 20)).unwrap();

        let err = listener
            .run(&delivery, out_tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(is_fatal(&err));

        let batch = out_rx.recv().await.unwrap();
        assert!(batch.records[0].record.is_error());
        drop(feed);
    }

    #[tokio::test]
    async fn test_cancellation_drains_and_closes_output() {
        let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
        let session = Arc::new(SyncSession::new(10));
        let listener =
            NotificationListener::new(mailbox, session, Arc::new(MessageFilter::new()));

        let (delivery, _feed) = ChannelDelivery::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        listener.run(&delivery, out_tx, cancel).await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }
}
