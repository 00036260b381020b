//! Strategy selection
//!
//! A [`Subscription`] composes either the polling engine, or the
//! notification listener plus an optional watch manager, into one stream of
//! [`RecordBatch`]es handed to an [`OutputAction`].
//!
//! The run stops when the caller cancels, the configured duration elapses,
//! the output action fails, or the engine hits a fatal error. An active
//! watch is always stopped on the way out.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{SubscribeConfig, SyncMode};
use crate::error::{WatchError, is_fatal};
use crate::gmail::{MailboxApi, TokenProvider};
use crate::models::RecordBatch;
use crate::pubsub::{DeliveryClient, PubSubClient, PullDelivery, PushDelivery};
use crate::sync::{NotificationListener, PollingEngine, SyncSession, bootstrap_watermark};
use crate::watch::{WatchHandle, WatchManager, WatchStateStore};

/// Batches buffered between the engine and the output action
const OUTPUT_BUFFER: usize = 32;

/// Receives every batch a run produces, whatever the strategy
///
/// Batches carry matched, filtered and failed records alike; use
/// [`RecordBatch::matched`] for the matching messages only. Returning an
/// error ends the run.
pub trait OutputAction: Send + Sync {
    fn deliver(
        &self,
        batch: RecordBatch,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl<F, Fut> OutputAction for F
where
    F: Fn(RecordBatch, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn deliver(
        &self,
        batch: RecordBatch,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send {
        self(batch, cancel)
    }
}

/// Build the delivery client a mode needs; `None` for polling
pub fn build_delivery(
    config: &SubscribeConfig,
    tokens: Arc<dyn TokenProvider>,
) -> Result<Option<Box<dyn DeliveryClient>>> {
    config.validate()?;
    let delivery: Box<dyn DeliveryClient> = match config.mode {
        SyncMode::Poll => return Ok(None),
        SyncMode::Pull => {
            let subscription = config
                .subscription
                .clone()
                .context("pull mode requires a subscription")?;
            Box::new(
                PullDelivery::new(PubSubClient::new(tokens, subscription))
                    .with_max_messages(config.max_pull_messages),
            )
        }
        SyncMode::Push => {
            let mut push = PushDelivery::bind(config.push_addr()?)?;
            if let Some(token) = &config.push_verification_token {
                push = push.with_verification_token(token);
            }
            Box::new(push)
        }
    };
    Ok(Some(delivery))
}

/// One configured subscription run
pub struct Subscription {
    config: SubscribeConfig,
    mailbox: Arc<dyn MailboxApi>,
    store: Arc<dyn WatchStateStore>,
    delivery: Option<Box<dyn DeliveryClient>>,
}

impl Subscription {
    pub fn new(
        config: SubscribeConfig,
        mailbox: Arc<dyn MailboxApi>,
        store: Arc<dyn WatchStateStore>,
    ) -> Self {
        Self {
            config,
            mailbox,
            store,
            delivery: None,
        }
    }

    /// Delivery client for pull or push mode
    pub fn with_delivery(mut self, delivery: Box<dyn DeliveryClient>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn config(&self) -> &SubscribeConfig {
        &self.config
    }

    /// Run until cancelled, the deadline passes, or a fatal error
    pub async fn run<A: OutputAction>(self, action: &A, cancel: CancellationToken) -> Result<()> {
        self.config.validate()?;
        if self.config.mode != SyncMode::Poll && self.delivery.is_none() {
            return Err(WatchError::InvalidConfig(format!(
                "{} mode requires a delivery client",
                self.config.mode
            ))
            .into());
        }

        let run_cancel = cancel.child_token();
        if let Some(duration) = self.config.duration() {
            let deadline = run_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = deadline.cancelled() => {}
                    _ = tokio::time::sleep(duration) => {
                        info!("Run duration of {:?} elapsed", duration);
                        deadline.cancel();
                    }
                }
            });
        }

        info!("Starting {} subscription", self.config.mode);

        let watch = match self.start_watch().await {
            Ok(watch) => watch,
            Err(e) => {
                run_cancel.cancel();
                return Err(e);
            }
        };

        let result = self.produce(action, watch.as_ref(), &run_cancel).await;
        run_cancel.cancel();

        if let Some(watch) = watch
            && let Err(e) = watch.stop().await
        {
            warn!("Failed to stop watch: {:#}", e);
        }

        match &result {
            Ok(()) => info!("Subscription finished"),
            Err(e) if is_fatal(e) => error!("Subscription failed: {:#}", e),
            Err(e) => warn!("Subscription ended with error: {:#}", e),
        }
        result
    }

    async fn start_watch(&self) -> Result<Option<WatchHandle>> {
        if self.config.mode == SyncMode::Poll || !self.config.auto_setup_watch {
            return Ok(None);
        }
        let topic = self
            .config
            .topic
            .as_deref()
            .context("auto_setup_watch requires a topic")?;
        let manager = Arc::new(WatchManager::new(
            Arc::clone(&self.mailbox),
            Arc::clone(&self.store),
            self.config.watch_settings(),
        ));
        let handle = manager
            .ensure_active(topic, &self.config.label_ids, self.config.end_time)
            .await?;
        Ok(Some(handle))
    }

    /// Initial watermark for the listener
    async fn seed_watermark(&self, watch: Option<&WatchHandle>) -> Result<u64> {
        if let Some(history_id) = watch.and_then(|w| w.registration().history_id()) {
            debug!("Seeding watermark from watch registration: {}", history_id);
            return Ok(history_id);
        }
        match bootstrap_watermark(Arc::clone(&self.mailbox)).await {
            Ok(history_id) => Ok(history_id),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                warn!("Could not seed watermark, waiting for first notification: {:#}", e);
                Ok(0)
            }
        }
    }

    async fn produce<A: OutputAction>(
        &self,
        action: &A,
        watch: Option<&WatchHandle>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let filter = Arc::new(self.config.filter.clone());
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);

        let producer = async {
            let produced: Result<()> = match (self.config.mode, self.delivery.as_deref()) {
                (SyncMode::Poll, _) | (_, None) => {
                    let session = Arc::new(SyncSession::new(0));
                    PollingEngine::new(Arc::clone(&self.mailbox), session, filter)
                        .with_interval(self.config.poll_interval())
                        .run(tx, cancel.clone())
                        .await
                }
                (_, Some(delivery)) => {
                    let initial = self.seed_watermark(watch).await?;
                    let session = Arc::new(SyncSession::new(initial));
                    NotificationListener::new(Arc::clone(&self.mailbox), session, filter)
                        .run(delivery, tx, cancel.clone())
                        .await
                }
            };
            produced
        };

        let consumer = async {
            let mut rx = rx;
            while let Some(batch) = rx.recv().await {
                let token = batch.token;
                if let Err(e) = action.deliver(batch, cancel.clone()).await {
                    // Producers blocked on a full buffer see the closed
                    // channel and wind down
                    cancel.cancel();
                    rx.close();
                    return Err(e.context(format!("Output action failed for {token}")));
                }
            }
            Ok(())
        };

        let (produced, consumed) = tokio::join!(producer, consumer);
        produced.and(consumed)
    }
}
