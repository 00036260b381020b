//! Pull delivery: poll a Pub/Sub subscription and acknowledge replies

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::client::PubSubClient;
use super::{AckReply, Delivery, DeliveryClient, DeliveryHandle};
use crate::error::is_fatal;

/// Pulls from a subscription and forwards each message as a [`Delivery`]
pub struct PullDelivery {
    client: Arc<PubSubClient>,
    max_messages: usize,
    retry_backoff: Duration,
}

impl PullDelivery {
    pub fn new(client: PubSubClient) -> Self {
        Self {
            client: Arc::new(client),
            max_messages: 10,
            retry_backoff: Duration::from_secs(5),
        }
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

impl DeliveryClient for PullDelivery {
    fn start(&self, sink: mpsc::Sender<Delivery>) -> Result<DeliveryHandle> {
        let client = Arc::clone(&self.client);
        let max_messages = self.max_messages;
        let backoff = self.retry_backoff;
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        info!("Pulling from {}", client.subscription());

        let task = tokio::spawn(async move {
            let replies = TaskTracker::new();
            let result = pull_loop(&client, &sink, &replies, max_messages, backoff, &stop).await;

            // Settle every outstanding ack before reporting
            replies.close();
            replies.wait().await;
            result
        });

        Ok(DeliveryHandle::new(cancel, task))
    }
}

async fn pull_loop(
    client: &Arc<PubSubClient>,
    sink: &mpsc::Sender<Delivery>,
    replies: &TaskTracker,
    max_messages: usize,
    backoff: Duration,
    stop: &CancellationToken,
) -> Result<()> {
    loop {
        let puller = Arc::clone(client);
        let pulled = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            pulled = tokio::task::spawn_blocking(move || puller.pull(max_messages)) => {
                pulled.context("Pull task panicked")?
            }
        };

        let messages = match pulled {
            Ok(messages) => messages,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!("Pull failed, retrying in {:?}: {:#}", backoff, e);
                tokio::select! {
                    _ = stop.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        if !messages.is_empty() {
            debug!("Pulled {} messages", messages.len());
        }

        for received in messages {
            let (delivery, reply) = Delivery::new(received.message);
            if sink.send(delivery).await.is_err() {
                debug!("Delivery sink closed");
                return Ok(());
            }

            let client = Arc::clone(client);
            let ack_id = received.ack_id;
            replies.spawn(async move {
                let answer = reply.await.unwrap_or(AckReply::Nack);
                let ids = vec![ack_id];
                let settled = tokio::task::spawn_blocking(move || match answer {
                    AckReply::Ack => client.acknowledge(&ids),
                    AckReply::Nack => client.nack(&ids),
                })
                .await;
                match settled {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to settle {:?} reply: {:#}", answer, e),
                    Err(e) => warn!("Ack task panicked: {}", e),
                }
            });
        }
    }
}
