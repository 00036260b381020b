//! In-process delivery from a channel of envelopes
//!
//! Useful for tests and for replaying captured notifications.

use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{AckReply, Delivery, DeliveryClient, DeliveryHandle, Envelope};

/// Delivers envelopes pushed into an unbounded channel
pub struct ChannelDelivery {
    source: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    replies: Arc<Mutex<Vec<(String, AckReply)>>>,
}

impl ChannelDelivery {
    /// Create the client and the sender envelopes are fed through
    pub fn new() -> (Self, mpsc::UnboundedSender<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            source: Mutex::new(Some(rx)),
            replies: Arc::new(Mutex::new(Vec::new())),
        };
        (client, tx)
    }

    /// `(message_id, reply)` for every answered delivery, in answer order
    pub fn replies(&self) -> Vec<(String, AckReply)> {
        self.replies.lock().clone()
    }
}

impl DeliveryClient for ChannelDelivery {
    fn start(&self, sink: mpsc::Sender<Delivery>) -> Result<DeliveryHandle> {
        let Some(mut source) = self.source.lock().take() else {
            bail!("channel delivery already started");
        };
        let replies = Arc::clone(&self.replies);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        let task = tokio::spawn(async move {
            let pending = TaskTracker::new();
            loop {
                let envelope = tokio::select! {
                    _ = stop.cancelled() => break,
                    envelope = source.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let message_id = envelope.message_id.clone();
                let (delivery, reply) = Delivery::new(envelope);
                if sink.send(delivery).await.is_err() {
                    break;
                }

                let replies = Arc::clone(&replies);
                pending.spawn(async move {
                    if let Ok(answer) = reply.await {
                        replies.lock().push((message_id, answer));
                    }
                });
            }
            pending.close();
            pending.wait().await;
            Ok(())
        });

        Ok(DeliveryHandle::new(cancel, task))
    }
}
