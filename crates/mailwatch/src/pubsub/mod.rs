//! Pub/Sub delivery of mailbox notifications
//!
//! A [`DeliveryClient`] feeds [`Delivery`] values into a channel. Each
//! delivery carries the transport envelope and a reply slot the consumer
//! answers with ack or nack; the client turns that reply into whatever its
//! transport needs (an acknowledge call, an HTTP status, ...).

mod channel;
mod client;
mod pull;
mod push;

pub use channel::ChannelDelivery;
pub use client::PubSubClient;
pub use pull::PullDelivery;
pub use push::PushDelivery;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A Pub/Sub message as delivered by pull or push
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "RawEnvelope")]
pub struct Envelope {
    pub message_id: String,
    /// Base64-encoded payload
    pub data: String,
    pub publish_time: Option<DateTime<Utc>>,
    pub attributes: HashMap<String, String>,
}

/// Push bodies carry both camelCase and snake_case copies of some fields
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default, rename = "message_id")]
    message_id_snake: Option<String>,
    #[serde(default)]
    data: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
    #[serde(default, rename = "publish_time")]
    publish_time_snake: Option<DateTime<Utc>>,
    #[serde(default)]
    attributes: Option<HashMap<String, String>>,
}

impl From<RawEnvelope> for Envelope {
    fn from(raw: RawEnvelope) -> Self {
        Self {
            message_id: raw
                .message_id
                .or(raw.message_id_snake)
                .unwrap_or_default(),
            data: raw.data,
            publish_time: raw.publish_time.or(raw.publish_time_snake),
            attributes: raw.attributes.unwrap_or_default(),
        }
    }
}

impl Envelope {
    pub fn new(message_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            data: data.into(),
            ..Default::default()
        }
    }
}

/// Consumer's verdict on a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckReply {
    Ack,
    Nack,
}

/// An envelope awaiting an ack or nack
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    reply: oneshot::Sender<AckReply>,
}

impl Delivery {
    /// Create a delivery and the receiver its reply arrives on
    pub fn new(envelope: Envelope) -> (Self, oneshot::Receiver<AckReply>) {
        let (reply, rx) = oneshot::channel();
        (Self { envelope, reply }, rx)
    }

    pub fn ack(self) {
        let _ = self.reply.send(AckReply::Ack);
    }

    pub fn nack(self) {
        let _ = self.reply.send(AckReply::Nack);
    }
}

/// Source of notification deliveries
pub trait DeliveryClient: Send + Sync {
    /// Start delivering into `sink` on the current tokio runtime
    ///
    /// Delivery stops when the handle is stopped or the sink is closed.
    fn start(&self, sink: mpsc::Sender<Delivery>) -> Result<DeliveryHandle>;
}

/// Running delivery task
pub struct DeliveryHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl DeliveryHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<Result<()>>) -> Self {
        Self { cancel, task }
    }

    /// Whether the delivery task has exited on its own
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the delivery task and wait up to `timeout` for it to finish
    ///
    /// Returns the task's own error, if it failed.
    pub async fn stop(self, timeout: Duration) -> Result<()> {
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined.context("Delivery task panicked")?,
            Err(_) => {
                warn!("Delivery task did not stop within {:?}, aborting", timeout);
                task.abort();
                Ok(())
            }
        }
    }
}
