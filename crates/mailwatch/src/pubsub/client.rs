//! Pub/Sub REST client for pull subscriptions
//!
//! Uses synchronous HTTP (ureq), like the Gmail client.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::Envelope;
use crate::error::http_error;
use crate::gmail::TokenProvider;

const SERVICE: &str = "pubsub";

/// A pulled message with its ack id
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: Envelope,
    #[serde(default)]
    pub delivery_attempt: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [String],
    ack_deadline_seconds: u32,
}

/// Client for one Pub/Sub subscription
pub struct PubSubClient {
    tokens: Arc<dyn TokenProvider>,
    base_url: String,
    subscription: String,
}

impl PubSubClient {
    const BASE_URL: &'static str = "https://pubsub.googleapis.com/v1";

    /// `subscription` is the full `projects/<p>/subscriptions/<s>` path
    pub fn new(tokens: Arc<dyn TokenProvider>, subscription: impl Into<String>) -> Self {
        Self {
            tokens,
            base_url: Self::BASE_URL.to_string(),
            subscription: subscription.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    fn post<B: Serialize>(&self, verb: &str, body: &B) -> Result<ureq::http::Response<ureq::Body>> {
        let url = format!("{}/{}:{}", self.base_url, self.subscription, verb);
        let token = self.tokens.access_token()?;
        ureq::post(&url)
            .header("Authorization", &format!("Bearer {token}"))
            .send_json(body)
            .map_err(|e| http_error(SERVICE, e, verb))
    }

    /// Pull up to `max_messages`; may return fewer, or none
    pub fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>> {
        let mut response = self.post(
            "pull",
            &PullRequest {
                max_messages: max_messages.max(1),
            },
        )?;
        let pulled: PullResponse = response
            .body_mut()
            .read_json()
            .context("Failed to parse pull response")?;
        Ok(pulled.received_messages)
    }

    pub fn acknowledge(&self, ack_ids: &[String]) -> Result<()> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.post("acknowledge", &AcknowledgeRequest { ack_ids })?;
        Ok(())
    }

    /// Make messages immediately available for redelivery
    pub fn nack(&self, ack_ids: &[String]) -> Result<()> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.post(
            "modifyAckDeadline",
            &ModifyAckDeadlineRequest {
                ack_ids,
                ack_deadline_seconds: 0,
            },
        )?;
        Ok(())
    }
}
