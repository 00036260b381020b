//! Push delivery: an HTTP endpoint for Pub/Sub push subscriptions
//!
//! Pub/Sub POSTs `{"message": {...}, "subscription": "..."}` and treats a 2xx
//! response as an ack; anything else triggers redelivery.

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AckReply, Delivery, DeliveryClient, DeliveryHandle, Envelope};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Push body; the `subscription` field is ignored
#[derive(Debug, Deserialize)]
struct PushRequest {
    message: Envelope,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Clone)]
struct PushState {
    sink: mpsc::Sender<Delivery>,
    verification_token: Option<Arc<str>>,
}

/// HTTP endpoint receiving Pub/Sub push requests
pub struct PushDelivery {
    listener: Mutex<Option<std::net::TcpListener>>,
    local_addr: SocketAddr,
    verification_token: Option<String>,
}

impl PushDelivery {
    /// Bind the endpoint; port 0 picks a free port
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("Failed to bind push endpoint on {addr}"))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            verification_token: None,
        })
    }

    /// Require `?token=<token>` on every request
    pub fn with_verification_token(mut self, token: impl Into<String>) -> Self {
        self.verification_token = Some(token.into());
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Any path is accepted; the push subscription decides which one it calls
fn router(state: PushState) -> Router {
    Router::new()
        .route("/", post(receive))
        .route("/{*path}", post(receive))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn receive(
    State(state): State<PushState>,
    Query(query): Query<TokenQuery>,
    Json(request): Json<PushRequest>,
) -> StatusCode {
    if let Some(expected) = state.verification_token.as_deref()
        && query.token.as_deref() != Some(expected)
    {
        warn!("Rejected push request with missing or wrong token");
        return StatusCode::FORBIDDEN;
    }

    let envelope_id = request.message.message_id.clone();
    let (delivery, reply) = Delivery::new(request.message);
    if state.sink.send(delivery).await.is_err() {
        debug!("Listener gone; refusing envelope {}", envelope_id);
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match reply.await {
        Ok(AckReply::Ack) => StatusCode::NO_CONTENT,
        Ok(AckReply::Nack) | Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl DeliveryClient for PushDelivery {
    fn start(&self, sink: mpsc::Sender<Delivery>) -> Result<DeliveryHandle> {
        let std_listener = self
            .listener
            .lock()
            .take()
            .context("push endpoint already started")?;
        let listener = TcpListener::from_std(std_listener)?;
        let app = router(PushState {
            sink,
            verification_token: self.verification_token.as_deref().map(Arc::from),
        });
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        info!("Accepting push deliveries on {}", self.local_addr);

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    stop.cancelled().await;
                    debug!("Push endpoint shutting down");
                })
                .await
                .context("Push endpoint failed")
        });

        Ok(DeliveryHandle::new(cancel, task))
    }
}
