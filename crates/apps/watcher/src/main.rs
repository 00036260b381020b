//! mailwatch - stream new Gmail messages as JSON lines
//!
//! Usage: `mailwatch [CONFIG_PATH]`
//!
//! Settings come from `CONFIG_PATH` or `~/.config/mailwatch/mailwatch.json`.
//! Records go to stdout, logs to stderr.

use anyhow::{Context, Result};
use log::{error, info, warn};
use mailwatch::{
    FileWatchStore, GmailAuth, GmailClient, GmailCredentials, RecordBatch, SubscribeConfig,
    Subscription, TokenProvider, build_delivery,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod output;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let subscribe = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => SubscribeConfig::from_file(&path)?,
        None => SubscribeConfig::load()?,
    };
    subscribe.validate()?;

    let credentials = match GmailCredentials::load() {
        Ok(credentials) => credentials,
        Err(e) => {
            if let Some(path) = GmailCredentials::default_credentials_path() {
                warn!(
                    "To configure Gmail access, either:\n\
                     1. Place your Google OAuth credentials at: {}\n\
                     2. Or set environment variables: GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
                    path.display()
                );
            }
            return Err(e.context("Gmail credentials not found"));
        }
    };

    let auth = GmailAuth::new(credentials.client_id, credentials.client_secret)?;
    let tokens: Arc<dyn TokenProvider> = Arc::new(auth);

    // Authorize up front so an interactive flow runs before any background work
    let authorizer = Arc::clone(&tokens);
    tokio::task::spawn_blocking(move || authorizer.access_token())
        .await
        .context("Authorization task panicked")??;

    let mailbox = Arc::new(GmailClient::new(Arc::clone(&tokens)));
    let store = Arc::new(FileWatchStore::default_location()?);
    let delivery = build_delivery(&subscribe, tokens)?;

    let mut subscription = Subscription::new(subscribe, mailbox, store);
    if let Some(delivery) = delivery {
        subscription = subscription.with_delivery(delivery);
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let action = |batch: RecordBatch, _cancel: CancellationToken| async move {
        output::write_batch(&batch)
    };
    subscription.run(&action, cancel).await
}

/// Cancel the run on SIGINT or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Shutdown requested, draining");
    cancel.cancel();
}
