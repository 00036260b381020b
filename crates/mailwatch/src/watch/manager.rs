//! Watch lifecycle: create or adopt a registration, renew it before expiry,
//! and tear it down on stop when this process owns it.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::store::WatchStateStore;
use super::timing::{RenewalDecision, check_renewal, next_check_at};
use crate::gmail::MailboxApi;
use crate::gmail::api::WatchRequest;
use crate::models::{GMAIL_SERVICE, WatchKey, WatchRegistration};

/// Timing and ownership policy for a [`WatchManager`]
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub application_name: String,
    /// Renewal is scheduled this long before expiry
    pub safety_margin: Duration,
    /// A check renews when expiry is at most this far away
    pub renewal_threshold: Duration,
    /// Delay before retrying a failed renewal
    pub retry_backoff: Duration,
    /// Earliest a check may be scheduled from now
    pub min_lead: Duration,
    /// Treat an adopted registration as owned (torn down on stop)
    pub enforce_ownership: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            application_name: "mailwatch".to_string(),
            safety_margin: Duration::minutes(15),
            renewal_threshold: Duration::minutes(20),
            retry_backoff: Duration::minutes(5),
            min_lead: Duration::minutes(1),
            enforce_ownership: false,
        }
    }
}

impl WatchSettings {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Default::default()
        }
    }
}

/// Creates, persists and renews the mailbox watch registration
pub struct WatchManager {
    mailbox: Arc<dyn MailboxApi>,
    store: Arc<dyn WatchStateStore>,
    settings: WatchSettings,
}

impl WatchManager {
    pub fn new(
        mailbox: Arc<dyn MailboxApi>,
        store: Arc<dyn WatchStateStore>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            mailbox,
            store,
            settings,
        }
    }

    pub fn key(&self) -> WatchKey {
        WatchKey::new(GMAIL_SERVICE, &self.settings.application_name)
    }

    pub fn settings(&self) -> &WatchSettings {
        &self.settings
    }

    /// Make sure a registration is active and start renewing it
    ///
    /// A persisted, unexpired registration for the same topic is adopted;
    /// otherwise a new one is created and persisted. Renewal stops for good
    /// once a due check finds `end_time` has passed.
    pub async fn ensure_active(
        self: &Arc<Self>,
        topic: &str,
        labels: &[String],
        end_time: Option<DateTime<Utc>>,
    ) -> Result<WatchHandle> {
        let manager = Arc::clone(self);
        let topic = topic.to_string();
        let labels = labels.to_vec();

        let (registration, topic, labels) = tokio::task::spawn_blocking(move || {
            manager
                .activate(&topic, &labels)
                .map(|registration| (registration, topic, labels))
        })
        .await
        .context("Watch setup task panicked")??;

        let current = Arc::new(Mutex::new(registration));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).renewal_loop(
            Arc::clone(&current),
            topic,
            labels,
            end_time,
            cancel.clone(),
        ));

        Ok(WatchHandle {
            manager: Arc::clone(self),
            current,
            cancel,
            task,
        })
    }

    /// Adopt or create a registration (blocking)
    pub fn activate(&self, topic: &str, labels: &[String]) -> Result<WatchRegistration> {
        let key = self.key();
        let now = Utc::now();

        match self.store.load(&key) {
            Ok(Some(mut existing)) if !existing.is_expired(now) && existing.topic_name == topic => {
                existing.owned = self.settings.enforce_ownership;
                info!(
                    "Adopting watch {} on {} (expires {}, owned: {})",
                    existing.watch_id, existing.topic_name, existing.expiration, existing.owned
                );
                return Ok(existing);
            }
            Ok(Some(existing)) if existing.topic_name != topic => {
                info!(
                    "Persisted watch targets {}, not {}; replacing it",
                    existing.topic_name, topic
                );
            }
            Ok(Some(existing)) => {
                info!("Persisted watch {} expired at {}", existing.watch_id, existing.expiration);
            }
            Ok(None) => debug!("No persisted watch for {}", key.file_name()),
            Err(e) => warn!("Ignoring unreadable watch state: {:#}", e),
        }

        self.create(topic, labels, true)
    }

    /// Register a new watch with the mailbox and persist it
    fn create(&self, topic: &str, labels: &[String], owned: bool) -> Result<WatchRegistration> {
        let response = self
            .mailbox
            .watch(&WatchRequest::new(topic, labels.to_vec()))
            .with_context(|| format!("Failed to create watch on {topic}"))?;
        let expiration = DateTime::from_timestamp_millis(response.expiration)
            .context("Watch expiration out of range")?;

        let registration = WatchRegistration {
            service_type: GMAIL_SERVICE.to_string(),
            watch_id: response.history_id.to_string(),
            topic_name: topic.to_string(),
            application_name: self.settings.application_name.clone(),
            expiration,
            created_at: Utc::now(),
            service_specific_data: serde_json::json!({
                "historyId": response.history_id,
                "labelIds": labels,
            }),
            owned,
        };
        self.store.save(&registration)?;

        info!(
            "Created watch {} on {} (expires {})",
            registration.watch_id, topic, expiration
        );
        Ok(registration)
    }

    async fn renewal_loop(
        self: Arc<Self>,
        current: Arc<Mutex<WatchRegistration>>,
        topic: String,
        labels: Vec<String>,
        end_time: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) {
        let settings = &self.settings;
        let expiration = current.lock().expiration;
        let mut next = next_check_at(expiration, Utc::now(), settings.safety_margin, settings.min_lead);

        loop {
            debug!("Next watch renewal check at {}", next);
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            let (expiration, owned) = {
                let registration = current.lock();
                (registration.expiration, registration.owned)
            };
            let now = Utc::now();

            match check_renewal(expiration, now, settings.renewal_threshold, end_time) {
                RenewalDecision::Wait => {
                    next = next_check_at(expiration, now, settings.safety_margin, settings.min_lead);
                }
                RenewalDecision::Finished => {
                    info!("Watch end time passed; no further renewals");
                    return;
                }
                RenewalDecision::Renew => {
                    // Runs to completion even when cancelled, so stop() sees
                    // and tears down the newest registration
                    let manager = Arc::clone(&self);
                    let topic = topic.clone();
                    let labels = labels.clone();
                    let renewed =
                        tokio::task::spawn_blocking(move || manager.create(&topic, &labels, owned))
                            .await;

                    match renewed {
                        Ok(Ok(registration)) => {
                            info!("Renewed watch, now expiring {}", registration.expiration);
                            next = next_check_at(
                                registration.expiration,
                                Utc::now(),
                                settings.safety_margin,
                                settings.min_lead,
                            );
                            *current.lock() = registration;
                        }
                        Ok(Err(e)) => {
                            warn!(
                                "Watch renewal failed, retrying in {}s: {:#}",
                                settings.retry_backoff.num_seconds(),
                                e
                            );
                            next = Utc::now() + settings.retry_backoff;
                        }
                        Err(e) => {
                            error!("Watch renewal task panicked: {}", e);
                            next = Utc::now() + settings.retry_backoff;
                        }
                    }
                }
            }
        }
    }
}

/// An active registration and its renewal task
pub struct WatchHandle {
    manager: Arc<WatchManager>,
    current: Arc<Mutex<WatchRegistration>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Snapshot of the current registration
    pub fn registration(&self) -> WatchRegistration {
        self.current.lock().clone()
    }

    pub fn is_owned(&self) -> bool {
        self.current.lock().owned
    }

    /// Cancel renewal; tear the registration down if this process owns it
    ///
    /// A non-owned registration and its persisted state are left untouched.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Watch renewal task ended abnormally: {}", e);
        }

        let registration = self.current.lock().clone();
        if !registration.owned {
            info!("Leaving watch {} in place (not owned)", registration.watch_id);
            return Ok(());
        }

        let manager = self.manager;
        tokio::task::spawn_blocking(move || -> Result<()> {
            manager.mailbox.stop_watch().context("Failed to stop watch")?;
            manager.store.delete(&registration.key())?;
            info!("Stopped watch {}", registration.watch_id);
            Ok(())
        })
        .await
        .context("Watch teardown task panicked")?
    }
}
