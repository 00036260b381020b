//! Integration tests for the mailwatch crate
//!
//! These tests drive complete runs against the in-memory mailbox, the
//! in-process delivery client and both watch stores.

use base64::prelude::*;
use chrono::{Duration, Utc};
use mailwatch::models::GMAIL_SERVICE;
use mailwatch::{
    AckReply, ChannelDelivery, Delivery, DeliveryClient, DeliveryHandle, EmailAddress, Envelope,
    FileWatchStore, InMemoryMailbox, InMemoryWatchStore, MailboxApi, Message, MessageFilter,
    NotificationListener, RecordBatch, SubscribeConfig, Subscription, SyncMode, SyncSession,
    WatchManager, WatchRegistration, WatchSettings, WatchStateStore, is_fatal,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "projects/acme/topics/mail";
const SUBSCRIPTION: &str = "projects/acme/subscriptions/mail-sub";

fn notification(id: &str, history_id: u64) -> Envelope {
    let payload = format!(r#"{{"emailAddress":"me@example.com","historyId":{history_id}}}"#);
    Envelope::new(id, BASE64_STANDARD.encode(payload))
}

fn pull_config(auto_setup_watch: bool) -> SubscribeConfig {
    SubscribeConfig {
        mode: SyncMode::Pull,
        topic: Some(TOPIC.to_string()),
        subscription: Some(SUBSCRIPTION.to_string()),
        auto_setup_watch,
        ..Default::default()
    }
}

fn message(id: &str, from: &str, subject: &str) -> Message {
    Message::builder(id)
        .from(EmailAddress::parse(from))
        .to(vec![EmailAddress::new("me@example.com")])
        .subject(subject)
        .received_at(Utc::now())
        .build()
}

/// Output action that keeps every batch
fn collector() -> (
    Arc<Mutex<Vec<RecordBatch>>>,
    impl Fn(RecordBatch, CancellationToken) -> std::future::Ready<anyhow::Result<()>> + Send + Sync,
) {
    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let action = move |batch: RecordBatch, _cancel: CancellationToken| {
        sink.lock().push(batch);
        std::future::ready(Ok(()))
    };
    (batches, action)
}

fn adopted_registration(history_id: u64) -> WatchRegistration {
    WatchRegistration {
        service_type: GMAIL_SERVICE.to_string(),
        watch_id: history_id.to_string(),
        topic_name: TOPIC.to_string(),
        application_name: "mailwatch".to_string(),
        expiration: Utc::now() + Duration::days(6),
        created_at: Utc::now() - Duration::days(1),
        service_specific_data: serde_json::json!({ "historyId": history_id.to_string() }),
        owned: false,
    }
}

#[tokio::test]
async fn test_notification_run_with_adopted_watch() {
    let state = TempDir::new().unwrap();
    let store = Arc::new(FileWatchStore::new(state.path()));
    store.save(&adopted_registration(100)).unwrap();

    let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
    mailbox.add_message_at(120, message("m120", "Alerts <alerts@acme.io>", "Disk full"));
    mailbox.add_message_at(145, message("m145", "friend@example.com", "Lunch?"));
    mailbox.bump_history(150);

    let (delivery, feed) = ChannelDelivery::new();
    let delivery = Arc::new(delivery);
    feed.send(notification("n1", 150)).unwrap();
    drop(feed);

    let mut config = pull_config(true);
    config.filter = MessageFilter::new().from_sender("alerts@");
    let subscription = Subscription::new(config, mailbox.clone(), store.clone())
        .with_delivery(Box::new(SharedDelivery(Arc::clone(&delivery))));

    let (batches, action) = collector();
    subscription.run(&action, CancellationToken::new()).await.unwrap();

    let batches = batches.lock();
    assert_eq!(batches.len(), 1);
    let history: Vec<u64> = batches[0].records.iter().map(|r| r.record.history_id).collect();
    assert_eq!(history, vec![120, 145]);
    let matched: Vec<&str> = batches[0].matched().map(|m| m.id.as_str()).collect();
    assert_eq!(matched, vec!["m120"]);

    // The adopted watch is neither renewed nor torn down
    assert!(mailbox.watch_requests().is_empty());
    assert_eq!(mailbox.stop_calls(), 0);
    assert!(store.path_for(&adopted_registration(100).key()).exists());
    assert_eq!(delivery.replies(), vec![("n1".to_string(), AckReply::Ack)]);
}

#[tokio::test]
async fn test_owned_watch_is_stopped_on_cancel() {
    let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
    mailbox.bump_history(300);
    let store = Arc::new(InMemoryWatchStore::new());

    let (delivery, _feed) = ChannelDelivery::new();
    let mut config = pull_config(true);
    config.label_ids = vec!["INBOX".to_string()];
    let subscription = Subscription::new(config, mailbox.clone(), store.clone())
        .with_delivery(Box::new(delivery));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    let observer = Arc::clone(&store);
    let watched = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let persisted = observer.len();
        stopper.cancel();
        persisted
    });

    let (_batches, action) = collector();
    subscription.run(&action, cancel).await.unwrap();

    assert_eq!(watched.await.unwrap(), 1);
    let requests = mailbox.watch_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].topic_name, TOPIC);
    assert_eq!(requests[0].label_filter_behavior.as_deref(), Some("include"));
    assert_eq!(mailbox.stop_calls(), 1);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_watch_stopped_when_output_action_fails() {
    let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
    mailbox.bump_history(10);
    mailbox.add_message_at(11, message("m11", "a@example.com", "hello"));
    let store = Arc::new(InMemoryWatchStore::new());

    let (delivery, feed) = ChannelDelivery::new();
    feed.send(notification("n1", 11)).unwrap();
    let subscription = Subscription::new(pull_config(true), mailbox.clone(), store.clone())
        .with_delivery(Box::new(delivery));

    let action = |_: RecordBatch, _: CancellationToken| async {
        Err::<(), _>(anyhow::anyhow!("downstream unavailable"))
    };
    let err = subscription
        .run(&action, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("downstream unavailable"));
    assert_eq!(mailbox.stop_calls(), 1);
    assert!(store.is_empty());
    drop(feed);
}

#[tokio::test]
async fn test_unauthorized_mailbox_is_fatal() {
    let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
    mailbox.set_unauthorized(true);
    let subscription = Subscription::new(
        SubscribeConfig::default(),
        mailbox,
        Arc::new(InMemoryWatchStore::new()),
    );

    let (batches, action) = collector();
    let err = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        subscription.run(&action, CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(is_fatal(&err));
    assert!(batches.lock().is_empty());
}

#[tokio::test]
async fn test_out_of_order_notifications_never_duplicate() {
    let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
    for (history_id, id) in [(110, "a"), (120, "b"), (130, "c")] {
        mailbox.add_message_at(history_id, Message::builder(id).build());
    }
    let session = Arc::new(SyncSession::new(100));
    let listener = NotificationListener::new(
        mailbox.clone(),
        Arc::clone(&session),
        Arc::new(MessageFilter::new()),
    );

    let (delivery, feed) = ChannelDelivery::new();
    for (id, history_id) in [("late", 130), ("early", 120), ("dup", 130)] {
        feed.send(notification(id, history_id)).unwrap();
    }
    drop(feed);

    let (tx, mut rx) = mpsc::channel(8);
    listener
        .run(&delivery, tx, CancellationToken::new())
        .await
        .unwrap();

    let mut batches = Vec::new();
    while let Some(batch) = rx.recv().await {
        batches.push(batch);
    }
    assert_eq!(batches.len(), 3);

    // Tokens are distinct and every record carries its batch's token
    let tokens: HashSet<_> = batches.iter().map(|b| b.token).collect();
    assert_eq!(tokens.len(), 3);
    for batch in &batches {
        assert!(batch.records.iter().all(|r| r.batch_id == batch.token));
        let ids: Vec<u64> = batch.records.iter().map(|r| r.record.history_id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    let mut seen: Vec<u64> = batches
        .iter()
        .flat_map(|b| b.records.iter().map(|r| r.record.history_id))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![110, 120, 130]);
    assert_eq!(session.current_watermark(), 130);
}

#[tokio::test]
async fn test_persisted_watch_file_format() {
    let state = TempDir::new().unwrap();
    let store = Arc::new(FileWatchStore::new(state.path().join("watches")));
    let mailbox = Arc::new(InMemoryMailbox::new("me@example.com"));
    mailbox.bump_history(4242);

    let manager = Arc::new(WatchManager::new(
        mailbox.clone() as Arc<dyn MailboxApi>,
        store.clone() as Arc<dyn WatchStateStore>,
        WatchSettings::new("desk-app"),
    ));
    let handle = manager.ensure_active(TOPIC, &[], None).await.unwrap();

    let path = store.path_for(&manager.key());
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["service_type"], "gmail");
    assert_eq!(raw["watch_id"], "4242");
    assert_eq!(raw["topic_name"], TOPIC);
    assert_eq!(raw["application_name"], "desk-app");
    assert_eq!(raw["service_specific_data"]["historyId"], 4242);
    assert!(raw["expiration"].as_str().unwrap().parse::<chrono::DateTime<Utc>>().is_ok());
    assert!(raw.get("owned").is_none());

    // A second manager adopts the persisted registration instead of creating one
    let adopter = WatchManager::new(
        mailbox.clone() as Arc<dyn MailboxApi>,
        store.clone() as Arc<dyn WatchStateStore>,
        WatchSettings::new("desk-app"),
    );
    let adopted = adopter.activate(TOPIC, &[]).unwrap();
    assert!(!adopted.owned);
    assert_eq!(mailbox.watch_requests().len(), 1);

    handle.stop().await.unwrap();
    assert!(!path.exists());
}

/// Lets a test keep a handle on a delivery client it hands to a subscription
struct SharedDelivery(Arc<ChannelDelivery>);

impl DeliveryClient for SharedDelivery {
    fn start(&self, sink: mpsc::Sender<Delivery>) -> anyhow::Result<DeliveryHandle> {
        self.0.start(sink)
    }
}
