//! Mailwatch - incremental Gmail sync driven by watch notifications
//!
//! This crate provides:
//! - Domain models (Message, MessageFilter, RecordBatch, WatchRegistration)
//! - Gmail API client, OAuth authentication and an in-memory mailbox
//! - Pub/Sub delivery clients (pull, push, in-process channel)
//! - Sync engine: watermark session, history windows, polling and
//!   notification listening
//! - Watch lifecycle management with persisted registrations
//! - Strategy selection composing all of the above into one batch stream
//!
//! HTTP clients are synchronous (ureq); async code runs them on tokio's
//! blocking pool.

pub mod config;
pub mod error;
pub mod gmail;
pub mod models;
pub mod pubsub;
pub mod strategy;
pub mod sync;
pub mod watch;

pub use config::{GmailCredentials, SubscribeConfig, SyncMode};
pub use error::{WatchError, is_fatal};
pub use gmail::{GmailAuth, GmailClient, InMemoryMailbox, MailboxApi, StaticToken, TokenProvider};
pub use models::{
    BatchToken, EmailAddress, InboundRecord, Message, MessageFilter, MessageId, ProcessedRecord,
    RecordBatch, RecordOutcome, WatchKey, WatchRegistration,
};
pub use pubsub::{
    AckReply, ChannelDelivery, Delivery, DeliveryClient, DeliveryHandle, Envelope, PubSubClient,
    PullDelivery, PushDelivery,
};
pub use strategy::{OutputAction, Subscription, build_delivery};
pub use sync::{NotificationListener, PollingEngine, SyncSession, resolve_window};
pub use watch::{
    FileWatchStore, InMemoryWatchStore, WatchHandle, WatchManager, WatchSettings, WatchStateStore,
};
