//! Incremental sync engine
//!
//! Tracks the change-stream watermark for a run and turns history windows
//! into correlated record batches, either on a timer ([`PollingEngine`]) or
//! driven by notifications ([`NotificationListener`]).

mod history;
mod listener;
mod notification;
mod poll;
mod session;

pub use history::{HistoryWindow, resolve_window};
pub use listener::NotificationListener;
pub use notification::{MailboxNotification, decode_notification};
pub use poll::{DEFAULT_POLL_INTERVAL, PollingEngine, bootstrap_watermark};
pub use session::SyncSession;
