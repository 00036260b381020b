//! Domain models for the sync engine

mod filter;
mod message;
mod record;
mod watch;

pub use filter::MessageFilter;
pub use message::{EmailAddress, Message, MessageBuilder, MessageId, UNREAD_LABEL};
pub use record::{BatchToken, InboundRecord, ProcessedRecord, RecordBatch, RecordOutcome};
pub use watch::{GMAIL_SERVICE, WatchKey, WatchRegistration};
