//! Watch registration lifecycle
//!
//! The mailbox only publishes change notifications while a watch is
//! registered, and registrations expire. [`WatchManager`] keeps one alive
//! for the duration of a run.

mod manager;
mod store;
mod timing;

pub use manager::{WatchHandle, WatchManager, WatchSettings};
pub use store::{FileWatchStore, InMemoryWatchStore, WatchStateStore};
pub use timing::{RenewalDecision, check_renewal, next_check_at};
