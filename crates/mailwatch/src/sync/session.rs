//! Session state shared by the polling engine and the notification listener

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::BatchToken;

/// Last processed change-stream position plus the batch-token counter
///
/// Safe to share across tasks: the watermark is a lock-protected
/// compare-and-set, the counter an atomic increment.
#[derive(Debug)]
pub struct SyncSession {
    session_id: String,
    watermark: Mutex<u64>,
    batch_counter: AtomicU64,
}

impl SyncSession {
    /// Start a session at `initial_watermark` (0 means unknown)
    pub fn new(initial_watermark: u64) -> Self {
        Self {
            session_id: format!("{}-{}", std::process::id(), Utc::now().timestamp_millis()),
            watermark: Mutex::new(initial_watermark),
            batch_counter: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn current_watermark(&self) -> u64 {
        *self.watermark.lock()
    }

    pub fn has_watermark(&self) -> bool {
        self.current_watermark() > 0
    }

    /// Raise the watermark to `candidate` if it is strictly greater
    ///
    /// Returns the value held before the call.
    pub fn update_watermark(&self, candidate: u64) -> u64 {
        let mut current = self.watermark.lock();
        let previous = *current;
        if candidate > previous {
            *current = candidate;
        }
        previous
    }

    /// Mint the next batch token; tokens start at 1 and never repeat
    pub fn next_batch_token(&self) -> BatchToken {
        BatchToken(self.batch_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}
