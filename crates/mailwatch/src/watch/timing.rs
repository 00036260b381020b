//! Renewal timing
//!
//! Pure functions that can be tested without timers.

use chrono::{DateTime, Duration, Utc};

/// What a renewal check should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    /// Expiry is within the threshold; create a replacement registration
    Renew,
    /// Not due yet; check again later
    Wait,
    /// Due, but the configured end time has passed; stop renewing
    Finished,
}

/// When to run the next renewal check
///
/// Aims for `expiration - safety_margin`, but never earlier than
/// `now + min_lead`.
pub fn next_check_at(
    expiration: DateTime<Utc>,
    now: DateTime<Utc>,
    safety_margin: Duration,
    min_lead: Duration,
) -> DateTime<Utc> {
    (expiration - safety_margin).max(now + min_lead)
}

/// Decide whether a registration expiring at `expiration` needs replacing
pub fn check_renewal(
    expiration: DateTime<Utc>,
    now: DateTime<Utc>,
    renewal_threshold: Duration,
    end_time: Option<DateTime<Utc>>,
) -> RenewalDecision {
    if expiration - now > renewal_threshold {
        return RenewalDecision::Wait;
    }
    match end_time {
        Some(end) if end <= now => RenewalDecision::Finished,
        _ => RenewalDecision::Renew,
    }
}
