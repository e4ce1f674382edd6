//! Acceptance checks applied to candidate events before storage.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Rejection;
use crate::event::{self, Event};

/// Bounds enforced on submitted events.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Verify Schnorr signatures on submission.
    pub verify_sig: bool,
    /// How far in the past `created_at` may lie, in seconds.
    pub max_past_secs: u64,
    /// How far in the future `created_at` may lie, in seconds.
    pub max_future_secs: u64,
    /// Maximum serialized event size in bytes.
    pub max_event_bytes: usize,
}

/// Current Unix time in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Decide whether a candidate event is acceptable.
///
/// Checks run in a fixed order and the first failure wins: field shape, then
/// identifier integrity, then signature, then timestamp skew. Pure function
/// of the input; storage happens elsewhere.
pub fn validate(ev: &Event, limits: &Limits) -> Result<(), Rejection> {
    validate_at(ev, limits, now_unix())
}

/// Same as [`validate`] with an explicit clock, for deterministic tests.
pub fn validate_at(ev: &Event, limits: &Limits, now: u64) -> Result<(), Rejection> {
    check_shape(ev, limits)?;
    event::verify_id(ev).map_err(|_| Rejection::InvalidId)?;
    if limits.verify_sig {
        event::verify_signature(ev).map_err(|_| Rejection::InvalidSignature)?;
    }
    let lower = now.saturating_sub(limits.max_past_secs);
    let upper = now.saturating_add(limits.max_future_secs);
    if ev.created_at < lower || ev.created_at > upper {
        return Err(Rejection::TimestampOutOfRange);
    }
    Ok(())
}

fn check_shape(ev: &Event, limits: &Limits) -> Result<(), Rejection> {
    if !is_hex(&ev.id, 64) {
        return Err(Rejection::MalformedField("id"));
    }
    if !is_hex(&ev.pubkey, 64) {
        return Err(Rejection::MalformedField("pubkey"));
    }
    if limits.verify_sig && !is_hex(&ev.sig, 128) {
        return Err(Rejection::MalformedField("sig"));
    }
    let size = serde_json::to_vec(ev).map(|v| v.len()).unwrap_or(usize::MAX);
    if size > limits.max_event_bytes {
        return Err(Rejection::Oversized(size));
    }
    Ok(())
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}
