//! Trace identifiers for runs and steps.
//!
//! A run gets a random root id. Each step gets a child id derived from the
//! parent id, a slug of the step name, and the millisecond it was issued, e.g.
//! `9b2f...:generate-name-themes:lq3k9x2a`.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};

use chrono::Utc;
use uuid::Uuid;

/// Longest slug kept from a step name.
pub const MAX_SLUG_LEN: usize = 48;

/// Create a new globally unique root trace id.
///
/// Uses a v4 UUID. If the platform cannot provide randomness the UUID
/// generator panics; that panic is caught and a timestamp plus hashed-suffix
/// id is produced instead, so this never fails.
#[must_use]
pub fn new_root_id() -> String {
    match std::panic::catch_unwind(Uuid::new_v4) {
        Ok(id) => id.to_string(),
        Err(_) => fallback_root_id(now_millis()),
    }
}

fn fallback_root_id(millis: u64) -> String {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(millis);
    format!("{}-{:x}", to_base36(millis), hasher.finish())
}

/// Derive the trace id of a step issued at `issued_at_millis` under `parent_id`.
///
/// Pure: the same inputs always give the same id.
///
/// ```rust
/// use stringcost::trace::derive_child_id;
///
/// let id = derive_child_id("root", "Evaluate Theme: Solar Lab", 1_700_000_000_000);
/// assert_eq!(id, "root:evaluate-theme-solar-lab:loyw3v28");
/// ```
#[must_use]
pub fn derive_child_id(parent_id: &str, step_name: &str, issued_at_millis: u64) -> String {
    format!(
        "{parent_id}:{}:{}",
        slugify(step_name),
        to_base36(issued_at_millis)
    )
}

/// Lower-case, collapse every run of non `[a-z0-9]` characters into `-`, trim
/// leading/trailing dashes and cap at [`MAX_SLUG_LEN`] characters.
#[must_use]
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for c in value.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    // Only ASCII is pushed, so byte truncation is char-safe.
    slug.truncate(MAX_SLUG_LEN);
    slug
}

/// Encode `value` in lower-case base 36.
#[must_use]
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

/// Current wall-clock time in Unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}
