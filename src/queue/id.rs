//! Task id generation and validation.
//!
//! Generated ids look like `write-readme-3fa9c1`: a slug of the description
//! followed by a short hex suffix derived from a UUIDv5 over the description
//! and the creation instant.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::error::QueueError;

/// Maximum slug length before the suffix.
const MAX_SLUG_LEN: usize = 48;

/// Hex characters taken from the UUID for the suffix.
const SUFFIX_LEN: usize = 6;

/// Maximum accepted length for an explicit id.
const MAX_ID_LEN: usize = 128;

/// Namespace for task id UUIDs.
const TASK_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b7e_9d44_4a3f_8c51_0e7a_d2b9_3c11);

static NON_SLUG_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex"));

static VALID_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("static regex"));

/// Lowercase, dash-separated slug of a description. Never empty.
pub fn slugify(description: &str) -> String {
    let lowered = description.to_lowercase();
    let slug = NON_SLUG_CHARS.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');

    let mut truncated = String::with_capacity(MAX_SLUG_LEN);
    for part in slug.split('-') {
        let extra = if truncated.is_empty() { part.len() } else { part.len() + 1 };
        if truncated.len() + extra > MAX_SLUG_LEN {
            break;
        }
        if !truncated.is_empty() {
            truncated.push('-');
        }
        truncated.push_str(part);
    }

    if truncated.is_empty() {
        // First word alone is longer than the limit, or nothing survived.
        truncated = slug.chars().take(MAX_SLUG_LEN).collect();
    }
    if truncated.is_empty() {
        truncated.push_str("task");
    }
    truncated
}

/// Derive a task id from its description, creation instant, and attempt number.
///
/// The same inputs always produce the same id; callers bump `attempt` on collision.
pub fn generate(description: &str, created_at: DateTime<Utc>, attempt: u32) -> String {
    let seed = format!(
        "{}\u{0}{}\u{0}{}",
        description,
        created_at.timestamp_nanos_opt().unwrap_or_default(),
        attempt
    );
    let digest = Uuid::new_v5(&TASK_ID_NAMESPACE, seed.as_bytes()).simple().to_string();
    format!("{}-{}", slugify(description), &digest[..SUFFIX_LEN])
}

/// Check that an id is safe to use as a record file name.
pub fn validate(id: &str) -> Result<(), QueueError> {
    if id.len() > MAX_ID_LEN {
        return Err(QueueError::validation(format!(
            "task id is longer than {MAX_ID_LEN} characters"
        )));
    }
    if !VALID_ID.is_match(id) {
        return Err(QueueError::validation(format!(
            "task id '{id}' must start alphanumeric and contain only letters, digits, '-' or '_'"
        )));
    }
    Ok(())
}
