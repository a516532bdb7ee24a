//! Input validation and normalization.
//!
//! Enum-like inputs (context types, project statuses) resolve in three
//! tiers: exact match → synonym lookup → error with suggestion.
//! Free-form inputs (tags, metadata, values) are checked against size
//! and character limits before they reach the store.

use crate::error::{Error, Result};
use crate::model::{ContextType, ProjectStatus};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

pub const MAX_TAGS: usize = 50;
pub const MAX_TAG_LEN: usize = 100;
pub const MAX_METADATA_KEYS: usize = 100;
pub const MAX_METADATA_BYTES: usize = 10 * 1024;
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;
pub const MAX_KEY_LEN: usize = 255;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_SEARCH_TEXT_BYTES: usize = 10_000;
pub const MAX_TENANT_ID_LEN: usize = 64;

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-.\s]+$").expect("static tag pattern"));

static TENANT_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static tenant pattern"));

// ── Valid value sets (O(1) lookups) ──────────────────────────

pub static VALID_TYPES: LazyLock<HashSet<&str>> =
    LazyLock::new(|| ContextType::ALL.iter().map(ContextType::as_str).collect());

pub static VALID_STATUSES: LazyLock<HashSet<&str>> = LazyLock::new(|| {
    ["active", "paused", "completed", "archived"]
        .into_iter()
        .collect()
});

// ── Synonym maps ─────────────────────────────────────────────

pub static TYPE_SYNONYMS: LazyLock<HashMap<&str, &str>> = LazyLock::new(|| {
    [
        ("adr", "decision"),
        ("choice", "decision"),
        ("snippet", "code"),
        ("convention", "standard"),
        ("guideline", "standard"),
        ("progress", "status"),
        ("task", "todo"),
        ("bug", "issue"),
        ("problem", "issue"),
        ("doc", "reference"),
        ("link", "reference"),
        ("settings", "config"),
        ("comment", "note"),
    ]
    .into_iter()
    .collect()
});

pub static STATUS_SYNONYMS: LazyLock<HashMap<&str, &str>> = LazyLock::new(|| {
    [
        ("open", "active"),
        ("wip", "active"),
        ("in_progress", "active"),
        ("hold", "paused"),
        ("on_hold", "paused"),
        ("blocked", "paused"),
        ("done", "completed"),
        ("complete", "completed"),
        ("finished", "completed"),
        ("closed", "completed"),
        ("archive", "archived"),
    ]
    .into_iter()
    .collect()
});

/// Normalize a context type via exact match or synonym lookup.
///
/// # Errors
///
/// Returns `Error::Validation` naming the closest valid type, if any.
pub fn normalize_context_type(input: &str) -> Result<ContextType> {
    let canonical = normalize(input, &VALID_TYPES, &TYPE_SYNONYMS)
        .map_err(|suggestion| invalid("type", input, suggestion))?;
    Ok(ContextType::from_str(&canonical))
}

/// Normalize a project status via exact match or synonym lookup.
///
/// # Errors
///
/// Returns `Error::Validation` naming the closest valid status, if any.
pub fn normalize_project_status(input: &str) -> Result<ProjectStatus> {
    let canonical = normalize(input, &VALID_STATUSES, &STATUS_SYNONYMS)
        .map_err(|suggestion| invalid("status", input, suggestion))?;
    Ok(ProjectStatus::from_str(&canonical))
}

fn normalize(
    input: &str,
    valid: &HashSet<&str>,
    synonyms: &HashMap<&str, &str>,
) -> std::result::Result<String, Option<String>> {
    let lower = input.trim().to_lowercase();

    if valid.contains(lower.as_str()) {
        return Ok(lower);
    }

    if let Some(&canonical) = synonyms.get(lower.as_str()) {
        return Ok(canonical.to_string());
    }

    Err(find_closest_match(&lower, valid, synonyms))
}

fn invalid(field: &str, input: &str, suggestion: Option<String>) -> Error {
    match suggestion {
        Some(s) => Error::Validation(format!("invalid {field} '{input}' (did you mean '{s}'?)")),
        None => Error::Validation(format!("invalid {field} '{input}'")),
    }
}

/// Find the closest matching value across valid set and synonyms.
fn find_closest_match(
    input: &str,
    valid: &HashSet<&str>,
    synonyms: &HashMap<&str, &str>,
) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;

    for &v in valid.iter().chain(synonyms.keys()) {
        let dist = levenshtein_distance(input, v);
        if dist <= 3 && best.is_none_or(|(_, d)| dist < d) {
            let target = synonyms.get(v).copied().unwrap_or(v);
            best = Some((target, dist));
        }
    }

    best.map(|(v, _)| v.to_string())
}

/// Compute the Levenshtein edit distance between two strings.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1)
                .min(curr[j - 1] + 1)
                .min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

// ── Free-form input ──────────────────────────────────────────

/// Reject empty (or whitespace-only) required fields.
///
/// # Errors
///
/// Returns `Error::RequiredField` when the value is blank.
pub fn require(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::RequiredField(field));
    }
    Ok(())
}

/// Check a string field's length in characters.
///
/// # Errors
///
/// Returns `Error::Validation` when `value` exceeds `max` characters.
pub fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(Error::Validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}

/// Validate and deduplicate a tag list, preserving first-seen order.
///
/// # Errors
///
/// Returns `Error::Validation` for too many tags, overlong tags, or
/// tags with characters outside `[\w\-.\s]`.
pub fn validate_tags(tags: &[String]) -> Result<Vec<String>> {
    if tags.len() > MAX_TAGS {
        return Err(Error::Validation(format!(
            "too many tags: {} (max {MAX_TAGS})",
            tags.len()
        )));
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        if tag.chars().count() > MAX_TAG_LEN {
            return Err(Error::Validation(format!(
                "tag exceeds {MAX_TAG_LEN} characters: '{}...'",
                tag.chars().take(20).collect::<String>()
            )));
        }
        if !TAG_PATTERN.is_match(tag) {
            return Err(Error::Validation(format!(
                "tag contains invalid characters: '{tag}'"
            )));
        }
        if seen.insert(tag.to_string()) {
            out.push(tag.to_string());
        }
    }
    Ok(out)
}

/// Validate metadata key count and serialized size.
///
/// # Errors
///
/// Returns `Error::Validation` when either cap is exceeded.
pub fn validate_metadata(metadata: &Map<String, Value>) -> Result<String> {
    if metadata.len() > MAX_METADATA_KEYS {
        return Err(Error::Validation(format!(
            "metadata has {} keys (max {MAX_METADATA_KEYS})",
            metadata.len()
        )));
    }
    let serialized = serde_json::to_string(metadata)?;
    if serialized.len() > MAX_METADATA_BYTES {
        return Err(Error::Validation(format!(
            "metadata is {} bytes serialized (max {MAX_METADATA_BYTES})",
            serialized.len()
        )));
    }
    Ok(serialized)
}

/// Validate a context value's size.
///
/// # Errors
///
/// Returns `Error::Validation` when the value exceeds `MAX_VALUE_BYTES`.
pub fn validate_value(value: &str) -> Result<()> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(Error::Validation(format!(
            "value is {} bytes (max {MAX_VALUE_BYTES})",
            value.len()
        )));
    }
    Ok(())
}

/// Validate a tenant id for use as a single path segment.
///
/// # Errors
///
/// Returns `Error::Validation` for empty, overlong, or non `[A-Za-z0-9_-]` ids.
pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    if tenant_id.is_empty() || tenant_id.len() > MAX_TENANT_ID_LEN {
        return Err(Error::Validation(format!(
            "tenant id must be 1-{MAX_TENANT_ID_LEN} characters"
        )));
    }
    if !TENANT_ID_PATTERN.is_match(tenant_id) {
        return Err(Error::Validation(format!(
            "tenant id contains invalid characters: '{tenant_id}'"
        )));
    }
    Ok(())
}

// ── Search helpers ───────────────────────────────────────────

/// Turn user text into an FTS5 MATCH expression.
///
/// Every whitespace-separated term is quoted, so operators (`OR`, `NOT`,
/// `AND`) and special characters (`-`, `:`, `*`, `"`) match literally.
/// Terms are implicitly AND-ed.
#[must_use]
pub fn fts_query(input: &str) -> String {
    input
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncate to at most `max` bytes without splitting a character.
#[must_use]
pub fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Parse a `since` filter into Unix milliseconds.
///
/// Accepts raw milliseconds, RFC 3339 timestamps, or relative offsets
/// such as `-7d`, `-12h`, `-30m`.
///
/// # Errors
///
/// Returns `Error::Validation` for anything else.
pub fn parse_since(input: &str, now_ms: i64) -> Result<i64> {
    let s = input.trim();

    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }

    if let Some(rel) = s.strip_prefix('-') {
        if let Some(ms) = relative_offset(rel, now_ms) {
            return Ok(ms);
        }
    }

    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| Error::Validation(format!("invalid since filter: '{input}'")))
}

/// `now_ms` minus `<n>{d,h,m}`, or `None` if malformed or out of range.
fn relative_offset(rel: &str, now_ms: i64) -> Option<i64> {
    let (split, unit) = rel.char_indices().last()?;
    let amount = rel[..split].parse::<i64>().ok()?;
    let delta = match unit {
        'd' => chrono::TimeDelta::try_days(amount)?,
        'h' => chrono::TimeDelta::try_hours(amount)?,
        'm' => chrono::TimeDelta::try_minutes(amount)?,
        _ => return None,
    };
    now_ms.checked_sub(delta.num_milliseconds())
}
