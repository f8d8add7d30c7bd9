//! # Key Paths
//!
//! Keys are hierarchical, `/`-separated paths without leading or trailing
//! separators (`keel/pipelines/web/stages/00000001`).

use crate::error::KvError;

/// Path separator.
pub const SEPARATOR: char = '/';

/// Join path components, ignoring separators at component ends and empty
/// components.
///
/// ```
/// use keel_kv::path::join;
/// assert_eq!(join(&["keel/", "/pipelines", "web"]), "keel/pipelines/web");
/// ```
pub fn join<S: AsRef<str>>(components: &[S]) -> String {
    let mut out = String::new();
    for component in components {
        let trimmed = component.as_ref().trim_matches(SEPARATOR);
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(SEPARATOR);
        }
        out.push_str(trimmed);
    }
    out
}

/// Returns `true` if `key` equals `prefix` or lies below it.
///
/// `keel/web` is under `keel` but `keel2/web` is not. An empty prefix
/// matches every key.
pub fn is_under(prefix: &str, key: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match key.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with(SEPARATOR),
        None => false,
    }
}

/// Path of `key` relative to `prefix`, without the leading separator.
///
/// Returns `None` when `key` is not under `prefix`.
pub fn suffix<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    if !is_under(prefix, key) {
        return None;
    }
    let rest = &key[prefix.len()..];
    Some(rest.trim_start_matches(SEPARATOR))
}

/// First path segment of `key` below `prefix`.
pub fn child_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = suffix(prefix, key)?;
    let name = rest.split(SEPARATOR).next()?;
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Check that `key` is a well-formed key.
pub fn validate_key(key: &str) -> Result<(), KvError> {
    let reason = if key.is_empty() {
        "key is empty"
    } else if key.starts_with(SEPARATOR) || key.ends_with(SEPARATOR) {
        "key must not start or end with a separator"
    } else if key.split(SEPARATOR).any(str::is_empty) {
        "key contains an empty segment"
    } else {
        return Ok(());
    };
    Err(KvError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}

/// Check that `segment` can be used as a single path segment.
pub fn validate_segment(segment: &str) -> Result<(), KvError> {
    if segment.is_empty() || segment.contains(SEPARATOR) {
        return Err(KvError::InvalidKey {
            key: segment.to_string(),
            reason: "segment must be non-empty and must not contain a separator",
        });
    }
    Ok(())
}
