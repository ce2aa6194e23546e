//! Storage key format shared by every key-value backend.

use crate::error::{ExperimentError, ExperimentResult};

pub const KEY_SEPARATOR: char = ':';

/// Default upper bound on a joined key, in characters.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 256;

/// Set holding every known session id.
pub const SESSION_REGISTRY_KEY: &str = "sessions";

/// Joins fragments with `:`, replacing colons inside each fragment with `_`.
pub fn make_key<S: AsRef<str>>(fragments: &[S], max_len: usize) -> ExperimentResult<String> {
    if fragments.is_empty() {
        return Err(ExperimentError::EmptyKey);
    }
    let key = fragments
        .iter()
        .map(|f| f.as_ref().replace(KEY_SEPARATOR, "_"))
        .collect::<Vec<_>>()
        .join(":");
    let len = key.chars().count();
    if len > max_len {
        return Err(ExperimentError::KeyTooLong { len, max: max_len });
    }
    Ok(key)
}

/// `site:experiment:variant:metrics`
pub fn metrics_key(
    site: &str,
    experiment_id: &str,
    variant: &str,
    max_len: usize,
) -> ExperimentResult<String> {
    make_key(&[site, experiment_id, variant, "metrics"], max_len)
}

/// `session:<id>`
pub fn session_key(session_id: &str, max_len: usize) -> ExperimentResult<String> {
    make_key(&["session", session_id], max_len)
}
