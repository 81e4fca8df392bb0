//! Shared utility functions.

use chrono::{DateTime, Utc};
use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run blocking work (git2, filesystem scans) off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Compact UTC timestamp used in branch names: `YYYYmmddHHMMSS`.
pub fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

/// Truncate `text` to at most `max` chars, keeping the tail.
///
/// Failure output usually carries the useful part at the end.
pub fn truncate_tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max).collect();
    format!("...{}", tail)
}
