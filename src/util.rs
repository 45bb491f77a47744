//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How a raced future ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Race<T> {
    /// The future finished first.
    Finished(T),
    /// The deadline passed. The token has been cancelled.
    TimedOut,
    /// The token was cancelled by someone else before either finished.
    Cancelled,
}

/// Race `fut` against `duration` and against `token`.
///
/// On timeout the token is cancelled so the work behind `fut` (which should
/// be watching the same token or a child of it) stops, and `fut` itself is
/// dropped.
pub async fn race<T, F>(duration: Duration, token: &CancellationToken, fut: F) -> Race<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Race::Cancelled,
        out = fut => Race::Finished(out),
        _ = tokio::time::sleep(duration) => {
            token.cancel();
            Race::TimedOut
        }
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Truncate `s` to at most `max` characters, appending an ellipsis if cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}
