use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Set-once stop signal shared between the caller and the running pipeline.
pub use tokio_util::sync::CancellationToken;

/// Something the engine wants the caller to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    /// Human-readable status line.
    Message { text: String },
    /// `current` of `total` steps done.
    Progress { current: u64, total: u64 },
}

impl ProgressEvent {
    pub fn message(text: impl Into<String>) -> Self {
        ProgressEvent::Message { text: text.into() }
    }

    /// Completion as a percentage (0-100).
    pub fn percentage(&self) -> Option<f32> {
        match self {
            ProgressEvent::Progress { total: 0, .. } => Some(100.0),
            ProgressEvent::Progress { current, total } => {
                Some((*current as f32 / *total as f32) * 100.0)
            }
            ProgressEvent::Message { .. } => None,
        }
    }
}

/// Receives every event of a run.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_the_signal() {
        let token = CancellationToken::new();
        let remote = token.clone();
        assert!(!token.is_cancelled());
        remote.cancel();
        remote.cancel();
        assert!(token.is_cancelled());
        // Already-cancelled tokens resolve immediately.
        token.cancelled().await;
    }

    #[test]
    fn percentage_of_progress_events() {
        let half = ProgressEvent::Progress {
            current: 5,
            total: 10,
        };
        assert!((half.percentage().unwrap() - 50.0).abs() < 0.01);
        assert_eq!(ProgressEvent::message("hi").percentage(), None);
    }
}
