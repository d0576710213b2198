use std::error::Error as _;
use std::path::PathBuf;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Errors that can end an update run.
#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    /// A path could not be read, written or removed.
    #[error("filesystem operation failed on {}: {source}", .path.display())]
    Filesystem {
        /// Path the operation was acting on.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The CDN could not be reached or returned an error status.
    #[error("network error: {message}")]
    Network {
        /// Short description of the failed request.
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },
    /// The manifest payload could not be parsed or is inconsistent.
    #[error("malformed update manifest: {0}")]
    Manifest(String),
    /// The target volume does not have enough free space.
    #[error("not enough free space: {required} bytes required, {available} bytes available")]
    InsufficientSpace {
        /// Bytes the plan needs, including the safety reserve.
        required: u64,
        /// Bytes available on the target volume.
        available: u64,
    },
    /// A downloaded file did not match the manifest.
    #[error("integrity check failed for {path} (expected {expected}, got {actual})")]
    Integrity {
        /// Manifest path of the file.
        path: String,
        /// Expected size or SHA-256 digest.
        expected: String,
        /// Observed size or SHA-256 digest.
        actual: String,
    },
    /// Another run is already active for the same target root.
    #[error("an update is already running for {}", .0.display())]
    AlreadyRunning(PathBuf),
    /// `start` was called before a base directory was set.
    #[error("no base directory has been set")]
    NoBaseDirectory,
}

impl UpdateError {
    /// Wrap an I/O error with the path it happened on.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UpdateError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Network failure without an underlying transport error.
    pub fn network(message: impl Into<String>) -> Self {
        UpdateError::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Helper for wrapping manifest validation failures.
    pub fn manifest(msg: impl Into<String>) -> Self {
        UpdateError::Manifest(msg.into())
    }

    /// Whether the error came from the transport layer.
    pub fn is_network_error(&self) -> bool {
        matches!(self, UpdateError::Network { .. })
    }

    /// Extra detail for callers that show the message first and the cause on demand.
    pub fn detail(&self) -> Option<String> {
        let mut source = self.source();
        let mut parts = Vec::new();
        while let Some(err) = source {
            parts.push(err.to_string());
            source = err.source();
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(": "))
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        let message = match err.url() {
            Some(url) => format!("request to {url} failed"),
            None => "request failed".to_string(),
        };
        UpdateError::Network {
            message,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for UpdateError {
    fn from(err: serde_json::Error) -> Self {
        UpdateError::Manifest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_reports_source_chain() {
        let err = UpdateError::fs(
            "/sd/CTGP-7",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only card"),
        );
        assert_eq!(err.detail().as_deref(), Some("read-only card"));
        assert!(err.to_string().contains("/sd/CTGP-7"));
    }

    #[test]
    fn detail_is_empty_without_source() {
        let err = UpdateError::manifest("missing version");
        assert!(err.detail().is_none());
        assert!(!err.is_network_error());
        assert!(UpdateError::network("timed out").is_network_error());
    }
}
