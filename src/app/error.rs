use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Failure of the direct network fetch. Any variant sends the orchestrator
/// down the full-render fallback path.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} for {url}")]
    Status {
        url: String,
        status: u16,
        elapsed: Duration,
        headers: HashMap<String, String>,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FetchError {
    /// Status code to record for the target; 0 when no response was received.
    pub fn status_code(&self) -> u16 {
        match self {
            FetchError::Status { status, .. } => *status,
            FetchError::Transport { .. } | FetchError::InvalidUrl { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// The browser session could not be constructed. Terminal for the run.
    #[error("browser session could not be started: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("timed out after {waited:?} waiting for the document body of {url}")]
    ReadyTimeout { url: String, waited: Duration },

    #[error("browser error: {0}")]
    Browser(String),
}

impl RenderError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::Launch(_))
    }
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("renderer unavailable, crawl aborted: {0}")]
    RendererUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_launch_failures_are_fatal() {
        assert!(RenderError::Launch("no driver".into()).is_fatal());
        assert!(
            !RenderError::Navigation {
                url: "https://example.com".into(),
                reason: "timeout".into(),
            }
            .is_fatal()
        );
        assert!(!RenderError::Browser("stale".into()).is_fatal());
    }

    #[test]
    fn status_error_keeps_code() {
        let err = FetchError::Status {
            url: "https://example.com".into(),
            status: 403,
            elapsed: Duration::from_millis(12),
            headers: HashMap::new(),
        };
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.to_string(), "HTTP 403 for https://example.com");
    }
}
