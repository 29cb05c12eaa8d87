//! Error types for acquisition transfers.
//!
//! Every variant carries the URL (or path) it concerns so that failures can
//! be logged and alerted on without extra bookkeeping at the call site.

use std::path::PathBuf;

use thiserror::Error;

use super::redirect::RedirectRefusal;
use crate::problem::ProblemDocument;

/// Errors that can occur while transferring an acquisition payload.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response that is not a problem document.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Content type of the error response, if declared.
        content_type: Option<String>,
    },

    /// The server answered with an RFC 7807 problem document.
    #[error("problem document (HTTP {status}) from {url}: {document}")]
    Problem {
        /// The URL that produced the document.
        url: String,
        /// The HTTP status code of the response.
        status: u16,
        /// The parsed document.
        document: ProblemDocument,
    },

    /// File system error during download (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A redirect was not followed.
    #[error("redirect from {url} refused: {reason}")]
    RedirectRefused {
        /// The URL whose response redirected.
        url: String,
        /// Why the redirect was refused.
        reason: RedirectRefusal,
    },

    /// The response content type cannot be fulfilled.
    #[error("unsupported content type {content_type:?} from {url}")]
    UnsupportedContent {
        /// The URL that produced the response.
        url: String,
        /// The declared content type, if any.
        content_type: Option<String>,
    },

    /// The transfer was cancelled through its cancellation token.
    #[error("download of {url} cancelled")]
    Cancelled {
        /// The URL being transferred.
        url: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a network or timeout error depending on the reqwest error kind.
    pub fn from_transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url)
        } else {
            Self::network(url, source)
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16, content_type: Option<String>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            content_type,
        }
    }

    /// Creates a problem-document error.
    pub fn problem(url: impl Into<String>, status: u16, document: ProblemDocument) -> Self {
        Self::Problem {
            url: url.into(),
            status,
            document,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a redirect refusal error.
    pub fn redirect_refused(url: impl Into<String>, reason: RedirectRefusal) -> Self {
        Self::RedirectRefused {
            url: url.into(),
            reason,
        }
    }

    /// Creates an unsupported-content error.
    pub fn unsupported_content(url: impl Into<String>, content_type: Option<String>) -> Self {
        Self::UnsupportedContent {
            url: url.into(),
            content_type,
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Whether the transfer ended because it was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// HTTP status of the failing response, when one was received.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } | Self::Problem { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Content type of the failing response, when known.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { content_type, .. }
            | Self::UnsupportedContent { content_type, .. } => content_type.as_deref(),
            Self::Problem { .. } => Some("application/problem+json"),
            _ => None,
        }
    }

    /// The problem document, when the server sent one.
    #[must_use]
    pub fn problem_document(&self) -> Option<&ProblemDocument> {
        match self {
            Self::Problem { document, .. } => Some(document),
            _ => None,
        }
    }
}

// Note on From trait implementations:
// There is no `From<reqwest::Error>` or `From<std::io::Error>` because the
// variants need a url or path the source errors don't carry. Use the helper
// constructors instead.
