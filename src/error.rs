//! Errors that end a fulfillment.
//!
//! None of these escape the coordinator's public commands. Each is turned
//! into a `DownloadFailed` transition, a log line and an alert at the point
//! where it happens.

use std::path::PathBuf;

use thiserror::Error;

use crate::bearer::BearerTokenError;
use crate::download::DownloadError;
use crate::drm::DrmError;
use crate::problem::{ProblemDocument, indicates_auth_refresh};

/// Why a download could not be fulfilled.
#[derive(Debug, Error)]
pub enum FulfillmentError {
    /// The transfer itself failed.
    #[error(transparent)]
    Transfer(#[from] DownloadError),

    /// A DRM collaborator failed.
    #[error(transparent)]
    Drm(#[from] DrmError),

    /// A bearer-token document could not be used.
    #[error(transparent)]
    BearerToken(#[from] BearerTokenError),

    /// The response's rights scheme is not recognised.
    #[error("unrecognised content type {content_type:?}; authentication might be needed after all")]
    UnknownRights {
        /// Declared content type of the response.
        content_type: Option<String>,
    },

    /// A bearer-token document pointed at another bearer-token document.
    #[error("bearer token download for {identifier} returned another bearer token")]
    ChainedBearerToken {
        /// The book being fulfilled.
        identifier: String,
    },

    /// Adobe-protected PDFs cannot be fulfilled.
    #[error("{title} is an Adobe PDF, which is not supported.")]
    UnsupportedAdobePdf {
        /// Title of the book.
        title: String,
    },

    /// Moving, copying or removing a file failed.
    #[error("failed to {operation} {path}: {source}")]
    Filesystem {
        /// The path being worked on.
        path: PathBuf,
        /// What was being done.
        operation: &'static str,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The book has no link to download from.
    #[error("no acquisition link for {identifier}")]
    MissingAcquisition {
        /// The book identifier.
        identifier: String,
    },
}

impl FulfillmentError {
    /// Creates a filesystem error.
    pub fn filesystem(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Filesystem {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Problem document attached to the failure, if the server sent one.
    #[must_use]
    pub fn problem_document(&self) -> Option<&ProblemDocument> {
        match self {
            Self::Transfer(error) => error.problem_document(),
            _ => None,
        }
    }

    /// Whether the failure asks for the session to be re-established.
    #[must_use]
    pub fn indicates_auth_refresh(&self) -> bool {
        match self {
            Self::Transfer(error) => error.status().is_some_and(|status| {
                indicates_auth_refresh(status, error.content_type(), error.problem_document())
            }),
            Self::UnknownRights { .. } => true,
            _ => false,
        }
    }

    /// Whether the transfer ended by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Transfer(error) => error.is_cancelled(),
            Self::Drm(DrmError::Cancelled) => true,
            _ => false,
        }
    }
}

// Note on From trait implementations:
// `From` is provided for the crate's own error types only. IO errors need
// the path and operation, so use `FulfillmentError::filesystem` instead.
