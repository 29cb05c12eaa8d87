//! Hand-off contracts with DRM and interception collaborators.
//!
//! The cryptography lives outside this crate. The coordinator only needs to
//! pass payloads in, observe progress and learn where the usable content
//! ended up. Cancellation goes through the task's [`CancellationToken`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::auth::SessionCookie;
use crate::download::TransferRequest;
use crate::problem::ProblemDocument;

/// Progress callback handed to long-running fulfillments, in `[0, 1]`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Errors reported by a DRM collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DrmError {
    /// The fulfillment was cancelled.
    #[error("fulfillment cancelled")]
    Cancelled,

    /// The collaborator could not fulfill the license.
    #[error("fulfillment failed: {reason}")]
    Failed {
        /// Collaborator-provided description.
        reason: String,
    },

    /// No collaborator for this scheme is configured.
    #[error("{scheme} fulfillment is not available")]
    Unavailable {
        /// Name of the scheme.
        scheme: &'static str,
    },
}

impl DrmError {
    /// Creates a failure with a reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Result of an Adobe ADEPT fulfillment.
#[derive(Debug, Clone)]
pub struct AdobeFulfillment {
    /// Decrypted-ready content produced by the collaborator.
    pub content_path: PathBuf,
    /// Rights document to store beside the content.
    pub rights: Vec<u8>,
    /// Loan identifier used to return the book later.
    pub fulfillment_id: Option<String>,
    /// Whether the loan may be returned early.
    pub returnable: bool,
}

/// Adobe ADEPT collaborator.
#[async_trait]
pub trait AdobeFulfiller: Send + Sync {
    /// Fulfills an ACSM document for `identifier`.
    async fn fulfill(
        &self,
        identifier: &str,
        acsm: &[u8],
        cancel: CancellationToken,
    ) -> Result<AdobeFulfillment, DrmError>;

    /// Returns a loan identified by its fulfillment id.
    async fn return_loan(&self, fulfillment_id: &str) -> Result<(), DrmError>;
}

/// Result of a Readium LCP fulfillment.
#[derive(Debug, Clone)]
pub struct LcpFulfillment {
    /// Where the protected publication was written.
    pub content_path: PathBuf,
    /// License identifier, recorded as fulfillment id.
    pub license_id: Option<String>,
}

/// Readium LCP collaborator.
#[async_trait]
pub trait LcpFulfiller: Send + Sync {
    /// Fetches the publication described by the license at `license`.
    async fn fulfill(
        &self,
        license: &Path,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<LcpFulfillment, DrmError>;

    /// Unpacks a protected PDF in place after it has been stored.
    async fn extract_pdf(&self, content: &Path) -> Result<(), DrmError>;
}

/// Outcome of presenting a request to the SAML interception flow.
#[derive(Debug, Clone)]
pub enum SamlOutcome {
    /// The user closed the flow.
    Cancelled,
    /// The book was reached; retry with these cookies and request.
    BookFound {
        /// Request to restart the download with.
        request: TransferRequest,
        /// Refreshed session cookies.
        cookies: Vec<SessionCookie>,
    },
    /// The identity provider answered with a problem.
    Problem(Option<ProblemDocument>),
}

/// Embedded SAML sign-in used to capture session cookies.
#[async_trait]
pub trait SamlInterceptor: Send + Sync {
    /// Loads `request` with `cookies` and reports what happened.
    async fn intercept(&self, request: TransferRequest, cookies: Vec<SessionCookie>)
    -> SamlOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drm_error_display() {
        assert_eq!(
            DrmError::failed("bad license").to_string(),
            "fulfillment failed: bad license"
        );
        assert_eq!(
            DrmError::Unavailable { scheme: "LCP" }.to_string(),
            "LCP fulfillment is not available"
        );
    }
}
