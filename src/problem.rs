//! RFC 7807 problem documents returned by circulation servers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rights::normalize_mime;

/// The patron has no active loan for the requested book.
pub const TYPE_NO_ACTIVE_LOAN: &str = "http://librarysimplified.org/terms/problem/no-active-loan";
/// A borrow was attempted for a book that is already on loan.
pub const TYPE_LOAN_ALREADY_EXISTS: &str =
    "http://librarysimplified.org/terms/problem/loan-already-exists";
/// The stored credentials were rejected.
pub const TYPE_INVALID_CREDENTIALS: &str =
    "http://librarysimplified.org/terms/problem/credentials-invalid";

/// Content types under which servers deliver problem documents.
pub const PROBLEM_DOCUMENT_TYPES: &[&str] =
    &["application/problem+json", "application/api-problem+json"];

/// OPDS authentication document; returned instead of content when the
/// session needs to be re-established.
pub const OPDS_AUTHENTICATION_TYPE: &str = "application/vnd.opds.authentication.v1.0+json";

/// Structured error detail from the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDocument {
    /// URI identifying the problem type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<String>,
    /// Short human-readable summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// HTTP status the server associated with the problem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Human-readable explanation specific to this occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// URI identifying this occurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDocument {
    /// Parses a problem document body.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the body is not a JSON object with the
    /// expected field types.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Whether the document carries the given problem type URI.
    #[must_use]
    pub fn is_type(&self, problem_type: &str) -> bool {
        self.problem_type.as_deref() == Some(problem_type)
    }

    /// Text suitable for an alert body: detail, falling back to title.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.detail.as_deref().or(self.title.as_deref())
    }
}

impl fmt::Display for ProblemDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.title.as_deref(), self.detail.as_deref()) {
            (Some(title), Some(detail)) => write!(f, "{title}: {detail}"),
            (Some(text), None) | (None, Some(text)) => write!(f, "{text}"),
            (None, None) => write!(
                f,
                "{}",
                self.problem_type.as_deref().unwrap_or("unspecified problem")
            ),
        }
    }
}

/// Whether a response content type denotes a problem document.
#[must_use]
pub fn is_problem_document_type(content_type: &str) -> bool {
    PROBLEM_DOCUMENT_TYPES.contains(&normalize_mime(content_type).as_str())
}

/// Decides whether a response means the session must be re-established.
///
/// True for an invalid-credentials problem document, an HTTP 401, or a
/// failed response that carries an OPDS authentication document.
#[must_use]
pub fn indicates_auth_refresh(
    status: u16,
    content_type: Option<&str>,
    problem: Option<&ProblemDocument>,
) -> bool {
    if problem.is_some_and(|doc| doc.is_type(TYPE_INVALID_CREDENTIALS)) {
        return true;
    }
    if status == 401 {
        return true;
    }
    let failed = !(200..300).contains(&status);
    failed && content_type.is_some_and(|ct| normalize_mime(ct) == OPDS_AUTHENTICATION_TYPE)
}
