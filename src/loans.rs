//! Circulation requests: borrowing and returning loans.
//!
//! Fetching and parsing the circulation feed happens behind [`LoanService`];
//! the coordinator only sees the resulting [`Book`] or a problem document.

use async_trait::async_trait;
use thiserror::Error;

use crate::acquisition::Book;
use crate::problem::ProblemDocument;

/// Errors from a circulation request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoanError {
    /// The server answered with a problem document.
    #[error("circulation problem: {0}")]
    Problem(ProblemDocument),

    /// The request did not complete.
    #[error("circulation request failed: {reason}")]
    Transport {
        /// Description of the failure.
        reason: String,
    },
}

impl LoanError {
    /// The problem document, when one was received.
    #[must_use]
    pub fn problem_document(&self) -> Option<&ProblemDocument> {
        match self {
            Self::Problem(document) => Some(document),
            Self::Transport { .. } => None,
        }
    }

    /// Whether the server reported the given problem type.
    #[must_use]
    pub fn is_problem(&self, problem_type: &str) -> bool {
        self.problem_document()
            .is_some_and(|doc| doc.is_type(problem_type))
    }
}

/// Borrow and revoke requests against the circulation server.
#[async_trait]
pub trait LoanService: Send + Sync {
    /// Borrows `book`, returning the entry as the server now describes it.
    async fn borrow(&self, book: &Book) -> Result<Book, LoanError>;

    /// Returns the loan on `book`.
    async fn revoke(&self, book: &Book) -> Result<(), LoanError>;
}
