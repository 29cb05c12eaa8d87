//! Pure decision functions of the fulfillment state machine.
//!
//! Each function maps the observed situation to what the coordinator does
//! next. Nothing here performs I/O, so every branch is unit-tested directly.

use crate::ledger::LoanState;
use crate::loans::LoanError;
use crate::problem::{TYPE_INVALID_CREDENTIALS, TYPE_LOAN_ALREADY_EXISTS, TYPE_NO_ACTIVE_LOAN};
use crate::rights::RightsManagementKind;

/// What a start request turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// A transfer is already running for the book.
    AlreadyInFlight,
    /// The book is already fulfilled or cannot be; nothing to do.
    Ignore,
    /// Capacity is exhausted; queue the request.
    Queue,
    /// The account must sign in first.
    SignIn,
    /// Borrow before downloading.
    Borrow,
    /// Download straight away, registering the book first when
    /// `register` is set.
    Download { register: bool },
}

/// Decides how to handle a start request for a book in `state`.
#[must_use]
pub fn decide_start(
    state: LoanState,
    requires_borrow: bool,
    login_required: bool,
    at_capacity: bool,
) -> StartDecision {
    match state {
        LoanState::Downloading => return StartDecision::AlreadyInFlight,
        LoanState::DownloadSuccessful | LoanState::Used | LoanState::Unsupported => {
            return StartDecision::Ignore;
        }
        _ => {}
    }
    if at_capacity {
        return StartDecision::Queue;
    }
    if login_required {
        return StartDecision::SignIn;
    }
    match state {
        LoanState::Unregistered | LoanState::Holding if requires_borrow => StartDecision::Borrow,
        LoanState::Unregistered => StartDecision::Download { register: true },
        _ => StartDecision::Download { register: false },
    }
}

/// Rights kind recorded for a response.
///
/// A task created by bearer-token indirection treats any recognized payload
/// as plain content. A second bearer-token document is kept so it can be
/// refused, and an unrecognized type stays `Unknown`.
#[must_use]
pub fn observed_rights(classified: RightsManagementKind, chained: bool) -> RightsManagementKind {
    match (chained, classified) {
        (false, kind) => kind,
        (
            true,
            kind @ (RightsManagementKind::SimplifiedBearerToken | RightsManagementKind::Unknown),
        ) => kind,
        (true, _) => RightsManagementKind::None,
    }
}

/// Whether a response of this kind may be written to disk at all.
#[must_use]
pub fn accepts_payload(rights: RightsManagementKind) -> bool {
    rights != RightsManagementKind::Unknown
}

/// How a finished payload is turned into content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAction {
    /// Hand the ACSM to the Adobe collaborator.
    FulfillAdobe,
    /// Hand the license to the LCP collaborator.
    FulfillLcp,
    /// Parse the token and fetch its location in a new task.
    FollowBearerToken,
    /// Replace the content file with the manifest.
    ReplaceContent,
    /// Move the payload to the content path.
    MoveIntoPlace,
    /// A bearer-token document led to another one.
    RejectChainedToken,
    /// Unknown rights scheme.
    RejectUnknown,
}

/// Decides how to finish a payload of kind `rights`.
#[must_use]
pub fn finish_action(rights: RightsManagementKind, chained: bool) -> FinishAction {
    match rights {
        RightsManagementKind::AdobeAdept => FinishAction::FulfillAdobe,
        RightsManagementKind::ReadiumLcp => FinishAction::FulfillLcp,
        RightsManagementKind::SimplifiedBearerToken if chained => FinishAction::RejectChainedToken,
        RightsManagementKind::SimplifiedBearerToken => FinishAction::FollowBearerToken,
        RightsManagementKind::OverdriveManifestJson => FinishAction::ReplaceContent,
        RightsManagementKind::None => FinishAction::MoveIntoPlace,
        RightsManagementKind::Unknown => FinishAction::RejectUnknown,
    }
}

/// State a cancel request moves the book to; `None` means the request is
/// ignored.
#[must_use]
pub fn after_cancel(state: LoanState, had_task: bool) -> Option<LoanState> {
    if had_task || state == LoanState::DownloadFailed {
        Some(LoanState::DownloadNeeded)
    } else {
        None
    }
}

/// Follow-up of a failed borrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowFailureAction {
    /// The loan exists already; tell the user.
    AlreadyOnLoan,
    /// Sign in again and retry the start once.
    Reauthenticate,
    /// Report the failure.
    Alert,
}

/// Decides what to do after a borrow failed.
#[must_use]
pub fn after_borrow_failure(error: &LoanError, attempted_auth: bool) -> BorrowFailureAction {
    if error.is_problem(TYPE_LOAN_ALREADY_EXISTS) {
        BorrowFailureAction::AlreadyOnLoan
    } else if error.is_problem(TYPE_INVALID_CREDENTIALS) && !attempted_auth {
        BorrowFailureAction::Reauthenticate
    } else {
        BorrowFailureAction::Alert
    }
}

/// Follow-up of a revoke request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnAction {
    /// The loan is gone; delete content and forget the book.
    Cleanup,
    /// Sign in again and retry once.
    Reauthenticate,
    /// Report the failure.
    Alert,
}

/// Decides what to do with the result of a revoke request.
#[must_use]
pub fn after_revoke(result: &Result<(), LoanError>, attempted_auth: bool) -> ReturnAction {
    match result {
        Ok(()) => ReturnAction::Cleanup,
        Err(error) if error.is_problem(TYPE_NO_ACTIVE_LOAN) => ReturnAction::Cleanup,
        Err(error) if error.is_problem(TYPE_INVALID_CREDENTIALS) && !attempted_auth => {
            ReturnAction::Reauthenticate
        }
        Err(_) => ReturnAction::Alert,
    }
}
