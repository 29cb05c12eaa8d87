//! Loan states and the book-state ledger the coordinator writes to.
//!
//! The ledger itself is owned by the host application. [`InMemoryLedger`]
//! backs the CLI and the tests.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::acquisition::Book;

/// Lifecycle stage of a book with respect to borrowing and downloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanState {
    /// Not known to the ledger.
    Unregistered,
    /// On hold, or borrowed but not yet available.
    Holding,
    /// Borrowed (or open access) and waiting for a download.
    DownloadNeeded,
    /// Cookie-based sign-in in progress for this book.
    SamlAuthStarted,
    /// A transfer or fulfillment is in flight.
    Downloading,
    /// The last attempt failed.
    DownloadFailed,
    /// Content is on disk.
    DownloadSuccessful,
    /// Content has been opened.
    Used,
    /// Content cannot be handled on this device.
    Unsupported,
}

impl LoanState {
    /// Returns the stable string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Holding => "holding",
            Self::DownloadNeeded => "download_needed",
            Self::SamlAuthStarted => "saml_auth_started",
            Self::Downloading => "downloading",
            Self::DownloadFailed => "download_failed",
            Self::DownloadSuccessful => "download_successful",
            Self::Used => "used",
            Self::Unsupported => "unsupported",
        }
    }

    /// Whether local content exists for a book in this state.
    #[must_use]
    pub fn is_downloaded(&self) -> bool {
        matches!(self, Self::DownloadSuccessful | Self::Used)
    }
}

impl fmt::Display for LoanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LoanState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unregistered" => Ok(Self::Unregistered),
            "holding" => Ok(Self::Holding),
            "download_needed" => Ok(Self::DownloadNeeded),
            "saml_auth_started" => Ok(Self::SamlAuthStarted),
            "downloading" => Ok(Self::Downloading),
            "download_failed" => Ok(Self::DownloadFailed),
            "download_successful" => Ok(Self::DownloadSuccessful),
            "used" => Ok(Self::Used),
            "unsupported" => Ok(Self::Unsupported),
            _ => Err(format!("invalid loan state: {s}")),
        }
    }
}

/// Persistent book-state store.
///
/// Implementations must be safe to call from any runtime thread; calls are
/// short and never await.
pub trait Ledger: Send + Sync {
    /// Current state; [`LoanState::Unregistered`] for unknown books.
    fn state(&self, identifier: &str) -> LoanState;

    /// Records a new state for a known book.
    fn set_state(&self, identifier: &str, state: LoanState);

    /// Opaque reading location, if one was stored.
    fn location(&self, identifier: &str) -> Option<String>;

    /// Registers or replaces a book together with its state.
    fn add_book(
        &self,
        book: &Book,
        location: Option<String>,
        state: LoanState,
        fulfillment_id: Option<String>,
    );

    /// Records the DRM fulfillment id used later to return the loan.
    fn set_fulfillment_id(&self, identifier: &str, fulfillment_id: Option<String>);

    /// Stored fulfillment id.
    fn fulfillment_id(&self, identifier: &str) -> Option<String>;

    /// The registered book, if any.
    fn book(&self, identifier: &str) -> Option<Book>;

    /// Forgets a book entirely.
    fn remove_book(&self, identifier: &str);
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    book: Book,
    state: LoanState,
    location: Option<String>,
    fulfillment_id: Option<String>,
    history: Vec<LoanState>,
}

/// Ledger kept in process memory.
///
/// Every state change is also appended to a per-book history so callers can
/// inspect the sequence of transitions.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: DashMap<String, LedgerEntry>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All states recorded for a book, oldest first.
    #[must_use]
    pub fn history(&self, identifier: &str) -> Vec<LoanState> {
        self.entries
            .get(identifier)
            .map(|entry| entry.history.clone())
            .unwrap_or_default()
    }

    /// Number of registered books.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no books are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Ledger for InMemoryLedger {
    fn state(&self, identifier: &str) -> LoanState {
        self.entries
            .get(identifier)
            .map_or(LoanState::Unregistered, |entry| entry.state)
    }

    fn set_state(&self, identifier: &str, state: LoanState) {
        if let Some(mut entry) = self.entries.get_mut(identifier) {
            entry.state = state;
            entry.history.push(state);
        }
    }

    fn location(&self, identifier: &str) -> Option<String> {
        self.entries
            .get(identifier)
            .and_then(|entry| entry.location.clone())
    }

    fn add_book(
        &self,
        book: &Book,
        location: Option<String>,
        state: LoanState,
        fulfillment_id: Option<String>,
    ) {
        self.entries
            .entry(book.identifier.clone())
            .and_modify(|entry| {
                entry.book = book.clone();
                entry.state = state;
                entry.location.clone_from(&location);
                if fulfillment_id.is_some() {
                    entry.fulfillment_id.clone_from(&fulfillment_id);
                }
                entry.history.push(state);
            })
            .or_insert_with(|| LedgerEntry {
                book: book.clone(),
                state,
                location: location.clone(),
                fulfillment_id: fulfillment_id.clone(),
                history: vec![state],
            });
    }

    fn set_fulfillment_id(&self, identifier: &str, fulfillment_id: Option<String>) {
        if let Some(mut entry) = self.entries.get_mut(identifier) {
            entry.fulfillment_id = fulfillment_id;
        }
    }

    fn fulfillment_id(&self, identifier: &str) -> Option<String> {
        self.entries
            .get(identifier)
            .and_then(|entry| entry.fulfillment_id.clone())
    }

    fn book(&self, identifier: &str) -> Option<Book> {
        self.entries.get(identifier).map(|entry| entry.book.clone())
    }

    fn remove_book(&self, identifier: &str) {
        self.entries.remove(identifier);
    }
}
