//! Catalog-side description of a book and how it can be acquired.
//!
//! These types are produced by the feed-parsing layer and handed to the
//! coordinator unchanged; nothing in this crate mutates them.

use url::Url;

use crate::ledger::LoanState;
use crate::locator::StorageKind;
use crate::rights::{mime, normalize_mime};

/// Availability classification from the catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Unlimited simultaneous loans.
    Unlimited,
    /// A limited number of copies, at least one available.
    Limited,
    /// The patron holds a reservation; no copy yet.
    Reserved,
    /// A reserved copy is ready to borrow.
    Ready,
    /// No copy available.
    Unavailable,
}

impl Availability {
    /// Whether content can be fetched right away.
    #[must_use]
    pub fn is_downloadable(self) -> bool {
        matches!(self, Self::Unlimited | Self::Limited | Self::Ready)
    }

    /// Loan state a freshly borrowed book enters.
    #[must_use]
    pub fn state_after_borrow(self) -> LoanState {
        if self.is_downloadable() {
            LoanState::DownloadNeeded
        } else {
            LoanState::Holding
        }
    }
}

/// Broad content format of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    Epub,
    Pdf,
    Audiobook,
    Unsupported,
}

/// How a book can be obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionDescriptor {
    /// Borrow link; requesting it creates a loan.
    pub borrow_url: Option<Url>,
    /// Open-access or fulfillment link that yields content directly.
    pub direct_url: Option<Url>,
    /// Availability classification.
    pub availability: Availability,
    /// Declared distributor (e.g. `Overdrive`, `Palace Marketplace`).
    pub distributor: Option<String>,
    /// Declared content type of the acquisition, when known.
    pub content_type: Option<String>,
}

impl AcquisitionDescriptor {
    /// Descriptor for an open-access book with a single direct link.
    #[must_use]
    pub fn open_access(url: Url) -> Self {
        Self {
            borrow_url: None,
            direct_url: Some(url),
            availability: Availability::Unlimited,
            distributor: None,
            content_type: None,
        }
    }

    /// Descriptor for a book that must be borrowed first.
    #[must_use]
    pub fn borrowable(url: Url, availability: Availability) -> Self {
        Self {
            borrow_url: Some(url),
            direct_url: None,
            availability,
            distributor: None,
            content_type: None,
        }
    }
}

/// A catalog entry as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    /// Stable catalog identifier.
    pub identifier: String,
    /// Display title, used in alerts.
    pub title: String,
    pub format: ContentFormat,
    pub acquisition: AcquisitionDescriptor,
    /// Link that returns the loan, when the server offers one.
    pub revoke_url: Option<Url>,
}

impl Book {
    /// Creates a book with no revoke link.
    #[must_use]
    pub fn new(
        identifier: impl Into<String>,
        title: impl Into<String>,
        format: ContentFormat,
        acquisition: AcquisitionDescriptor,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            format,
            acquisition,
            revoke_url: None,
        }
    }

    /// Whether starting a download must go through a borrow request.
    ///
    /// Any borrow link wins. Without one, a book lacking a direct link still
    /// needs a borrow when the account requires sign-in.
    #[must_use]
    pub fn requires_borrow(&self, login_required: bool) -> bool {
        self.acquisition.borrow_url.is_some()
            || (self.acquisition.direct_url.is_none() && login_required)
    }

    /// Whether the declared acquisition is an LCP license.
    #[must_use]
    pub fn is_lcp(&self) -> bool {
        self.acquisition
            .content_type
            .as_deref()
            .is_some_and(|ct| normalize_mime(ct) == mime::READIUM_LCP)
    }

    /// On-disk storage kind for this book's content.
    #[must_use]
    pub fn storage_kind(&self) -> StorageKind {
        match (self.is_lcp(), self.format) {
            (true, ContentFormat::Audiobook) => StorageKind::LcpAudiobook,
            (true, ContentFormat::Pdf) => StorageKind::LcpPdf,
            _ => StorageKind::Standard,
        }
    }
}
