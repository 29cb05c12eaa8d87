//! Download notifications and the debounced progress broadcaster.
//!
//! Progress changes arrive once per received chunk. Listeners only need the
//! latest picture, so broadcast requests are coalesced: the first request
//! schedules one emission after the debounce delay, later requests inside
//! that window are absorbed, and the emission reads whatever state is current
//! when it fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::download::constants::PROGRESS_DEBOUNCE;
use crate::problem::ProblemDocument;

/// Default channel capacity for download events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Title of alerts for failed downloads.
pub const DOWNLOAD_FAILED_TITLE: &str = "Download Failed";
/// Title of alerts for failed borrows.
pub const BORROW_FAILED_TITLE: &str = "Borrow Failed";
/// Title of alerts for failed returns.
pub const RETURN_FAILED_TITLE: &str = "Return Failed";

/// User-facing description of a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadAlert {
    pub title: String,
    pub message: String,
    /// Problem document received from the server, if any.
    pub problem: Option<ProblemDocument>,
}

impl DownloadAlert {
    /// Alert for a failed download. The problem document's text wins over
    /// `description` when present.
    #[must_use]
    pub fn download_failed(description: &str, problem: Option<ProblemDocument>) -> Self {
        let message = problem
            .as_ref()
            .and_then(ProblemDocument::message)
            .unwrap_or(description)
            .to_string();
        Self {
            title: DOWNLOAD_FAILED_TITLE.to_string(),
            message,
            problem,
        }
    }

    /// Alert for a failed borrow of `book_title`.
    #[must_use]
    pub fn borrow_failed(book_title: &str, problem: Option<ProblemDocument>) -> Self {
        let fallback = format!("Borrowing {book_title} could not be completed.");
        let message = problem
            .as_ref()
            .and_then(ProblemDocument::message)
            .map_or(fallback, ToString::to_string);
        Self {
            title: BORROW_FAILED_TITLE.to_string(),
            message,
            problem,
        }
    }

    /// Alert for a borrow of a book that is already on loan.
    #[must_use]
    pub fn loan_already_exists(problem: ProblemDocument) -> Self {
        Self {
            title: BORROW_FAILED_TITLE.to_string(),
            message: "You have already checked out this loan. You may need to refresh your \
                      list of books to download the title."
                .to_string(),
            problem: Some(problem),
        }
    }

    /// Alert for a failed return of `book_title`.
    #[must_use]
    pub fn return_failed(book_title: &str, problem: Option<ProblemDocument>) -> Self {
        let fallback = format!("An error occurred while attempting to return {book_title}.");
        let message = problem
            .as_ref()
            .and_then(ProblemDocument::message)
            .map_or(fallback, ToString::to_string);
        Self {
            title: RETURN_FAILED_TITLE.to_string(),
            message,
            problem,
        }
    }
}

/// Events published by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// Debounced change notification carrying the progress of every
    /// in-flight book.
    CenterChanged {
        progress: HashMap<String, f64>,
    },
    /// A download ended in `DownloadFailed`.
    DownloadFailed {
        identifier: String,
        alert: DownloadAlert,
    },
    /// A borrow request failed.
    BorrowFailed {
        identifier: String,
        alert: DownloadAlert,
    },
    /// A return request failed.
    ReturnFailed {
        identifier: String,
        alert: DownloadAlert,
    },
}

impl DownloadEvent {
    /// Short description for logging.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::CenterChanged { progress } => {
                format!("center changed ({} in flight)", progress.len())
            }
            Self::DownloadFailed { identifier, .. } => format!("download failed: {identifier}"),
            Self::BorrowFailed { identifier, .. } => format!("borrow failed: {identifier}"),
            Self::ReturnFailed { identifier, .. } => format!("return failed: {identifier}"),
        }
    }
}

/// Something that can report per-book progress at emission time.
pub trait ProgressSource: Send + Sync {
    /// Progress of every in-flight book.
    fn progress_snapshot(&self) -> HashMap<String, f64>;
}

/// Publishes [`DownloadEvent`]s, debouncing change notifications.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: broadcast::Sender<DownloadEvent>,
    pending: Arc<AtomicBool>,
    delay: Duration,
    source: Arc<dyn ProgressSource>,
}

impl std::fmt::Debug for ProgressBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBroadcaster")
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .field("delay", &self.delay)
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl ProgressBroadcaster {
    /// Creates a broadcaster with the default 200 ms debounce.
    #[must_use]
    pub fn new(source: Arc<dyn ProgressSource>) -> Self {
        Self::with_delay(source, PROGRESS_DEBOUNCE)
    }

    /// Creates a broadcaster with an explicit debounce delay.
    #[must_use]
    pub fn with_delay(source: Arc<dyn ProgressSource>, delay: Duration) -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            sender,
            pending: Arc::new(AtomicBool::new(false)),
            delay,
            source,
        }
    }

    /// Subscribes to download events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Requests a change notification.
    ///
    /// At most one emission is pending at a time. Outside a tokio runtime
    /// the notification is emitted immediately.
    pub fn request_broadcast(&self) {
        if self.pending.swap(true, Ordering::SeqCst) {
            trace!("broadcast already pending");
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(this.delay).await;
                    this.emit_change();
                });
            }
            Err(_) => self.emit_change(),
        }
    }

    /// Publishes an event right away.
    ///
    /// Returns the number of receivers that got the event; 0 when nobody
    /// is subscribed.
    pub fn publish(&self, event: DownloadEvent) -> usize {
        debug!(event = %event.description(), "publishing download event");
        // send() returns Err if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    fn emit_change(&self) {
        // Cleared before the snapshot so a change racing with the emission
        // schedules another one.
        self.pending.store(false, Ordering::SeqCst);
        let progress = self.source.progress_snapshot();
        let _ = self.sender.send(DownloadEvent::CenterChanged { progress });
    }
}
