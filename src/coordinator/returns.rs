//! Returning loans and removing local content.

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::FulfillmentCoordinator;
use super::fulfill::rights_path;
use super::transitions::{self, ReturnAction};
use crate::acquisition::Book;
use crate::ledger::LoanState;
use crate::locator::{LICENSE_EXTENSION, StorageKind};
use crate::progress::{DownloadAlert, DownloadEvent};

const STORAGE_KINDS: [StorageKind; 3] = [
    StorageKind::Standard,
    StorageKind::LcpAudiobook,
    StorageKind::LcpPdf,
];

impl FulfillmentCoordinator {
    /// Returns the loan on `identifier` and forgets the book.
    ///
    /// Any transfer in flight is cancelled first. Failures are reported as
    /// [`DownloadEvent::ReturnFailed`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn return_book(&self, identifier: &str) -> JoinHandle<()> {
        let this = self.clone();
        let identifier = identifier.to_string();
        tokio::spawn(async move { this.run_return(&identifier).await })
    }

    #[instrument(skip(self))]
    async fn run_return(&self, identifier: &str) {
        let inner = &self.inner;
        self.remove_pending(identifier);
        if let Some(task) = inner.registry.remove(identifier) {
            task.cancel();
            inner.ledger.set_state(identifier, LoanState::DownloadNeeded);
            debug!(task_id = task.task_id(), "cancelled transfer before return");
        }

        let Some(book) = inner.ledger.book(identifier) else {
            warn!("return requested for unknown book");
            return;
        };
        let downloaded = inner.ledger.state(identifier).is_downloaded();

        if let (Some(fulfillment_id), Some(adobe)) =
            (inner.ledger.fulfillment_id(identifier), inner.adobe.as_ref())
        {
            match adobe.return_loan(&fulfillment_id).await {
                Ok(()) => debug!("Adobe loan returned"),
                Err(error) => warn!(error = %error, "Adobe loan return failed"),
            }
        }

        if book.revoke_url.is_none() {
            info!("no revoke link; removing book locally");
            self.forget_book(&book, downloaded).await;
            return;
        }

        let Some(loans) = inner.loans.as_ref() else {
            warn!("no circulation service configured");
            self.publish_return_failure(&book, DownloadAlert::return_failed(&book.title, None));
            return;
        };

        let mut attempted_auth = false;
        loop {
            let result = loans.revoke(&book).await;
            match transitions::after_revoke(&result, attempted_auth) {
                ReturnAction::Cleanup => {
                    info!("loan returned");
                    self.forget_book(&book, downloaded).await;
                    return;
                }
                ReturnAction::Reauthenticate => {
                    attempted_auth = true;
                    let using_existing = inner.auth.has_credentials();
                    if let Err(error) = inner.auth.reauthenticate(using_existing).await {
                        info!(error = %error, "sign-in not completed; return abandoned");
                        return;
                    }
                }
                ReturnAction::Alert => {
                    let problem = result.err().and_then(|e| e.problem_document().cloned());
                    warn!(problem = ?problem, "return failed");
                    self.publish_return_failure(
                        &book,
                        DownloadAlert::return_failed(&book.title, problem),
                    );
                    return;
                }
            }
        }
    }

    async fn forget_book(&self, book: &Book, downloaded: bool) {
        if downloaded {
            self.delete_local_content(&book.identifier).await;
        }
        self.inner.ledger.remove_book(&book.identifier);
        self.inner.broadcaster.request_broadcast();
    }

    fn publish_return_failure(&self, book: &Book, alert: DownloadAlert) {
        self.inner.broadcaster.publish(DownloadEvent::ReturnFailed {
            identifier: book.identifier.clone(),
            alert,
        });
    }

    /// Deletes every stored file of `identifier`: content, streaming
    /// license and rights document. Missing files are not an error.
    #[instrument(skip(self))]
    pub async fn delete_local_content(&self, identifier: &str) {
        let locator = &self.inner.locator;
        let mut paths: Vec<_> = STORAGE_KINDS
            .iter()
            .map(|kind| locator.planned_path(identifier, *kind))
            .collect();
        paths.push(rights_path(&locator.planned_path(identifier, StorageKind::Standard)));
        paths.push(
            locator
                .planned_path(identifier, StorageKind::Standard)
                .with_extension(LICENSE_EXTENSION),
        );

        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "removed local content"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "failed to remove local content");
                }
            }
        }
    }

    /// Cancels every transfer and deletes the current account's stored
    /// content. Queued requests are dropped.
    #[instrument(skip(self))]
    pub async fn reset(&self) {
        self.abandon_all();
        for dir in [
            self.inner.locator.content_dir(),
            self.inner.locator.staging_dir(),
        ] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(path = %dir.display(), "removed directory"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    warn!(path = %dir.display(), error = %error, "failed to remove directory");
                }
            }
        }
        self.inner.broadcaster.request_broadcast();
    }

    /// Cancels every transfer and points content storage at another
    /// account. Stored content of the previous account is kept.
    pub fn switch_account(&self, account_id: &str) {
        self.abandon_all();
        self.inner.locator.switch_account(account_id);
        info!(account = %account_id, "switched account");
        self.inner.broadcaster.request_broadcast();
    }

    fn abandon_all(&self) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        for (identifier, task) in self.inner.registry.drain() {
            task.cancel();
            self.inner
                .ledger
                .set_state(&identifier, LoanState::DownloadNeeded);
            debug!(identifier = %identifier, task_id = task.task_id(), "transfer abandoned");
        }
    }
}
