//! Transfer driving and payload finalization.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::transitions::{self, FinishAction};
use super::{FulfillmentCoordinator, Inner};
use crate::acquisition::{Book, ContentFormat};
use crate::bearer::BearerToken;
use crate::download::{
    DownloadError, FetchedPayload, ResponseHead, TransferControl, TransferObserver,
    TransferRequest,
};
use crate::drm::{DrmError, LcpFulfiller, ProgressCallback};
use crate::error::FulfillmentError;
use crate::locator::{LICENSE_EXTENSION, StorageKind};
use crate::rights::RightsManagementKind;

/// Marker an ACSM carries when it describes a PDF.
const ADOBE_PDF_MARKER: &[u8] = b">application/pdf</dc:format>";

/// Suffix of the rights document stored beside Adobe content.
const RIGHTS_SUFFIX: &str = "_rights.xml";

/// Feeds transport callbacks of one task into the registry.
struct TaskObserver<'a> {
    inner: &'a Inner,
    identifier: &'a str,
    task_id: u64,
    chained: bool,
    rights: RightsManagementKind,
}

impl TransferObserver for TaskObserver<'_> {
    fn on_response(&mut self, head: &ResponseHead) -> ControlFlow<()> {
        let content_type = head.content_type.as_deref().unwrap_or_default();
        let classified = self.inner.classifier.classify(content_type);
        self.rights = transitions::observed_rights(classified, self.chained);
        info!(
            identifier = %self.identifier,
            content_type = %content_type,
            rights = %self.rights,
            "response classified"
        );
        self.inner
            .registry
            .update_rights(self.identifier, self.task_id, self.rights);

        if transitions::accepts_payload(self.rights) {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }

    fn on_progress(&mut self, written: u64, expected: u64) {
        if !self.rights.reports_progress() {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = written as f64 / expected as f64;
        if self
            .inner
            .registry
            .update_progress(self.identifier, self.task_id, fraction)
        {
            self.inner.broadcaster.request_broadcast();
        }
    }
}

impl FulfillmentCoordinator {
    /// Runs transfers for `book` until the content is in place or the task
    /// ends. Bearer-token indirection continues here with a new task.
    pub(super) async fn run_transfer(
        &self,
        book: &Book,
        mut task_id: u64,
        mut control: TransferControl,
        mut request: TransferRequest,
    ) {
        let inner = &self.inner;
        let identifier = book.identifier.as_str();
        let mut chained = false;

        loop {
            let staging = match inner.locator.staging_path(identifier, task_id).await {
                Ok(path) => path,
                Err(error) => {
                    let staging_dir = inner.locator.staging_dir();
                    self.fail_download(
                        book,
                        task_id,
                        FulfillmentError::filesystem("create", staging_dir, error),
                    )
                    .await;
                    return;
                }
            };

            let mut observer = TaskObserver {
                inner,
                identifier,
                task_id,
                chained,
                rights: RightsManagementKind::Unknown,
            };
            let result = inner
                .client
                .fetch_to_file(
                    task_id,
                    &request,
                    &staging,
                    &inner.guard,
                    &mut control,
                    &mut observer,
                )
                .await;
            inner.guard.forget(task_id);
            let rights = observer.rights;

            let payload = match result {
                Ok(payload) => payload,
                Err(DownloadError::UnsupportedContent { content_type, .. }) => {
                    self.fail_download(book, task_id, FulfillmentError::UnknownRights { content_type })
                        .await;
                    return;
                }
                Err(error) => {
                    self.fail_download(book, task_id, error.into()).await;
                    return;
                }
            };

            let action = transitions::finish_action(rights, chained);
            if action != FinishAction::FollowBearerToken {
                let outcome = self.finalize(book, task_id, &control, &payload, action).await;
                remove_quietly(&payload.path).await;
                match outcome {
                    Ok(()) => self.complete_download(book, task_id),
                    Err(error) => self.fail_download(book, task_id, error).await,
                }
                return;
            }

            match self.follow_bearer_token(book, task_id, &payload).await {
                Ok((next_task_id, next_control, next_request)) => {
                    task_id = next_task_id;
                    control = next_control;
                    request = next_request;
                    chained = true;
                }
                Err(Some(error)) => {
                    self.fail_download(book, task_id, error).await;
                    return;
                }
                Err(None) => return,
            }
        }
    }

    /// Parses the bearer-token payload and swaps in a task for its location.
    ///
    /// `Err(None)` means the task was retired meanwhile and nothing is left
    /// to do.
    #[instrument(skip(self, book, payload), fields(identifier = %book.identifier))]
    async fn follow_bearer_token(
        &self,
        book: &Book,
        task_id: u64,
        payload: &FetchedPayload,
    ) -> Result<(u64, TransferControl, TransferRequest), Option<FulfillmentError>> {
        let inner = &self.inner;
        let body = tokio::fs::read(&payload.path).await;
        remove_quietly(&payload.path).await;
        let body = body.map_err(|e| Some(FulfillmentError::filesystem("read", &payload.path, e)))?;
        let token = BearerToken::from_slice(&body).map_err(|e| Some(e.into()))?;

        let next = inner.registry.new_task();
        let next_task_id = next.task_id();
        let Ok(control) = inner.registry.replace(&book.identifier, task_id, next) else {
            debug!("task retired before bearer token follow-up");
            return Err(None);
        };
        inner.registry.update_rights(
            &book.identifier,
            next_task_id,
            RightsManagementKind::None,
        );
        let request = TransferRequest::bearer(token.location.clone(), &token.access_token);
        inner
            .registry
            .set_bearer_token(&book.identifier, next_task_id, token);
        info!(
            retired = task_id,
            task_id = next_task_id,
            location = %request.url,
            "following bearer token"
        );
        Ok((next_task_id, control, request))
    }

    async fn finalize(
        &self,
        book: &Book,
        task_id: u64,
        control: &TransferControl,
        payload: &FetchedPayload,
        action: FinishAction,
    ) -> Result<(), FulfillmentError> {
        match action {
            FinishAction::FulfillAdobe => self.fulfill_adobe(book, control, payload).await,
            FinishAction::FulfillLcp => self.fulfill_lcp(book, task_id, control, payload).await,
            FinishAction::ReplaceContent | FinishAction::MoveIntoPlace => {
                let destination = self.content_destination(book, book.storage_kind()).await?;
                install_content(&payload.path, &destination).await?;
                info!(
                    identifier = %book.identifier,
                    path = %destination.display(),
                    "content stored"
                );
                Ok(())
            }
            FinishAction::RejectChainedToken => Err(FulfillmentError::ChainedBearerToken {
                identifier: book.identifier.clone(),
            }),
            FinishAction::RejectUnknown => Err(FulfillmentError::UnknownRights {
                content_type: payload.head.content_type.clone(),
            }),
            FinishAction::FollowBearerToken => Ok(()),
        }
    }

    async fn content_destination(
        &self,
        book: &Book,
        kind: StorageKind,
    ) -> Result<PathBuf, FulfillmentError> {
        self.inner
            .locator
            .path_for(&book.identifier, kind)
            .await
            .map_err(|e| FulfillmentError::filesystem("create", self.inner.locator.content_dir(), e))
    }

    #[instrument(skip_all, fields(identifier = %book.identifier))]
    async fn fulfill_adobe(
        &self,
        book: &Book,
        control: &TransferControl,
        payload: &FetchedPayload,
    ) -> Result<(), FulfillmentError> {
        let inner = &self.inner;
        let acsm = tokio::fs::read(&payload.path)
            .await
            .map_err(|e| FulfillmentError::filesystem("read", &payload.path, e))?;
        if contains(&acsm, ADOBE_PDF_MARKER) {
            return Err(FulfillmentError::UnsupportedAdobePdf {
                title: book.title.clone(),
            });
        }
        let adobe = inner
            .adobe
            .as_ref()
            .ok_or(DrmError::Unavailable { scheme: "Adobe" })?;

        let fulfilled = adobe
            .fulfill(&book.identifier, &acsm, control.token().clone())
            .await?;

        let destination = self.content_destination(book, StorageKind::Standard).await?;
        copy_content(&fulfilled.content_path, &destination).await?;
        let rights_path = rights_path(&destination);
        tokio::fs::write(&rights_path, &fulfilled.rights)
            .await
            .map_err(|e| FulfillmentError::filesystem("write", &rights_path, e))?;

        if fulfilled.returnable {
            inner
                .ledger
                .set_fulfillment_id(&book.identifier, fulfilled.fulfillment_id);
        }
        info!(path = %destination.display(), "Adobe fulfillment stored");
        Ok(())
    }

    #[instrument(skip_all, fields(identifier = %book.identifier))]
    async fn fulfill_lcp(
        &self,
        book: &Book,
        task_id: u64,
        control: &TransferControl,
        payload: &FetchedPayload,
    ) -> Result<(), FulfillmentError> {
        let inner = &self.inner;
        let lcp = inner
            .lcp
            .as_ref()
            .ok_or(DrmError::Unavailable { scheme: "LCP" })?;

        let license = payload.path.with_extension(LICENSE_EXTENSION);
        tokio::fs::rename(&payload.path, &license)
            .await
            .map_err(|e| FulfillmentError::filesystem("rename", &payload.path, e))?;
        let result = self.fulfill_lcp_license(book, task_id, control, &license, lcp.as_ref()).await;
        remove_quietly(&license).await;
        result
    }

    async fn fulfill_lcp_license(
        &self,
        book: &Book,
        task_id: u64,
        control: &TransferControl,
        license: &Path,
        lcp: &dyn LcpFulfiller,
    ) -> Result<(), FulfillmentError> {
        let inner = &self.inner;
        let audiobook = book.format == ContentFormat::Audiobook;

        if audiobook {
            let streaming = inner
                .locator
                .license_path(&book.identifier)
                .await
                .map_err(|e| FulfillmentError::filesystem("create", inner.locator.content_dir(), e))?;
            tokio::fs::copy(license, &streaming)
                .await
                .map_err(|e| FulfillmentError::filesystem("copy", &streaming, e))?;
            debug!(path = %streaming.display(), "license kept for streaming");
        }

        let registry = Arc::clone(&inner.registry);
        let broadcaster = inner.broadcaster.clone();
        let identifier = book.identifier.clone();
        let progress: ProgressCallback = Arc::new(move |fraction| {
            if registry.update_progress(&identifier, task_id, fraction) {
                broadcaster.request_broadcast();
            }
        });

        let fulfilled = lcp.fulfill(license, progress, control.token().clone()).await?;
        inner
            .ledger
            .set_fulfillment_id(&book.identifier, fulfilled.license_id);

        let destination = self.content_destination(book, book.storage_kind()).await?;
        if let Err(error) = install_content(&fulfilled.content_path, &destination).await {
            if audiobook {
                warn!(error = %error, "audiobook content not stored; streaming from license");
                return Ok(());
            }
            return Err(error);
        }

        if book.format == ContentFormat::Pdf {
            lcp.extract_pdf(&destination).await?;
        }
        info!(path = %destination.display(), "LCP fulfillment stored");
        Ok(())
    }
}

/// Moves `source` to `destination`, replacing whatever is there.
///
/// Falls back to copy-and-delete when a rename is not possible.
async fn install_content(source: &Path, destination: &Path) -> Result<(), FulfillmentError> {
    remove_existing(destination).await?;
    if tokio::fs::rename(source, destination).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(source, destination)
        .await
        .map_err(|e| FulfillmentError::filesystem("copy", destination, e))?;
    remove_quietly(source).await;
    Ok(())
}

/// Copies `source` to `destination`, replacing whatever is there.
async fn copy_content(source: &Path, destination: &Path) -> Result<(), FulfillmentError> {
    remove_existing(destination).await?;
    tokio::fs::copy(source, destination)
        .await
        .map(|_| ())
        .map_err(|e| FulfillmentError::filesystem("copy", destination, e))
}

async fn remove_existing(path: &Path) -> Result<(), FulfillmentError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FulfillmentError::filesystem("remove", path, e)),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %error, "could not remove staging file");
        }
    }
}

/// Path of the rights document stored beside `content`.
pub(super) fn rights_path(content: &Path) -> PathBuf {
    let mut name = content.as_os_str().to_owned();
    name.push(RIGHTS_SUFFIX);
    PathBuf::from(name)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
