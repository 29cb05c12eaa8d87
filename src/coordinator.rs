//! The fulfillment state machine.
//!
//! [`FulfillmentCoordinator`] turns a start request into borrow, transfer and
//! DRM hand-off steps, writing every state change to the [`Ledger`]. Public
//! commands never block and never return errors: work is spawned on the
//! tokio runtime, and failures end as a `DownloadFailed` state plus a
//! [`DownloadEvent`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fulfillment_core::acquisition::{AcquisitionDescriptor, Book, ContentFormat};
//! use fulfillment_core::auth::StaticAuthenticator;
//! use fulfillment_core::config::EngineConfig;
//! use fulfillment_core::coordinator::FulfillmentCoordinator;
//! use fulfillment_core::ledger::InMemoryLedger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = FulfillmentCoordinator::builder(
//!     EngineConfig::new("./library"),
//!     Arc::new(InMemoryLedger::new()),
//!     Arc::new(StaticAuthenticator::new()),
//! )
//! .build()?;
//! let book = Book::new(
//!     "urn:book:1",
//!     "Moby Dick",
//!     ContentFormat::Epub,
//!     AcquisitionDescriptor::open_access("https://example.com/moby.epub".parse()?),
//! );
//! coordinator.start_download(book).await?;
//! # Ok(())
//! # }
//! ```

mod fulfill;
mod returns;
pub mod transitions;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::acquisition::Book;
use crate::auth::{Authenticator, SessionCookie};
use crate::config::{ConfigError, EngineConfig};
use crate::download::{HttpClient, RedirectGuard, TransferControl, TransferRequest};
use crate::drm::{AdobeFulfiller, LcpFulfiller, SamlInterceptor, SamlOutcome};
use crate::error::FulfillmentError;
use crate::ledger::{Ledger, LoanState};
use crate::loans::LoanService;
use crate::locator::FileLocator;
use crate::problem::TYPE_NO_ACTIVE_LOAN;
use crate::progress::{DownloadAlert, DownloadEvent, ProgressBroadcaster, ProgressSource};
use crate::registry::AcquisitionTaskRegistry;
use crate::rights::RightsClassifier;
use transitions::{BorrowFailureAction, StartDecision};

/// Result of trying to register a transfer.
enum Admission {
    Admitted {
        task_id: u64,
        control: TransferControl,
    },
    Queued,
    Duplicate,
}

/// A start request waiting for capacity.
///
/// `request` is set when the request was already rewritten by SAML sign-in
/// and must be replayed as is instead of starting over.
struct PendingStart {
    book: Book,
    request: Option<TransferRequest>,
}

/// Whether a start step finished or asks for one more attempt after
/// signing in again.
enum StepOutcome {
    Done,
    Restart(Book),
}

struct Inner {
    ledger: Arc<dyn Ledger>,
    auth: Arc<dyn Authenticator>,
    loans: Option<Arc<dyn LoanService>>,
    adobe: Option<Arc<dyn AdobeFulfiller>>,
    lcp: Option<Arc<dyn LcpFulfiller>>,
    saml: Option<Arc<dyn SamlInterceptor>>,
    client: HttpClient,
    guard: RedirectGuard,
    classifier: RightsClassifier,
    locator: FileLocator,
    registry: Arc<AcquisitionTaskRegistry>,
    broadcaster: ProgressBroadcaster,
    pending: Mutex<VecDeque<PendingStart>>,
    max_concurrent: usize,
}

/// Builds a [`FulfillmentCoordinator`] from its collaborators.
pub struct CoordinatorBuilder {
    config: EngineConfig,
    ledger: Arc<dyn Ledger>,
    auth: Arc<dyn Authenticator>,
    loans: Option<Arc<dyn LoanService>>,
    adobe: Option<Arc<dyn AdobeFulfiller>>,
    lcp: Option<Arc<dyn LcpFulfiller>>,
    saml: Option<Arc<dyn SamlInterceptor>>,
}

impl CoordinatorBuilder {
    /// Circulation service used to borrow and return loans.
    #[must_use]
    pub fn loan_service(mut self, loans: Arc<dyn LoanService>) -> Self {
        self.loans = Some(loans);
        self
    }

    /// Adobe ADEPT collaborator.
    #[must_use]
    pub fn adobe(mut self, adobe: Arc<dyn AdobeFulfiller>) -> Self {
        self.adobe = Some(adobe);
        self
    }

    /// Readium LCP collaborator.
    #[must_use]
    pub fn lcp(mut self, lcp: Arc<dyn LcpFulfiller>) -> Self {
        self.lcp = Some(lcp);
        self
    }

    /// SAML cookie interception collaborator.
    #[must_use]
    pub fn saml(mut self, saml: Arc<dyn SamlInterceptor>) -> Self {
        self.saml = Some(saml);
        self
    }

    /// Validates the configuration and builds the coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration is invalid.
    pub fn build(self) -> Result<FulfillmentCoordinator, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let registry = Arc::new(AcquisitionTaskRegistry::new());
        let source: Arc<dyn ProgressSource> = registry.clone();
        let broadcaster = ProgressBroadcaster::with_delay(source, config.progress_debounce);

        info!(
            base_dir = %config.content_base_dir.display(),
            account = %config.account_id,
            max_concurrent = config.max_concurrent_downloads,
            "fulfillment coordinator ready"
        );

        Ok(FulfillmentCoordinator {
            inner: Arc::new(Inner {
                classifier: config.classifier(),
                client: HttpClient::new_with_timeouts(
                    config.connect_timeout_secs,
                    config.read_timeout_secs,
                ),
                guard: RedirectGuard::new(config.max_redirects),
                locator: FileLocator::new(config.content_base_dir, config.account_id),
                max_concurrent: config.max_concurrent_downloads,
                ledger: self.ledger,
                auth: self.auth,
                loans: self.loans,
                adobe: self.adobe,
                lcp: self.lcp,
                saml: self.saml,
                registry,
                broadcaster,
                pending: Mutex::new(VecDeque::new()),
            }),
        })
    }
}

/// Handle to the fulfillment state machine.
///
/// Cloning is cheap; all clones share the same registry and channels.
#[derive(Clone)]
pub struct FulfillmentCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FulfillmentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FulfillmentCoordinator")
            .field("in_flight", &self.inner.registry.len())
            .field("max_concurrent", &self.inner.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl FulfillmentCoordinator {
    /// Starts building a coordinator.
    #[must_use]
    pub fn builder(
        config: EngineConfig,
        ledger: Arc<dyn Ledger>,
        auth: Arc<dyn Authenticator>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            ledger,
            auth,
            loans: None,
            adobe: None,
            lcp: None,
            saml: None,
        }
    }

    /// Requests a download of `book`.
    ///
    /// Returns immediately. The returned handle completes when the request
    /// has been fully handled (downloaded, failed, queued or ignored);
    /// dropping it does not cancel anything.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start_download(&self, book: Book) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_start(book).await })
    }

    /// Pauses the transfer of `identifier` between chunks.
    pub fn pause_download(&self, identifier: &str) {
        if self.inner.registry.set_paused(identifier, true) {
            info!(identifier = %identifier, "download paused");
        } else {
            debug!(identifier = %identifier, "no download to pause");
        }
    }

    /// Resumes a paused transfer.
    pub fn resume_download(&self, identifier: &str) {
        if self.inner.registry.set_paused(identifier, false) {
            info!(identifier = %identifier, "download resumed");
        } else {
            debug!(identifier = %identifier, "no download to resume");
        }
    }

    /// Cancels the transfer of `identifier` and returns the book to
    /// `DownloadNeeded`.
    ///
    /// A failed download without a task is reset the same way; anything
    /// else is ignored.
    #[instrument(skip(self))]
    pub fn cancel_download(&self, identifier: &str) {
        let inner = &self.inner;
        self.remove_pending(identifier);

        let task = inner.registry.remove(identifier);
        let state = inner.ledger.state(identifier);
        let Some(next) = transitions::after_cancel(state, task.is_some()) else {
            info!(state = %state, "ignoring nonsensical cancellation request");
            return;
        };

        if let Some(task) = task {
            task.cancel();
            info!(task_id = task.task_id(), "download cancelled");
        }
        inner.ledger.set_state(identifier, next);
        inner.broadcaster.request_broadcast();
        self.dispatch_pending();
    }

    /// Progress of `identifier` in `[0, 1]`; 0 when nothing is in flight.
    #[must_use]
    pub fn download_progress(&self, identifier: &str) -> f64 {
        self.inner.registry.progress(identifier)
    }

    /// Subscribes to download events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.broadcaster.subscribe()
    }

    /// Number of transfers in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    /// Number of start requests waiting for capacity.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    async fn run_start(&self, mut book: Book) {
        let mut attempted_auth = false;
        loop {
            match self.start_step(&book, attempted_auth).await {
                StepOutcome::Done => return,
                StepOutcome::Restart(next) => {
                    debug!(identifier = %next.identifier, "restarting after sign-in");
                    attempted_auth = true;
                    book = next;
                }
            }
        }
    }

    #[instrument(skip(self, book), fields(identifier = %book.identifier))]
    async fn start_step(&self, book: &Book, attempted_auth: bool) -> StepOutcome {
        let inner = &self.inner;
        let identifier = book.identifier.as_str();
        let state = inner.ledger.state(identifier);
        let login_required = inner.auth.login_required();
        let at_capacity = inner.registry.get(identifier).is_none()
            && inner.registry.len() >= inner.max_concurrent;

        match transitions::decide_start(
            state,
            book.requires_borrow(login_required),
            login_required,
            at_capacity,
        ) {
            StartDecision::AlreadyInFlight => {
                debug!("download already in progress");
                StepOutcome::Done
            }
            StartDecision::Ignore => {
                info!(state = %state, "ignoring nonsensical download request");
                StepOutcome::Done
            }
            StartDecision::Queue => {
                self.enqueue_pending(book);
                StepOutcome::Done
            }
            StartDecision::SignIn => {
                info!("sign-in required before download");
                self.reauthenticate_then_restart(book, false, attempted_auth)
                    .await
            }
            StartDecision::Borrow => self.borrow_then_download(book, attempted_auth).await,
            StartDecision::Download { register } => {
                if register {
                    self.register_if_absent(book);
                }
                self.download(book, attempted_auth).await
            }
        }
    }

    async fn reauthenticate_then_restart(
        &self,
        book: &Book,
        using_existing: bool,
        attempted_auth: bool,
    ) -> StepOutcome {
        if attempted_auth {
            warn!(identifier = %book.identifier, "already signed in once; not retrying");
            return StepOutcome::Done;
        }
        match self.inner.auth.reauthenticate(using_existing).await {
            Ok(()) => StepOutcome::Restart(book.clone()),
            Err(error) => {
                info!(identifier = %book.identifier, error = %error, "sign-in not completed");
                StepOutcome::Done
            }
        }
    }

    async fn borrow_then_download(&self, book: &Book, attempted_auth: bool) -> StepOutcome {
        let inner = &self.inner;
        let Some(loans) = inner.loans.as_ref() else {
            warn!(identifier = %book.identifier, "no circulation service configured");
            self.publish_borrow_failure(book, DownloadAlert::borrow_failed(&book.title, None));
            return StepOutcome::Done;
        };

        info!(identifier = %book.identifier, "borrowing");
        match loans.borrow(book).await {
            Ok(borrowed) => {
                let state = borrowed.acquisition.availability.state_after_borrow();
                let location = inner.ledger.location(&borrowed.identifier);
                inner.ledger.add_book(&borrowed, location, state, None);
                inner.broadcaster.request_broadcast();
                info!(identifier = %borrowed.identifier, state = %state, "borrow succeeded");
                if state == LoanState::DownloadNeeded {
                    self.download(&borrowed, attempted_auth).await
                } else {
                    StepOutcome::Done
                }
            }
            Err(error) => {
                warn!(identifier = %book.identifier, error = %error, "borrow failed");
                match transitions::after_borrow_failure(&error, attempted_auth) {
                    BorrowFailureAction::AlreadyOnLoan => {
                        let problem = error.problem_document().cloned().unwrap_or_default();
                        self.publish_borrow_failure(book, DownloadAlert::loan_already_exists(problem));
                        StepOutcome::Done
                    }
                    BorrowFailureAction::Reauthenticate => {
                        let using_existing = inner.auth.has_credentials();
                        self.reauthenticate_then_restart(book, using_existing, attempted_auth)
                            .await
                    }
                    BorrowFailureAction::Alert => {
                        let alert = DownloadAlert::borrow_failed(
                            &book.title,
                            error.problem_document().cloned(),
                        );
                        self.publish_borrow_failure(book, alert);
                        StepOutcome::Done
                    }
                }
            }
        }
    }

    async fn download(&self, book: &Book, attempted_auth: bool) -> StepOutcome {
        let inner = &self.inner;
        let Some(url) = book.acquisition.direct_url.clone() else {
            self.report_failure(
                book,
                FulfillmentError::MissingAcquisition {
                    identifier: book.identifier.clone(),
                },
            )
            .await;
            return StepOutcome::Done;
        };
        let request = match inner.auth.bearer_token() {
            Some(token) => TransferRequest::bearer(url, &token),
            None => TransferRequest::new(url),
        };

        let cookies = inner.auth.cookies().filter(|cookies| !cookies.is_empty());
        if let Some(cookies) = cookies {
            let saml_started = inner.ledger.state(&book.identifier) == LoanState::SamlAuthStarted;
            match inner.saml.as_ref() {
                Some(saml) if !saml_started => {
                    return self
                        .intercept(saml.as_ref(), book, request, cookies, attempted_auth)
                        .await;
                }
                _ => self.install_cookies(&cookies),
            }
        }

        self.transfer(book, request, false).await;
        StepOutcome::Done
    }

    async fn intercept(
        &self,
        saml: &dyn SamlInterceptor,
        book: &Book,
        request: TransferRequest,
        cookies: Vec<SessionCookie>,
        attempted_auth: bool,
    ) -> StepOutcome {
        let inner = &self.inner;
        let identifier = book.identifier.as_str();
        inner
            .ledger
            .set_state(identifier, LoanState::SamlAuthStarted);
        inner.broadcaster.request_broadcast();

        match saml.intercept(request, cookies).await {
            SamlOutcome::Cancelled => {
                info!(identifier = %identifier, "SAML sign-in cancelled");
                if let Some(task) = inner.registry.remove(identifier) {
                    task.cancel();
                }
                inner.ledger.set_state(identifier, LoanState::DownloadNeeded);
                inner.broadcaster.request_broadcast();
                StepOutcome::Done
            }
            SamlOutcome::BookFound { request, cookies } => {
                debug!(identifier = %identifier, "SAML sign-in reached the book");
                inner.auth.set_cookies(cookies.clone());
                self.install_cookies(&cookies);
                self.transfer(book, request, true).await;
                StepOutcome::Done
            }
            SamlOutcome::Problem(problem) => {
                warn!(
                    identifier = %identifier,
                    problem = ?problem.as_ref().map(ToString::to_string),
                    "SAML sign-in reported a problem"
                );
                inner.ledger.set_state(identifier, LoanState::DownloadNeeded);
                inner.broadcaster.request_broadcast();
                self.reauthenticate_then_restart(book, false, attempted_auth)
                    .await
            }
        }
    }

    fn install_cookies(&self, cookies: &[SessionCookie]) {
        if let Err(error) = self.inner.client.replace_cookies(cookies) {
            warn!(error = %error, "failed to install session cookies; keeping previous client");
        }
    }

    /// Registers a task for `book` and drives its transfer.
    ///
    /// With `keep_request`, a start queued for capacity later replays
    /// `request` instead of starting over.
    async fn transfer(&self, book: &Book, request: TransferRequest, keep_request: bool) {
        let inner = &self.inner;
        let admission = self.admit(book, keep_request.then_some(&request));
        match admission {
            Admission::Duplicate => {
                debug!(identifier = %book.identifier, "task already registered; ignoring start");
            }
            Admission::Queued => {
                info!(identifier = %book.identifier, "at capacity; download queued");
            }
            Admission::Admitted { task_id, control } => {
                inner
                    .ledger
                    .set_state(&book.identifier, LoanState::Downloading);
                inner.broadcaster.request_broadcast();
                self.run_transfer(book, task_id, control, request).await;
            }
        }
    }

    fn admit(&self, book: &Book, resume_with: Option<&TransferRequest>) -> Admission {
        let inner = &self.inner;
        let mut pending = inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if inner.registry.get(&book.identifier).is_some() {
            return Admission::Duplicate;
        }
        if inner.registry.len() >= inner.max_concurrent {
            push_unique(&mut pending, book, resume_with);
            return Admission::Queued;
        }

        let task = inner.registry.new_task();
        let task_id = task.task_id();
        match inner.registry.insert(&book.identifier, task) {
            Ok(control) => Admission::Admitted { task_id, control },
            Err(_) => Admission::Duplicate,
        }
    }

    /// Adds `book` as `DownloadNeeded` unless another start got there first.
    ///
    /// Runs under the pending lock so it cannot interleave with [`Self::admit`].
    fn register_if_absent(&self, book: &Book) {
        let inner = &self.inner;
        let _pending = inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let identifier = book.identifier.as_str();
        if inner.registry.get(identifier).is_some()
            || inner.ledger.state(identifier) != LoanState::Unregistered
        {
            debug!(identifier = %identifier, "already registered");
            return;
        }
        let location = inner.ledger.location(identifier);
        inner
            .ledger
            .add_book(book, location, LoanState::DownloadNeeded, None);
    }

    fn enqueue_pending(&self, book: &Book) {
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        push_unique(&mut pending, book, None);
        info!(identifier = %book.identifier, queued = pending.len(), "download queued");
    }

    fn remove_pending(&self, identifier: &str) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|queued| queued.book.identifier != identifier);
    }

    /// Starts queued requests while capacity is free.
    fn dispatch_pending(&self) {
        let inner = &self.inner;
        let ready: Vec<PendingStart> = {
            let mut pending = inner
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let free = inner.max_concurrent.saturating_sub(inner.registry.len());
            let take = free.min(pending.len());
            pending.drain(..take).collect()
        };
        for PendingStart { book, request } in ready {
            debug!(identifier = %book.identifier, "dispatching queued download");
            match request {
                Some(request) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.transfer(&book, request, true).await });
                }
                None => {
                    self.start_download(book);
                }
            }
        }
    }

    /// Retires `task_id` and records a successful download.
    fn complete_download(&self, book: &Book, task_id: u64) {
        let inner = &self.inner;
        if inner
            .registry
            .remove_if_current(&book.identifier, task_id)
            .is_none()
        {
            debug!(identifier = %book.identifier, task_id, "task retired; dropping result");
            return;
        }
        inner
            .ledger
            .set_state(&book.identifier, LoanState::DownloadSuccessful);
        info!(identifier = %book.identifier, "download successful");
        inner.broadcaster.request_broadcast();
        self.dispatch_pending();
    }

    /// Retires `task_id` and records the failure.
    ///
    /// Results of retired tasks are dropped. A cancellation of a task that
    /// is still current (a DRM collaborator giving up on its own) returns
    /// the book to `DownloadNeeded` without an alert.
    async fn fail_download(&self, book: &Book, task_id: u64, error: FulfillmentError) {
        let inner = &self.inner;
        if inner
            .registry
            .remove_if_current(&book.identifier, task_id)
            .is_none()
        {
            debug!(
                identifier = %book.identifier,
                task_id,
                error = %error,
                "task retired; dropping failure"
            );
            return;
        }
        if error.is_cancelled() {
            info!(identifier = %book.identifier, task_id, "transfer cancelled");
            inner
                .ledger
                .set_state(&book.identifier, LoanState::DownloadNeeded);
            inner.broadcaster.request_broadcast();
        } else {
            self.report_failure(book, error).await;
        }
        self.dispatch_pending();
    }

    /// Records a failure for a book that has no task.
    async fn report_failure(&self, book: &Book, error: FulfillmentError) {
        let inner = &self.inner;
        let identifier = book.identifier.as_str();
        let problem = error.problem_document().cloned();
        warn!(identifier = %identifier, error = %error, "download failed");

        if problem
            .as_ref()
            .is_some_and(|doc| doc.is_type(TYPE_NO_ACTIVE_LOAN))
        {
            info!(identifier = %identifier, "loan no longer active; removing book");
            inner.ledger.remove_book(identifier);
        } else {
            inner.ledger.set_state(identifier, LoanState::DownloadFailed);
        }

        let alert = DownloadAlert::download_failed(&error.to_string(), problem);
        inner.broadcaster.publish(DownloadEvent::DownloadFailed {
            identifier: identifier.to_string(),
            alert,
        });
        inner.broadcaster.request_broadcast();

        if error.indicates_auth_refresh() || inner.auth.login_required() {
            let using_existing = inner.auth.has_credentials();
            if let Err(auth_error) = inner.auth.reauthenticate(using_existing).await {
                info!(identifier = %identifier, error = %auth_error, "re-authentication not completed");
            }
        }
    }

    fn publish_borrow_failure(&self, book: &Book, alert: DownloadAlert) {
        self.inner.broadcaster.publish(DownloadEvent::BorrowFailed {
            identifier: book.identifier.clone(),
            alert,
        });
    }
}

/// Queues `book` once; a later rewritten request replaces the queued one.
fn push_unique(
    pending: &mut VecDeque<PendingStart>,
    book: &Book,
    request: Option<&TransferRequest>,
) {
    if let Some(queued) = pending
        .iter_mut()
        .find(|queued| queued.book.identifier == book.identifier)
    {
        debug!(identifier = %book.identifier, "already queued");
        if request.is_some() {
            queued.request = request.cloned();
        }
    } else {
        pending.push_back(PendingStart {
            book: book.clone(),
            request: request.cloned(),
        });
    }
}
