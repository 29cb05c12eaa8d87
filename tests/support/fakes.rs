//! Scripted collaborators for driving the coordinator in tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fulfillment_core::drm::{
    AdobeFulfiller, AdobeFulfillment, DrmError, LcpFulfiller, LcpFulfillment, ProgressCallback,
    SamlInterceptor, SamlOutcome,
};
use fulfillment_core::download::TransferRequest;
use fulfillment_core::loans::{LoanError, LoanService};
use fulfillment_core::{Book, Ledger, LoanState, ProblemDocument, SessionCookie};
use tokio_util::sync::CancellationToken;

/// Problem-document loan error of the given type.
pub fn problem(problem_type: &str, detail: &str) -> LoanError {
    LoanError::Problem(ProblemDocument {
        problem_type: Some(problem_type.to_string()),
        detail: Some(detail.to_string()),
        ..ProblemDocument::default()
    })
}

/// Polls `ledger` until `identifier` reaches `state`.
pub async fn wait_for_state(ledger: &dyn Ledger, identifier: &str, state: LoanState) {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while ledger.state(identifier) != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "Expected {state} for {identifier}, found {}",
        ledger.state(identifier)
    );
}

/// Circulation service answering from scripted queues.
///
/// Borrow answers are consumed in order; an exhausted queue answers with
/// the book unchanged. Revoke answers work the same way and default to
/// success.
#[derive(Default)]
pub struct ScriptedLoans {
    borrows: Mutex<VecDeque<Result<Book, LoanError>>>,
    revokes: Mutex<VecDeque<Result<(), LoanError>>>,
    borrow_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
}

impl ScriptedLoans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_borrow(self, answer: Result<Book, LoanError>) -> Self {
        self.borrows.lock().unwrap().push_back(answer);
        self
    }

    pub fn then_revoke(self, answer: Result<(), LoanError>) -> Self {
        self.revokes.lock().unwrap().push_back(answer);
        self
    }

    pub fn borrow_calls(&self) -> usize {
        self.borrow_calls.load(Ordering::SeqCst)
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoanService for ScriptedLoans {
    async fn borrow(&self, book: &Book) -> Result<Book, LoanError> {
        self.borrow_calls.fetch_add(1, Ordering::SeqCst);
        self.borrows
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(book.clone()))
    }

    async fn revoke(&self, _book: &Book) -> Result<(), LoanError> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        self.revokes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// Adobe collaborator that "decrypts" by writing fixed bytes.
pub struct FakeAdobe {
    work_dir: PathBuf,
    content: Vec<u8>,
    fulfillment_id: Option<String>,
    returnable: bool,
    received: Mutex<Vec<Vec<u8>>>,
    returned: Mutex<Vec<String>>,
}

impl FakeAdobe {
    pub fn new(work_dir: &Path, content: &[u8]) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            content: content.to_vec(),
            fulfillment_id: Some("urn:uuid:adobe-loan".to_string()),
            returnable: true,
            received: Mutex::new(Vec::new()),
            returned: Mutex::new(Vec::new()),
        }
    }

    pub fn not_returnable(mut self) -> Self {
        self.returnable = false;
        self
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    pub fn returned(&self) -> Vec<String> {
        self.returned.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdobeFulfiller for FakeAdobe {
    async fn fulfill(
        &self,
        identifier: &str,
        acsm: &[u8],
        _cancel: CancellationToken,
    ) -> Result<AdobeFulfillment, DrmError> {
        self.received.lock().unwrap().push(acsm.to_vec());
        let content_path = self.work_dir.join(format!("adobe-{}.epub", identifier.len()));
        tokio::fs::write(&content_path, &self.content)
            .await
            .map_err(|e| DrmError::failed(e.to_string()))?;
        Ok(AdobeFulfillment {
            content_path,
            rights: b"<rights/>".to_vec(),
            fulfillment_id: self.fulfillment_id.clone(),
            returnable: self.returnable,
        })
    }

    async fn return_loan(&self, fulfillment_id: &str) -> Result<(), DrmError> {
        self.returned
            .lock()
            .unwrap()
            .push(fulfillment_id.to_string());
        Ok(())
    }
}

/// LCP collaborator that writes fixed publication bytes.
pub struct FakeLcp {
    work_dir: PathBuf,
    publication: Vec<u8>,
    licenses: Mutex<Vec<Vec<u8>>>,
    extracted: Mutex<Vec<PathBuf>>,
    fail_with: Option<DrmError>,
}

impl FakeLcp {
    pub fn new(work_dir: &Path, publication: &[u8]) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            publication: publication.to_vec(),
            licenses: Mutex::new(Vec::new()),
            extracted: Mutex::new(Vec::new()),
            fail_with: None,
        }
    }

    pub fn failing(mut self, error: DrmError) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub fn licenses(&self) -> Vec<Vec<u8>> {
        self.licenses.lock().unwrap().clone()
    }

    pub fn extracted(&self) -> Vec<PathBuf> {
        self.extracted.lock().unwrap().clone()
    }
}

#[async_trait]
impl LcpFulfiller for FakeLcp {
    async fn fulfill(
        &self,
        license: &Path,
        progress: ProgressCallback,
        _cancel: CancellationToken,
    ) -> Result<LcpFulfillment, DrmError> {
        let body = tokio::fs::read(license)
            .await
            .map_err(|e| DrmError::failed(e.to_string()))?;
        self.licenses.lock().unwrap().push(body);
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        progress(0.5);
        let content_path = self.work_dir.join("lcp-publication.bin");
        tokio::fs::write(&content_path, &self.publication)
            .await
            .map_err(|e| DrmError::failed(e.to_string()))?;
        progress(1.0);
        Ok(LcpFulfillment {
            content_path,
            license_id: Some("lcp-license-1".to_string()),
        })
    }

    async fn extract_pdf(&self, content: &Path) -> Result<(), DrmError> {
        self.extracted.lock().unwrap().push(content.to_path_buf());
        Ok(())
    }
}

/// SAML interceptor answering from a script; the last answer repeats.
pub struct ScriptedSaml {
    outcomes: Mutex<VecDeque<SamlOutcome>>,
    calls: AtomicUsize,
    seen_cookies: Mutex<Vec<Vec<SessionCookie>>>,
    delay: Duration,
}

impl ScriptedSaml {
    pub fn new(outcomes: Vec<SamlOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
            seen_cookies: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Makes every interception take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_cookies(&self) -> Vec<Vec<SessionCookie>> {
        self.seen_cookies.lock().unwrap().clone()
    }
}

#[async_trait]
impl SamlInterceptor for ScriptedSaml {
    async fn intercept(
        &self,
        _request: TransferRequest,
        cookies: Vec<SessionCookie>,
    ) -> SamlOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_cookies.lock().unwrap().push(cookies);
        tokio::time::sleep(self.delay).await;
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.len() > 1 {
            outcomes.pop_front().unwrap_or(SamlOutcome::Cancelled)
        } else {
            outcomes.front().cloned().unwrap_or(SamlOutcome::Cancelled)
        }
    }
}
