//! Integration tests for borrowing, sign-in, SAML interception and returns.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fulfillment_core::coordinator::{CoordinatorBuilder, FulfillmentCoordinator};
use fulfillment_core::download::TransferRequest;
use fulfillment_core::drm::SamlOutcome;
use fulfillment_core::locator::{StorageKind, content_path};
use fulfillment_core::problem::{
    TYPE_INVALID_CREDENTIALS, TYPE_LOAN_ALREADY_EXISTS, TYPE_NO_ACTIVE_LOAN,
};
use fulfillment_core::progress::{BORROW_FAILED_TITLE, RETURN_FAILED_TITLE};
use fulfillment_core::rights::mime;
use fulfillment_core::{
    AcquisitionDescriptor, Availability, Book, ContentFormat, DownloadAlert, DownloadEvent,
    EngineConfig, InMemoryLedger, Ledger, LoanState, SessionCookie, StaticAuthenticator,
};
use tempfile::TempDir;
use tokio::sync::broadcast;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::fakes::{FakeAdobe, ScriptedLoans, ScriptedSaml, problem, wait_for_state};
use support::socket_guard::start_mock_server_or_skip;

const EPUB_BYTES: &[u8] = b"PK\x03\x04 borrowed epub";

struct Harness {
    dir: TempDir,
    ledger: Arc<InMemoryLedger>,
    auth: Arc<StaticAuthenticator>,
    coordinator: FulfillmentCoordinator,
}

impl Harness {
    fn content_file(&self, account: &str, identifier: &str) -> PathBuf {
        content_path(
            &self.dir.path().join(account).join("content"),
            identifier,
            StorageKind::Standard,
        )
    }
}

fn harness(
    auth: StaticAuthenticator,
    collaborators: impl FnOnce(CoordinatorBuilder) -> CoordinatorBuilder,
) -> Harness {
    harness_with(auth, |config| config, collaborators)
}

fn harness_with(
    auth: StaticAuthenticator,
    configure: impl FnOnce(EngineConfig) -> EngineConfig,
    collaborators: impl FnOnce(CoordinatorBuilder) -> CoordinatorBuilder,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(InMemoryLedger::new());
    let auth = Arc::new(auth);
    let config = configure(EngineConfig {
        progress_debounce: Duration::from_millis(10),
        ..EngineConfig::new(dir.path())
    });
    let builder = FulfillmentCoordinator::builder(config, ledger.clone(), auth.clone());
    let coordinator = collaborators(builder).build().unwrap();
    Harness {
        dir,
        ledger,
        auth,
        coordinator,
    }
}

fn url(raw: &str) -> Url {
    raw.parse().unwrap()
}

fn borrowable(identifier: &str, availability: Availability) -> Book {
    Book::new(
        identifier,
        "The Odyssey",
        ContentFormat::Epub,
        AcquisitionDescriptor::borrowable(url("https://circ.example.com/borrow"), availability),
    )
}

/// The book as the circulation server describes it after a borrow.
fn on_loan(book: &Book, server: &MockServer, availability: Availability) -> Book {
    let mut borrowed = book.clone();
    borrowed.acquisition.borrow_url = None;
    borrowed.acquisition.direct_url = Some(url(&format!("{}/loan.epub", server.uri())));
    borrowed.acquisition.availability = availability;
    borrowed.revoke_url = Some(url("https://circ.example.com/revoke"));
    borrowed
}

async fn mount_epub(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/loan.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(EPUB_BYTES, mime::EPUB_ZIP))
        .mount(server)
        .await;
}

fn alerts(events: &mut broadcast::Receiver<DownloadEvent>) -> Vec<(&'static str, DownloadAlert)> {
    let mut found = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            DownloadEvent::DownloadFailed { alert, .. } => found.push(("download", alert)),
            DownloadEvent::BorrowFailed { alert, .. } => found.push(("borrow", alert)),
            DownloadEvent::ReturnFailed { alert, .. } => found.push(("return", alert)),
            DownloadEvent::CenterChanged { .. } => {}
        }
    }
    found
}

// ---- Borrowing ----

#[tokio::test]
async fn test_borrow_then_download() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let book = borrowable("o-1", Availability::Limited);
    let loans = Arc::new(
        ScriptedLoans::new().then_borrow(Ok(on_loan(&book, &server, Availability::Limited))),
    );
    let h = harness(StaticAuthenticator::new(), {
        let loans = loans.clone();
        move |builder| builder.loan_service(loans)
    });

    h.coordinator.start_download(book).await.unwrap();

    assert_eq!(loans.borrow_calls(), 1);
    assert_eq!(h.ledger.state("o-1"), LoanState::DownloadSuccessful);
    assert!(
        h.ledger
            .history("o-1")
            .starts_with(&[LoanState::DownloadNeeded, LoanState::Downloading])
    );
    assert_eq!(
        std::fs::read(h.content_file("default", "o-1")).unwrap(),
        EPUB_BYTES
    );
}

#[tokio::test]
async fn test_borrow_of_reserved_book_ends_holding() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let book = borrowable("o-2", Availability::Reserved);
    let loans = Arc::new(
        ScriptedLoans::new().then_borrow(Ok(on_loan(&book, &server, Availability::Reserved))),
    );
    let h = harness(StaticAuthenticator::new(), move |b| b.loan_service(loans));

    h.coordinator.start_download(book).await.unwrap();

    assert_eq!(h.ledger.state("o-2"), LoanState::Holding);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_borrow_of_existing_loan_reports_already_on_loan() {
    let book = borrowable("o-3", Availability::Limited);
    let loans = Arc::new(
        ScriptedLoans::new().then_borrow(Err(problem(TYPE_LOAN_ALREADY_EXISTS, "exists"))),
    );
    let h = harness(StaticAuthenticator::new(), move |b| b.loan_service(loans));
    let mut events = h.coordinator.subscribe();

    h.coordinator.start_download(book).await.unwrap();

    let found = alerts(&mut events);
    assert_eq!(found.len(), 1);
    let (kind, alert) = &found[0];
    assert_eq!(*kind, "borrow");
    assert_eq!(alert.title, BORROW_FAILED_TITLE);
    assert!(
        alert.message.contains("already checked out"),
        "Expected already-on-loan message in: {}",
        alert.message
    );
    assert_eq!(h.ledger.state("o-3"), LoanState::Unregistered);
}

#[tokio::test]
async fn test_borrow_with_invalid_credentials_signs_in_and_retries_once() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let book = borrowable("o-4", Availability::Limited);
    let loans = Arc::new(
        ScriptedLoans::new()
            .then_borrow(Err(problem(TYPE_INVALID_CREDENTIALS, "bad pin")))
            .then_borrow(Ok(on_loan(&book, &server, Availability::Limited))),
    );
    let h = harness(StaticAuthenticator::new(), {
        let loans = loans.clone();
        move |builder| builder.loan_service(loans)
    });

    h.coordinator.start_download(book).await.unwrap();

    assert_eq!(h.auth.reauth_calls(), 1);
    assert_eq!(loans.borrow_calls(), 2);
    assert_eq!(h.ledger.state("o-4"), LoanState::DownloadSuccessful);
}

#[tokio::test]
async fn test_borrow_with_invalid_credentials_twice_alerts() {
    let book = borrowable("o-5", Availability::Limited);
    let loans = Arc::new(
        ScriptedLoans::new()
            .then_borrow(Err(problem(TYPE_INVALID_CREDENTIALS, "bad pin")))
            .then_borrow(Err(problem(TYPE_INVALID_CREDENTIALS, "still bad"))),
    );
    let h = harness(StaticAuthenticator::new(), {
        let loans = loans.clone();
        move |builder| builder.loan_service(loans)
    });
    let mut events = h.coordinator.subscribe();

    h.coordinator.start_download(book).await.unwrap();

    assert_eq!(h.auth.reauth_calls(), 1);
    assert_eq!(loans.borrow_calls(), 2);
    let found = alerts(&mut events);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].1.message, "still bad");
}

#[tokio::test]
async fn test_borrow_without_circulation_service_alerts() {
    let h = harness(StaticAuthenticator::new(), |b| b);
    let mut events = h.coordinator.subscribe();

    h.coordinator
        .start_download(borrowable("o-6", Availability::Limited))
        .await
        .unwrap();

    let found = alerts(&mut events);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, "borrow");
    assert_eq!(
        found[0].1.message,
        "Borrowing The Odyssey could not be completed."
    );
}

// ---- Sign-in ----

#[tokio::test]
async fn test_login_required_signs_in_before_download() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let h = harness(StaticAuthenticator::new().with_needs_auth(true), |b| b);

    let book = Book::new(
        "s-1",
        "Open Title",
        ContentFormat::Epub,
        AcquisitionDescriptor::open_access(url(&format!("{}/loan.epub", server.uri()))),
    );
    h.coordinator.start_download(book).await.unwrap();

    assert_eq!(h.auth.reauth_calls(), 1);
    assert_eq!(h.ledger.state("s-1"), LoanState::DownloadSuccessful);
}

#[tokio::test]
async fn test_dismissed_sign_in_abandons_download() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let auth = StaticAuthenticator::new().with_needs_auth(true);
    auth.accept_reauth(false);
    let h = harness(auth, |b| b);

    let book = Book::new(
        "s-2",
        "Open Title",
        ContentFormat::Epub,
        AcquisitionDescriptor::open_access(url(&format!("{}/loan.epub", server.uri()))),
    );
    h.coordinator.start_download(book).await.unwrap();

    assert_eq!(h.auth.reauth_calls(), 1);
    assert_eq!(h.ledger.state("s-2"), LoanState::Unregistered);
    assert!(server.received_requests().await.unwrap().is_empty());
}

// ---- SAML ----

fn session_cookie() -> SessionCookie {
    SessionCookie::new(
        "127.0.0.1".to_string(),
        "/".to_string(),
        false,
        0,
        "SESSION".to_string(),
        "idp-session".to_string(),
    )
}

fn open_book(identifier: &str, server: &MockServer) -> Book {
    Book::new(
        identifier,
        "Saml Title",
        ContentFormat::Epub,
        AcquisitionDescriptor::open_access(url(&format!("{}/loan.epub", server.uri()))),
    )
}

#[tokio::test]
async fn test_saml_book_found_downloads_with_new_cookies() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let refreshed = vec![session_cookie()];
    let saml = Arc::new(ScriptedSaml::new(vec![SamlOutcome::BookFound {
        request: TransferRequest::new(url(&format!("{}/loan.epub", server.uri()))),
        cookies: refreshed.clone(),
    }]));
    let auth = StaticAuthenticator::new().with_cookies(vec![session_cookie()]);
    let h = harness(auth, {
        let saml = saml.clone();
        move |builder| builder.saml(saml)
    });

    h.coordinator
        .start_download(open_book("m-1", &server))
        .await
        .unwrap();

    assert_eq!(saml.calls(), 1);
    assert_eq!(h.ledger.state("m-1"), LoanState::DownloadSuccessful);
    assert!(
        h.ledger
            .history("m-1")
            .contains(&LoanState::SamlAuthStarted)
    );
    let received = server.received_requests().await.unwrap();
    let cookie = received[0].headers.get("cookie").unwrap().to_str().unwrap();
    assert!(cookie.contains("SESSION=idp-session"), "Expected cookie in: {cookie}");
}

#[tokio::test]
async fn test_saml_book_found_at_capacity_replays_rewritten_request() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/slow.epub"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(EPUB_BYTES, mime::EPUB_ZIP)
                .set_delay(Duration::from_millis(600)),
        )
        .mount(&server)
        .await;
    mount_epub(&server).await;
    let saml = Arc::new(
        ScriptedSaml::new(vec![SamlOutcome::BookFound {
            request: TransferRequest::new(url(&format!("{}/loan.epub", server.uri()))),
            cookies: vec![session_cookie()],
        }])
        .with_delay(Duration::from_millis(300)),
    );
    let auth = StaticAuthenticator::new().with_cookies(vec![session_cookie()]);
    let h = harness_with(
        auth,
        |config| EngineConfig {
            max_concurrent_downloads: 1,
            ..config
        },
        {
            let saml = saml.clone();
            move |builder| builder.saml(saml)
        },
    );

    let mut signing_in = open_book("m-4", &server);
    signing_in.acquisition.direct_url = Some(url(&format!("{}/original", server.uri())));
    let mut signed_in = open_book("m-5", &server);
    signed_in.acquisition.direct_url = Some(url(&format!("{}/slow.epub", server.uri())));
    h.ledger
        .add_book(&signed_in, None, LoanState::SamlAuthStarted, None);

    let intercepted = h.coordinator.start_download(signing_in);
    wait_for_state(h.ledger.as_ref(), "m-4", LoanState::SamlAuthStarted).await;
    let running = h.coordinator.start_download(signed_in);
    wait_for_state(h.ledger.as_ref(), "m-5", LoanState::Downloading).await;

    intercepted.await.unwrap();
    assert_eq!(h.coordinator.queued(), 1);

    running.await.unwrap();
    wait_for_state(h.ledger.as_ref(), "m-4", LoanState::DownloadSuccessful).await;
    assert_eq!(saml.calls(), 1);
    let received = server.received_requests().await.unwrap();
    assert!(
        received.iter().all(|r| r.url.path() != "/original"),
        "queued start must replay the rewritten request"
    );
}

#[tokio::test]
async fn test_saml_cancel_returns_book_to_download_needed() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let saml = Arc::new(ScriptedSaml::new(vec![SamlOutcome::Cancelled]));
    let auth = StaticAuthenticator::new().with_cookies(vec![session_cookie()]);
    let h = harness(auth, move |b| b.saml(saml));

    h.coordinator
        .start_download(open_book("m-2", &server))
        .await
        .unwrap();

    assert_eq!(h.ledger.state("m-2"), LoanState::DownloadNeeded);
    assert_eq!(h.coordinator.in_flight(), 0);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_saml_problem_signs_in_and_retries_once() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let saml = Arc::new(ScriptedSaml::new(vec![SamlOutcome::Problem(None)]));
    let auth = StaticAuthenticator::new().with_cookies(vec![session_cookie()]);
    let h = harness(auth, {
        let saml = saml.clone();
        move |builder| builder.saml(saml)
    });

    h.coordinator
        .start_download(open_book("m-3", &server))
        .await
        .unwrap();

    assert_eq!(h.auth.reauth_calls(), 1);
    assert_eq!(saml.calls(), 2);
    assert_eq!(h.ledger.state("m-3"), LoanState::DownloadNeeded);
}

// ---- Returns ----

async fn downloaded_loan(h: &Harness, server: &MockServer, identifier: &str) -> Book {
    let mut book = open_book(identifier, server);
    book.revoke_url = Some(url("https://circ.example.com/revoke"));
    h.coordinator.start_download(book.clone()).await.unwrap();
    assert_eq!(h.ledger.state(identifier), LoanState::DownloadSuccessful);
    book
}

#[tokio::test]
async fn test_return_revokes_loan_and_deletes_content() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let loans = Arc::new(ScriptedLoans::new());
    let h = harness(StaticAuthenticator::new(), {
        let loans = loans.clone();
        move |builder| builder.loan_service(loans)
    });
    downloaded_loan(&h, &server, "r-1").await;
    let content = h.content_file("default", "r-1");
    assert!(content.exists());

    h.coordinator.return_book("r-1").await.unwrap();

    assert_eq!(loans.revoke_calls(), 1);
    assert!(h.ledger.book("r-1").is_none());
    assert!(!content.exists());
}

#[tokio::test]
async fn test_return_treats_missing_loan_as_returned() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let loans = Arc::new(
        ScriptedLoans::new().then_revoke(Err(problem(TYPE_NO_ACTIVE_LOAN, "no loan"))),
    );
    let h = harness(StaticAuthenticator::new(), move |b| b.loan_service(loans));
    downloaded_loan(&h, &server, "r-2").await;

    h.coordinator.return_book("r-2").await.unwrap();

    assert!(h.ledger.book("r-2").is_none());
}

#[tokio::test]
async fn test_return_with_invalid_credentials_signs_in_and_retries() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let loans = Arc::new(
        ScriptedLoans::new().then_revoke(Err(problem(TYPE_INVALID_CREDENTIALS, "expired"))),
    );
    let h = harness(StaticAuthenticator::new(), {
        let loans = loans.clone();
        move |builder| builder.loan_service(loans)
    });
    downloaded_loan(&h, &server, "r-3").await;

    h.coordinator.return_book("r-3").await.unwrap();

    assert_eq!(h.auth.reauth_calls(), 1);
    assert_eq!(loans.revoke_calls(), 2);
    assert!(h.ledger.book("r-3").is_none());
}

#[tokio::test]
async fn test_failed_return_keeps_book_and_alerts() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let loans = Arc::new(ScriptedLoans::new().then_revoke(Err(
        fulfillment_core::loans::LoanError::Transport {
            reason: "offline".to_string(),
        },
    )));
    let h = harness(StaticAuthenticator::new(), move |b| b.loan_service(loans));
    downloaded_loan(&h, &server, "r-4").await;
    let mut events = h.coordinator.subscribe();

    h.coordinator.return_book("r-4").await.unwrap();

    assert_eq!(h.ledger.state("r-4"), LoanState::DownloadSuccessful);
    assert!(h.content_file("default", "r-4").exists());
    let found = alerts(&mut events);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, "return");
    assert_eq!(found[0].1.title, RETURN_FAILED_TITLE);
}

#[tokio::test]
async fn test_return_without_revoke_link_forgets_book() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let h = harness(StaticAuthenticator::new(), |b| b);
    let book = open_book("r-5", &server);
    h.coordinator.start_download(book).await.unwrap();

    h.coordinator.return_book("r-5").await.unwrap();

    assert!(h.ledger.book("r-5").is_none());
    assert!(!h.content_file("default", "r-5").exists());
}

#[tokio::test]
async fn test_return_hands_adobe_loan_back() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/loan.epub"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(&b"<fulfillmentToken/>"[..], mime::ADOBE_ADEPT),
        )
        .mount(&server)
        .await;
    let work = TempDir::new().unwrap();
    let adobe = Arc::new(FakeAdobe::new(work.path(), b"decrypted"));
    let h = harness(StaticAuthenticator::new(), {
        let adobe = adobe.clone();
        move |builder| builder.adobe(adobe)
    });
    h.coordinator
        .start_download(open_book("r-6", &server))
        .await
        .unwrap();
    assert_eq!(h.ledger.state("r-6"), LoanState::DownloadSuccessful);

    h.coordinator.return_book("r-6").await.unwrap();

    assert_eq!(adobe.returned(), vec!["urn:uuid:adobe-loan".to_string()]);
    assert!(h.ledger.book("r-6").is_none());
    let mut rights = h.content_file("default", "r-6").into_os_string();
    rights.push("_rights.xml");
    assert!(!PathBuf::from(rights).exists());
}

#[tokio::test]
async fn test_return_cancels_transfer_in_flight() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/loan.epub"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(EPUB_BYTES, mime::EPUB_ZIP)
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    let h = harness(StaticAuthenticator::new(), |b| b);
    let handle = h.coordinator.start_download(open_book("r-7", &server));
    wait_for_state(h.ledger.as_ref(), "r-7", LoanState::Downloading).await;

    h.coordinator.return_book("r-7").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("transfer should stop after return")
        .unwrap();

    assert_eq!(h.coordinator.in_flight(), 0);
    assert!(h.ledger.book("r-7").is_none());
}

// ---- Account maintenance ----

#[tokio::test]
async fn test_reset_deletes_account_content() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let h = harness(StaticAuthenticator::new(), |b| b);
    h.coordinator
        .start_download(open_book("x-1", &server))
        .await
        .unwrap();
    assert!(h.content_file("default", "x-1").exists());

    h.coordinator.reset().await;

    assert!(!h.dir.path().join("default").join("content").exists());
    assert_eq!(h.coordinator.in_flight(), 0);
}

#[tokio::test]
async fn test_switch_account_stores_content_separately() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_epub(&server).await;
    let h = harness(StaticAuthenticator::new(), |b| b);
    h.coordinator
        .start_download(open_book("x-2", &server))
        .await
        .unwrap();

    h.coordinator.switch_account("second");
    h.coordinator
        .start_download(open_book("x-3", &server))
        .await
        .unwrap();

    assert!(h.content_file("default", "x-2").exists());
    assert!(h.content_file("second", "x-3").exists());
    assert!(!h.content_file("second", "x-2").exists());
}

#[tokio::test]
async fn test_delete_local_content_tolerates_missing_files() {
    let h = harness(StaticAuthenticator::new(), |b| b);
    h.coordinator.delete_local_content("never-downloaded").await;
    assert!(h.ledger.is_empty());
}
