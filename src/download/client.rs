//! HTTP client wrapper for acquisition transfers.
//!
//! This module provides the `HttpClient` struct which streams acquisition
//! payloads to disk. Redirects are walked manually so every hop passes the
//! [`RedirectGuard`], and transfers observe a cancellation token and a pause
//! switch between chunks.

use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::cookie::Jar;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, MAX_PROBLEM_DOCUMENT_BYTES, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use super::redirect::{RedirectDecision, RedirectGuard};
use crate::auth::{SessionCookie, load_cookies_into_jar};
use crate::problem::{ProblemDocument, is_problem_document_type};
use crate::user_agent;

/// A GET request for an acquisition link.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Target URL.
    pub url: Url,
    /// `Authorization` header value, if any (sensitive).
    pub authorization: Option<String>,
}

impl TransferRequest {
    /// Unauthenticated request.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            authorization: None,
        }
    }

    /// Request carrying `Authorization: Bearer <token>`.
    #[must_use]
    pub fn bearer(url: Url, token: &str) -> Self {
        Self {
            url,
            authorization: Some(format!("Bearer {token}")),
        }
    }

    /// Whether the request carries bearer credentials.
    #[must_use]
    pub fn has_bearer(&self) -> bool {
        self.authorization
            .as_deref()
            .is_some_and(|value| value.starts_with("Bearer"))
    }
}

// Custom Debug impl that redacts the authorization header.
impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("url", &self.url.as_str())
            .field(
                "authorization",
                &self.authorization.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Status line and headers of the final (post-redirect) response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// URL that produced the response.
    pub url: Url,
    /// HTTP status code.
    pub status: u16,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Declared body length.
    pub expected_bytes: Option<u64>,
}

/// Receives transfer callbacks in transport order.
pub trait TransferObserver: Send {
    /// Called once when a successful response starts. Returning
    /// [`ControlFlow::Break`] abandons the transfer.
    fn on_response(&mut self, head: &ResponseHead) -> ControlFlow<()>;

    /// Called after each chunk is written when the body length is known.
    fn on_progress(&mut self, written: u64, expected: u64);
}

/// Cancellation and pause signals for one transfer.
#[derive(Debug, Clone)]
pub struct TransferControl {
    cancel: CancellationToken,
    pause: watch::Receiver<bool>,
}

impl TransferControl {
    /// Creates a control from a task's cancellation token and pause switch.
    #[must_use]
    pub fn new(cancel: CancellationToken, pause: watch::Receiver<bool>) -> Self {
        Self { cancel, pause }
    }

    /// Control that can only be cancelled, never paused.
    #[must_use]
    pub fn unpaused(cancel: CancellationToken) -> Self {
        let (_tx, pause) = watch::channel(false);
        Self { cancel, pause }
    }

    /// The cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn wait_while_paused(&mut self, url: &str) -> Result<(), DownloadError> {
        let paused = *self.pause.borrow();
        if !paused {
            return Ok(());
        }
        debug!(url = %url, "transfer paused");
        tokio::select! {
            () = self.cancel.cancelled() => Err(DownloadError::cancelled(url)),
            _ = self.pause.wait_for(|paused| !*paused) => {
                debug!(url = %url, "transfer resumed");
                Ok(())
            }
        }
    }
}

/// Payload written to disk by [`HttpClient::fetch_to_file`].
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    /// File holding the body.
    pub path: PathBuf,
    /// Response metadata.
    pub head: ResponseHead,
    /// Bytes written.
    pub bytes: u64,
}

/// HTTP client for acquisition transfers.
///
/// The session cookie jar can be swapped at runtime; doing so rebuilds the
/// underlying client, which is cheap compared with a transfer.
#[derive(Debug)]
pub struct HttpClient {
    client: RwLock<Client>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a new HTTP client with explicit timeout values.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        let connect_timeout = Duration::from_secs(connect_timeout_secs);
        let read_timeout = Duration::from_secs(read_timeout_secs);
        let client = build_client(None, connect_timeout, read_timeout)
            .expect("failed to build HTTP client with static configuration");
        Self {
            client: RwLock::new(client),
            connect_timeout,
            read_timeout,
        }
    }

    /// Replaces the session cookies sent with every request.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the client cannot be rebuilt; the
    /// previous client stays in use.
    #[instrument(level = "debug", skip(self, cookies), fields(count = cookies.len()))]
    pub fn replace_cookies(&self, cookies: &[SessionCookie]) -> Result<(), reqwest::Error> {
        let jar = load_cookies_into_jar(cookies);
        let rebuilt = build_client(Some(jar), self.connect_timeout, self.read_timeout)?;
        *self
            .client
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = rebuilt;
        Ok(())
    }

    fn current(&self) -> Client {
        self.client
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Streams the response for `request` into `destination`.
    ///
    /// Redirects are counted against `task_id` in `guard`. Problem documents
    /// and non-success statuses are returned as errors without touching
    /// `destination`. A partially written file is removed on failure.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` if:
    /// - The request fails (network error, timeout)
    /// - A redirect is refused
    /// - The server returns a problem document or an error status
    /// - The observer rejects the response
    /// - The transfer is cancelled
    /// - Writing to disk fails
    #[instrument(skip(self, request, guard, control, observer), fields(url = %request.url))]
    pub async fn fetch_to_file(
        &self,
        task_id: u64,
        request: &TransferRequest,
        destination: &Path,
        guard: &RedirectGuard,
        control: &mut TransferControl,
        observer: &mut dyn TransferObserver,
    ) -> Result<FetchedPayload, DownloadError> {
        debug!("starting transfer");
        let response = self
            .send_following_redirects(task_id, request, guard, control.token())
            .await?;

        let head = ResponseHead {
            url: response.url().clone(),
            status: response.status().as_u16(),
            content_type: response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string),
            expected_bytes: response.content_length(),
        };

        if head
            .content_type
            .as_deref()
            .is_some_and(is_problem_document_type)
        {
            let document = read_problem_document(response, head.url.as_str()).await?;
            return Err(DownloadError::problem(head.url.as_str(), head.status, document));
        }

        if !response.status().is_success() {
            return Err(DownloadError::http_status(
                head.url.as_str(),
                head.status,
                head.content_type.clone(),
            ));
        }

        if observer.on_response(&head).is_break() {
            debug!(content_type = ?head.content_type, "observer rejected response");
            return Err(DownloadError::unsupported_content(
                head.url.as_str(),
                head.content_type.clone(),
            ));
        }

        let file = File::create(destination)
            .await
            .map_err(|e| DownloadError::io(destination, e))?;

        let stream_result = stream_to_file(
            file,
            response,
            head.url.as_str(),
            destination,
            head.expected_bytes,
            control,
            observer,
        )
        .await;

        let bytes = match stream_result {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!(path = %destination.display(), "cleaning up partial file after error");
                let _ = tokio::fs::remove_file(destination).await;
                return Err(error);
            }
        };

        info!(
            path = %destination.display(),
            bytes,
            content_type = ?head.content_type,
            "transfer complete"
        );

        Ok(FetchedPayload {
            path: destination.to_path_buf(),
            head,
            bytes,
        })
    }

    async fn send_following_redirects(
        &self,
        task_id: u64,
        request: &TransferRequest,
        guard: &RedirectGuard,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut current = request.url.clone();
        let mut authorization = request.authorization.clone();

        loop {
            let mut builder = self.current().get(current.clone());
            if let Some(value) = authorization.as_deref() {
                builder = builder.header(AUTHORIZATION, value);
            }

            let response = tokio::select! {
                () = cancel.cancelled() => return Err(DownloadError::cancelled(current.as_str())),
                result = builder.send() => {
                    result.map_err(|e| DownloadError::from_transport(current.as_str(), e))?
                }
            };

            if !response.status().is_redirection() {
                return Ok(response);
            }
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return Ok(response);
            };
            let next = current
                .join(location)
                .map_err(|_| DownloadError::invalid_url(location))?;

            match guard.evaluate(
                task_id,
                &request.url,
                request.authorization.as_deref(),
                &next,
            ) {
                RedirectDecision::Follow {
                    authorization: next_authorization,
                } => {
                    debug!(
                        from = %current,
                        to = %next,
                        authorized = next_authorization.is_some(),
                        "following redirect"
                    );
                    authorization = next_authorization;
                    current = next;
                }
                RedirectDecision::Refuse(reason) => {
                    warn!(from = %current, to = %next, reason = %reason, "redirect refused");
                    return Err(DownloadError::redirect_refused(current.as_str(), reason));
                }
            }
        }
    }
}

/// Streams response body to file, returning bytes written.
///
/// This is extracted to enable cleanup on error in the caller.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    expected: Option<u64>,
    control: &mut TransferControl,
    observer: &mut dyn TransferObserver,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    loop {
        control.wait_while_paused(url).await?;

        let next = tokio::select! {
            () = control.cancel.cancelled() => return Err(DownloadError::cancelled(url)),
            next = stream.next() => next,
        };
        let Some(chunk_result) = next else {
            break;
        };
        let chunk = chunk_result.map_err(|e| DownloadError::from_transport(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;

        bytes_written += chunk.len() as u64;
        if let Some(expected) = expected.filter(|len| *len > 0) {
            observer.on_progress(bytes_written, expected);
        }
    }

    // Ensure all data is flushed to disk
    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}

async fn read_problem_document(
    response: reqwest::Response,
    url: &str,
) -> Result<ProblemDocument, DownloadError> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DownloadError::from_transport(url, e))?;
        body.extend_from_slice(&chunk);
        if body.len() > MAX_PROBLEM_DOCUMENT_BYTES {
            warn!(url = %url, "problem document exceeds size limit; truncating");
            break;
        }
    }
    Ok(ProblemDocument::from_slice(&body).unwrap_or_else(|error| {
        warn!(url = %url, error = %error, "failed to parse problem document");
        ProblemDocument::default()
    }))
}

fn build_client(
    cookie_jar: Option<Arc<Jar>>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(read_timeout)
        .gzip(true)
        .redirect(Policy::none())
        .user_agent(user_agent::default_user_agent());
    if let Some(jar) = cookie_jar {
        builder = builder.cookie_provider(jar);
    }
    builder.build()
}
