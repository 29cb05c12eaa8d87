//! Account authentication as seen by the coordinator.
//!
//! Credential storage and sign-in UI belong to the host application; this
//! module defines the [`Authenticator`] seam they sit behind, plus session
//! cookie handling for the HTTP client.

mod cookies;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

pub use cookies::{SessionCookie, load_cookies_into_jar};

/// Errors from a re-authentication attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The user dismissed the sign-in flow.
    #[error("sign-in cancelled")]
    Cancelled,

    /// The server rejected the credentials.
    #[error("sign-in rejected: {reason}")]
    Rejected {
        /// Server or user-facing reason.
        reason: String,
    },
}

/// Credentials and session state of the active account.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Whether credentials are stored for the account.
    fn has_credentials(&self) -> bool;

    /// Whether the library requires sign-in at all.
    fn needs_auth(&self) -> bool;

    /// Session bearer token used to authorize acquisition requests.
    fn bearer_token(&self) -> Option<String>;

    /// Stored session cookies, when sign-in went through a SAML provider.
    fn cookies(&self) -> Option<Vec<SessionCookie>>;

    /// Replaces the stored session cookies.
    fn set_cookies(&self, cookies: Vec<SessionCookie>);

    /// Runs the sign-in flow again.
    ///
    /// `using_existing` asks the implementation to retry with the stored
    /// credentials rather than prompting for new ones.
    async fn reauthenticate(&self, using_existing: bool) -> Result<(), AuthError>;

    /// Sign-in is required but nothing is stored.
    fn login_required(&self) -> bool {
        self.needs_auth() && !self.has_credentials()
    }
}

/// Authenticator with fixed answers, used by the CLI and in tests.
///
/// Every call to [`Authenticator::reauthenticate`] is counted. Whether it
/// succeeds is controlled by [`StaticAuthenticator::accept_reauth`]; a
/// successful attempt marks credentials as stored.
pub struct StaticAuthenticator {
    bearer: Option<String>,
    needs_auth: bool,
    has_credentials: AtomicBool,
    cookies: RwLock<Option<Vec<SessionCookie>>>,
    reauth_calls: AtomicUsize,
    accept_reauth: AtomicBool,
}

impl Default for StaticAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticAuthenticator {
    /// Account that needs no sign-in.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bearer: None,
            needs_auth: false,
            has_credentials: AtomicBool::new(false),
            cookies: RwLock::new(None),
            reauth_calls: AtomicUsize::new(0),
            accept_reauth: AtomicBool::new(true),
        }
    }

    /// Sets the session bearer token; implies stored credentials.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self.has_credentials.store(true, Ordering::SeqCst);
        self
    }

    /// Marks the library as requiring sign-in.
    #[must_use]
    pub fn with_needs_auth(mut self, needs_auth: bool) -> Self {
        self.needs_auth = needs_auth;
        self
    }

    /// Sets whether credentials are stored.
    #[must_use]
    pub fn with_credentials(self, has_credentials: bool) -> Self {
        self.has_credentials.store(has_credentials, Ordering::SeqCst);
        self
    }

    /// Seeds session cookies.
    #[must_use]
    pub fn with_cookies(self, cookies: Vec<SessionCookie>) -> Self {
        self.set_cookies(cookies);
        self
    }

    /// Controls whether later sign-in attempts succeed.
    pub fn accept_reauth(&self, accept: bool) {
        self.accept_reauth.store(accept, Ordering::SeqCst);
    }

    /// Number of sign-in attempts so far.
    #[must_use]
    pub fn reauth_calls(&self) -> usize {
        self.reauth_calls.load(Ordering::SeqCst)
    }
}

// Custom Debug impl that redacts the bearer token.
impl fmt::Debug for StaticAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAuthenticator")
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .field("needs_auth", &self.needs_auth)
            .field("has_credentials", &self.has_credentials())
            .field("reauth_calls", &self.reauth_calls())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    fn has_credentials(&self) -> bool {
        self.has_credentials.load(Ordering::SeqCst)
    }

    fn needs_auth(&self) -> bool {
        self.needs_auth
    }

    fn bearer_token(&self) -> Option<String> {
        self.bearer.clone()
    }

    fn cookies(&self) -> Option<Vec<SessionCookie>> {
        self.cookies
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_cookies(&self, cookies: Vec<SessionCookie>) {
        debug!(count = cookies.len(), "storing session cookies");
        *self
            .cookies
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(cookies);
    }

    async fn reauthenticate(&self, using_existing: bool) -> Result<(), AuthError> {
        let attempt = self.reauth_calls.fetch_add(1, Ordering::SeqCst) + 1;
        info!(attempt, using_existing, "re-authentication requested");
        if self.accept_reauth.load(Ordering::SeqCst) {
            self.has_credentials.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(AuthError::Cancelled)
        }
    }
}
