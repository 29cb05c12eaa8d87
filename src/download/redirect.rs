//! Redirect policy for acquisition transfers.
//!
//! The HTTP client never follows redirects on its own. Every `3xx` goes
//! through [`RedirectGuard::evaluate`], which caps the number of hops per
//! task and decides whether a bearer `Authorization` header travels with
//! the redirected request.

use std::fmt;

use dashmap::DashMap;
use url::Url;

/// Maximum redirects followed for a single task.
pub const MAX_REDIRECT_ATTEMPTS: u32 = 10;

/// Why a redirect was not followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectRefusal {
    /// The task already used up its redirect budget.
    TooManyRedirects {
        /// Redirects followed before this one.
        attempts: u32,
    },
    /// A bearer-authorized request was redirected from HTTPS to plain HTTP.
    InsecureDowngrade {
        /// Scheme the redirect pointed at.
        scheme: String,
    },
}

impl fmt::Display for RedirectRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyRedirects { attempts } => {
                write!(f, "too many redirects ({attempts} already followed)")
            }
            Self::InsecureDowngrade { scheme } => {
                write!(f, "refusing to send bearer credentials over {scheme}")
            }
        }
    }
}

/// Outcome of evaluating one redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectDecision {
    /// Issue the redirected request with this `Authorization` value, if any.
    Follow {
        /// Header value to attach to the next request.
        authorization: Option<String>,
    },
    /// Abandon the task.
    Refuse(RedirectRefusal),
}

/// Decides how the `Authorization` header of `original` carries over to `next`.
///
/// Only bearer credentials are managed here. They are re-attached for the
/// same host, dropped for any other host, and the redirect is refused
/// outright when it would downgrade HTTPS to a non-HTTPS scheme.
#[must_use]
pub fn authorize_redirect(
    original: &Url,
    original_authorization: Option<&str>,
    next: &Url,
) -> RedirectDecision {
    let Some(bearer) = original_authorization.filter(|value| value.starts_with("Bearer")) else {
        return RedirectDecision::Follow {
            authorization: None,
        };
    };

    if original.host_str() != next.host_str() {
        return RedirectDecision::Follow {
            authorization: None,
        };
    }

    if original.scheme() == "https" && next.scheme() != "https" {
        return RedirectDecision::Refuse(RedirectRefusal::InsecureDowngrade {
            scheme: next.scheme().to_string(),
        });
    }

    RedirectDecision::Follow {
        authorization: Some(bearer.to_string()),
    }
}

/// Per-task redirect counters plus the authorization policy.
#[derive(Debug)]
pub struct RedirectGuard {
    attempts: DashMap<u64, u32>,
    max_attempts: u32,
}

impl Default for RedirectGuard {
    fn default() -> Self {
        Self::new(MAX_REDIRECT_ATTEMPTS)
    }
}

impl RedirectGuard {
    /// Creates a guard allowing `max_attempts` redirects per task.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: DashMap::new(),
            max_attempts,
        }
    }

    /// Counts a redirect for `task_id` and decides whether to follow it.
    #[must_use]
    pub fn evaluate(
        &self,
        task_id: u64,
        original: &Url,
        original_authorization: Option<&str>,
        next: &Url,
    ) -> RedirectDecision {
        {
            let mut count = self.attempts.entry(task_id).or_insert(0);
            if *count >= self.max_attempts {
                return RedirectDecision::Refuse(RedirectRefusal::TooManyRedirects {
                    attempts: *count,
                });
            }
            *count += 1;
        }
        authorize_redirect(original, original_authorization, next)
    }

    /// Redirects counted so far for a task.
    #[must_use]
    pub fn attempts(&self, task_id: u64) -> u32 {
        self.attempts.get(&task_id).map_or(0, |count| *count)
    }

    /// Drops the counter of a finished task.
    pub fn forget(&self, task_id: u64) {
        self.attempts.remove(&task_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_bearer_dropped_for_other_host() {
        let decision = authorize_redirect(
            &url("https://library.example/fulfill/1"),
            Some("Bearer abc"),
            &url("https://cdn.example/file.epub"),
        );
        assert_eq!(
            decision,
            RedirectDecision::Follow {
                authorization: None
            }
        );
    }

    #[test]
    fn test_bearer_kept_for_same_host() {
        let decision = authorize_redirect(
            &url("https://library.example/fulfill/1"),
            Some("Bearer abc"),
            &url("https://library.example/files/1.epub"),
        );
        assert_eq!(
            decision,
            RedirectDecision::Follow {
                authorization: Some("Bearer abc".to_string())
            }
        );
    }

    #[test]
    fn test_same_host_downgrade_refused() {
        let decision = authorize_redirect(
            &url("https://library.example/fulfill/1"),
            Some("Bearer abc"),
            &url("http://library.example/files/1.epub"),
        );
        assert!(matches!(
            decision,
            RedirectDecision::Refuse(RedirectRefusal::InsecureDowngrade { ref scheme }) if scheme == "http"
        ));
    }

    #[test]
    fn test_non_bearer_requests_follow_unmodified() {
        let original = url("https://library.example/a");
        let next = url("http://elsewhere.example/b");
        assert_eq!(
            authorize_redirect(&original, None, &next),
            RedirectDecision::Follow {
                authorization: None
            }
        );
        assert_eq!(
            authorize_redirect(&original, Some("Basic dXNlcjpwYXNz"), &next),
            RedirectDecision::Follow {
                authorization: None
            }
        );
    }

    #[test]
    fn test_eleventh_redirect_refused() {
        let guard = RedirectGuard::default();
        let a = url("https://library.example/a");
        for _ in 0..10 {
            assert!(matches!(
                guard.evaluate(1, &a, None, &a),
                RedirectDecision::Follow { .. }
            ));
        }
        assert_eq!(guard.attempts(1), 10);
        assert_eq!(
            guard.evaluate(1, &a, None, &a),
            RedirectDecision::Refuse(RedirectRefusal::TooManyRedirects { attempts: 10 })
        );
    }

    #[test]
    fn test_counters_are_per_task() {
        let guard = RedirectGuard::new(1);
        let a = url("https://library.example/a");
        assert!(matches!(
            guard.evaluate(1, &a, None, &a),
            RedirectDecision::Follow { .. }
        ));
        assert!(matches!(
            guard.evaluate(2, &a, None, &a),
            RedirectDecision::Follow { .. }
        ));
        assert!(matches!(
            guard.evaluate(1, &a, None, &a),
            RedirectDecision::Refuse(_)
        ));

        guard.forget(1);
        assert_eq!(guard.attempts(1), 0);
    }
}
