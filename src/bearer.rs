//! Simplified bearer-token documents.
//!
//! A bearer-token acquisition answers with a small JSON document naming the
//! real payload location and a short-lived token to fetch it with.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Errors from parsing a bearer-token document.
#[derive(Debug, Error)]
pub enum BearerTokenError {
    /// The document is not valid JSON or misses a field.
    #[error("malformed bearer token document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The `location` field is not an absolute URL.
    #[error("bearer token location is not a valid URL: {location}")]
    InvalidLocation {
        /// The rejected value.
        location: String,
    },
}

#[derive(Deserialize)]
struct RawBearerToken {
    access_token: String,
    location: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// A parsed bearer-token document.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    /// Token sent as `Authorization: Bearer <token>`.
    pub access_token: String,
    /// Where the payload lives.
    pub location: Url,
    /// Token lifetime in seconds, when declared.
    pub expires_in: Option<u64>,
}

impl BearerToken {
    /// Parses a bearer-token document.
    ///
    /// # Errors
    ///
    /// Returns [`BearerTokenError`] when the JSON is malformed or the
    /// location is not a URL.
    pub fn from_slice(body: &[u8]) -> Result<Self, BearerTokenError> {
        let raw: RawBearerToken = serde_json::from_slice(body)?;
        let location = Url::parse(&raw.location).map_err(|_| BearerTokenError::InvalidLocation {
            location: raw.location.clone(),
        })?;
        Ok(Self {
            access_token: raw.access_token,
            location,
            expires_in: raw.expires_in,
        })
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("access_token", &"[REDACTED]")
            .field("location", &self.location.as_str())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}
