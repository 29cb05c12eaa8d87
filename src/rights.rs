//! Rights-management classification of acquisition responses.
//!
//! The first response of every acquisition task carries a content type that
//! decides which fulfillment path the payload takes. [`RightsClassifier`] is
//! the single place that mapping lives.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known content types recognised by the classifier.
pub mod mime {
    /// Adobe ADEPT fulfillment token (ACSM).
    pub const ADOBE_ADEPT: &str = "application/vnd.adobe.adept+xml";
    /// Readium LCP license document.
    pub const READIUM_LCP: &str = "application/vnd.readium.lcp.license.v1.0+json";
    /// Unprotected EPUB.
    pub const EPUB_ZIP: &str = "application/epub+zip";
    /// Library Simplified bearer-token document.
    pub const BEARER_TOKEN: &str = "application/vnd.librarysimplified.bearer-token+json";
    /// Overdrive audiobook manifest.
    pub const OVERDRIVE_MANIFEST: &str = "application/json";
    /// PDF payload.
    pub const PDF: &str = "application/pdf";
    /// Readium web publication manifest for audiobooks.
    pub const AUDIOBOOK_JSON: &str = "application/audiobook+json";
}

/// Content types that may arrive on an acquisition path without any
/// rights management wrapped around them.
pub const DEFAULT_SUPPORTED_TYPES: &[&str] = &[
    mime::EPUB_ZIP,
    mime::PDF,
    mime::AUDIOBOOK_JSON,
    mime::ADOBE_ADEPT,
    mime::READIUM_LCP,
    mime::BEARER_TOKEN,
    "application/kepub+zip",
    "application/x-mobipocket-ebook",
    "application/vnd.overdrive.circulation.api+json",
    "application/vnd.librarysimplified.axisnow+json",
    "application/vnd.librarysimplified.findaway.license+json",
];

/// Protection or indirection scheme a downloaded payload requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RightsManagementKind {
    /// No DRM: the payload is the content itself.
    None,
    /// Adobe ADEPT fulfillment token.
    AdobeAdept,
    /// Readium LCP license.
    ReadiumLcp,
    /// Bearer-token document naming the real download location.
    SimplifiedBearerToken,
    /// Overdrive audiobook manifest.
    OverdriveManifestJson,
    /// Not recognised; usually an authentication page.
    Unknown,
}

impl RightsManagementKind {
    /// Returns the stable string label used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AdobeAdept => "adobe_adept",
            Self::ReadiumLcp => "readium_lcp",
            Self::SimplifiedBearerToken => "simplified_bearer_token",
            Self::OverdriveManifestJson => "overdrive_manifest_json",
            Self::Unknown => "unknown",
        }
    }

    /// Whether byte-level transfer progress is meaningful for this kind.
    ///
    /// Adobe tokens, bearer-token documents and Overdrive manifests are small
    /// metadata payloads; their transfer says nothing about the book itself.
    #[must_use]
    pub fn reports_progress(&self) -> bool {
        !matches!(
            self,
            Self::AdobeAdept | Self::SimplifiedBearerToken | Self::OverdriveManifestJson
        )
    }
}

impl fmt::Display for RightsManagementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Maps response content types to a [`RightsManagementKind`].
#[derive(Debug, Clone)]
pub struct RightsClassifier {
    supported_types: HashSet<String>,
    overdrive_manifests: bool,
}

impl Default for RightsClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SUPPORTED_TYPES.iter().copied(), true)
    }
}

impl RightsClassifier {
    /// Creates a classifier with an explicit allow-list of supported types.
    ///
    /// `overdrive_manifests` controls whether plain `application/json`
    /// responses are treated as Overdrive manifests.
    #[must_use]
    pub fn new<I, S>(supported_types: I, overdrive_manifests: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            supported_types: supported_types
                .into_iter()
                .map(|t| normalize_mime(t.as_ref()))
                .collect(),
            overdrive_manifests,
        }
    }

    /// Classifies a raw `Content-Type` header value.
    ///
    /// Parameters and letter case are ignored. Every input maps to exactly
    /// one kind.
    #[must_use]
    pub fn classify(&self, content_type: &str) -> RightsManagementKind {
        let normalized = normalize_mime(content_type);
        match normalized.as_str() {
            mime::ADOBE_ADEPT => RightsManagementKind::AdobeAdept,
            mime::READIUM_LCP => RightsManagementKind::ReadiumLcp,
            mime::EPUB_ZIP => RightsManagementKind::None,
            mime::BEARER_TOKEN => RightsManagementKind::SimplifiedBearerToken,
            mime::OVERDRIVE_MANIFEST if self.overdrive_manifests => {
                RightsManagementKind::OverdriveManifestJson
            }
            other if self.supported_types.contains(other) => RightsManagementKind::None,
            _ => RightsManagementKind::Unknown,
        }
    }

    /// Whether `content_type` is on the supported allow-list.
    #[must_use]
    pub fn is_supported(&self, content_type: &str) -> bool {
        self.supported_types.contains(&normalize_mime(content_type))
    }
}

/// Strips parameters and lowercases a content type.
#[must_use]
pub fn normalize_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
