//! User-Agent string for acquisition traffic.

/// Project URL for User-Agent identification (good citizenship; RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/nicksrandall/fulfillment";

/// Default User-Agent for acquisition requests.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("fulfillment/{version} (library-reader; +{PROJECT_UA_URL})")
}
