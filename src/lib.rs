//! Fulfillment Core Library
//!
//! This library turns a library catalog entry into a locally stored,
//! readable book: it borrows when needed, streams the acquisition link,
//! classifies the rights management of the payload and hands protected
//! content to the matching DRM collaborator.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`coordinator`] - The fulfillment state machine and its public commands
//! - [`download`] - Streaming HTTP transfers with an audited redirect policy
//! - [`registry`] - In-flight task registry shared with transfer observers
//! - [`progress`] - Debounced progress and failure notifications
//! - [`ledger`] - Per-book loan state storage
//! - [`locator`] - Deterministic on-disk content locations
//! - [`rights`] - Content-type to rights-management classification
//! - [`problem`] - RFC 7807 problem documents
//!
//! External systems (authentication, circulation, Adobe, LCP and SAML
//! sign-in) are reached through the traits in [`auth`], [`loans`] and
//! [`drm`].

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod acquisition;
pub mod auth;
pub mod bearer;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod drm;
pub mod error;
pub mod ledger;
pub mod loans;
pub mod locator;
pub mod problem;
pub mod progress;
pub mod registry;
pub mod rights;
mod user_agent;

// Re-export commonly used types
pub use acquisition::{AcquisitionDescriptor, Availability, Book, ContentFormat};
pub use auth::{Authenticator, SessionCookie, StaticAuthenticator};
pub use config::{ConfigError, EngineConfig};
pub use coordinator::FulfillmentCoordinator;
pub use download::{DownloadError, HttpClient, RedirectGuard};
pub use error::FulfillmentError;
pub use ledger::{InMemoryLedger, Ledger, LoanState};
pub use problem::ProblemDocument;
pub use progress::{DownloadAlert, DownloadEvent};
pub use rights::{RightsClassifier, RightsManagementKind};
