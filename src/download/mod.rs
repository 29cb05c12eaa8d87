//! HTTP transfers for acquisition links.
//!
//! This module streams acquisition responses to disk and keeps the
//! request's credentials safe across redirects.
//!
//! # Features
//!
//! - Streaming downloads (memory-efficient for large files)
//! - Manual redirect walking with a per-task cap and bearer-header rules
//! - Cancellation and pause between chunks
//! - Problem documents surfaced as structured errors
//! - Configurable timeouts (30s connect, 5min read by default)
//!
//! # Example
//!
//! ```no_run
//! use fulfillment_core::download::{HttpClient, RedirectGuard, TransferControl, TransferRequest};
//! # use fulfillment_core::download::{ResponseHead, TransferObserver};
//! # use std::ops::ControlFlow;
//! # struct Accept;
//! # impl TransferObserver for Accept {
//! #     fn on_response(&mut self, _: &ResponseHead) -> ControlFlow<()> { ControlFlow::Continue(()) }
//! #     fn on_progress(&mut self, _: u64, _: u64) {}
//! # }
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new();
//! let guard = RedirectGuard::default();
//! let mut control = TransferControl::unpaused(CancellationToken::new());
//! let request = TransferRequest::new("https://example.com/book.epub".parse()?);
//! let payload = client
//!     .fetch_to_file(1, &request, Path::new("./book.part"), &guard, &mut control, &mut Accept)
//!     .await?;
//! println!("Downloaded {} bytes", payload.bytes);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
pub mod redirect;

pub use client::{
    FetchedPayload, HttpClient, ResponseHead, TransferControl, TransferObserver, TransferRequest,
};
pub use error::DownloadError;
pub use redirect::{MAX_REDIRECT_ATTEMPTS, RedirectDecision, RedirectGuard, RedirectRefusal};
