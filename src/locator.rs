//! Deterministic on-disk locations for book content.
//!
//! Layout: `<base>/<account>/content/<sha256(identifier)>.<ext>`. Transfers
//! are staged in `<base>/<account>/staging/` so the final move stays on one
//! filesystem.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use tracing::debug;

/// Extension of an LCP license file.
pub const LICENSE_EXTENSION: &str = "lcpl";

const CONTENT_DIR: &str = "content";
const STAGING_DIR: &str = "staging";

/// How a book's content is stored, which decides its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// EPUB, plain PDF, audiobook manifest.
    #[default]
    Standard,
    /// Packaged LCP audiobook.
    LcpAudiobook,
    /// LCP-protected PDF before extraction.
    LcpPdf,
}

impl StorageKind {
    /// File extension for content of this kind.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Standard => "epub",
            Self::LcpAudiobook => "lcpa",
            Self::LcpPdf => "zip",
        }
    }
}

/// Lowercase hex SHA-256 of a book identifier.
#[must_use]
pub fn hashed_identifier(identifier: &str) -> String {
    format!("{:x}", Sha256::digest(identifier.as_bytes()))
}

/// Content path for a book under an already-resolved content root.
#[must_use]
pub fn content_path(root: &Path, identifier: &str, kind: StorageKind) -> PathBuf {
    root.join(format!(
        "{}.{}",
        hashed_identifier(identifier),
        kind.extension()
    ))
}

/// Resolves content paths for the current account.
#[derive(Debug)]
pub struct FileLocator {
    base_dir: PathBuf,
    account_id: RwLock<String>,
}

impl FileLocator {
    /// Creates a locator rooted at `base_dir` for `account_id`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, account_id: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            account_id: RwLock::new(account_id.into()),
        }
    }

    /// Identifier of the account whose content is being resolved.
    #[must_use]
    pub fn account_id(&self) -> String {
        self.account_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Points the locator at another account.
    pub fn switch_account(&self, account_id: impl Into<String>) {
        let mut guard = self
            .account_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = account_id.into();
    }

    fn account_dir(&self) -> PathBuf {
        self.base_dir.join(self.account_id())
    }

    /// Content directory of the current account; not created.
    #[must_use]
    pub fn content_dir(&self) -> PathBuf {
        self.account_dir().join(CONTENT_DIR)
    }

    /// Staging directory of the current account; not created.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.account_dir().join(STAGING_DIR)
    }

    /// Content path without touching the filesystem.
    #[must_use]
    pub fn planned_path(&self, identifier: &str, kind: StorageKind) -> PathBuf {
        content_path(&self.content_dir(), identifier, kind)
    }

    /// Content path, creating the content directory if needed.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the directory cannot be created.
    pub async fn path_for(&self, identifier: &str, kind: StorageKind) -> std::io::Result<PathBuf> {
        let dir = self.content_dir();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(content_path(&dir, identifier, kind))
    }

    /// Location of a book's LCP license copy kept for streaming.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the directory cannot be created.
    pub async fn license_path(&self, identifier: &str) -> std::io::Result<PathBuf> {
        let dir = self.content_dir();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir.join(format!(
            "{}.{LICENSE_EXTENSION}",
            hashed_identifier(identifier)
        )))
    }

    /// Fresh staging file for one transfer attempt.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the directory cannot be created.
    pub async fn staging_path(&self, identifier: &str, task_id: u64) -> std::io::Result<PathBuf> {
        let dir = self.staging_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}-{task_id}.part", hashed_identifier(identifier)));
        debug!(path = %path.display(), "resolved staging path");
        Ok(path)
    }
}
