//! Storage collaborator: list, get and put objects addressed by path.
//!
//! Paths are `s3://bucket/key` URIs throughout the crate because that is
//! what the labeling platform hands us, and what it expects back. Three
//! stores implement [`DocumentStore`]:
//!
//! - [`LocalDocumentStore`]: maps `s3://bucket/key` onto `<root>/bucket/key`
//! - [`MemoryDocumentStore`]: ordered in-memory map for tests and dry runs
//! - `S3DocumentStore`: Amazon S3 (feature `aws`)

pub mod local;
pub mod memory;

#[cfg(feature = "aws")]
pub mod s3;

pub use local::LocalDocumentStore;
pub use memory::MemoryDocumentStore;

#[cfg(feature = "aws")]
pub use s3::S3DocumentStore;

use crate::pipeline::retry::Retryable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage throttled the request: {0}")]
    Throttled(String),

    #[error("Storage request timed out: {0}")]
    Timeout(String),

    #[error("Storage temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid path '{0}'")]
    InvalidPath(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Throttled(_) | Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Object body plus the metadata the handlers need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl StoredObject {
    pub fn text(&self) -> Result<&str, StoreError> {
        std::str::from_utf8(&self.bytes)
            .map_err(|e| StoreError::Backend(format!("object is not UTF-8: {}", e)))
    }
}

/// List/get/put capability the core depends on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Full paths of every object under `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn get(&self, path: &str) -> Result<StoredObject, StoreError>;

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
}

// ── Path helpers ─────────────────────────────────────────────────────────

/// Split `s3://bucket/key` into `(bucket, key)`.
pub fn split_uri(uri: &str) -> Result<(&str, &str), StoreError> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| StoreError::InvalidPath(uri.to_string()))?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(StoreError::InvalidPath(uri.to_string()));
    }
    Ok((bucket, key))
}

pub fn bucket_of(uri: &str) -> Result<&str, StoreError> {
    split_uri(uri).map(|(bucket, _)| bucket)
}

/// Last path segment.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Last path segment without its extension.
pub fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(i) => &name[..i],
    }
}

/// Everything before the last `/`, or `""` when there is none.
pub fn parent(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

/// Join path segments with single slashes.
pub fn join(base: &str, child: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), child.trim_start_matches('/'))
}

pub fn is_pdf(path: &str) -> bool {
    path.to_ascii_lowercase().ends_with(".pdf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_uri_parts() {
        assert_eq!(split_uri("s3://docs/in/a.pdf").unwrap(), ("docs", "in/a.pdf"));
        assert_eq!(split_uri("s3://docs").unwrap(), ("docs", ""));
        assert!(split_uri("/tmp/a.pdf").is_err());
        assert!(split_uri("s3:///key").is_err());
    }

    #[test]
    fn stems_and_names() {
        assert_eq!(file_stem("s3://b/x/report.final.pdf"), "report.final");
        assert_eq!(file_name("s3://b/x/report.pdf"), "report.pdf");
        assert_eq!(file_stem("noext"), "noext");
        assert_eq!(parent("s3://b/x/report.pdf"), "s3://b/x");
    }

    #[test]
    fn pdf_detection_is_case_insensitive() {
        assert!(is_pdf("s3://b/A.PDF"));
        assert!(!is_pdf("s3://b/a.pdf.json"));
    }

    #[test]
    fn transient_errors() {
        assert!(StoreError::Throttled("x".into()).is_transient());
        assert!(!StoreError::AccessDenied("x".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(StoreError::Io(io).is_transient());
    }

    #[test]
    fn join_collapses_slashes() {
        assert_eq!(join("s3://b/out/", "/x.json"), "s3://b/out/x.json");
    }
}
