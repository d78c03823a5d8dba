//! Filesystem document store.
//!
//! `s3://bucket/key` resolves to `<root>/bucket/key`, so a directory tree
//! can stand in for a bucket during local runs. Paths without a scheme are
//! taken relative to `root` (absolute paths are used as-is) and listed back
//! in the same form.

use super::{split_uri, DocumentStore, StoreError, StoredObject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LocalDocumentStore {
    root: PathBuf,
}

impl LocalDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        if path.starts_with("s3://") {
            let (bucket, key) = split_uri(path)?;
            if key.split('/').any(|seg| seg == "..") {
                return Err(StoreError::InvalidPath(path.to_string()));
            }
            Ok(self.root.join(bucket).join(key))
        } else {
            Ok(self.root.join(path))
        }
    }

    /// Inverse of [`Self::resolve`] for a file found while listing.
    fn to_store_path(&self, prefix: &str, file: &Path) -> Option<String> {
        if prefix.starts_with("s3://") {
            let rel = file.strip_prefix(&self.root).ok()?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            Some(format!("s3://{}", rel))
        } else if Path::new(prefix).is_absolute() {
            Some(file.to_string_lossy().into_owned())
        } else {
            let rel = file.strip_prefix(&self.root).ok()?;
            Some(rel.to_string_lossy().into_owned())
        }
    }
}

fn map_io(path: &str, e: std::io::Error) -> StoreError {
    match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => StoreError::AccessDenied(path.to_string()),
        _ => StoreError::Io(e),
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = self.resolve(prefix)?;
        // The prefix may end mid-name ("in/rep" matches "in/report.pdf").
        let (dir, name_prefix) = if prefix.ends_with('/') || base.is_dir() {
            (base.clone(), String::new())
        } else {
            let dir = base.parent().map(Path::to_path_buf).unwrap_or_default();
            let name = base
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (dir, name)
        };

        let mut found = Vec::new();
        let mut stack = vec![dir];
        while let Some(d) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&d).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(map_io(prefix, e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if path.to_string_lossy().starts_with(&*base.to_string_lossy())
                    || name_prefix.is_empty()
                {
                    if let Some(p) = self.to_store_path(prefix, &path) {
                        found.push(p);
                    }
                }
            }
        }
        found.sort();
        debug!("Listed {} objects under {}", found.len(), prefix);
        Ok(found)
    }

    async fn get(&self, path: &str) -> Result<StoredObject, StoreError> {
        let file = self.resolve(path)?;
        let bytes = tokio::fs::read(&file).await.map_err(|e| map_io(path, e))?;
        let last_modified = tokio::fs::metadata(&file)
            .await
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(StoredObject {
            bytes,
            last_modified,
        })
    }

    /// Atomic write: temp file next to the target, then rename.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }
        let mut tmp = file.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| map_io(path, e))?;
        tokio::fs::rename(&tmp, &file)
            .await
            .map_err(|e| map_io(path, e))?;
        debug!("Wrote {} bytes to {}", bytes.len(), file.display());
        Ok(())
    }
}
