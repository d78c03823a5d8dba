//! In-memory document store.
//!
//! Keys are kept in a `BTreeMap`, so listing is already in key order. Tests
//! can queue failures per path to exercise retry and partial-result paths.

use super::{DocumentStore, StoreError, StoredObject};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    objects: RwLock<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
    failures: RwLock<HashMap<String, VecDeque<StoreError>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object stamped with the current time.
    pub async fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.insert_at(path, bytes, Utc::now()).await;
    }

    pub async fn insert_at(
        &self,
        path: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        modified: DateTime<Utc>,
    ) {
        self.objects
            .write()
            .await
            .insert(path.into(), (bytes.into(), modified));
    }

    /// Make the next `get`/`put` on `path` fail with `error`. Queued errors
    /// are consumed in order.
    pub async fn fail_next(&self, path: impl Into<String>, error: StoreError) {
        self.failures
            .write()
            .await
            .entry(path.into())
            .or_default()
            .push_back(error);
    }

    /// Stored paths, in key order.
    pub async fn paths(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn text(&self, path: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(path)
            .map(|(b, _)| String::from_utf8_lossy(b).into_owned())
    }

    async fn injected(&self, path: &str) -> Option<StoreError> {
        self.failures
            .write()
            .await
            .get_mut(path)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, path: &str) -> Result<StoredObject, StoreError> {
        if let Some(e) = self.injected(path).await {
            return Err(e);
        }
        self.objects
            .read()
            .await
            .get(path)
            .map(|(bytes, modified)| StoredObject {
                bytes: bytes.clone(),
                last_modified: Some(*modified),
            })
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        if let Some(e) = self.injected(path).await {
            return Err(e);
        }
        self.insert(path, bytes).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_is_sorted_and_prefixed() {
        let store = MemoryDocumentStore::new();
        store.insert("s3://b/in/z.pdf", b"z".to_vec()).await;
        store.insert("s3://b/in/a.pdf", b"a".to_vec()).await;
        store.insert("s3://b/other/c.pdf", b"c".to_vec()).await;
        let listed = store.list("s3://b/in/").await.unwrap();
        assert_eq!(listed, vec!["s3://b/in/a.pdf", "s3://b/in/z.pdf"]);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = MemoryDocumentStore::new();
        store.insert("s3://b/k", b"v".to_vec()).await;
        store
            .fail_next("s3://b/k", StoreError::Throttled("slow down".into()))
            .await;
        assert!(matches!(
            store.get("s3://b/k").await,
            Err(StoreError::Throttled(_))
        ));
        assert_eq!(store.get("s3://b/k").await.unwrap().bytes, b"v");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryDocumentStore::new();
        assert!(matches!(
            store.get("s3://b/missing").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
