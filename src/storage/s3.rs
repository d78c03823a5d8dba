//! Amazon S3 document store.

use super::{split_uri, DocumentStore, StoreError, StoredObject};
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct S3DocumentStore {
    client: Client,
}

impl S3DocumentStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the default AWS credential/region chain.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }
}

fn classify<E, R>(path: &str, err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{}: {}", path, DisplayErrorContext(&err));
    if let SdkError::TimeoutError(_) = err {
        return StoreError::Timeout(message);
    }
    match err.code() {
        Some("NoSuchKey" | "NoSuchBucket" | "NotFound") => StoreError::NotFound(path.to_string()),
        Some("SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded") => {
            StoreError::Throttled(message)
        }
        Some("AccessDenied" | "InvalidAccessKeyId" | "ExpiredToken" | "SignatureDoesNotMatch") => {
            StoreError::AccessDenied(message)
        }
        Some("InternalError" | "ServiceUnavailable" | "RequestTimeout") => {
            StoreError::Unavailable(message)
        }
        _ if matches!(err, SdkError::DispatchFailure(_)) => StoreError::Unavailable(message),
        _ => StoreError::Backend(message),
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl DocumentStore for S3DocumentStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let (bucket, key_prefix) = split_uri(prefix)?;
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(key_prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| classify(prefix, e))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .filter(|k| !k.ends_with('/'))
                    .map(|k| format!("s3://{}/{}", bucket, k)),
            );

            match response.next_continuation_token() {
                Some(next) if response.is_truncated() == Some(true) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }
        keys.sort();
        debug!("Listed {} objects under {}", keys.len(), prefix);
        Ok(keys)
    }

    async fn get(&self, path: &str) -> Result<StoredObject, StoreError> {
        let (bucket, key) = split_uri(path)?;
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(path, e))?;

        let last_modified = response.last_modified().and_then(to_chrono);
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend(format!("{}: {}", path, e)))?;

        Ok(StoredObject {
            bytes: bytes.to_vec(),
            last_modified,
        })
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let (bucket, key) = split_uri(path)?;
        let len = bytes.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| classify(path, e))?;
        debug!("Wrote {} bytes to {}", len, path);
        Ok(())
    }
}
