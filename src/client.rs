//! Storage client contracts.
//!
//! The adapter never talks HTTP itself.  It drives an authenticated
//! [`StorageClient`] obtained from an [`Authenticator`]; the Google
//! implementations live in [`crate::gcs`], and tests substitute fakes.

use bytes::Bytes;
use futures::Stream;
use reqwest::header::HeaderMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::config::Credential;

/// Streamed object body.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>>;

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    /// Public URL of the stored object.
    pub url: String,
}

/// Authenticated access to object storage.
pub trait StorageClient: Send + Sync + 'static {
    /// Stream `body` into `bucket` under `key` with the given request headers.
    fn upload_stream(
        &self,
        body: ByteStream,
        bucket: &str,
        key: &str,
        headers: HeaderMap,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UploadResponse>> + Send + '_>>;

    /// Delete the object `key` from `bucket`.
    fn delete_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Exchanges service-account credentials for an authenticated client.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(
        &self,
        issuer: &str,
        scope: &str,
        credential: &Credential,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn StorageClient>>> + Send + '_>>;
}

/// Open a local file as a streamed body.
pub async fn open_byte_source(path: &Path) -> std::io::Result<ByteStream> {
    let file = tokio::fs::File::open(path).await?;
    Ok(Box::pin(ReaderStream::new(file)))
}
