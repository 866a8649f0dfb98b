//! Google Cloud Storage attachment adapter.
//!
//! Persists and deletes binary file attachments in a Cloud Storage bucket,
//! authenticating with a service-account key.  The adapter obtains its
//! access token asynchronously; operations issued before the exchange
//! completes are queued and replayed once it does.
//!
//! ```no_run
//! use gcs_attachments::{AdapterOptions, Attachment, StorageAdapter};
//!
//! # async fn demo() -> gcs_attachments::Result<()> {
//! let options = AdapterOptions {
//!     issuer: Some("uploader@my-project.iam.gserviceaccount.com".into()),
//!     bucket: Some("my-attachments".into()),
//!     key_file: Some("/etc/gcs/key.json".into()),
//!     ..AdapterOptions::default()
//! };
//! let adapter = StorageAdapter::connect(options)?;
//!
//! let stored = Attachment::new("/tmp/logo.png", 1234, "image/png");
//! let url = adapter.save(&stored).await?;
//! adapter.remove(&stored.with_url(url)).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod attachment;
pub mod client;
pub mod config;
pub mod errors;
pub mod gcs;
pub mod metrics;

pub use adapter::{Status, StorageAdapter};
pub use attachment::Attachment;
pub use client::{Authenticator, ByteStream, StorageClient, UploadResponse};
pub use config::{load_options, AdapterConfig, AdapterOptions, Credential, PathPolicy};
pub use errors::{AdapterError, Result};
