//! Attachment descriptors and the request details derived from them.

use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use std::path::{Path, PathBuf};

use crate::config::AdapterConfig;
use crate::errors::{AdapterError, Result};

/// Header carrying the canned ACL applied to a new object.
pub const GOOG_ACL: &str = "x-goog-acl";

/// A file to store, or a previously stored file to delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    /// Local path of the readable byte source.
    pub path: PathBuf,
    /// Size in bytes, sent as `Content-Length`.
    pub size: u64,
    /// MIME type, sent as `Content-Type`.
    pub content_type: String,
    /// Public URL of a previously stored copy.
    pub url: Option<String>,
}

impl Attachment {
    /// Describe a local file to upload.
    pub fn new(path: impl Into<PathBuf>, size: u64, content_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            content_type: content_type.into(),
            url: None,
        }
    }

    /// Describe a previously stored file by its public URL.
    pub fn stored(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Attach the URL returned by a previous save.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// The stored URL, treating an empty string as absent.
    pub fn stored_url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.is_empty())
    }
}

/// Final path component of `path`, or the empty string.
pub fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Object key for a stored URL: `/` followed by the URL's last segment.
///
/// Query strings and fragments are not part of the object name. The
/// segment is percent-decoded, since upload URLs carry the encoded name.
pub fn object_key_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let last = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    format!("/{}", percent_decode_str(last).decode_utf8_lossy())
}

/// Build the upload headers for `attachment`.
///
/// The computed `Content-Length`, `Content-Type` and `x-goog-acl` come first;
/// configured headers are then merged over them and win on conflict.
/// A content type that is not a valid header value fails the call.
pub fn upload_headers(attachment: &Attachment, config: &AdapterConfig) -> Result<HeaderMap> {
    let content_type = HeaderValue::from_str(&attachment.content_type).map_err(|e| {
        AdapterError::InvalidAttachment(format!(
            "content type {:?} is not a valid header value: {e}",
            attachment.content_type
        ))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(attachment.size));
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(HeaderName::from_static(GOOG_ACL), config.acl_header().clone());
    for (name, value) in config.headers() {
        headers.insert(name.clone(), value.clone());
    }
    Ok(headers)
}
