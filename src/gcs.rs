//! Google Cloud Storage client.
//!
//! [`ServiceAccountAuthenticator`] performs the service-account credential
//! exchange: it signs an RS256 JWT assertion with the account's private key
//! and trades it for an OAuth2 access token at Google's token endpoint.
//! The resulting [`GcsClient`] talks to the Cloud Storage XML API:
//!
//!   Upload:  `PUT    https://storage.googleapis.com/{bucket}/{key}`
//!   Delete:  `DELETE https://storage.googleapis.com/{bucket}/{key}`
//!
//! Key material may be a bare PEM private key or a service-account JSON
//! key file (`private_key`, optional `token_uri`).

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::client::{Authenticator, ByteStream, StorageClient, UploadResponse};
use crate::config::Credential;

/// Google OAuth2 token endpoint.
pub const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Cloud Storage XML API base URL.
pub const GCS_XML_BASE: &str = "https://storage.googleapis.com";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for each JWT assertion.
const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: u64 = 60;

/// Characters escaped in object names. `/` stays literal so keys keep
/// their directory structure.
const OBJECT_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

// -- Credential exchange ------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

/// Parsed key material.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyMaterial {
    private_key_pem: String,
    token_uri: String,
}

impl KeyMaterial {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') {
            let key: ServiceAccountKey = serde_json::from_str(trimmed)
                .map_err(|e| anyhow::anyhow!("Failed to parse service account key: {e}"))?;
            return Ok(Self {
                private_key_pem: key.private_key,
                token_uri: key.token_uri.unwrap_or_else(|| TOKEN_URI.to_string()),
            });
        }
        if trimmed.contains("PRIVATE KEY-----") {
            return Ok(Self {
                private_key_pem: trimmed.to_string(),
                token_uri: TOKEN_URI.to_string(),
            });
        }
        Err(anyhow::anyhow!(
            "Key material is neither a PEM private key nor a service account JSON key"
        ))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// XML API error body: `<Error><Code/><Message/></Error>`.
#[derive(Debug, Deserialize)]
struct GcsXmlError {
    #[serde(rename = "Code", default)]
    code: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

/// Issues and caches access tokens for one service account.
struct TokenSource {
    http: reqwest::Client,
    issuer: String,
    scope: String,
    token_uri: String,
    signing_key: jsonwebtoken::EncodingKey,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    fn new(
        http: reqwest::Client,
        issuer: &str,
        scope: &str,
        material: KeyMaterial,
    ) -> anyhow::Result<Self> {
        let signing_key = jsonwebtoken::EncodingKey::from_rsa_pem(
            material.private_key_pem.as_bytes(),
        )
        .map_err(|e| anyhow::anyhow!("Invalid service account private key: {e}"))?;

        Ok(Self {
            http,
            issuer: issuer.to_string(),
            scope: scope.to_string(),
            token_uri: material.token_uri,
            signing_key,
            cache: Mutex::new(None),
        })
    }

    /// Build the signed JWT assertion for the token request.
    fn assertion(&self) -> anyhow::Result<String> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let claims = Claims {
            iss: self.issuer.clone(),
            scope: self.scope.clone(),
            aud: self.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .map_err(|e| anyhow::anyhow!("Failed to sign JWT assertion: {e}"))
    }

    /// Return a cached token, or exchange a fresh assertion for one.
    async fn access_token(&self) -> anyhow::Result<String> {
        {
            let cache = self.cache.lock().expect("token cache mutex poisoned");
            if let Some(ref cached) = *cache {
                if cached.expiry > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch().await?;
        let expiry =
            Instant::now() + Duration::from_secs(expires_in.saturating_sub(EXPIRY_MARGIN_SECS));

        {
            let mut cache = self.cache.lock().expect("token cache mutex poisoned");
            *cache = Some(CachedToken {
                access_token: token.clone(),
                expiry,
            });
        }

        Ok(token)
    }

    async fn fetch(&self) -> anyhow::Result<(String, u64)> {
        let assertion = self.assertion()?;

        debug!("Requesting access token for {} from {}", self.issuer, self.token_uri);

        let resp = self
            .http
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Token request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Token exchange failed ({status}): {body}"));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Malformed token response: {e}"))?;

        Ok((token.access_token, token.expires_in))
    }
}

/// Authenticates with a service-account key and yields a [`GcsClient`].
pub struct ServiceAccountAuthenticator {
    http: reqwest::Client,
}

impl ServiceAccountAuthenticator {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
        Ok(Self { http })
    }
}

impl Authenticator for ServiceAccountAuthenticator {
    fn authenticate(
        &self,
        issuer: &str,
        scope: &str,
        credential: &Credential,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn StorageClient>>> + Send + '_>> {
        let issuer = issuer.to_string();
        let scope = scope.to_string();
        let credential = credential.clone();
        Box::pin(async move {
            let raw = credential.material().await?;
            let material = KeyMaterial::parse(&raw)?;
            let tokens = TokenSource::new(self.http.clone(), &issuer, &scope, material)?;

            // Exchange eagerly so bad credentials surface at connect time.
            tokens.access_token().await?;
            info!("Obtained access token for {}", issuer);

            let client: Arc<dyn StorageClient> = Arc::new(GcsClient {
                http: self.http.clone(),
                base_url: GCS_XML_BASE.to_string(),
                tokens,
            });
            Ok(client)
        })
    }
}

// -- Storage client -----------------------------------------------------------

/// Authenticated Cloud Storage client.
pub struct GcsClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenSource,
}

impl GcsClient {
    /// URL of `key` in `bucket`. Leading slashes on the key are optional.
    fn object_url(base_url: &str, bucket: &str, key: &str) -> String {
        let name = key.trim_start_matches('/');
        format!(
            "{}/{}/{}",
            base_url,
            utf8_percent_encode(bucket, OBJECT_NAME),
            utf8_percent_encode(name, OBJECT_NAME)
        )
    }

    async fn auth_headers(&self) -> anyhow::Result<HeaderMap> {
        let token = self.tokens.access_token().await?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| anyhow::anyhow!("Invalid auth header value: {e}"))?,
        );
        Ok(headers)
    }

    fn map_gcs_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        if let Ok(GcsXmlError {
            code,
            message: Some(message),
        }) = quick_xml::de::from_str::<GcsXmlError>(body)
        {
            let code = code.unwrap_or_else(|| "Unknown".to_string());
            return anyhow::anyhow!("GCS {context}: {message} ({code}, HTTP {status})");
        }
        anyhow::anyhow!("GCS {context}: HTTP {status} - {body}")
    }
}

impl StorageClient for GcsClient {
    fn upload_stream(
        &self,
        body: ByteStream,
        bucket: &str,
        key: &str,
        headers: HeaderMap,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UploadResponse>> + Send + '_>> {
        let url = Self::object_url(&self.base_url, bucket, key);
        Box::pin(async move {
            let auth = self.auth_headers().await?;

            debug!("GCS upload: {}", url);

            let resp = self
                .http
                .put(&url)
                .headers(headers)
                .headers(auth)
                .body(reqwest::Body::wrap_stream(body))
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("GCS upload request failed: {e}"))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_gcs_error("upload", status, &body));
            }

            Ok(UploadResponse {
                url: resp.url().to_string(),
            })
        })
    }

    /// Deleting a missing object succeeds.
    fn delete_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let url = Self::object_url(&self.base_url, bucket, key);
        Box::pin(async move {
            let auth = self.auth_headers().await?;

            debug!("GCS delete: {}", url);

            let resp = self
                .http
                .delete(&url)
                .headers(auth)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("GCS delete request failed: {e}"))?;

            let status = resp.status();
            if !status.is_success() && status != StatusCode::NOT_FOUND {
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_gcs_error("delete", status, &body));
            }

            Ok(())
        })
    }
}

// -- Tests -------------------------------------------------------------------
