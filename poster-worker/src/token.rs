//! Bearer token cache backed by an OAuth client credentials exchange.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_kms::error::DisplayErrorContext;
use aws_sdk_kms::primitives::Blob;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheSource, CachedValue};
use crate::error::AuthError;

/// Path of the token endpoint, relative to the configured OAuth URL.
const TOKEN_PATH: &str = "oauth/token";

/// An opaque bearer credential. Expiry is enforced by the issuer, not tracked here.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: &str) -> Self {
        Self(token.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken(<redacted>)")
    }
}

/// Turns configured credential material into the plaintext sent to the token endpoint.
#[async_trait]
pub trait SecretDecrypter: Send + Sync {
    async fn decrypt(&self, value: &str) -> Result<String, AuthError>;
}

/// Credentials are configured in plaintext.
pub struct Plaintext;

#[async_trait]
impl SecretDecrypter for Plaintext {
    async fn decrypt(&self, value: &str) -> Result<String, AuthError> {
        Ok(value.to_owned())
    }
}

/// Credentials are base64 encoded KMS ciphertexts.
pub struct KmsDecrypter {
    client: aws_sdk_kms::Client,
}

impl KmsDecrypter {
    pub fn new(client: aws_sdk_kms::Client) -> Self {
        Self { client }
    }

    /// Build a KMS client from the ambient AWS configuration.
    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_kms::Client::new(&config))
    }
}

#[async_trait]
impl SecretDecrypter for KmsDecrypter {
    async fn decrypt(&self, value: &str) -> Result<String, AuthError> {
        let ciphertext = STANDARD
            .decode(value.trim())
            .map_err(|e| AuthError::Decrypt(format!("ciphertext is not valid base64: {e}")))?;

        let output = self
            .client
            .decrypt()
            .ciphertext_blob(Blob::new(ciphertext))
            .send()
            .await
            .map_err(|e| AuthError::Decrypt(DisplayErrorContext(&e).to_string()))?;

        let plaintext = output
            .plaintext()
            .ok_or_else(|| AuthError::Decrypt("KMS returned no plaintext".to_owned()))?;

        String::from_utf8(plaintext.as_ref().to_vec())
            .map_err(|e| AuthError::Decrypt(format!("plaintext is not valid UTF-8: {e}")))
    }
}

/// Client credentials for the token endpoint. Key and secret may still be encrypted.
#[derive(Clone)]
pub struct OAuthCredentials {
    pub key: String,
    pub secret: String,
    pub url: Url,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// Join the token path onto the OAuth URL, treating the URL as a directory even without a
/// trailing slash.
fn token_endpoint(base: &Url) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(TOKEN_PATH)
}

/// Holds the one bearer token this process uses, fetching it on first use and again after it
/// has been invalidated.
pub struct TokenCache {
    http_client: reqwest::Client,
    credentials: OAuthCredentials,
    decrypter: Arc<dyn SecretDecrypter>,
    cached: CachedValue<AuthToken>,
}

impl TokenCache {
    pub fn new(
        http_client: reqwest::Client,
        credentials: OAuthCredentials,
        decrypter: Arc<dyn SecretDecrypter>,
    ) -> Self {
        Self {
            http_client,
            credentials,
            decrypter,
            cached: CachedValue::new(),
        }
    }

    /// Return the cached token, or run the credentials exchange when there is none.
    pub async fn get_token(&self) -> Result<AuthToken, AuthError> {
        let (token, source) = self
            .cached
            .get_or_fetch(|| self.request_token())
            .await
            .inspect_err(|error| warn!(stage = "auth", %error, "not authenticated"))?;

        match source {
            CacheSource::Cached => debug!("already authenticated"),
            CacheSource::Fetched => info!("successfully authenticated"),
        }

        Ok(token)
    }

    /// Drop `stale` after the destination refused it, so the next `get_token` re-authenticates.
    pub async fn invalidate(&self, stale: &AuthToken) {
        if self.cached.invalidate_if(stale).await {
            info!("cleared cached token after authorization failure");
        }
    }

    async fn request_token(&self) -> Result<AuthToken, AuthError> {
        info!("requesting new token");

        let client_id = self.decrypter.decrypt(&self.credentials.key).await?;
        let client_secret = self.decrypter.decrypt(&self.credentials.secret).await?;
        let url = token_endpoint(&self.credentials.url)?;

        let response = self
            .http_client
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected { status, body });
        }

        let body: TokenResponse = response.json().await?;

        match body.access_token {
            Some(token) if !token.is_empty() => Ok(AuthToken::new(&token)),
            _ => Err(AuthError::MissingAccessToken),
        }
    }
}
