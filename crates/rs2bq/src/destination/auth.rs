//! OAuth2 access tokens for the BigQuery API
//!
//! A service account key is exchanged for a bearer token through the JWT
//! bearer grant. Tokens are cached until shortly before they expire.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::{MigrateError, Result};

pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh this long before the reported expiry
const EXPIRY_MARGIN_SECS: i64 = 60;

/// The fields of a downloaded service account JSON key that matter here
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub project_id: Option<String>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            MigrateError::config(format!(
                "Failed to read service account key {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            MigrateError::config(format!(
                "Invalid service account key {}: {}",
                path.display(),
                e
            ))
        })
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map_or(true, |at| now + Duration::seconds(EXPIRY_MARGIN_SECS) < at)
    }
}

enum TokenSource {
    Static(String),
    ServiceAccount {
        key: ServiceAccountKey,
        http: reqwest::Client,
    },
}

pub struct TokenProvider {
    source: TokenSource,
    cache: Mutex<Option<AccessToken>>,
}

impl TokenProvider {
    /// Always hand out the same pre-issued token
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            source: TokenSource::Static(token.into()),
            cache: Mutex::new(None),
        }
    }

    pub fn service_account(key: ServiceAccountKey, http: reqwest::Client) -> Self {
        Self {
            source: TokenSource::ServiceAccount { key, http },
            cache: Mutex::new(None),
        }
    }

    /// A bearer token valid for at least the next minute
    pub async fn token(&self) -> Result<String> {
        let (key, http) = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount { key, http } => (key, http),
        };

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(cached.token.clone());
        }

        let fresh = exchange(key, http).await?;
        let token = fresh.token.clone();
        *cache = Some(fresh);
        Ok(token)
    }
}

/// Build the signed assertion sent to the token endpoint
pub fn sign_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<String> {
    let claims = Claims {
        iss: &key.client_email,
        scope: BIGQUERY_SCOPE,
        aud: &key.token_uri,
        iat: now.timestamp(),
        exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
    };
    let encoding = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| MigrateError::config(format!("Invalid service account private key: {}", e)))?;

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding)
        .map_err(|e| MigrateError::destination(format!("Failed to sign token assertion: {}", e)))
}

#[instrument(skip_all, fields(client = %key.client_email))]
async fn exchange(key: &ServiceAccountKey, http: &reqwest::Client) -> Result<AccessToken> {
    let now = Utc::now();
    let assertion = sign_assertion(key, now)?;

    let response = http
        .post(&key.token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .await
        .map_err(|e| MigrateError::destination(format!("Token request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(MigrateError::destination(format!(
            "Token endpoint returned {}: {}",
            status, body
        )));
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| MigrateError::destination(format!("Malformed token response: {}", e)))?;

    debug!(expires_in = ?body.expires_in, "Access token issued");
    Ok(AccessToken {
        token: body.access_token,
        expires_at: body.expires_in.map(|secs| now + Duration::seconds(secs)),
    })
}
