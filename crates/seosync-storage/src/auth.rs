//! Google credentials: service-account key files (JWT bearer grant) or a pre-minted access token.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{FetchError, HttpFetcher};

pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

pub const SEARCH_CONSOLE_SCOPE: &str = "https://www.googleapis.com/auth/webmasters.readonly";
pub const ANALYTICS_SCOPE: &str = "https://www.googleapis.com/auth/analytics.readonly";
pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Minted tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("credentials path is not configured")]
    NotConfigured,
    #[error("credentials file {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("reading credentials file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing credentials file {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("credentials file {} has an empty access_token", .0.display())]
    EmptyToken(PathBuf),
    #[error("service account file {} is missing {field}", .path.display())]
    Incomplete { path: PathBuf, field: &'static str },
    #[error("service account file {} has an unusable private_key", .path.display())]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: jsonwebtoken::errors::Error,
    },
    #[error("service account file {} has an invalid token_uri {value}", .path.display())]
    InvalidTokenUri { path: PathBuf, value: String },
    #[error("signing token assertion")]
    Sign(#[source] jsonwebtoken::errors::Error),
    #[error("requesting access token")]
    TokenRequest(#[from] FetchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialsKind {
    AccessToken,
    ServiceAccount,
}

/// Every field is optional so one shape covers both file flavours.
#[derive(Deserialize)]
struct CredentialsFile {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    client_email: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct CachedToken {
    scope: String,
    token: String,
    expires_at: DateTime<Utc>,
}

struct ServiceAccount {
    client_email: String,
    key_id: Option<String>,
    signing_key: EncodingKey,
    token_uri: Url,
}

enum TokenSource {
    Static(String),
    ServiceAccount(ServiceAccount),
}

/// Bearer credentials for Google APIs. Clones share one token cache.
#[derive(Clone)]
pub struct ServiceCredentials {
    source: Arc<TokenSource>,
    client_email: Option<String>,
    cache: Arc<Mutex<Option<CachedToken>>>,
}

impl fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("kind", &self.kind())
            .field("client_email", &self.client_email)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl ServiceCredentials {
    pub fn from_access_token(token: impl Into<String>) -> Self {
        Self::with_source(TokenSource::Static(token.into()), None)
    }

    fn with_source(source: TokenSource, client_email: Option<String>) -> Self {
        Self {
            source: Arc::new(source),
            client_email,
            cache: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, CredentialsError> {
        if !path.exists() {
            return Err(CredentialsError::Missing(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| CredentialsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text, path)
    }

    /// `path` is only used in error messages.
    pub fn from_json(text: &str, path: &Path) -> Result<Self, CredentialsError> {
        let file: CredentialsFile =
            serde_json::from_str(text).map_err(|source| CredentialsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let is_service_account =
            file.kind.as_deref() == Some("service_account") || file.private_key.is_some();
        if !is_service_account {
            let token = file.access_token.unwrap_or_default();
            if token.trim().is_empty() {
                return Err(CredentialsError::EmptyToken(path.to_path_buf()));
            }
            return Ok(Self::with_source(TokenSource::Static(token), file.client_email));
        }

        let incomplete = |field| CredentialsError::Incomplete {
            path: path.to_path_buf(),
            field,
        };
        let client_email = file
            .client_email
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| incomplete("client_email"))?;
        let private_key = file.private_key.ok_or_else(|| incomplete("private_key"))?;
        let signing_key = EncodingKey::from_rsa_pem(private_key.as_bytes()).map_err(|source| {
            CredentialsError::InvalidKey {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let raw_uri = file.token_uri.unwrap_or_else(|| GOOGLE_TOKEN_URI.to_string());
        let token_uri = Url::parse(&raw_uri).map_err(|_| CredentialsError::InvalidTokenUri {
            path: path.to_path_buf(),
            value: raw_uri.clone(),
        })?;

        let account = ServiceAccount {
            client_email: client_email.clone(),
            key_id: file.private_key_id,
            signing_key,
            token_uri,
        };
        Ok(Self::with_source(
            TokenSource::ServiceAccount(account),
            Some(client_email),
        ))
    }

    pub fn resolve(path: Option<&Path>) -> Result<Self, CredentialsError> {
        match path {
            Some(path) => Self::from_path(path),
            None => Err(CredentialsError::NotConfigured),
        }
    }

    /// Loads credentials or logs why they are unusable. `purpose` names the consumer in logs.
    pub fn load_optional(path: Option<&Path>, purpose: &str) -> Option<Self> {
        match Self::resolve(path) {
            Ok(creds) => {
                debug!(
                    purpose,
                    kind = ?creds.kind(),
                    client_email = creds.client_email().unwrap_or("unknown"),
                    "loaded credentials"
                );
                Some(creds)
            }
            Err(err) => {
                warn!(purpose, error = %err, "credentials unavailable");
                None
            }
        }
    }

    pub fn kind(&self) -> CredentialsKind {
        match self.source.as_ref() {
            TokenSource::Static(_) => CredentialsKind::AccessToken,
            TokenSource::ServiceAccount(_) => CredentialsKind::ServiceAccount,
        }
    }

    pub fn client_email(&self) -> Option<&str> {
        self.client_email.as_deref()
    }

    /// Returns a token valid for `scopes`, minting one through the token endpoint when needed.
    pub async fn bearer_token(
        &self,
        http: &HttpFetcher,
        scopes: &[&str],
    ) -> Result<String, CredentialsError> {
        let account = match self.source.as_ref() {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount(account) => account,
        };

        let scope = scopes.join(" ");
        let mut cache = self.cache.lock().await;
        let now = Utc::now();
        let fresh_until = now + ChronoDuration::seconds(EXPIRY_MARGIN_SECS);
        if let Some(cached) = cache.as_ref().filter(|c| c.scope == scope && c.expires_at > fresh_until) {
            return Ok(cached.token.clone());
        }

        let claims = AssertionClaims {
            iss: &account.client_email,
            scope: &scope,
            aud: account.token_uri.as_str(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = account.key_id.clone();
        let assertion = jsonwebtoken::encode(&header, &claims, &account.signing_key)
            .map_err(CredentialsError::Sign)?;

        let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
        let response: TokenResponse = http
            .post_form_json(account.token_uri.clone(), &form)
            .await?;
        let lifetime = response.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);
        info!(
            client_email = %account.client_email,
            scope = %scope,
            expires_in = lifetime,
            "minted access token"
        );

        let token = response.access_token;
        *cache = Some(CachedToken {
            scope,
            token: token.clone(),
            expires_at: now + ChronoDuration::seconds(lifetime),
        });
        Ok(token)
    }
}
