// =============================================================================
// GOOGLE SERVICE ACCOUNT AUTHENTICATION
// =============================================================================
//
// One authenticator is shared by the Sheets, Drive and Gmail clients. It signs a
// JWT with the service account's private key, exchanges it for an OAuth2 access
// token and caches the token until shortly before it expires.
//
// **Setup:**
// 1. Create a service account in Google Cloud Console and download a JSON key.
// 2. Enable the Google Sheets, Google Drive and Gmail APIs for the project.
// 3. Share the spreadsheet with the service account email (Editor access).
// 4. Gmail only sends on behalf of a real mailbox: grant the service account
//    domain-wide delegation for the scopes below and set
//    `GOOGLE_IMPERSONATE_USER` to the sending address.
//
// **Environment Variables:**
// - `GOOGLE_SERVICE_ACCOUNT_KEY` - Path to service account JSON file
// - `GOOGLE_SERVICE_ACCOUNT_JSON` - Service account JSON content (alternative)
// - `GOOGLE_IMPERSONATE_USER` - Mailbox to act as (domain-wide delegation)

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use crate::core::requests::request_ports::CollaboratorError;

/// Every API the processor touches.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/gmail.send",
];

/// Service account credentials from the JSON key file.
#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountCredentials {
    /// The service account email (used as issuer in JWT).
    client_email: String,

    /// The private key in PEM format.
    private_key: String,

    /// The token URI (where to exchange JWT for access token).
    token_uri: String,
}

/// JWT claims for Google OAuth2.
#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,

    /// Space separated list of scopes.
    scope: String,

    aud: String,

    /// Impersonated user, when domain-wide delegation is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,

    iat: u64,

    /// Max 1 hour from iat.
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

/// Authenticator that handles OAuth2 with service account credentials.
pub struct ServiceAccountAuth {
    credentials: ServiceAccountCredentials,
    subject: Option<String>,
    client: Client,
    cached_token: Arc<RwLock<Option<CachedToken>>>,
}

impl ServiceAccountAuth {
    pub async fn from_file(
        path: &str,
        subject: Option<String>,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json(&content, subject)
    }

    pub fn from_json(
        json: &str,
        subject: Option<String>,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let credentials: ServiceAccountCredentials = serde_json::from_str(json)?;
        Ok(Self {
            credentials,
            subject,
            client: Client::new(),
            cached_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Creates from environment variables.
    pub async fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let subject = std::env::var("GOOGLE_IMPERSONATE_USER")
            .ok()
            .filter(|s| !s.trim().is_empty());

        if let Ok(path) = std::env::var("GOOGLE_SERVICE_ACCOUNT_KEY") {
            return Self::from_file(&path, subject).await;
        }

        if let Ok(json) = std::env::var("GOOGLE_SERVICE_ACCOUNT_JSON") {
            return Self::from_json(&json, subject);
        }

        Err("Neither GOOGLE_SERVICE_ACCOUNT_KEY nor GOOGLE_SERVICE_ACCOUNT_JSON is set.".into())
    }

    pub fn service_email(&self) -> &str {
        &self.credentials.client_email
    }

    /// The mailbox mail is sent from, if impersonating.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Gets a valid access token, refreshing if necessary.
    pub async fn access_token(&self) -> Result<String, CollaboratorError> {
        {
            let cached = self.cached_token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > SystemTime::now() + Duration::from_secs(300) {
                    return Ok(token.token.clone());
                }
            }
        }

        let (token, expires_in) = self
            .fetch_new_token()
            .await
            .map_err(|e| CollaboratorError::Auth(e.to_string()))?;

        {
            let mut cached = self.cached_token.write().await;
            *cached = Some(CachedToken {
                token: token.clone(),
                expires_at: SystemTime::now() + Duration::from_secs(expires_in),
            });
        }

        tracing::debug!("Refreshed Google access token for {}", self.service_email());
        Ok(token)
    }

    fn claims(&self, now: u64) -> JwtClaims {
        JwtClaims {
            iss: self.credentials.client_email.clone(),
            scope: SCOPES.join(" "),
            aud: self.credentials.token_uri.clone(),
            sub: self.subject.clone(),
            iat: now,
            exp: now + 3600,
        }
    }

    async fn fetch_new_token(&self) -> Result<(String, u64), Box<dyn Error + Send + Sync>> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();

        let header = Header::new(Algorithm::RS256);
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.as_bytes())?;
        let jwt = encode(&header, &self.claims(now), &key)?;

        let response = self
            .client
            .post(&self.credentials.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(format!("Token exchange failed ({}): {}", status, text).into());
        }

        let token_response: TokenResponse = response.json().await?;
        Ok((token_response.access_token, token_response.expires_in))
    }
}

/// Turns a non-2xx response into an error message carrying the API's reply.
pub(crate) async fn expect_success(response: Response, context: &str) -> Result<Response, String> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(format!("{} ({}): {}", context, status, text))
}
