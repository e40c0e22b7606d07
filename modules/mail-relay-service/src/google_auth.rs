//! OAuth access token shared by the Gmail and Sheets clients.

use crate::error::ApiError;
use crate::http::truncate_error;
use crate::secrets::{self, SecretStore};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use reqwest::Client;

const TOKEN_REFRESH_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh a token this long before Google says it expires
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::seconds(EXPIRY_SKEW_SECS) < expires_at,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

pub struct GoogleAuth {
    http: Client,
    token: RwLock<Option<AccessToken>>,
    refresh: Option<RefreshCredentials>,
}

impl GoogleAuth {
    pub fn new(
        http: Client,
        access_token: Option<String>,
        refresh: Option<RefreshCredentials>,
    ) -> Self {
        Self {
            http,
            token: RwLock::new(access_token.map(|value| AccessToken {
                value,
                // Unknown expiry: trusted until a refresh replaces it
                expires_at: None,
            })),
            refresh,
        }
    }

    pub fn from_secrets(http: Client, store: &dyn SecretStore) -> Self {
        let refresh = match (
            store.get(secrets::GOOGLE_CLIENT_ID),
            store.get(secrets::GOOGLE_CLIENT_SECRET),
            store.get(secrets::GOOGLE_REFRESH_TOKEN),
        ) {
            (Some(client_id), Some(client_secret), Some(refresh_token)) => {
                Some(RefreshCredentials {
                    client_id,
                    client_secret,
                    refresh_token,
                })
            }
            _ => None,
        };
        Self::new(http, store.get(secrets::GOOGLE_ACCESS_TOKEN), refresh)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh.is_some()
    }

    /// A usable access token, refreshing first when the current one is missing or stale
    pub async fn access_token(&self) -> Result<String, ApiError> {
        let cached = self
            .token
            .read()
            .as_ref()
            .filter(|token| token.is_fresh(Utc::now()))
            .map(|token| token.value.clone());
        match cached {
            Some(value) => Ok(value),
            None => self.refresh_access_token().await,
        }
    }

    /// Forget the cached token after upstream rejected it. A token without
    /// refresh credentials is kept, since nothing could replace it.
    pub fn invalidate(&self) {
        if self.can_refresh() {
            *self.token.write() = None;
            log::debug!("[MAIL_RELAY] Google access token invalidated");
        }
    }

    /// Exchange the refresh token for a new access token
    pub async fn refresh_access_token(&self) -> Result<String, ApiError> {
        let creds = self
            .refresh
            .as_ref()
            .ok_or_else(|| ApiError::new("No Google access token and no refresh credentials"))?;

        let response = self
            .http
            .post(TOKEN_REFRESH_URL)
            .form(&[
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.as_str()),
                ("refresh_token", creds.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| ApiError::new(format!("Failed to refresh token: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(ApiError::with_status(
                format!("Token refresh failed: {}", truncate_error(&error)),
                status.as_u16(),
            ));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: Option<i64>,
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::new(format!("Failed to parse token response: {}", e)))?;

        let token = AccessToken {
            value: body.access_token.clone(),
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        };
        *self.token.write() = Some(token);
        log::debug!("[MAIL_RELAY] Google access token refreshed");
        Ok(body.access_token)
    }
}
