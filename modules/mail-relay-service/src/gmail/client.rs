//! Gmail API client

use super::types::*;
use crate::cursor::Cursor;
use crate::error::ApiError;
use crate::google_auth::GoogleAuth;
use crate::http::truncate_error;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// The slice of the Gmail API the relay depends on
#[async_trait]
pub trait MailApi: Send + Sync {
    /// One page of "message added" history starting at `start`
    async fn list_history(
        &self,
        start: &Cursor,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ApiError>;

    async fn get_message(&self, message_id: &str) -> Result<GmailMessage, ApiError>;

    /// Register (or refresh) the push subscription
    async fn watch(&self, topic_name: &str, label_ids: &[String]) -> Result<WatchResponse, ApiError>;

    async fn stop(&self) -> Result<(), ApiError>;
}

/// Gmail API client
pub struct GmailClient {
    http: Client,
    auth: Arc<GoogleAuth>,
    user_id: String,
    base_url: String,
    /// Labels the history listing is restricted to
    history_label: Option<String>,
}

impl GmailClient {
    pub fn new(http: Client, auth: Arc<GoogleAuth>, user_id: &str) -> Self {
        Self {
            http,
            auth,
            user_id: user_id.to_string(),
            base_url: GMAIL_API_BASE.to_string(),
            history_label: None,
        }
    }

    /// Only list history entries carrying this label
    pub fn with_history_label(mut self, label: Option<String>) -> Self {
        self.history_label = label;
        self
    }

    fn user_url(&self, suffix: &str) -> String {
        format!("{}/users/{}/{}", self.base_url, self.user_id, suffix)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let token = self.auth.access_token().await?;
        Ok(request.bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response, ApiError> {
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(|e| ApiError::new(format!("Failed to {}: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            let error = ApiError::with_status(
                format!("Gmail API error while trying to {}: {}", what, truncate_error(&error)),
                status.as_u16(),
            );
            if error.is_unauthorized() {
                self.auth.invalidate();
            }
            return Err(error);
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, ApiError> {
        self.send(request, what)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::new(format!("Failed to parse response to {}: {}", what, e)))
    }
}

#[async_trait]
impl MailApi for GmailClient {
    async fn list_history(
        &self,
        start: &Cursor,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, ApiError> {
        let mut query: Vec<(&str, &str)> = vec![
            ("startHistoryId", start.as_str()),
            ("historyTypes", "messageAdded"),
        ];
        if let Some(label) = self.history_label.as_deref() {
            query.push(("labelId", label));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let request = self.http.get(self.user_url("history")).query(&query);
        self.send_json(request, "list history").await
    }

    async fn get_message(&self, message_id: &str) -> Result<GmailMessage, ApiError> {
        let request = self
            .http
            .get(self.user_url(&format!("messages/{}", message_id)))
            .query(&[("format", "full")]);
        self.send_json(request, "get message").await
    }

    async fn watch(&self, topic_name: &str, label_ids: &[String]) -> Result<WatchResponse, ApiError> {
        let body = json!({
            "topicName": topic_name,
            "labelIds": label_ids,
            "labelFilterBehavior": "INCLUDE"
        });
        let request = self.http.post(self.user_url("watch")).json(&body);
        self.send_json(request, "set up watch").await
    }

    async fn stop(&self) -> Result<(), ApiError> {
        let request = self.http.post(self.user_url("stop"));
        self.send(request, "stop watch").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_urls() {
        let auth = Arc::new(GoogleAuth::new(Client::new(), Some("t".to_string()), None));
        let client = GmailClient::new(Client::new(), auth, "me");
        assert_eq!(
            client.user_url("history"),
            "https://gmail.googleapis.com/gmail/v1/users/me/history"
        );
    }
}
