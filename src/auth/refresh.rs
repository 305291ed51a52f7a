// Token refresh backend
// The remote endpoint that exchanges a refresh token for a new pair

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::types::{RefreshRequest, RefreshResponse, TokenPair};
use crate::error::{ClientError, Result};

/// Path of the refresh endpoint, relative to the API base URL
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Exchanges a refresh token for a new token pair
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair>;
}

/// `POST {base_url}/auth/refresh` over HTTP
pub struct HttpAuthBackend {
    client: Client,
    url: String,
}

impl HttpAuthBackend {
    /// Create a backend with its own HTTP client bounded by `timeout`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), REFRESH_PATH),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        tracing::debug!(url = %self.url, "Sending refresh request");

        let response = self
            .client
            .post(&self.url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| ClientError::RefreshFailed(ClientError::from_transport(e).to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                body = %error_text,
                "Refresh endpoint rejected the token"
            );
            return Err(ClientError::RefreshFailed(format!(
                "{} - {}",
                status, error_text
            )));
        }

        let data: RefreshResponse = response.json().await.map_err(|e| {
            ClientError::RefreshFailed(format!("Failed to parse refresh response: {}", e))
        })?;

        if data.access_token.is_empty() {
            return Err(ClientError::RefreshFailed(
                "Refresh response does not contain accessToken".to_string(),
            ));
        }

        Ok(TokenPair {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
        })
    }
}
