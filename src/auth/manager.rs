use serde_json::Value;
use std::sync::Arc;

use super::types::{mask_token, Credential, LoginRequest, LoginResponse};
use crate::error::{ClientError, Result};
use crate::http_client::ApiClient;

const LOGIN_PATH: &str = "/auth/login";

/// Session lifecycle on top of [`ApiClient`]
///
/// Login stores the credential pair and user profile; logout and terminal
/// refresh failures wipe them and reset the refresh coordinator.
pub struct AuthManager {
    client: Arc<ApiClient>,
}

impl AuthManager {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    /// Exchange email and password for a credential
    ///
    /// Returns the user profile from the login response, if any.
    pub async fn login(&self, email: &str, password: &str) -> Result<Option<Value>> {
        tracing::info!("Logging in as {}", email);

        let body = serde_json::to_value(LoginRequest { email, password })?;
        let response: LoginResponse = self.client.post_json(LOGIN_PATH, body).await?;

        let credential = Credential::new(response.access_token, response.refresh_token);
        let user = response.user;

        // A stale refresh from a previous session must not overwrite this one
        self.client
            .coordinator()
            .reset_with(|store| {
                store.clear()?;
                store.set(&credential)?;
                if let Some(ref user) = user {
                    store.set_user_info(user)?;
                }
                Ok(())
            })
            .await?;

        tracing::info!(
            "Login successful (token: {})",
            mask_token(&credential.access_token)
        );

        Ok(user)
    }

    /// Drop the stored credential and abandon any in-flight refresh
    pub async fn logout(&self) -> Result<()> {
        self.client
            .coordinator()
            .reset_with(|store| store.clear())
            .await?;
        tracing::info!("Logged out");
        Ok(())
    }

    pub fn is_authenticated(&self) -> Result<bool> {
        Ok(self.client.store().access_token()?.is_some())
    }

    /// Cached user profile from the last login
    pub fn current_user(&self) -> Result<Option<Value>> {
        self.client.store().user_info()
    }

    /// Force a sign-out when `err` ends the credential epoch
    ///
    /// Returns true if the session was ended.
    pub async fn handle_error(&self, err: &ClientError) -> Result<bool> {
        if !err.requires_sign_out() {
            return Ok(false);
        }

        tracing::warn!("Session ended: {}", err);
        self.logout().await?;
        Ok(true)
    }
}
