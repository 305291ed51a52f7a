use bytes::Bytes;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{
    AuthBackend, CredentialStore, HttpAuthBackend, PublicEndpointClassifier, RefreshCoordinator,
};
use crate::config::ClientSettings;
use crate::error::{ClientError, Result};

/// One logical API call
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Extra header; an `Authorization` header here is ignored
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A descriptor plus its retry marker
///
/// `retried` is set before the refresh-triggered retry goes out and is never
/// cleared, so a request passes through the refresh path at most once.
#[derive(Debug, Clone)]
pub struct RequestAttempt {
    descriptor: RequestDescriptor,
    retried: bool,
}

impl RequestAttempt {
    pub fn new(descriptor: RequestDescriptor) -> Self {
        Self {
            descriptor,
            retried: false,
        }
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    pub fn retried(&self) -> bool {
        self.retried
    }

    pub fn mark_retried(&mut self) {
        self.retried = true;
    }
}

/// Fully buffered HTTP response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl ApiResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn a non-success status into [`ClientError::Upstream`]
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ClientError::Upstream {
                status: self.status.as_u16(),
                message: self.text(),
            })
        }
    }
}

/// HTTP client that authenticates requests and recovers from expired tokens
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    base_url: String,

    store: Arc<dyn CredentialStore>,

    classifier: PublicEndpointClassifier,

    coordinator: RefreshCoordinator,
}

impl ApiClient {
    /// Create a client that refreshes through `POST {base_url}/auth/refresh`
    pub fn new(settings: ClientSettings, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let backend = HttpAuthBackend::new(&settings.base_url, settings.refresh_timeout)?;
        Self::with_backend(settings, store, Arc::new(backend))
    }

    /// Create a client with a custom refresh backend
    pub fn with_backend(
        settings: ClientSettings,
        store: Arc<dyn CredentialStore>,
        backend: Arc<dyn AuthBackend>,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(settings.max_idle_connections)
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let coordinator = RefreshCoordinator::new(store.clone(), backend, settings.refresh_timeout);

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            store,
            classifier: PublicEndpointClassifier::default(),
            coordinator,
        })
    }

    /// Replace the public endpoint allowlist
    pub fn with_public_endpoints(mut self, classifier: PublicEndpointClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one logical request
    pub async fn send(&self, descriptor: RequestDescriptor) -> Result<ApiResponse> {
        let mut attempt = RequestAttempt::new(descriptor);
        self.dispatch(&mut attempt).await
    }

    /// Send an attempt, retrying once through a token refresh on 401
    ///
    /// Statuses other than 401 are returned unchanged. A 401 from a public
    /// endpoint is returned unchanged too, since no credential was involved.
    pub async fn dispatch(&self, attempt: &mut RequestAttempt) -> Result<ApiResponse> {
        let request_id = Uuid::new_v4();
        let public = self.classifier.is_public(&attempt.descriptor.path);
        let mut bearer = if public {
            None
        } else {
            self.store.access_token()?
        };

        tracing::debug!(
            request_id = %request_id,
            method = %attempt.descriptor.method,
            path = %attempt.descriptor.path,
            public = public,
            authenticated = bearer.is_some(),
            "Sending HTTP request"
        );

        loop {
            let response = self
                .transmit(&attempt.descriptor, bearer.as_deref())
                .await?;

            tracing::debug!(
                request_id = %request_id,
                status = %response.status(),
                retried = attempt.retried,
                "Received HTTP response"
            );

            if response.status() != StatusCode::UNAUTHORIZED || public {
                return Ok(response);
            }

            if attempt.retried {
                tracing::warn!(
                    request_id = %request_id,
                    path = %attempt.descriptor.path,
                    "Received 401 after token refresh, giving up"
                );
                return Err(ClientError::AuthExpired {
                    status: response.status().as_u16(),
                    message: response.text(),
                });
            }

            tracing::warn!(
                request_id = %request_id,
                path = %attempt.descriptor.path,
                "Received 401, refreshing token and retrying..."
            );
            attempt.mark_retried();

            let fresh = match bearer.as_deref() {
                Some(rejected) => self.coordinator.obtain_fresh_credential_after(rejected).await,
                None => self.coordinator.obtain_fresh_credential().await,
            };
            match fresh {
                Ok(token) => bearer = Some(token),
                Err(e) => {
                    tracing::error!(
                        request_id = %request_id,
                        error = %e,
                        "Token refresh failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn transmit(
        &self,
        descriptor: &RequestDescriptor,
        bearer: Option<&str>,
    ) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, descriptor.path);
        let mut builder = self.client.request(descriptor.method.clone(), &url);

        if !descriptor.query.is_empty() {
            builder = builder.query(&descriptor.query);
        }
        for (name, value) in &descriptor.headers {
            if name.eq_ignore_ascii_case(AUTHORIZATION.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &descriptor.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            let err = ClientError::from_transport(e);
            tracing::warn!(url = %url, error = %err, "HTTP request error");
            err
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(ClientError::from_transport)?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.send(RequestDescriptor::new(Method::GET, path)).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.send(RequestDescriptor::new(Method::POST, path).json(body))
            .await
    }

    pub async fn put(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.send(RequestDescriptor::new(Method::PUT, path).json(body))
            .await
    }

    pub async fn patch(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.send(RequestDescriptor::new(Method::PATCH, path).json(body))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send(RequestDescriptor::new(Method::DELETE, path)).await
    }

    /// GET and decode a JSON body, treating non-2xx as an error
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path).await?.error_for_status()?.json()
    }

    /// POST and decode a JSON body, treating non-2xx as an error
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        self.post(path, body).await?.error_for_status()?.json()
    }
}
