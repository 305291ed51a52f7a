// Session Client - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;

pub use auth::{AuthManager, Credential, CredentialStore, RefreshCoordinator};
pub use error::ClientError;
pub use http_client::{ApiClient, ApiResponse, RequestAttempt, RequestDescriptor};
