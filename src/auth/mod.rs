// Authentication module
// Credential storage, public endpoint rules and single-flight token refresh

mod coordinator;
mod manager;
mod public;
mod refresh;
mod store;
mod types;

pub use coordinator::{CoordinatorState, RefreshCoordinator};
pub use manager::AuthManager;
pub use public::{PublicEndpointClassifier, DEFAULT_PUBLIC_FRAGMENTS};
pub use refresh::{AuthBackend, HttpAuthBackend, REFRESH_PATH};
pub use store::{CredentialStore, MemoryCredentialStore, SqliteCredentialStore, StoreKey};
pub use types::{mask_token, Credential, TokenPair};
