// Single-flight token refresh
//
// At most one refresh runs at a time. Callers that need a fresh token while a
// refresh is in flight are queued and all receive that refresh's outcome.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};

use super::refresh::AuthBackend;
use super::store::CredentialStore;
use super::types::{mask_token, Credential, TokenPair};
use crate::error::{ClientError, Result};

/// Outcome broadcast to every caller of one refresh episode
type RefreshOutcome = Result<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Refreshing,
}

struct Inner {
    state: CoordinatorState,
    /// Non-empty only while `Refreshing`
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    /// Bumped by `reset`; a refresh started in an older epoch is discarded
    epoch: u64,
    /// Backend call of the current episode
    in_flight: Option<InFlight>,
}

struct InFlight {
    abort: AbortHandle,
    /// Resolves once the call's future has been dropped
    done: oneshot::Receiver<()>,
}

struct Shared {
    inner: Mutex<Inner>,
    store: Arc<dyn CredentialStore>,
    backend: Arc<dyn AuthBackend>,
    refresh_timeout: Duration,
}

/// Owns the refresh state machine and the waiter queue
///
/// Cloning is cheap and every clone drives the same state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        backend: Arc<dyn AuthBackend>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: CoordinatorState::Idle,
                    waiters: Vec::new(),
                    epoch: 0,
                    in_flight: None,
                }),
                store,
                backend,
                refresh_timeout,
            }),
        }
    }

    pub async fn state(&self) -> CoordinatorState {
        self.shared.inner.lock().await.state
    }

    /// Number of callers queued behind the in-flight refresh
    pub async fn pending_waiters(&self) -> usize {
        self.shared.inner.lock().await.waiters.len()
    }

    /// Get a new access token, joining the in-flight refresh if there is one
    pub async fn obtain_fresh_credential(&self) -> RefreshOutcome {
        self.obtain(None).await
    }

    /// Like [`obtain_fresh_credential`](Self::obtain_fresh_credential), for a
    /// request that was rejected while carrying `rejected`
    ///
    /// If the stored access token already differs from `rejected`, a refresh
    /// completed after that request went out and the stored token is returned
    /// without contacting the backend.
    pub async fn obtain_fresh_credential_after(&self, rejected: &str) -> RefreshOutcome {
        self.obtain(Some(rejected)).await
    }

    async fn obtain(&self, rejected: Option<&str>) -> RefreshOutcome {
        let receiver = {
            let mut inner = self.shared.inner.lock().await;

            match inner.state {
                CoordinatorState::Refreshing => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    tracing::debug!(
                        waiters = inner.waiters.len(),
                        "Queued behind in-flight token refresh"
                    );
                    rx
                }
                CoordinatorState::Idle => {
                    if let Some(rejected) = rejected {
                        if let Some(current) = self.shared.store.access_token()? {
                            if current != rejected {
                                tracing::debug!(
                                    token = %mask_token(&current),
                                    "Credential already rotated, reusing stored token"
                                );
                                return Ok(current);
                            }
                        }
                    }

                    let refresh_token = match self.shared.store.refresh_token()? {
                        Some(token) => token,
                        None => {
                            tracing::warn!("No refresh token stored, clearing credentials");
                            self.clear_store();
                            return Err(ClientError::NoRefreshToken);
                        }
                    };

                    inner.state = CoordinatorState::Refreshing;
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);

                    let backend = self.shared.backend.clone();
                    let token = refresh_token.clone();
                    let (done_tx, done_rx) = oneshot::channel();
                    let call = tokio::spawn(async move {
                        let _done = done_tx;
                        backend.refresh(&token).await
                    });
                    inner.in_flight = Some(InFlight {
                        abort: call.abort_handle(),
                        done: done_rx,
                    });

                    // The refresh runs detached so that dropping this caller
                    // cannot leave the queue stuck in Refreshing
                    let coordinator = self.clone();
                    let epoch = inner.epoch;
                    tokio::spawn(async move {
                        coordinator.run_refresh(call, refresh_token, epoch).await;
                    });
                    rx
                }
            }
        };

        receiver.await.unwrap_or_else(|_| {
            Err(ClientError::RefreshFailed(
                "refresh ended without a result".to_string(),
            ))
        })
    }

    async fn run_refresh(
        self,
        mut call: JoinHandle<Result<TokenPair>>,
        refresh_token: String,
        epoch: u64,
    ) {
        tracing::info!("Refreshing access token...");

        let result = match tokio::time::timeout(self.shared.refresh_timeout, &mut call).await {
            Ok(Ok(Ok(pair))) => Ok(pair),
            Ok(Ok(Err(ClientError::RefreshFailed(message)))) => {
                Err(ClientError::RefreshFailed(message))
            }
            Ok(Ok(Err(other))) => Err(ClientError::RefreshFailed(other.to_string())),
            Ok(Err(join_err)) => Err(ClientError::RefreshFailed(format!(
                "refresh task aborted: {}",
                join_err
            ))),
            Err(_) => {
                call.abort();
                let _ = call.await;
                Err(ClientError::RefreshFailed(format!(
                    "timed out after {}ms",
                    self.shared.refresh_timeout.as_millis()
                )))
            }
        };

        self.settle(result, &refresh_token, epoch).await;
    }

    /// Persist or clear credentials, then resume every waiter with one outcome
    async fn settle(&self, result: Result<TokenPair>, previous_refresh: &str, epoch: u64) {
        let mut inner = self.shared.inner.lock().await;

        if inner.epoch != epoch {
            tracing::debug!("Discarding refresh result from a reset session");
            return;
        }
        inner.in_flight = None;

        let outcome = match result {
            Ok(pair) => {
                let credential = Credential {
                    access_token: pair.access_token,
                    refresh_token: pair
                        .refresh_token
                        .unwrap_or_else(|| previous_refresh.to_string()),
                };
                match self.shared.store.set(&credential) {
                    Ok(()) => {
                        tracing::info!(
                            token = %mask_token(&credential.access_token),
                            "Access token refreshed"
                        );
                        Ok(credential.access_token)
                    }
                    Err(e) => {
                        tracing::error!("Failed to persist refreshed credential: {}", e);
                        self.clear_store();
                        Err(ClientError::RefreshFailed(format!(
                            "failed to persist refreshed credential: {}",
                            e
                        )))
                    }
                }
            }
            Err(e) => {
                tracing::error!("Token refresh failed: {}", e);
                self.clear_store();
                Err(e)
            }
        };

        let waiters = std::mem::take(&mut inner.waiters);
        inner.state = CoordinatorState::Idle;

        tracing::debug!(waiters = waiters.len(), "Resuming queued callers");
        for waiter in waiters {
            // A dropped receiver belongs to a cancelled caller
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Abandon any in-flight refresh and fail its waiters
    pub async fn reset(&self) {
        let mut inner = self.shared.inner.lock().await;
        Self::abandon(&mut inner).await;
    }

    /// Reset, then apply `update` to the store before any new refresh can start
    ///
    /// Logout and login go through here so that a refresh begun in between
    /// cannot write its tokens over the cleared or replaced session.
    pub async fn reset_with<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&dyn CredentialStore) -> Result<()>,
    {
        let mut inner = self.shared.inner.lock().await;
        Self::abandon(&mut inner).await;
        update(self.shared.store.as_ref())
    }

    async fn abandon(inner: &mut Inner) {
        inner.epoch += 1;
        inner.state = CoordinatorState::Idle;

        if let Some(in_flight) = inner.in_flight.take() {
            tracing::debug!("Aborting in-flight token refresh");
            in_flight.abort.abort();
            // The backend call must be gone before the lock is released
            let _ = in_flight.done.await;
        }

        let waiters = std::mem::take(&mut inner.waiters);
        if !waiters.is_empty() {
            tracing::debug!(waiters = waiters.len(), "Failing waiters on reset");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(ClientError::RefreshFailed(
                "session was reset".to_string(),
            )));
        }
    }

    fn clear_store(&self) {
        if let Err(e) = self.shared.store.clear() {
            tracing::error!("Failed to clear credentials: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::{MemoryCredentialStore, StoreKey};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        calls: AtomicUsize,
        delay: Duration,
        outcome: Result<TokenPair>,
    }

    impl FakeBackend {
        fn succeeding(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                outcome: Ok(TokenPair {
                    access_token: "T2".to_string(),
                    refresh_token: Some("R2".to_string()),
                }),
            })
        }

        fn failing(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                outcome: Err(ClientError::RefreshFailed("401 Unauthorized".to_string())),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthBackend for FakeBackend {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
            assert_eq!(refresh_token, "R1");
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }
    }

    /// Records how many refresh calls overlap; the call is counted until its
    /// future is dropped, so an aborted call stops counting immediately
    struct OverlapBackend {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    struct InFlightGuard<'a>(&'a AtomicUsize);

    impl Drop for InFlightGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl OverlapBackend {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl AuthBackend for OverlapBackend {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlightGuard(&self.in_flight);

            tokio::time::sleep(self.delay).await;
            Ok(TokenPair {
                access_token: format!("access-for-{}", refresh_token),
                refresh_token: Some(format!("{}-next", refresh_token)),
            })
        }
    }

    /// Store whose deletes always fail
    #[derive(Default)]
    struct UndeletableStore {
        entries: MemoryCredentialStore,
    }

    impl CredentialStore for UndeletableStore {
        fn read(&self, key: StoreKey) -> Result<Option<String>> {
            self.entries.read(key)
        }

        fn write(&self, key: StoreKey, value: &str) -> Result<()> {
            self.entries.write(key, value)
        }

        fn remove(&self, _key: StoreKey) -> Result<()> {
            Err(ClientError::Storage("database is locked".to_string()))
        }
    }

    fn setup(
        backend: Arc<FakeBackend>,
        timeout: Duration,
    ) -> (RefreshCoordinator, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::with_credential(&Credential::new(
            "T1", "R1",
        )));
        store
            .set_user_info(&serde_json::json!({ "id": 1 }))
            .unwrap();
        let coordinator = RefreshCoordinator::new(store.clone(), backend, timeout);
        (coordinator, store)
    }

    async fn wait_until_refreshing(coordinator: &RefreshCoordinator) {
        while coordinator.state().await != CoordinatorState::Refreshing {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_single_flight_success() {
        let backend = FakeBackend::succeeding(Duration::from_millis(100));
        let (coordinator, store) = setup(backend.clone(), Duration::from_secs(5));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("T2".to_string()));
        }

        assert_eq!(backend.calls(), 1);
        assert_eq!(store.get().unwrap(), Some(Credential::new("T2", "R2")));
        assert_eq!(coordinator.state().await, CoordinatorState::Idle);
        assert_eq!(coordinator.pending_waiters().await, 0);
    }

    #[tokio::test]
    async fn test_failure_is_broadcast_and_clears_store() {
        let backend = FakeBackend::failing(Duration::from_millis(100));
        let (coordinator, store) = setup(backend.clone(), Duration::from_secs(5));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Err(ClientError::RefreshFailed("401 Unauthorized".to_string()))
            );
        }

        assert_eq!(backend.calls(), 1);
        for key in StoreKey::ALL {
            assert_eq!(store.read(key).unwrap(), None);
        }
        assert_eq!(coordinator.state().await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_no_refresh_token_short_circuits() {
        let backend = FakeBackend::succeeding(Duration::ZERO);
        let store = Arc::new(MemoryCredentialStore::new());
        store.write(StoreKey::AccessToken, "T1").unwrap();
        let coordinator =
            RefreshCoordinator::new(store.clone(), backend.clone(), Duration::from_secs(5));

        let result = coordinator.obtain_fresh_credential().await;

        assert_eq!(result, Err(ClientError::NoRefreshToken));
        assert_eq!(backend.calls(), 0);
        assert_eq!(store.access_token().unwrap(), None);
        assert_eq!(coordinator.state().await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_timeout_is_refresh_failure() {
        let backend = FakeBackend::succeeding(Duration::from_secs(10));
        let (coordinator, store) = setup(backend, Duration::from_millis(50));

        let result = coordinator.obtain_fresh_credential().await;

        match result {
            Err(ClientError::RefreshFailed(message)) => assert!(message.contains("timed out")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(store.get().unwrap(), None);
        assert_eq!(coordinator.state().await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_sequential_episodes_refresh_again() {
        let backend = FakeBackend::succeeding(Duration::ZERO);
        let (coordinator, store) = setup(backend.clone(), Duration::from_secs(5));

        assert_eq!(coordinator.obtain_fresh_credential().await, Ok("T2".to_string()));

        // Restore the first refresh token so the fake accepts it again
        store.set(&Credential::new("T1", "R1")).unwrap();
        assert_eq!(coordinator.obtain_fresh_credential().await, Ok("T2".to_string()));

        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_rotated_credential_skips_backend() {
        let backend = FakeBackend::succeeding(Duration::ZERO);
        let (coordinator, _store) = setup(backend.clone(), Duration::from_secs(5));

        let token = coordinator.obtain_fresh_credential_after("T0").await;

        assert_eq!(token, Ok("T1".to_string()));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_rejected_current_token_triggers_refresh() {
        let backend = FakeBackend::succeeding(Duration::ZERO);
        let (coordinator, _store) = setup(backend.clone(), Duration::from_secs(5));

        let token = coordinator.obtain_fresh_credential_after("T1").await;

        assert_eq!(token, Ok("T2".to_string()));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_disturb_others() {
        let backend = FakeBackend::succeeding(Duration::from_millis(100));
        let (coordinator, _store) = setup(backend.clone(), Duration::from_secs(5));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
        };
        wait_until_refreshing(&coordinator).await;

        let cancelled = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
        };
        let survivor = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
        };
        cancelled.abort();

        assert_eq!(first.await.unwrap(), Ok("T2".to_string()));
        assert_eq!(survivor.await.unwrap(), Ok("T2".to_string()));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_initiator_still_completes_refresh() {
        let backend = FakeBackend::succeeding(Duration::from_millis(100));
        let (coordinator, store) = setup(backend.clone(), Duration::from_secs(5));

        let initiator = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
        };
        wait_until_refreshing(&coordinator).await;

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
        };
        initiator.abort();

        assert_eq!(waiter.await.unwrap(), Ok("T2".to_string()));
        assert_eq!(store.get().unwrap(), Some(Credential::new("T2", "R2")));
        assert_eq!(coordinator.state().await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_reset_fails_waiters_and_discards_result() {
        let backend = FakeBackend::succeeding(Duration::from_millis(100));
        let (coordinator, store) = setup(backend.clone(), Duration::from_secs(5));

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
        };
        wait_until_refreshing(&coordinator).await;

        store.clear().unwrap();
        coordinator.reset().await;

        assert_eq!(
            pending.await.unwrap(),
            Err(ClientError::RefreshFailed("session was reset".to_string()))
        );
        assert_eq!(coordinator.state().await, CoordinatorState::Idle);

        // Let the abandoned refresh finish; it must not resurrect the session
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.get().unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_aborts_backend_call_before_next_episode() {
        let backend = OverlapBackend::new(Duration::from_millis(200));
        let store = Arc::new(MemoryCredentialStore::with_credential(&Credential::new(
            "T1", "R1",
        )));
        let coordinator =
            RefreshCoordinator::new(store.clone(), backend.clone(), Duration::from_secs(5));

        let abandoned = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
        };
        while backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        coordinator
            .reset_with(|store| store.set(&Credential::new("T5", "R5")))
            .await
            .unwrap();
        assert_eq!(backend.in_flight.load(Ordering::SeqCst), 0);

        let next = coordinator.obtain_fresh_credential().await;

        assert_eq!(next, Ok("access-for-R5".to_string()));
        assert_eq!(
            abandoned.await.unwrap(),
            Err(ClientError::RefreshFailed("session was reset".to_string()))
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get().unwrap(),
            Some(Credential::new("access-for-R5", "R5-next"))
        );
    }

    #[tokio::test]
    async fn test_cleared_session_is_not_restored_by_racing_refresh() {
        let backend = FakeBackend::succeeding(Duration::from_millis(100));
        let (coordinator, store) = setup(backend.clone(), Duration::from_secs(5));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
        };
        wait_until_refreshing(&coordinator).await;

        // Callers racing the logout either queue behind the doomed refresh or
        // find the store already empty
        let racing: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
            })
            .collect();
        coordinator.reset_with(|store| store.clear()).await.unwrap();

        assert!(first.await.unwrap().is_err());
        for handle in racing {
            let result = handle.await.unwrap();
            assert!(
                matches!(
                    result,
                    Err(ClientError::RefreshFailed(_)) | Err(ClientError::NoRefreshToken)
                ),
                "unexpected outcome: {:?}",
                result
            );
        }
        assert_eq!(
            coordinator.obtain_fresh_credential().await,
            Err(ClientError::NoRefreshToken)
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        for key in StoreKey::ALL {
            assert_eq!(store.read(key).unwrap(), None);
        }
        // The aborted call may never have been polled
        assert!(backend.calls() <= 1);
    }

    #[tokio::test]
    async fn test_reset_with_surfaces_store_error() {
        let backend = FakeBackend::succeeding(Duration::ZERO);
        let store = Arc::new(UndeletableStore::default());
        let coordinator = RefreshCoordinator::new(store, backend, Duration::from_secs(5));

        let result = coordinator.reset_with(|store| store.clear()).await;

        assert_eq!(
            result,
            Err(ClientError::Storage("database is locked".to_string()))
        );
        assert_eq!(coordinator.state().await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_no_refresh_token_reported_even_if_clear_fails() {
        let backend = FakeBackend::succeeding(Duration::ZERO);
        let store = Arc::new(UndeletableStore::default());
        store.write(StoreKey::AccessToken, "T1").unwrap();
        let coordinator =
            RefreshCoordinator::new(store.clone(), backend.clone(), Duration::from_secs(5));

        let result = coordinator.obtain_fresh_credential().await;

        assert_eq!(result, Err(ClientError::NoRefreshToken));
        assert!(result.unwrap_err().requires_sign_out());
        assert_eq!(backend.calls(), 0);
        assert_eq!(coordinator.state().await, CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn test_missing_rotated_refresh_token_keeps_previous() {
        let backend = Arc::new(FakeBackend {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            outcome: Ok(TokenPair {
                access_token: "T2".to_string(),
                refresh_token: None,
            }),
        });
        let (coordinator, store) = setup(backend, Duration::from_secs(5));

        assert_eq!(coordinator.obtain_fresh_credential().await, Ok("T2".to_string()));
        assert_eq!(store.get().unwrap(), Some(Credential::new("T2", "R1")));
    }
}
