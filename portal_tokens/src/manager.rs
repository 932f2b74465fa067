use crate::sources::RefreshSource;
use crate::tokens::{self, DecodeError, DecodedToken};
use crate::{AccessToken, AccessTokenRef, TokenEvent, TokenStore};
use futures::future::{BoxFuture, FutureExt, Shared};
use portal_clock::{Clock, DurationSecs, System};
use std::{
    error, fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use thiserror::Error;
use tokio::task::JoinHandle;

/// A refresh in flight, shared by every caller that asked for it
pub type PendingRefresh = Shared<BoxFuture<'static, Result<AccessToken, RefreshError>>>;

/// The reason a refresh did not produce a token
///
/// Any of these means the session must be re-authenticated. Refreshes are
/// never retried automatically.
#[derive(Clone, Debug, Error)]
pub enum RefreshError {
    /// The refresh source failed
    #[error("unable to refresh access token")]
    Source(#[source] Arc<dyn error::Error + Send + Sync + 'static>),
    /// The refresh source returned a token that could not be decoded
    #[error("refreshed access token could not be decoded")]
    InvalidToken(#[source] Arc<DecodeError>),
    /// The token store was cleared while the refresh was in flight
    #[error("session was cleared while the refresh was in flight")]
    SessionCleared,
    /// The refresh task panicked or was torn down with the runtime
    #[error("refresh task ended before producing a result")]
    Aborted,
}

/// Configuration for when tokens are refreshed
#[derive(Clone, Copy, Debug)]
pub struct RefreshConfig {
    refresh_margin: DurationSecs,
    min_refresh_interval: DurationSecs,
}

impl Default for RefreshConfig {
    /// Default refresh configuration
    ///
    /// Refreshes five minutes ahead of expiry. When a freshly refreshed token
    /// is already inside that margin, waits at least 30 seconds before trying
    /// again.
    fn default() -> Self {
        Self {
            refresh_margin: tokens::DEFAULT_REFRESH_MARGIN,
            min_refresh_interval: DurationSecs(30),
        }
    }
}

impl RefreshConfig {
    /// Constructs a new refresh configuration
    pub fn new(refresh_margin: DurationSecs, min_refresh_interval: DurationSecs) -> Self {
        Self {
            refresh_margin,
            min_refresh_interval,
        }
    }

    /// How long before expiry a proactive refresh is attempted
    pub fn refresh_margin(&self) -> DurationSecs {
        self.refresh_margin
    }

    /// The shortest delay between a refresh and the next proactive one
    pub fn min_refresh_interval(&self) -> DurationSecs {
        self.min_refresh_interval
    }
}

/// Keeps a usable access token in a [`TokenStore`]
///
/// The manager refreshes proactively shortly before the held token expires,
/// and on demand when a request is rejected. At most one refresh is in flight
/// at any time: concurrent callers, including the proactive timer, all share
/// the same [`PendingRefresh`]. Starting a refresh disarms the proactive timer,
/// and a successful refresh re-arms it from the new token's expiry.
///
/// All methods that may start a refresh or arm the timer must be called from
/// within a Tokio runtime.
pub struct TokenLifecycleManager<S, C = System> {
    inner: Arc<Inner<S, C>>,
}

struct Inner<S, C> {
    source: S,
    store: TokenStore,
    config: RefreshConfig,
    clock: C,
    pending: Mutex<Option<(u64, PendingRefresh)>>,
    timer: Mutex<Option<(u64, JoinHandle<()>)>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S, C> Clone for TokenLifecycleManager<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, C: fmt::Debug> fmt::Debug for TokenLifecycleManager<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenLifecycleManager")
            .field("store", &self.inner.store)
            .field("config", &self.inner.config)
            .field("clock", &self.inner.clock)
            .field("refreshing", &lock(&self.inner.pending).is_some())
            .field("timer_armed", &lock(&self.inner.timer).is_some())
            .finish()
    }
}

impl<S: RefreshSource> TokenLifecycleManager<S, System> {
    /// Constructs a manager that refreshes `store` from `source`
    pub fn new(source: S, store: TokenStore, config: RefreshConfig) -> Self {
        Self::with_clock(source, store, config, System)
    }
}

impl<S, C> TokenLifecycleManager<S, C>
where
    S: RefreshSource,
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a manager using the given clock
    pub fn with_clock(source: S, store: TokenStore, config: RefreshConfig, clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                store,
                config,
                clock,
                pending: Mutex::new(None),
                timer: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// The store this manager keeps populated
    pub fn store(&self) -> &TokenStore {
        &self.inner.store
    }

    /// The refresh configuration
    pub fn config(&self) -> RefreshConfig {
        self.inner.config
    }

    /// Installs a token obtained at login and schedules its proactive refresh
    pub fn set_token(&self, token: AccessToken) -> Result<(), DecodeError> {
        let decoded = DecodedToken::decode(token)?;
        self.inner.store.set(decoded.access_token().to_owned());
        self.schedule_proactive_refresh(&decoded);
        Ok(())
    }

    /// Arms the proactive refresh timer for `token`
    ///
    /// The timer fires the refresh margin ahead of the token's expiry. If the
    /// token is already inside that margin, a refresh starts immediately.
    /// Any previously armed timer is replaced.
    pub fn schedule_proactive_refresh(&self, token: &DecodedToken) {
        self.inner.schedule(token, DurationSecs(0));
    }

    /// Refreshes the access token, joining any refresh already in flight
    ///
    /// The refresh runs in its own task and completes even if every caller
    /// stops waiting on it. On failure the store is cleared and
    /// [`TokenEvent::Expired`] is published.
    pub fn refresh(&self) -> PendingRefresh {
        Inner::refresh(&self.inner)
    }

    /// Obtains a replacement for a token the server just rejected
    ///
    /// If the store already holds a different, valid token, the rejection
    /// raced with a completed refresh and that token is returned without
    /// another network call. Otherwise this joins or starts a refresh.
    pub async fn refresh_after_rejection(
        &self,
        rejected: Option<&AccessTokenRef>,
    ) -> Result<AccessToken, RefreshError> {
        if let Some(current) = self.inner.store.get() {
            if rejected != Some(&*current) && self.is_valid(&current) {
                tracing::trace!("token already replaced since the request was sent");
                return Ok(current);
            }
        }

        self.refresh().await
    }

    /// The held token, if it decodes and has not expired
    pub fn valid_token(&self) -> Option<AccessToken> {
        self.inner
            .store
            .get()
            .filter(|token| self.is_valid(token))
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        lock(&self.inner.pending).is_some()
    }

    /// Whether a proactive refresh is currently scheduled
    pub fn is_timer_armed(&self) -> bool {
        lock(&self.inner.timer).is_some()
    }

    /// Disarms the proactive timer and clears the store
    ///
    /// A refresh already in flight still completes, but its result is
    /// discarded.
    pub fn clear(&self) {
        self.inner.cancel_timer();
        self.inner.store.clear();
    }

    /// Ends the session as if a refresh had failed
    ///
    /// Disarms the proactive timer, clears the store, and publishes
    /// [`TokenEvent::Expired`] so listeners can send the user to sign in.
    pub fn expire(&self) {
        self.inner.cancel_timer();
        self.inner.store.clear();
        self.inner.store.publish(TokenEvent::Expired);
    }

    /// Whether `token` has expired according to this manager's clock
    pub fn is_expired(&self, token: &AccessTokenRef) -> bool {
        tokens::is_expired_with_clock(token, &self.inner.clock)
    }

    /// Whether `token` is within the refresh margin of expiring
    pub fn is_expiring_soon(&self, token: &AccessTokenRef) -> bool {
        tokens::is_expiring_soon_with_clock(token, self.inner.config.refresh_margin, &self.inner.clock)
    }

    /// Whether `token` decodes and has not expired
    pub fn is_valid(&self, token: &AccessTokenRef) -> bool {
        tokens::is_valid_with_clock(token, &self.inner.clock)
    }
}

impl<S, C> Inner<S, C>
where
    S: RefreshSource,
    C: Clock + Send + Sync + 'static,
{
    fn refresh(self: &Arc<Self>) -> PendingRefresh {
        let mut pending = lock(&self.pending);
        if let Some((_, op)) = pending.as_ref() {
            tracing::trace!("joining in-flight token refresh");
            return op.clone();
        }

        self.cancel_timer();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let generation = self.store.generation();
        let task = tokio::spawn(Arc::clone(self).run_refresh(id, generation));

        let op = async move {
            task.await.unwrap_or_else(|error| {
                tracing::error!(error = (&error as &dyn error::Error), "token refresh task failed");
                Err(RefreshError::Aborted)
            })
        }
        .boxed()
        .shared();

        *pending = Some((id, op.clone()));
        op
    }

    async fn run_refresh(
        self: Arc<Self>,
        id: u64,
        generation: u64,
    ) -> Result<AccessToken, RefreshError> {
        tracing::debug!("requesting new access token");

        let outcome = match self.source.refresh_token().await {
            Ok(token) => {
                DecodedToken::decode(token).map_err(|e| RefreshError::InvalidToken(Arc::new(e)))
            }
            Err(error) => Err(RefreshError::Source(Arc::new(error))),
        };

        let result = match outcome {
            Ok(decoded) => {
                let token = decoded.access_token().to_owned();
                if self.store.set_if_generation(token.clone(), generation) {
                    tracing::info!(
                        issued = decoded.issued().0,
                        expiry = decoded.expiry().0,
                        until_expired = decoded.until_expired_at(self.clock.now()).0,
                        "access token refreshed"
                    );
                    self.schedule(&decoded, self.config.min_refresh_interval);
                    Ok(token)
                } else {
                    tracing::debug!("token store changed during refresh, discarding refreshed token");
                    self.store.get().ok_or(RefreshError::SessionCleared)
                }
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "token refresh failed, re-authentication required"
                );
                if self.store.clear_if_generation(generation) {
                    self.store.publish(TokenEvent::Expired);
                }
                Err(error)
            }
        };

        let mut pending = lock(&self.pending);
        if matches!(pending.as_ref(), Some((current, _)) if *current == id) {
            *pending = None;
        }

        result
    }

    /// Arms the timer, or refreshes now when `floor` is zero and the token
    /// is already inside the margin.
    fn schedule(self: &Arc<Self>, token: &DecodedToken, floor: DurationSecs) {
        let until_expired = token.until_expired_at(self.clock.now());
        let margin = self.config.refresh_margin;

        if until_expired > margin {
            let delay = until_expired.saturating_sub(margin);
            tracing::debug!(
                delay = delay.0,
                expiry = token.expiry().0,
                "waiting to refresh ahead of expiry"
            );
            self.arm_timer(delay);
        } else if floor.is_zero() {
            tracing::debug!(
                until_expired = until_expired.0,
                "token within refresh margin, refreshing now"
            );
            drop(Self::refresh(self));
        } else {
            tracing::warn!(
                until_expired = until_expired.0,
                delay = floor.0,
                "refreshed token is already within refresh margin"
            );
            self.arm_timer(floor);
        }
    }

    fn arm_timer(self: &Arc<Self>, delay: DurationSecs) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let mut events = self.store.subscribe();

        let handle = tokio::spawn(async move {
            let disarmed = tokio::select! {
                biased;
                _ = events.recv() => true,
                () = tokio::time::sleep(delay.into()) => false,
            };

            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.release_timer(id);

            if disarmed {
                tracing::trace!("token store changed, proactive refresh disarmed");
                return;
            }

            tracing::debug!("proactive refresh timer fired");
            // Failures are already logged and published by the refresh itself.
            let _ = Self::refresh(&inner).await;
        });

        if let Some((_, previous)) = lock(&self.timer).replace((id, handle)) {
            previous.abort();
        }
    }

    fn release_timer(&self, id: u64) {
        let mut timer = lock(&self.timer);
        if matches!(timer.as_ref(), Some((current, _)) if *current == id) {
            *timer = None;
        }
    }

    fn cancel_timer(&self) {
        if let Some((_, handle)) = lock(&self.timer).take() {
            tracing::trace!("proactive refresh timer cancelled");
            handle.abort();
        }
    }
}

impl<S, C> Drop for Inner<S, C> {
    fn drop(&mut self) {
        let timer = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, handle)) = timer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    use async_trait::async_trait;
    use portal_clock::{TestClock, UnixTime};

    use super::*;
    use crate::tokens::unsigned_token;

    const NOW: UnixTime = UnixTime(1_700_000_000);

    #[derive(Debug, Error)]
    #[error("refresh endpoint responded 500 Internal Server Error")]
    struct ServerError;

    #[derive(Debug, Default)]
    struct FakeRefreshSource {
        calls: AtomicUsize,
        delay: Duration,
        responses: Mutex<VecDeque<Result<AccessToken, ServerError>>>,
    }

    impl FakeRefreshSource {
        fn issuing(tokens: impl IntoIterator<Item = AccessToken>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(tokens.into_iter().map(Ok).collect()),
                ..Self::default()
            })
        }

        fn slowly_issuing(delay: Duration, token: AccessToken) -> Arc<Self> {
            Arc::new(Self {
                delay,
                responses: Mutex::new(VecDeque::from([Ok(token)])),
                ..Self::default()
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(VecDeque::from([Err(ServerError)])),
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshSource for FakeRefreshSource {
        type Error = ServerError;

        async fn refresh_token(&self) -> Result<AccessToken, Self::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            lock(&self.responses).pop_front().unwrap_or(Err(ServerError))
        }
    }

    type TestManager = TokenLifecycleManager<Arc<FakeRefreshSource>, TestClock>;

    fn manager_with(source: &Arc<FakeRefreshSource>) -> (TestManager, TestClock) {
        let clock = TestClock::new(NOW);
        let manager = TokenLifecycleManager::with_clock(
            Arc::clone(source),
            TokenStore::new(),
            RefreshConfig::default(),
            clock.clone(),
        );
        (manager, clock)
    }

    fn token_expiring_in(sub: &str, secs: u64) -> AccessToken {
        unsigned_token(sub, NOW, NOW + DurationSecs(secs))
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    mod single_flight {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn concurrent_refreshes_share_one_call() {
            let source =
                FakeRefreshSource::slowly_issuing(Duration::from_millis(250), token_expiring_in("new", 3_600));
            let (manager, _) = manager_with(&source);

            let first = manager.refresh();
            let second = manager.refresh();
            assert!(manager.is_refreshing());

            let (first, second) = tokio::join!(first, second);

            assert_eq!(source.calls(), 1);
            assert_eq!(first.unwrap(), second.unwrap());
            assert!(!manager.is_refreshing());
        }

        #[tokio::test(start_paused = true)]
        async fn concurrent_rejections_share_one_call_and_one_token() {
            let old = token_expiring_in("old", 3_600);
            let new = token_expiring_in("new", 3_600);
            let source = FakeRefreshSource::slowly_issuing(Duration::from_millis(250), new.clone());
            let (manager, _) = manager_with(&source);
            manager.store().set(old.clone());

            let mut tasks = Vec::new();
            for _ in 0..8 {
                let manager = manager.clone();
                let old = old.clone();
                tasks.push(tokio::spawn(async move {
                    manager.refresh_after_rejection(Some(&*old)).await
                }));
            }

            for task in tasks {
                assert_eq!(task.await.unwrap().unwrap(), new);
            }
            assert_eq!(source.calls(), 1);
        }

        #[tokio::test]
        async fn late_rejection_reuses_the_refreshed_token() {
            let old = token_expiring_in("old", 3_600);
            let new = token_expiring_in("new", 3_600);
            let source = FakeRefreshSource::issuing([new.clone()]);
            let (manager, _) = manager_with(&source);
            manager.store().set(old.clone());

            assert_eq!(manager.refresh().await.unwrap(), new);
            assert_eq!(manager.refresh_after_rejection(Some(&*old)).await.unwrap(), new);
            assert_eq!(source.calls(), 1);
        }
    }

    mod proactive_refresh {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn fires_at_the_refresh_margin_before_expiry() {
            let source = FakeRefreshSource::issuing([token_expiring_in("next", 3_600)]);
            let (manager, _) = manager_with(&source);

            manager.set_token(token_expiring_in("first", 600)).unwrap();
            assert!(manager.is_timer_armed());
            let mut events = manager.store().subscribe();

            tokio::time::advance(Duration::from_secs(299)).await;
            settle().await;
            assert_eq!(source.calls(), 0);

            tokio::time::advance(Duration::from_secs(1)).await;
            assert_eq!(events.recv().await.unwrap(), TokenEvent::Updated);

            assert_eq!(source.calls(), 1);
            assert_eq!(
                manager.store().get().unwrap(),
                token_expiring_in("next", 3_600)
            );
            assert!(manager.is_timer_armed());
        }

        #[tokio::test(start_paused = true)]
        async fn token_inside_the_margin_refreshes_immediately() {
            let source = FakeRefreshSource::issuing([token_expiring_in("next", 3_600)]);
            let (manager, _) = manager_with(&source);

            manager.set_token(token_expiring_in("first", 120)).unwrap();
            settle().await;

            assert_eq!(source.calls(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn clearing_the_store_disarms_the_timer() {
            let source = FakeRefreshSource::issuing([token_expiring_in("next", 3_600)]);
            let (manager, _) = manager_with(&source);

            manager.set_token(token_expiring_in("first", 600)).unwrap();
            manager.store().clear();
            assert_eq!(manager.store().get(), None);

            tokio::time::advance(Duration::from_secs(900)).await;
            settle().await;

            assert_eq!(source.calls(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn setting_a_new_token_rearms_from_its_expiry() {
            let source = FakeRefreshSource::issuing([token_expiring_in("next", 3_600)]);
            let (manager, _) = manager_with(&source);

            manager.set_token(token_expiring_in("first", 600)).unwrap();
            manager.set_token(token_expiring_in("second", 1_200)).unwrap();

            tokio::time::advance(Duration::from_secs(600)).await;
            settle().await;
            assert_eq!(source.calls(), 0);

            tokio::time::advance(Duration::from_secs(300)).await;
            settle().await;
            assert_eq!(source.calls(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn reactive_refresh_supersedes_the_timer() {
            let source = FakeRefreshSource::issuing([token_expiring_in("next", 3_600)]);
            let (manager, _) = manager_with(&source);

            manager.set_token(token_expiring_in("first", 600)).unwrap();
            manager.refresh().await.unwrap();

            tokio::time::advance(Duration::from_secs(300)).await;
            settle().await;

            assert_eq!(source.calls(), 1);
            assert!(manager.is_timer_armed());
        }
    }

    mod when_refresh_fails {
        use super::*;

        #[tokio::test]
        async fn store_is_cleared_and_expiry_is_published() {
            let source = FakeRefreshSource::failing();
            let (manager, _) = manager_with(&source);
            manager.store().set(token_expiring_in("old", 3_600));
            let mut events = manager.store().subscribe();

            let error = manager.refresh().await.unwrap_err();

            assert!(matches!(error, RefreshError::Source(_)));
            assert_eq!(manager.store().get(), None);
            assert_eq!(events.recv().await.unwrap(), TokenEvent::Cleared);
            assert_eq!(events.recv().await.unwrap(), TokenEvent::Expired);
            assert!(!manager.is_timer_armed());
        }

        #[tokio::test]
        async fn undecodable_token_is_a_failure() {
            let source = FakeRefreshSource::issuing([AccessToken::from_static("garbage")]);
            let (manager, _) = manager_with(&source);

            let error = manager.refresh().await.unwrap_err();

            assert!(matches!(error, RefreshError::InvalidToken(_)));
            assert_eq!(manager.store().get(), None);
        }
    }

    mod when_expired_explicitly {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn store_is_cleared_timer_disarmed_and_expiry_published() {
            let source = FakeRefreshSource::issuing([token_expiring_in("next", 3_600)]);
            let (manager, _) = manager_with(&source);
            manager.set_token(token_expiring_in("first", 600)).unwrap();
            let mut events = manager.store().subscribe();

            manager.expire();

            assert_eq!(manager.store().get(), None);
            assert!(!manager.is_timer_armed());
            assert_eq!(events.recv().await.unwrap(), TokenEvent::Cleared);
            assert_eq!(events.recv().await.unwrap(), TokenEvent::Expired);

            tokio::time::advance(Duration::from_secs(900)).await;
            settle().await;
            assert_eq!(source.calls(), 0);
        }

        #[tokio::test]
        async fn expiry_is_published_even_without_a_token() {
            let source = FakeRefreshSource::failing();
            let (manager, _) = manager_with(&source);
            let mut events = manager.store().subscribe();

            manager.expire();

            assert_eq!(events.recv().await.unwrap(), TokenEvent::Expired);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn logout_during_refresh_discards_the_result() {
        let source =
            FakeRefreshSource::slowly_issuing(Duration::from_millis(250), token_expiring_in("new", 3_600));
        let (manager, _) = manager_with(&source);
        manager.store().set(token_expiring_in("old", 3_600));

        let pending = manager.refresh();
        manager.clear();

        assert!(matches!(pending.await, Err(RefreshError::SessionCleared)));
        assert_eq!(manager.store().get(), None);
    }

    #[tokio::test]
    async fn validity_follows_the_manager_clock() {
        let source = FakeRefreshSource::issuing([]);
        let (manager, clock) = manager_with(&source);
        let token = token_expiring_in("alice", 600);
        manager.store().set(token.clone());

        assert!(manager.is_valid(&token));
        assert!(!manager.is_expiring_soon(&token));

        clock.inc(400);
        assert!(manager.is_expiring_soon(&token));
        assert!(manager.valid_token().is_some());

        clock.inc(200);
        assert!(manager.is_expired(&token));
        assert_eq!(manager.valid_token(), None);
    }

    #[tokio::test]
    async fn separate_managers_do_not_share_tokens() {
        let tab_a_source = FakeRefreshSource::issuing([token_expiring_in("a-new", 3_600)]);
        let tab_b_source = FakeRefreshSource::issuing([]);
        let (tab_a, _) = manager_with(&tab_a_source);
        let (tab_b, _) = manager_with(&tab_b_source);
        let tab_b_token = token_expiring_in("b", 3_600);
        tab_b.store().set(tab_b_token.clone());

        tab_a.refresh().await.unwrap();

        assert_eq!(tab_b.store().get(), Some(tab_b_token));
        assert_eq!(tab_b_source.calls(), 0);
    }
}
