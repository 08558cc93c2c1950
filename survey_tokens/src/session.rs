use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use survey_clock::{Clock, DurationSecs, System, UnixTime};
use tokio::sync::{
    broadcast::{self, error::RecvError, error::TryRecvError},
    Mutex, MutexGuard,
};

use crate::{
    inspect,
    store::{StoreError, TokenSlot, TokenStore},
    AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef,
};

const EVENT_CAPACITY: usize = 64;

/// A notification about the session's authentication state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    /// The session moved between authenticated and unauthenticated
    ///
    /// Only emitted on an actual transition; recomputing an unchanged state
    /// is silent.
    Changed {
        /// Whether the session is now authenticated
        authenticated: bool,
    },
    /// [`Session::login()`] was called
    LoggedIn,
    /// [`Session::logout()`] was called
    LoggedOut,
    /// The session could not be renewed and was logged out
    ///
    /// The application should move to `redirect_to`, its public entry point.
    SessionExpired {
        /// The route to send the user to
        redirect_to: String,
    },
}

/// A live subscription to a session's [`AuthEvent`]s
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct AuthSubscription {
    rx: broadcast::Receiver<AuthEvent>,
}

impl AuthSubscription {
    /// Waits for the next event
    ///
    /// Returns `None` once the session has been dropped. A subscriber that
    /// falls too far behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<AuthEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "auth subscriber lagged, skipping missed events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next event if one is already waiting
    pub fn try_recv(&mut self) -> Option<AuthEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Ends the subscription
    pub fn unsubscribe(self) {}
}

/// The authentication state of one client session
///
/// The session owns the token store and a single derived flag: whether the
/// stored access token is currently valid. The flag is never set directly;
/// it is recomputed from the store after every login, logout, and renewal,
/// and observers are notified through [`subscribe()`][Self::subscribe()].
///
/// Share it as an `Arc<Session>` with everything that needs to read or
/// change the session.
pub struct Session {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock + Send + Sync>,
    authenticated: AtomicBool,
    writer: Mutex<()>,
    events: broadcast::Sender<AuthEvent>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store.name())
            .field("authenticated", &self.is_authenticated())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl Session {
    /// Opens a session over `store`, using the system clock
    ///
    /// The authentication state is computed from whatever the store
    /// already holds.
    pub async fn open<S>(store: S) -> Arc<Self>
    where
        S: TokenStore + 'static,
    {
        Self::open_with_clock(store, System).await
    }

    /// Opens a session over `store`, judging token expiry with `clock`
    pub async fn open_with_clock<S, C>(store: S, clock: C) -> Arc<Self>
    where
        S: TokenStore + 'static,
        C: Clock + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let session = Arc::new(Self {
            store: Arc::new(store),
            clock: Arc::new(clock),
            authenticated: AtomicBool::new(false),
            writer: Mutex::new(()),
            events,
        });

        let authenticated = session.recompute().await;
        tracing::debug!(
            store = session.store.name(),
            authenticated,
            "opened session"
        );

        session
    }

    /// Subscribes to authentication events
    pub fn subscribe(&self) -> AuthSubscription {
        AuthSubscription {
            rx: self.events.subscribe(),
        }
    }

    /// The most recently computed authentication state
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// The current time according to the session's clock
    #[inline]
    pub fn now(&self) -> UnixTime {
        self.clock.now()
    }

    /// Recomputes the authentication state from the stored access token
    ///
    /// Emits [`AuthEvent::Changed`] only if the state differs from the
    /// previous computation.
    pub async fn recompute(&self) -> bool {
        let guard = self.writer.lock().await;
        self.recompute_locked(&guard).await
    }

    /// Whether the stored access token is currently valid
    ///
    /// Unlike [`recompute()`][Self::recompute()], this does not update the
    /// session's state or notify anyone.
    pub async fn validate_token(&self) -> bool {
        match self.access_token().await {
            Some(token) => inspect::is_valid_with_clock(token.as_str(), &*self.clock),
            None => false,
        }
    }

    /// Whether the stored access token expires within `lead`
    ///
    /// A missing or undecodable token is always about to expire.
    pub async fn expires_within(&self, lead: DurationSecs) -> bool {
        let token = self.access_token().await;
        let token = token.as_ref().map_or("", |t| t.as_str());
        inspect::is_expiring_soon_with_clock(token, lead, &*self.clock)
    }

    /// The stored access token, if any
    pub async fn access_token(&self) -> Option<AccessToken> {
        self.read(TokenSlot::Access).await.map(AccessToken::new)
    }

    /// The stored refresh token, if any
    pub async fn refresh_token(&self) -> Option<RefreshToken> {
        self.read(TokenSlot::Refresh).await.map(RefreshToken::new)
    }

    /// Stores newly issued tokens and recomputes the authentication state
    ///
    /// Empty tokens are ignored. [`AuthEvent::LoggedIn`] is emitted on every
    /// call, after any state transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be written. The state is
    /// recomputed and the event emitted regardless.
    pub async fn login(
        &self,
        access_token: AccessToken,
        refresh_token: Option<RefreshToken>,
    ) -> Result<bool, StoreError> {
        let guard = self.writer.lock().await;
        let stored = self
            .persist(Some(&access_token), refresh_token.as_deref())
            .await;
        let authenticated = self.recompute_locked(&guard).await;
        self.emit(AuthEvent::LoggedIn);
        stored.map(|()| authenticated)
    }

    /// Clears both tokens and recomputes the authentication state
    ///
    /// [`AuthEvent::LoggedOut`] is emitted on every call, after any state
    /// transition.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered clearing the store. Both slots
    /// are still attempted, and the state is recomputed regardless.
    pub async fn logout(&self) -> Result<(), StoreError> {
        let guard = self.writer.lock().await;
        let access = self.store.remove(TokenSlot::Access).await;
        let refresh = self.store.remove(TokenSlot::Refresh).await;
        self.recompute_locked(&guard).await;
        self.emit(AuthEvent::LoggedOut);
        access.and(refresh)
    }

    /// Stores tokens that a server rotated in on an ordinary response
    ///
    /// Unlike [`login()`][Self::login()], this only notifies on an actual
    /// state transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be written.
    pub async fn accept_rotation(
        &self,
        access_token: Option<&AccessTokenRef>,
        refresh_token: Option<&RefreshTokenRef>,
    ) -> Result<(), StoreError> {
        let guard = self.writer.lock().await;
        let stored = self.persist(access_token, refresh_token).await;
        self.recompute_locked(&guard).await;
        stored
    }

    /// Forces a logout because the session can no longer be renewed
    ///
    /// Emits [`AuthEvent::SessionExpired`] after the logout so that the
    /// application can send the user to `redirect_to`.
    pub async fn expire(&self, redirect_to: &str) {
        if let Err(error) = self.logout().await {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "unable to clear token store while expiring session"
            );
        }

        tracing::warn!(redirect_to, "session expired");
        self.emit(AuthEvent::SessionExpired {
            redirect_to: redirect_to.to_owned(),
        });
    }

    async fn persist(
        &self,
        access_token: Option<&AccessTokenRef>,
        refresh_token: Option<&RefreshTokenRef>,
    ) -> Result<(), StoreError> {
        if let Some(token) = access_token.filter(|t| !t.as_str().is_empty()) {
            self.store.set(TokenSlot::Access, token.as_str()).await?;
        }
        if let Some(token) = refresh_token.filter(|t| !t.as_str().is_empty()) {
            self.store.set(TokenSlot::Refresh, token.as_str()).await?;
        }
        Ok(())
    }

    async fn read(&self, slot: TokenSlot) -> Option<String> {
        match self.store.get(slot).await {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(error) => {
                tracing::warn!(
                    store = self.store.name(),
                    %slot,
                    error = (&error as &dyn std::error::Error),
                    "unable to read token store, treating token as absent"
                );
                None
            }
        }
    }

    async fn recompute_locked(&self, _writer: &MutexGuard<'_, ()>) -> bool {
        let authenticated = match self.read(TokenSlot::Access).await {
            Some(token) => inspect::is_valid_with_clock(&token, &*self.clock),
            None => false,
        };

        let previous = self.authenticated.swap(authenticated, Ordering::AcqRel);
        if previous != authenticated {
            tracing::info!(
                authenticated,
                "auth state changed: {}",
                if authenticated { "logged in" } else { "logged out" }
            );
            self.emit(AuthEvent::Changed { authenticated });
        }

        authenticated
    }

    fn emit(&self, event: AuthEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("no auth subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use async_trait::async_trait;
    use color_eyre::Result;
    use survey_clock::TestClock;
    use tracing_test::traced_test;

    use super::*;
    use crate::{store::InMemoryTokenStore, testing::mint_token};

    const NOW: UnixTime = UnixTime(1_700_000_000);

    struct Fixture {
        store: Arc<InMemoryTokenStore>,
        clock: Arc<TestClock>,
        session: Arc<Session>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryTokenStore::new());
        let clock = Arc::new(TestClock::new(NOW));
        let session = Session::open_with_clock(store.clone(), clock.clone()).await;
        Fixture {
            store,
            clock,
            session,
        }
    }

    fn drain(sub: &mut AuthSubscription) -> Vec<AuthEvent> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    fn transitions(events: &[AuthEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, AuthEvent::Changed { .. }))
            .count()
    }

    #[tokio::test]
    async fn empty_store_is_not_authenticated() {
        let f = fixture().await;
        assert!(!f.session.is_authenticated());
        assert!(!f.session.validate_token().await);
        assert!(f.session.expires_within(DurationSecs(120)).await);
    }

    #[tokio::test]
    async fn opening_over_a_valid_token_starts_authenticated() -> Result<()> {
        let store = Arc::new(InMemoryTokenStore::new());
        store
            .set(TokenSlot::Access, &mint_token(NOW + DurationSecs(3600)))
            .await?;

        let session = Session::open_with_clock(store, TestClock::new(NOW)).await;

        assert!(session.is_authenticated());
        assert!(session.validate_token().await);
        Ok(())
    }

    #[tokio::test]
    async fn login_notifies_transition_then_login() -> Result<()> {
        let f = fixture().await;
        let mut sub = f.session.subscribe();

        let authenticated = f
            .session
            .login(
                AccessToken::new(mint_token(NOW + DurationSecs(3600))),
                Some(RefreshToken::from_static("refresh-1")),
            )
            .await?;

        assert!(authenticated);
        assert_eq!(
            drain(&mut sub),
            vec![
                AuthEvent::Changed {
                    authenticated: true
                },
                AuthEvent::LoggedIn
            ]
        );
        assert_eq!(
            f.store.get(TokenSlot::Refresh).await?.as_deref(),
            Some("refresh-1")
        );
        Ok(())
    }

    #[tokio::test]
    async fn repeated_login_is_observable_without_a_transition() -> Result<()> {
        let f = fixture().await;
        let token = mint_token(NOW + DurationSecs(3600));
        f.session.login(AccessToken::new(token.clone()), None).await?;

        let mut sub = f.session.subscribe();
        f.session.login(AccessToken::new(token), None).await?;

        assert_eq!(drain(&mut sub), vec![AuthEvent::LoggedIn]);
        Ok(())
    }

    #[tokio::test]
    async fn login_with_an_expired_token_stays_unauthenticated() -> Result<()> {
        let f = fixture().await;
        let mut sub = f.session.subscribe();

        let authenticated = f
            .session
            .login(AccessToken::new(mint_token(NOW - DurationSecs(1))), None)
            .await?;

        assert!(!authenticated);
        assert_eq!(drain(&mut sub), vec![AuthEvent::LoggedIn]);
        Ok(())
    }

    #[tokio::test]
    async fn login_ignores_empty_tokens() -> Result<()> {
        let f = fixture().await;
        f.store.set(TokenSlot::Refresh, "refresh-1").await?;

        f.session
            .login(AccessToken::from_static(""), Some(RefreshToken::from_static("")))
            .await?;

        assert_eq!(f.store.get(TokenSlot::Access).await?, None);
        assert_eq!(
            f.store.get(TokenSlot::Refresh).await?.as_deref(),
            Some("refresh-1")
        );
        Ok(())
    }

    #[tokio::test]
    async fn logout_twice_transitions_once() -> Result<()> {
        let f = fixture().await;
        f.session
            .login(
                AccessToken::new(mint_token(NOW + DurationSecs(3600))),
                Some(RefreshToken::from_static("refresh-1")),
            )
            .await?;
        let mut sub = f.session.subscribe();

        f.session.logout().await?;
        let first = drain(&mut sub);
        assert!(!f.session.is_authenticated());
        assert_eq!(f.store.get(TokenSlot::Access).await?, None);
        assert_eq!(f.store.get(TokenSlot::Refresh).await?, None);

        f.session.logout().await?;
        let second = drain(&mut sub);
        assert!(!f.session.is_authenticated());
        assert_eq!(f.store.get(TokenSlot::Access).await?, None);

        assert_eq!(transitions(&first), 1);
        assert_eq!(transitions(&second), 0);
        assert_eq!(first.last(), Some(&AuthEvent::LoggedOut));
        assert_eq!(second, vec![AuthEvent::LoggedOut]);
        Ok(())
    }

    #[tokio::test]
    async fn recompute_without_change_is_silent() -> Result<()> {
        let f = fixture().await;
        f.session
            .login(AccessToken::new(mint_token(NOW + DurationSecs(3600))), None)
            .await?;
        let mut sub = f.session.subscribe();

        assert!(f.session.recompute().await);
        assert!(f.session.recompute().await);

        assert!(drain(&mut sub).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn recompute_notices_a_token_lapsing() -> Result<()> {
        let f = fixture().await;
        f.session
            .login(AccessToken::new(mint_token(NOW + DurationSecs(60))), None)
            .await?;
        let mut sub = f.session.subscribe();

        f.clock.advance(DurationSecs(61));

        assert!(!f.session.recompute().await);
        assert_eq!(
            drain(&mut sub),
            vec![AuthEvent::Changed {
                authenticated: false
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn rotation_persists_without_a_login_event() -> Result<()> {
        let f = fixture().await;
        let mut sub = f.session.subscribe();
        let rotated = AccessToken::new(mint_token(NOW + DurationSecs(3600)));

        f.session
            .accept_rotation(Some(&rotated), Some(RefreshTokenRef::from_str("refresh-2")))
            .await?;

        assert_eq!(
            drain(&mut sub),
            vec![AuthEvent::Changed {
                authenticated: true
            }]
        );
        assert_eq!(f.session.access_token().await, Some(rotated));
        assert_eq!(
            f.session.refresh_token().await,
            Some(RefreshToken::from_static("refresh-2"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn expiring_logs_out_then_asks_for_a_redirect() -> Result<()> {
        let f = fixture().await;
        f.session
            .login(
                AccessToken::new(mint_token(NOW + DurationSecs(3600))),
                Some(RefreshToken::from_static("refresh-1")),
            )
            .await?;
        let mut sub = f.session.subscribe();

        f.session.expire("/").await;

        assert_eq!(
            drain(&mut sub),
            vec![
                AuthEvent::Changed {
                    authenticated: false
                },
                AuthEvent::LoggedOut,
                AuthEvent::SessionExpired {
                    redirect_to: "/".to_owned()
                },
            ]
        );
        assert_eq!(f.store.get(TokenSlot::Refresh).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_subscription_stops_receiving() -> Result<()> {
        let f = fixture().await;
        let sub = f.session.subscribe();
        let mut kept = f.session.subscribe();
        sub.unsubscribe();

        f.session.logout().await?;

        assert_eq!(drain(&mut kept), vec![AuthEvent::LoggedOut]);
        Ok(())
    }

    struct BrokenStore;

    #[async_trait]
    impl TokenStore for BrokenStore {
        async fn get(&self, _: TokenSlot) -> Result<Option<String>, StoreError> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied").into())
        }

        async fn set(&self, _: TokenSlot, _: &str) -> Result<(), StoreError> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied").into())
        }

        async fn remove(&self, _: TokenSlot) -> Result<(), StoreError> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied").into())
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn unreadable_store_fails_closed() {
        let session = Session::open_with_clock(BrokenStore, TestClock::new(NOW)).await;
        let mut sub = session.subscribe();

        assert!(!session.is_authenticated());
        assert!(!session.validate_token().await);
        assert!(logs_contain("unable to read token store"));

        let result = session
            .login(AccessToken::new(mint_token(NOW + DurationSecs(3600))), None)
            .await;
        assert!(matches!(result, Err(StoreError::Io(_))));
        assert_eq!(drain(&mut sub), vec![AuthEvent::LoggedIn]);
    }
}
