use std::time::Duration;

use survey_clock::DurationSecs;
use tokio::{
    task::AbortHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::RefreshCoordinator;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the background session watcher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchConfig {
    interval: DurationSecs,
    lead: DurationSecs,
}

impl Default for WatchConfig {
    /// Checks once a minute, renewing tokens that expire within five minutes
    fn default() -> Self {
        Self {
            interval: DurationSecs(60),
            lead: DurationSecs(300),
        }
    }
}

impl WatchConfig {
    /// Constructs a new watch configuration
    pub const fn new(interval: DurationSecs, lead: DurationSecs) -> Self {
        Self { interval, lead }
    }

    /// Sets how often the session is checked
    ///
    /// Intervals shorter than one second are treated as one second.
    pub const fn with_interval(self, interval: DurationSecs) -> Self {
        Self { interval, ..self }
    }

    /// Sets how long before expiry a token is renewed
    pub const fn with_lead(self, lead: DurationSecs) -> Self {
        Self { lead, ..self }
    }

    /// How often the session is checked
    pub const fn interval(&self) -> DurationSecs {
        self.interval
    }

    /// How long before expiry a token is renewed
    pub const fn lead(&self) -> DurationSecs {
        self.lead
    }
}

/// A background task that keeps a session fresh
///
/// On every tick the session's authentication state is recomputed, so a token
/// that lapses silently is noticed. If the session is still authenticated but
/// its token expires within the configured lead time, and no refresh is
/// already in flight, a refresh is started.
///
/// The task stops when the watcher is shut down or dropped.
#[derive(Debug)]
pub struct SessionWatcher {
    task: AbortHandle,
}

impl SessionWatcher {
    /// Spawns a watcher over the coordinator's session
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(coordinator: RefreshCoordinator, config: WatchConfig) -> Self {
        let join = tokio::spawn(forever_watch(coordinator, config));
        let task = join.abort_handle();

        tokio::spawn(async move {
            match join.await {
                Err(err) if err.is_panic() => tracing::error!("session watcher panicked!"),
                Err(_) => tracing::debug!("session watcher stopped"),
                Ok(()) => {}
            }
        });

        Self { task }
    }

    /// Stops the watcher
    pub fn shutdown(self) {
        self.task.abort();
    }

    /// Whether the watcher has stopped
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn forever_watch(coordinator: RefreshCoordinator, config: WatchConfig) {
    let period = Duration::from(config.interval).max(MIN_INTERVAL);
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        interval = period.as_secs(),
        lead = config.lead.0,
        "watching session"
    );

    loop {
        ticks.tick().await;
        check_session(&coordinator, config.lead).await;
    }
}

async fn check_session(coordinator: &RefreshCoordinator, lead: DurationSecs) {
    let session = coordinator.session();

    if !session.recompute().await {
        tracing::trace!("session not authenticated, nothing to renew");
        return;
    }

    if !session.expires_within(lead).await {
        tracing::trace!(lead = lead.0, "session token not yet due for renewal");
        return;
    }

    if coordinator.is_refreshing() {
        tracing::debug!("session token due for renewal, refresh already in flight");
        return;
    }

    tracing::debug!(lead = lead.0, "session token due for renewal, refreshing");
    if !coordinator.refresh().await {
        tracing::info!("background refresh did not renew the session");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use color_eyre::Result;
    use survey_clock::{TestClock, UnixTime};

    use super::*;
    use crate::{
        store::{InMemoryTokenStore, TokenSlot, TokenStore},
        testing::{mint_token, ScriptedExchange},
        AuthEvent, AuthSubscription, Session,
    };

    const NOW: UnixTime = UnixTime(1_700_000_000);

    struct Fixture {
        store: Arc<InMemoryTokenStore>,
        clock: Arc<TestClock>,
        exchange: Arc<ScriptedExchange>,
        coordinator: RefreshCoordinator,
    }

    async fn fixture(expires_in: DurationSecs, renewed: &str) -> Result<Fixture> {
        let store = Arc::new(InMemoryTokenStore::new());
        store
            .set(TokenSlot::Access, &mint_token(NOW + expires_in))
            .await?;
        store.set(TokenSlot::Refresh, "refresh-1").await?;

        let clock = Arc::new(TestClock::new(NOW));
        let session = Session::open_with_clock(store.clone(), clock.clone()).await;
        let exchange = Arc::new(ScriptedExchange::renewing(renewed));
        let coordinator = RefreshCoordinator::new(session, exchange.clone());

        Ok(Fixture {
            store,
            clock,
            exchange,
            coordinator,
        })
    }

    async fn wait_for(sub: &mut AuthSubscription, expected: AuthEvent) -> bool {
        let seen = async {
            while let Some(event) = sub.recv().await {
                if event == expected {
                    return true;
                }
            }
            false
        };
        tokio::time::timeout(Duration::from_secs(600), seen)
            .await
            .unwrap_or(false)
    }

    #[test]
    fn defaults_check_every_minute_with_five_minutes_lead() {
        let config = WatchConfig::default();
        assert_eq!(config.interval(), DurationSecs(60));
        assert_eq!(config.lead(), DurationSecs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn renews_a_token_nearing_expiry() -> Result<()> {
        let renewed = mint_token(NOW + DurationSecs(3600));
        let f = fixture(DurationSecs(200), &renewed).await?;
        let mut sub = f.coordinator.session().subscribe();

        let _watcher = SessionWatcher::spawn(f.coordinator.clone(), WatchConfig::default());

        assert!(wait_for(&mut sub, AuthEvent::LoggedIn).await);
        assert_eq!(f.store.get(TokenSlot::Access).await?, Some(renewed));
        assert_eq!(f.exchange.calls(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn leaves_a_fresh_token_alone() -> Result<()> {
        let f = fixture(DurationSecs(3600), "unused").await?;

        let _watcher = SessionWatcher::spawn(f.coordinator.clone(), WatchConfig::default());
        tokio::time::sleep(Duration::from_secs(181)).await;

        assert_eq!(f.exchange.calls(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn notices_a_token_that_lapsed_silently() -> Result<()> {
        let f = fixture(DurationSecs(30), "unused").await?;
        let mut sub = f.coordinator.session().subscribe();
        assert!(f.coordinator.session().is_authenticated());

        f.clock.advance(DurationSecs(31));
        let _watcher = SessionWatcher::spawn(f.coordinator.clone(), WatchConfig::default());

        assert!(
            wait_for(
                &mut sub,
                AuthEvent::Changed {
                    authenticated: false
                }
            )
            .await
        );
        assert_eq!(f.exchange.calls(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_shutdown() -> Result<()> {
        let f = fixture(DurationSecs(200), "unused").await?;

        let watcher = SessionWatcher::spawn(f.coordinator.clone(), WatchConfig::default());
        watcher.shutdown();
        tokio::time::sleep(Duration::from_secs(181)).await;

        assert_eq!(f.exchange.calls(), 0);
        Ok(())
    }
}
