//! Single-flight renewal of session tokens
//!
//! At most one exchange of the refresh token is ever in flight. Callers that
//! need a renewed token while one is running queue behind it and observe the
//! same [`RefreshOutcome`], in the order in which they arrived.
//!
//! The exchange runs on its own task. A caller that gives up waiting does not
//! abandon the others, and a task that panics or is aborted still settles its
//! flight as failed, so a later refresh is never blocked by an earlier one.

use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::{AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef, Session};

pub mod dto;
mod http;

pub use http::{HttpRefreshExchange, RefreshRequestError, DEFAULT_REFRESH_PATH};

/// A boxed error returned by a [`RefreshExchange`]
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Tokens issued in exchange for a refresh token
#[derive(Clone, Debug)]
pub struct RenewedTokens {
    /// The new access token
    pub access_token: AccessToken,
    /// A replacement refresh token, if one was issued
    pub refresh_token: Option<RefreshToken>,
}

/// An authority able to exchange a refresh token for new tokens
#[async_trait]
pub trait RefreshExchange: Send + Sync {
    /// Exchanges the refresh token
    ///
    /// Any error, including a well-formed response that lacks an access
    /// token, is a failed renewal.
    async fn exchange(&self, refresh_token: &RefreshTokenRef) -> Result<RenewedTokens, BoxError>;
}

#[async_trait]
impl<T> RefreshExchange for Arc<T>
where
    T: RefreshExchange + ?Sized,
{
    async fn exchange(&self, refresh_token: &RefreshTokenRef) -> Result<RenewedTokens, BoxError> {
        (**self).exchange(refresh_token).await
    }
}

/// The settled result of one refresh flight
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New tokens were issued and stored
    Renewed {
        /// The flight that produced this outcome
        flight: u64,
        /// The access token now held by the session
        access_token: AccessToken,
    },
    /// The tokens could not be renewed; stored tokens are unchanged
    Failed {
        /// The flight that produced this outcome
        flight: u64,
    },
}

impl RefreshOutcome {
    /// The flight that produced this outcome
    ///
    /// Flight identifiers increase monotonically for a given coordinator.
    pub fn flight(&self) -> u64 {
        match self {
            Self::Renewed { flight, .. } | Self::Failed { flight } => *flight,
        }
    }

    /// Whether the flight renewed the tokens
    pub fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }

    /// The renewed access token, if any
    pub fn access_token(&self) -> Option<&AccessTokenRef> {
        match self {
            Self::Renewed { access_token, .. } => Some(access_token),
            Self::Failed { .. } => None,
        }
    }
}

/// A place in line for the outcome of a refresh flight
#[derive(Debug)]
#[must_use = "a ticket does nothing unless its outcome is awaited"]
pub struct RefreshTicket {
    flight: u64,
    started: bool,
    rx: oneshot::Receiver<RefreshOutcome>,
}

impl RefreshTicket {
    /// The flight this ticket is waiting on
    pub fn flight(&self) -> u64 {
        self.flight
    }

    /// Whether taking this ticket started the flight, rather than joining one
    /// already in progress
    pub fn started(&self) -> bool {
        self.started
    }

    /// Waits for the flight to settle
    pub async fn outcome(self) -> RefreshOutcome {
        let flight = self.flight;
        self.rx
            .await
            .unwrap_or(RefreshOutcome::Failed { flight })
    }
}

/// Coordinates renewal of a session's tokens so that only one exchange is
/// ever in flight
///
/// Cloning a coordinator is cheap; all clones share the same flight state.
/// A coordinator never logs the session out by itself: deciding what a
/// failed renewal means is left to its callers.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    session: Arc<Session>,
    exchange: Arc<dyn RefreshExchange>,
    state: Mutex<FlightState>,
}

#[derive(Default)]
struct FlightState {
    last_flight: u64,
    current: Option<Flight>,
}

struct Flight {
    id: u64,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("RefreshCoordinator")
            .field("session", &self.inner.session)
            .field("last_flight", &state.last_flight)
            .field("in_flight", &state.current.as_ref().map(|f| f.id))
            .field("waiters", &state.current.as_ref().map_or(0, |f| f.waiters.len()))
            .finish()
    }
}

impl RefreshCoordinator {
    /// Constructs a coordinator that renews `session` through `exchange`
    pub fn new<E>(session: Arc<Session>, exchange: E) -> Self
    where
        E: RefreshExchange + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                session,
                exchange: Arc::new(exchange),
                state: Mutex::new(FlightState::default()),
            }),
        }
    }

    /// The session being renewed
    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_state().current.is_some()
    }

    /// Attempts to renew the session's tokens
    ///
    /// Returns `false` immediately, without contacting the authority, if a
    /// refresh is already in flight or if no refresh token is stored.
    /// Otherwise returns whether the renewal succeeded.
    pub async fn refresh(&self) -> bool {
        if self.is_refreshing() {
            tracing::debug!("refresh already in flight, not starting another");
            return false;
        }

        if self.inner.session.refresh_token().await.is_none() {
            tracing::debug!("no refresh token stored, unable to refresh");
            return false;
        }

        match self.try_start() {
            Some(ticket) => ticket.outcome().await.is_renewed(),
            None => {
                tracing::debug!("refresh already in flight, not starting another");
                false
            }
        }
    }

    /// Awaits a renewal, joining one already in flight rather than declining
    ///
    /// Returns `false` if no refresh token is stored or the renewal failed.
    pub async fn refresh_or_join(&self) -> bool {
        self.start_or_join().outcome().await.is_renewed()
    }

    /// Starts a refresh, or queues behind the one already in flight
    ///
    /// The decision is made atomically: concurrent callers produce exactly
    /// one flight, and every ticket observes its outcome. Waiters are
    /// notified in the order they took their tickets.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_or_join(&self) -> RefreshTicket {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock_state();

        if let Some(flight) = &mut state.current {
            flight.waiters.push(tx);
            tracing::debug!(
                flight = flight.id,
                queued = flight.waiters.len() - 1,
                "queued behind in-flight refresh"
            );
            return RefreshTicket {
                flight: flight.id,
                started: false,
                rx,
            };
        }

        RefreshTicket {
            flight: self.launch(state, tx),
            started: true,
            rx,
        }
    }

    fn try_start(&self) -> Option<RefreshTicket> {
        let state = self.inner.lock_state();
        if state.current.is_some() {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        Some(RefreshTicket {
            flight: self.launch(state, tx),
            started: true,
            rx,
        })
    }

    fn launch(
        &self,
        mut state: MutexGuard<'_, FlightState>,
        leader: oneshot::Sender<RefreshOutcome>,
    ) -> u64 {
        state.last_flight += 1;
        let id = state.last_flight;
        state.current = Some(Flight {
            id,
            waiters: vec![leader],
        });
        drop(state);

        tracing::debug!(flight = id, "starting refresh");
        tokio::spawn(run_flight(self.inner.clone(), id));
        id
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, FlightState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: RefreshOutcome) {
        let waiters = {
            let mut state = self.lock_state();
            match state.current.take() {
                Some(flight) if flight.id == outcome.flight() => flight.waiters,
                other => {
                    state.current = other;
                    return;
                }
            }
        };

        tracing::debug!(
            flight = outcome.flight(),
            renewed = outcome.is_renewed(),
            waiters = waiters.len(),
            "refresh settled"
        );

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn renew(&self, flight: u64) -> RefreshOutcome {
        let Some(refresh_token) = self.session.refresh_token().await else {
            tracing::debug!(flight, "no refresh token stored, unable to refresh");
            return RefreshOutcome::Failed { flight };
        };

        let renewed = match self.exchange.exchange(&refresh_token).await {
            Ok(renewed) => renewed,
            Err(error) => {
                tracing::warn!(
                    flight,
                    error = (&*error as &dyn error::Error),
                    "unable to renew session tokens"
                );
                return RefreshOutcome::Failed { flight };
            }
        };

        let rotated = renewed.refresh_token.is_some();
        let access_token = renewed.access_token.clone();
        match self
            .session
            .login(renewed.access_token, renewed.refresh_token)
            .await
        {
            Ok(authenticated) => {
                tracing::info!(flight, authenticated, rotated, "renewed session tokens");
                RefreshOutcome::Renewed {
                    flight,
                    access_token,
                }
            }
            Err(error) => {
                tracing::warn!(
                    flight,
                    error = (&error as &dyn error::Error),
                    "unable to store renewed session tokens"
                );
                RefreshOutcome::Failed { flight }
            }
        }
    }
}

async fn run_flight(inner: Arc<Inner>, flight: u64) {
    let guard = SettleOnDrop {
        inner,
        flight,
        settled: false,
    };
    let outcome = guard.inner.renew(flight).await;
    guard.settle(outcome);
}

/// Settles the flight as failed if the task ends without settling it
struct SettleOnDrop {
    inner: Arc<Inner>,
    flight: u64,
    settled: bool,
}

impl SettleOnDrop {
    fn settle(mut self, outcome: RefreshOutcome) {
        self.settled = true;
        self.inner.settle(outcome);
    }
}

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                flight = self.flight,
                "refresh task ended without settling, failing its waiters"
            );
            self.inner.settle(RefreshOutcome::Failed {
                flight: self.flight,
            });
        }
    }
}
