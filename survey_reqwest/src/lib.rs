//! Middleware to keep outgoing requests authorized with the client's session
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`SessionMiddleware`] in the middleware stack to attach the
//! session's current access token to each outbound request as a bearer
//! token.
//!
//! If a request is rejected with `401 Unauthorized`, the middleware renews
//! the session through its [`RefreshCoordinator`] and replays the request
//! once with the renewed token. Requests rejected while a renewal is already
//! in flight wait for that renewal rather than starting another, so a burst
//! of rejections costs a single call to the refresh endpoint. If the renewal
//! fails, the session is logged out, an
//! [`AuthEvent::SessionExpired`](survey_tokens::AuthEvent::SessionExpired)
//! is emitted once for the failed renewal, and every waiting request is
//! answered with its original `401` response.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, and a rejection of that request is returned as-is.
//!
//! ```
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use survey_reqwest::SessionMiddleware;
//! use survey_tokens::{
//!     refresh::{HttpRefreshExchange, DEFAULT_REFRESH_PATH},
//!     store::InMemoryTokenStore,
//!     RefreshCoordinator, Session,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let api = reqwest::Url::parse("http://localhost:8080").unwrap();
//! let session = Session::open(InMemoryTokenStore::new()).await;
//! let exchange =
//!     HttpRefreshExchange::from_base_url(Client::default(), &api, DEFAULT_REFRESH_PATH).unwrap();
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(SessionMiddleware::new(RefreshCoordinator::new(session, exchange)))
//!     .build();
//!
//! let req = client
//!     .get(api.join("/surveys").unwrap());
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! The middleware can also be configured to apply the session only
//! conditionally. Requests that do not match are passed through untouched:
//! no token is attached, and a rejection does not trigger a renewal.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a token to a request.
//!
//! ```
//! use predicates::prelude::PredicateBooleanExt;
//! use survey_reqwest::{HttpsOnly, SameOrigin, SessionMiddleware};
//! # use survey_tokens::{store::InMemoryTokenStore, testing::ScriptedExchange, RefreshCoordinator, Session};
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let session = Session::open(InMemoryTokenStore::new()).await;
//! # let coordinator = RefreshCoordinator::new(session, ScriptedExchange::failing());
//! let api = reqwest::Url::parse("https://surveys.example.com").unwrap();
//!
//! SessionMiddleware::new(coordinator)
//!     .with_predicate(HttpsOnly.and(SameOrigin::new(&api)));
//! # }
//! ```
//!
//! # Token rotation
//!
//! By default, JSON responses to matching requests are inspected for
//! top-level `accessToken` and `refreshToken` string fields, which are
//! stored in the session when present. Such a response is buffered and
//! rebuilt, and the rebuilt response no longer reports the URL it was
//! fetched from. Use
//! [`without_token_rotation()`][SessionMiddleware::without_token_rotation()]
//! to only accept tokens from the refresh endpoint.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use predicates::{constant::BooleanPredicate, prelude::*};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Error, Middleware, Next, Result};
use survey_tokens::{
    AccessToken, AccessTokenRef, RefreshCoordinator, RefreshOutcome, RefreshToken,
};
use tokio::sync::Mutex;

mod scope;

pub use scope::{HttpsOnly, SameOrigin};

/// The route users are sent to when their session expires
pub const DEFAULT_LANDING_ROUTE: &str = "/";

/// Marks a request that has already been replayed after a renewal
///
/// A request carrying this extension is never renewed and replayed again;
/// a second rejection is returned to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Retried;

/// A middleware that authorizes outgoing requests with the session's access
/// token, renewing the session when a request is rejected
#[derive(Clone, Debug)]
pub struct SessionMiddleware<P = BooleanPredicate> {
    coordinator: RefreshCoordinator,
    predicate: P,
    landing_route: String,
    rotate_tokens: bool,
    expired_flight: Arc<Mutex<u64>>,
}

impl SessionMiddleware<BooleanPredicate> {
    /// Construct a new middleware from a refresh coordinator
    ///
    /// By default, this middleware applies the session to every request. To
    /// change this behavior, provide a custom predicate with
    /// [`with_predicate()`][Self::with_predicate()].
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self {
            coordinator,
            predicate: predicate::always(),
            landing_route: DEFAULT_LANDING_ROUTE.to_owned(),
            rotate_tokens: true,
            expired_flight: Arc::new(Mutex::new(0)),
        }
    }
}

impl<P> SessionMiddleware<P> {
    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> SessionMiddleware<Q> {
        SessionMiddleware {
            coordinator: self.coordinator,
            predicate,
            landing_route: self.landing_route,
            rotate_tokens: self.rotate_tokens,
            expired_flight: self.expired_flight,
        }
    }

    /// Sets the route users are sent to when their session expires
    pub fn with_landing_route(self, route: impl Into<String>) -> Self {
        Self {
            landing_route: route.into(),
            ..self
        }
    }

    /// Stops accepting tokens rotated in on ordinary responses
    pub fn without_token_rotation(self) -> Self {
        Self {
            rotate_tokens: false,
            ..self
        }
    }

    /// The coordinator used to renew the session
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Logs the session out once per failed renewal, however many requests
    /// were waiting on it
    ///
    /// Requests arriving while the logout is underway wait for it to finish,
    /// so no caller sees its rejection before the tokens are cleared.
    async fn expire_once(&self, flight: u64) {
        let mut expired = self.expired_flight.lock().await;
        if *expired < flight {
            tracing::info!(flight, "renewal failed, logging out");
            self.coordinator
                .session()
                .expire(&self.landing_route)
                .await;
            *expired = flight;
        } else {
            tracing::debug!(flight, "session already expired for this renewal");
        }
    }

    async fn accept_rotated_tokens(&self, resp: Response) -> Result<Response> {
        if !self.rotate_tokens || !is_json(&resp) {
            return Ok(resp);
        }

        let status = resp.status();
        let version = resp.version();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;

        if let Some((access_token, refresh_token)) = rotated_tokens(&body) {
            tracing::info!(
                has_access_token = access_token.is_some(),
                has_refresh_token = refresh_token.is_some(),
                "response carried rotated tokens"
            );
            if let Err(error) = self
                .coordinator
                .session()
                .accept_rotation(access_token.as_deref(), refresh_token.as_deref())
                .await
            {
                tracing::warn!(%error, "unable to store rotated tokens");
            }
        }

        let mut rebuilt = http::Response::new(body);
        *rebuilt.status_mut() = status;
        *rebuilt.version_mut() = version;
        *rebuilt.headers_mut() = headers;
        Ok(Response::from(rebuilt))
    }
}

fn bearer(token: &AccessTokenRef) -> Result<header::HeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze())
        .map_err(Error::middleware)?;
    value.set_sensitive(true);
    Ok(value)
}

fn is_json(resp: &Response) -> bool {
    resp.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        .map_or(false, |mime| {
            mime.eq_ignore_ascii_case("application/json") || mime.ends_with("+json")
        })
}

fn rotated_tokens(body: &Bytes) -> Option<(Option<AccessToken>, Option<RefreshToken>)> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let field = |name: &str| {
        value
            .get(name)
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };

    let access_token = field("accessToken").map(AccessToken::new);
    let refresh_token = field("refreshToken").map(RefreshToken::new);
    if access_token.is_none() && refresh_token.is_none() {
        None
    } else {
        Some((access_token, refresh_token))
    }
}

#[async_trait::async_trait]
impl<P> Middleware for SessionMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) {
            tracing::trace!(url = %req.url(), "request outside of session scope");
            return next.run(req, extensions).await;
        }

        let caller_authorized = req.headers().contains_key(header::AUTHORIZATION);
        if !caller_authorized {
            match self.coordinator.session().access_token().await {
                Some(token) => {
                    tracing::trace!(token = format_args!("{:#?}", token), "attaching access token");
                    req.headers_mut()
                        .insert(header::AUTHORIZATION, bearer(&token)?);
                }
                None => tracing::trace!("no access token to attach"),
            }
        }

        let replay = if caller_authorized || extensions.get::<Retried>().is_some() {
            None
        } else {
            req.try_clone()
        };

        let resp = next.clone().run(req, extensions).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return self.accept_rotated_tokens(resp).await;
        }

        let Some(mut replay) = replay else {
            tracing::debug!(
                caller_authorized,
                "request unauthorized and not eligible for renewal"
            );
            return Ok(resp);
        };

        extensions.insert(Retried);
        let ticket = self.coordinator.start_or_join();
        tracing::debug!(
            flight = ticket.flight(),
            started = ticket.started(),
            "request unauthorized, awaiting renewal"
        );

        match ticket.outcome().await {
            RefreshOutcome::Renewed {
                flight,
                access_token,
            } => {
                tracing::debug!(flight, "replaying request with renewed token");
                replay
                    .headers_mut()
                    .insert(header::AUTHORIZATION, bearer(&access_token)?);
                let resp = next.run(replay, extensions).await?;
                self.accept_rotated_tokens(resp).await
            }
            RefreshOutcome::Failed { flight } => {
                self.expire_once(flight).await;
                Ok(resp)
            }
        }
    }
}
