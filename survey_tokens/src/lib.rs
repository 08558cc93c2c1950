//! Session token management for the survey client
//!
//! A client session holds two opaque bearer tokens: a short-lived access
//! token presented on every API call, and a longer-lived refresh token that
//! can be exchanged for a new access token once the current one lapses. This
//! crate keeps those tokens, decides whether they are still worth presenting,
//! and renews them without ever running two renewals at once.
//!
//! * A [`TokenStore`][store::TokenStore] persists the two tokens under the
//!   `accessToken` and `refreshToken` keys.
//! * The [`inspect`] module reads a token's `exp` claim, failing closed on
//!   anything it cannot decode.
//! * A [`Session`] derives the authentication state from the stored access
//!   token and notifies subscribers when it changes, or when the user logs in
//!   or out.
//! * A [`RefreshCoordinator`] renews the tokens with a
//!   [`RefreshExchange`][refresh::RefreshExchange], queueing concurrent
//!   callers behind a single in-flight exchange.
//! * A [`SessionWatcher`] renews tokens in the background shortly before
//!   they expire.
//!
//! ```no_run
//! use survey_tokens::{
//!     refresh::{HttpRefreshExchange, DEFAULT_REFRESH_PATH},
//!     store::FileTokenStore,
//!     RefreshCoordinator, Session, SessionWatcher, WatchConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let api = reqwest::Url::parse("http://localhost:8080")?;
//!
//! let session = Session::open(FileTokenStore::new(".session.json")).await;
//! let exchange =
//!     HttpRefreshExchange::from_base_url(reqwest::Client::new(), &api, DEFAULT_REFRESH_PATH)?;
//! let coordinator = RefreshCoordinator::new(session.clone(), exchange);
//!
//! let _watcher = SessionWatcher::spawn(coordinator.clone(), WatchConfig::default());
//!
//! let mut events = session.subscribe();
//! while let Some(event) = events.recv().await {
//!     tracing::info!(?event, "auth event");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `file` (default): Provides [`FileTokenStore`][store::FileTokenStore],
//!   which persists tokens to the local filesystem.
//! * `testing`: Provides helpers for minting tokens and scripting refresh
//!   exchanges in tests.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod inspect;
pub mod refresh;
mod session;
pub mod store;
#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
mod watcher;

pub use braids::*;
pub use refresh::{RefreshCoordinator, RefreshOutcome, RefreshTicket};
pub use session::{AuthEvent, AuthSubscription, Session};
pub use watcher::{SessionWatcher, WatchConfig};
