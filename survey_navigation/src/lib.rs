//! Guarding page transitions on the client's session
//!
//! Pages are either public, and open to anyone, or protected, and open only
//! to a session holding a valid access token. The [`NavigationGuard`] is
//! consulted before every transition. When the target is protected and the
//! session's access token is about to expire, the guard first waits for one
//! renewal, so that a user moving between pages is not turned away by a
//! token that was seconds from being replaced.
//!
//! ```
//! use survey_navigation::{Navigation, NavigationGuard};
//! use survey_tokens::{
//!     store::InMemoryTokenStore, testing::ScriptedExchange, RefreshCoordinator, Session,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let session = Session::open(InMemoryTokenStore::new()).await;
//! let guard = NavigationGuard::new(RefreshCoordinator::new(session, ScriptedExchange::failing()));
//!
//! assert_eq!(guard.before_each("/login").await, Navigation::Proceed);
//! assert_eq!(
//!     guard.before_each("/surveys/create").await,
//!     Navigation::Redirect("/".to_owned()),
//! );
//! # }
//! ```

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

use std::collections::BTreeSet;

use survey_clock::DurationSecs;
use survey_tokens::RefreshCoordinator;

/// Routes open to anyone, whether or not they are logged in
pub const PUBLIC_ROUTES: &[&str] = &["/", "/login", "/register"];

/// The route users are sent to when denied a protected page
pub const DEFAULT_LANDING_ROUTE: &str = "/";

/// How close to expiry a token must be before the guard renews it
pub const DEFAULT_REFRESH_LEAD: DurationSecs = DurationSecs(120);

/// Whether a route requires a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteAccess {
    /// Open to anyone
    Public,
    /// Open only to an authenticated session
    Protected,
}

/// An allow-list of public routes; everything else is protected
///
/// Routes are compared by path alone. A query string, a fragment, and a
/// trailing slash are all ignored.
///
/// ```
/// use survey_navigation::{RouteAccess, RouteTable};
///
/// let routes = RouteTable::default();
/// assert_eq!(routes.classify("/register?invite=abc"), RouteAccess::Public);
/// assert_eq!(routes.classify("/profile/"), RouteAccess::Protected);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTable {
    public: BTreeSet<String>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::public(PUBLIC_ROUTES.iter().copied())
    }
}

impl RouteTable {
    /// A table in which every route is protected
    pub fn protected_only() -> Self {
        Self {
            public: BTreeSet::new(),
        }
    }

    /// A table in which only the given routes are public
    pub fn public<I, S>(routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            public: routes
                .into_iter()
                .map(|r| normalize(r.as_ref()).to_owned())
                .collect(),
        }
    }

    /// Adds a public route
    pub fn with_public(mut self, route: &str) -> Self {
        self.public.insert(normalize(route).to_owned());
        self
    }

    /// Classifies a route
    pub fn classify(&self, route: &str) -> RouteAccess {
        if self.public.contains(normalize(route)) {
            RouteAccess::Public
        } else {
            RouteAccess::Protected
        }
    }

    /// Whether a route is open to anyone
    #[inline]
    pub fn is_public(&self, route: &str) -> bool {
        self.classify(route) == RouteAccess::Public
    }
}

fn normalize(route: &str) -> &str {
    let end = route.find(['?', '#']).unwrap_or(route.len());
    let path = route[..end].trim_end_matches('/');
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// The guard's decision about a page transition
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum Navigation {
    /// Continue to the requested page
    Proceed,
    /// Abort the transition and go to this route instead
    Redirect(String),
}

/// Decides whether page transitions may proceed
#[derive(Clone, Debug)]
pub struct NavigationGuard {
    coordinator: RefreshCoordinator,
    routes: RouteTable,
    refresh_lead: DurationSecs,
    landing_route: String,
}

impl NavigationGuard {
    /// Constructs a guard over the coordinator's session with the default
    /// public routes
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self {
            coordinator,
            routes: RouteTable::default(),
            refresh_lead: DEFAULT_REFRESH_LEAD,
            landing_route: DEFAULT_LANDING_ROUTE.to_owned(),
        }
    }

    /// Sets how close to expiry a token must be before it is renewed ahead
    /// of a transition
    pub fn with_refresh_lead(self, refresh_lead: DurationSecs) -> Self {
        Self {
            refresh_lead,
            ..self
        }
    }

    /// Sets the route users are sent to when denied
    pub fn with_landing_route(self, route: impl Into<String>) -> Self {
        Self {
            landing_route: route.into(),
            ..self
        }
    }

    /// Replaces the route table
    pub fn with_routes(self, routes: RouteTable) -> Self {
        Self { routes, ..self }
    }

    /// The route table in use
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Decides whether the transition to `route` may proceed
    ///
    /// Public routes are always admitted. For a protected route, an access
    /// token that is missing, undecodable, or expires within the refresh lead
    /// time is renewed first, joining a renewal already in flight if there is one. The
    /// renewal is best-effort: whatever its outcome, the route is admitted
    /// only if the stored access token is then valid.
    pub async fn before_each(&self, route: &str) -> Navigation {
        if self.routes.is_public(route) {
            tracing::trace!(route, "public route");
            return Navigation::Proceed;
        }

        let session = self.coordinator.session();
        if session.expires_within(self.refresh_lead).await {
            tracing::debug!(
                route,
                lead = self.refresh_lead.0,
                "access token missing or expiring soon, renewing before navigation"
            );
            let renewed = self.coordinator.refresh_or_join().await;
            tracing::debug!(route, renewed, "renewal before navigation settled");
        }

        if session.validate_token().await {
            tracing::trace!(route, "protected route admitted");
            Navigation::Proceed
        } else {
            tracing::info!(
                route,
                redirect_to = %self.landing_route,
                "no valid session for protected route"
            );
            Navigation::Redirect(self.landing_route.clone())
        }
    }
}
