use std::fmt;

use predicates::{reflection, Predicate};
use reqwest::{Request, Url};

/// Only apply the session if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only apply the session if the request is being sent to the API's origin
///
/// Two URLs share an origin when their scheme, host, and port all match,
/// with default ports filled in for the scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SameOrigin {
    scheme: String,
    host: Option<String>,
    port: Option<u16>,
}

impl SameOrigin {
    /// Construct a new predicate matching the origin of `api`
    pub fn new(api: &Url) -> Self {
        Self {
            scheme: api.scheme().to_owned(),
            host: api.host_str().map(str::to_owned),
            port: api.port_or_known_default(),
        }
    }
}

impl Predicate<Request> for SameOrigin {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        let url = req.url();
        url.scheme() == self.scheme
            && url.host_str() == self.host.as_deref()
            && url.port_or_known_default() == self.port
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "origin",
                    req.url().origin().ascii_serialization(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for SameOrigin {}
impl fmt::Display for SameOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "origin == {}://{}",
            self.scheme,
            self.host.as_deref().unwrap_or_default()
        )?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}
