use std::fmt;

use predicates::{prelude::*, reflection};
use reqwest::{Request, Url};
use url::Host;

/// Only allow requests to an allow-listed host or one of its subdomains
///
/// Entries may be bare hosts (`api.example.com`) or origins
/// (`https://api.example.com:8443`); only the host part is compared, and
/// comparison is case-insensitive. Requests must use `https` unless they
/// target a loopback host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowedOrigins {
    hosts: Vec<String>,
}

impl AllowedOrigins {
    /// Construct a new allow-list from origins or host names
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = origins
            .into_iter()
            .filter_map(|origin| normalize(origin.as_ref()))
            .collect();

        Self { hosts }
    }

    /// The allow-listed hosts
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Whether `url` targets an allow-listed host over an acceptable scheme
    pub fn allows(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        if url.scheme() != "https" && !is_loopback(url) {
            return false;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        self.hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .map_or(false, |prefix| prefix.ends_with('.'))
        })
    }
}

impl Default for AllowedOrigins {
    /// Allows only `localhost`
    fn default() -> Self {
        Self::new(["localhost"])
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.');
            domain.eq_ignore_ascii_case("localhost")
                || domain.to_ascii_lowercase().ends_with(".localhost")
        }
        Some(Host::Ipv4(addr)) => addr.is_loopback(),
        Some(Host::Ipv6(addr)) => addr.is_loopback(),
        None => false,
    }
}

fn normalize(origin: &str) -> Option<String> {
    let origin = origin.trim();
    if origin.is_empty() {
        return None;
    }

    let host = if origin.contains("://") {
        Url::parse(origin).ok()?.host_str()?.to_owned()
    } else if origin.starts_with('[') {
        origin[..=origin.find(']')?].to_owned()
    } else {
        origin.split(['/', ':']).next()?.to_owned()
    };

    let host = host.trim_end_matches('.').to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

impl Predicate<Request> for AllowedOrigins {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        self.allows(req.url())
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url()
                        .host_str()
                        .unwrap_or("<no host>")
                        .to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for AllowedOrigins {}
impl fmt::Display for AllowedOrigins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host in [")?;
        f.write_str(&self.hosts.join(", "))?;
        f.write_str("]")
    }
}
