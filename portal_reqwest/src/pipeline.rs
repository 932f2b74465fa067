use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use portal_clock::{Clock, System};
use portal_session::{
    events::{SecurityEventKind, SecurityReporter},
    SessionGuard,
};
use portal_tokens::{sources::RefreshSource, AccessToken, AccessTokenRef, TokenLifecycleManager};
use predicates::prelude::*;
use reqwest::{header, Request, Response, StatusCode, Url};
use reqwest_middleware::{Middleware, Next, Result};
use serde_json::json;

use crate::{error::retry_after, inspect, AllowedOrigins, PipelineError, RateLimiter};

/// Header carrying a per-request correlation identifier
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header carrying the session anti-forgery token
pub const CSRF_HEADER: &str = "x-csrf-token";

/// A middleware that screens, authorizes, and recovers outgoing requests
///
/// Before a request is sent, it must target an allowed origin, carry no
/// suspicious query input, and fit within the client-side rate limit.
/// Requests that pass are tagged with a request identifier, the session's
/// anti-forgery token, and the current access token.
///
/// When the server answers `401 Unauthorized`, the session is checked, the
/// access token is refreshed, and the request is replayed exactly once.
/// Concurrent rejections share a single refresh. When recovery is not
/// possible the request fails with
/// [`PipelineError::ReauthenticationRequired`].
///
/// If a request already specifies an `Authorization` header, that value is
/// left in place and rejections of it are passed through untouched.
pub struct RequestPipeline<S, C = System, P = AllowedOrigins> {
    tokens: TokenLifecycleManager<S, C>,
    session: Arc<SessionGuard>,
    reporter: SecurityReporter,
    origins: P,
    limiter: Arc<RateLimiter>,
}

impl<S, C, P: Clone> Clone for RequestPipeline<S, C, P> {
    fn clone(&self) -> Self {
        Self {
            tokens: self.tokens.clone(),
            session: Arc::clone(&self.session),
            reporter: self.reporter.clone(),
            origins: self.origins.clone(),
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<S, C: std::fmt::Debug, P: std::fmt::Debug> std::fmt::Debug for RequestPipeline<S, C, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("tokens", &self.tokens)
            .field("session", &self.session)
            .field("origins", &self.origins)
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl<S, C> RequestPipeline<S, C, AllowedOrigins> {
    /// Construct a new pipeline
    ///
    /// By default, only requests to `localhost` are allowed and each host
    /// may receive 100 requests per minute. The session is the one the
    /// reporter describes.
    pub fn new(tokens: TokenLifecycleManager<S, C>, reporter: SecurityReporter) -> Self {
        Self {
            tokens,
            session: Arc::clone(reporter.session()),
            reporter,
            origins: AllowedOrigins::default(),
            limiter: Arc::new(RateLimiter::default()),
        }
    }
}

impl<S, C, P> RequestPipeline<S, C, P> {
    /// Replaces the origin policy with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> RequestPipeline<S, C, Q> {
        RequestPipeline {
            tokens: self.tokens,
            session: self.session,
            reporter: self.reporter,
            origins: predicate,
            limiter: self.limiter,
        }
    }

    /// Replaces the client-side rate limiter
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    /// The token manager used to authorize requests
    pub fn tokens(&self) -> &TokenLifecycleManager<S, C> {
        &self.tokens
    }
}

impl<S, C, P> RequestPipeline<S, C, P>
where
    S: RefreshSource,
    C: Clock + Send + Sync + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    fn screen(&self, req: &Request) -> std::result::Result<(), PipelineError> {
        let url = req.url();

        if !self.origins.eval(req) {
            tracing::warn!(url = %url, policy = %self.origins, "blocked request to disallowed origin");
            self.reporter.report(
                SecurityEventKind::AccessDenied,
                json!({ "host": url.host_str() }),
                Some(url),
            );
            return Err(PipelineError::DisallowedOrigin { url: url.clone() });
        }

        if let Some(suspicious) = inspect::find_suspicious_parameter(url) {
            tracing::warn!(parameter = %suspicious.name, "blocked request with suspicious input");
            self.reporter.report(
                SecurityEventKind::SuspiciousInput,
                json!({ "parameter": suspicious.name }),
                Some(url),
            );
            return Err(PipelineError::SuspiciousInput {
                parameter: suspicious.name,
            });
        }

        let host = url.host_str().unwrap_or_default();
        if let Err(wait) = self.limiter.try_acquire(host) {
            tracing::warn!(host, wait_ms = wait.as_millis() as u64, "client-side rate limit reached");
            self.reporter.report(
                SecurityEventKind::RateLimitExceeded,
                json!({ "source": "client", "retryAfterSecs": wait.as_secs() }),
                Some(url),
            );
            return Err(PipelineError::RateLimited {
                retry_after: Some(wait),
            });
        }

        Ok(())
    }

    fn decorate(&self, req: &mut Request, caller_authorized: bool) -> Option<AccessToken> {
        let headers = req.headers_mut();

        if !headers.contains_key(REQUEST_ID_HEADER) {
            let request_id = uuid::Uuid::new_v4().to_string();
            if let Ok(value) = header::HeaderValue::from_str(&request_id) {
                headers.insert(REQUEST_ID_HEADER, value);
            }
        }

        if let Some(csrf) = self.session.csrf_token() {
            if let Ok(mut value) = header::HeaderValue::from_str(csrf.as_str()) {
                value.set_sensitive(true);
                headers.insert(CSRF_HEADER, value);
            }
        }

        if caller_authorized {
            return None;
        }

        let token = self.tokens.valid_token()?;
        trace_token(&token);
        headers.insert(header::AUTHORIZATION, bearer(&token)?);
        Some(token)
    }

    async fn recover_unauthorized(
        &self,
        url: &Url,
        rejected: Response,
        replay: Option<Request>,
        sent_token: Option<AccessToken>,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if let Err(reason) = self.session.check() {
            self.reporter.report(
                SecurityEventKind::InvalidSession,
                json!({ "reason": reason.to_string() }),
                Some(url),
            );
            self.tokens.expire();
            return Err(PipelineError::ReauthenticationRequired.into());
        }

        let token = match self
            .tokens
            .refresh_after_rejection(sent_token.as_deref())
            .await
        {
            Ok(token) => token,
            Err(error) => {
                tracing::warn!(%error, "unable to recover from rejected request");
                self.reporter.report(
                    SecurityEventKind::RefreshFailed,
                    json!({ "error": error.to_string() }),
                    Some(url),
                );
                self.session.clear();
                return Err(PipelineError::ReauthenticationRequired.into());
            }
        };

        let Some(mut replay) = replay else {
            tracing::debug!(url = %url, "request cannot be replayed, passing rejection through");
            return Ok(rejected);
        };
        drop(rejected);

        if let Some(value) = bearer(&token) {
            replay.headers_mut().insert(header::AUTHORIZATION, value);
        }

        tracing::debug!(url = %url, "replaying request with refreshed access token");
        let response = next.run(replay, extensions).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.reporter.report(
                SecurityEventKind::RepeatedUnauthorized,
                json!({ "status": 401 }),
                Some(url),
            );
        }

        self.finish(url, response)
    }

    fn finish(&self, url: &Url, response: Response) -> Result<Response> {
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }

        let retry_after = retry_after(&response);
        self.reporter.report(
            SecurityEventKind::RateLimitExceeded,
            json!({
                "source": "server",
                "retryAfterSecs": retry_after.map(|d| d.as_secs()),
            }),
            Some(url),
        );

        Err(PipelineError::RateLimited { retry_after }.into())
    }
}

fn bearer(token: &AccessTokenRef) -> Option<header::HeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    match header::HeaderValue::from_maybe_shared(header_value.freeze()) {
        Ok(mut value) => {
            value.set_sensitive(true);
            Some(value)
        }
        Err(_) => {
            tracing::warn!("access token is not a valid header value");
            None
        }
    }
}

fn trace_token(token: &AccessTokenRef) {
    if tracing::enabled!(tracing::Level::TRACE) {
        if let Ok(decoded) = portal_tokens::DecodedToken::decode(token.to_owned()) {
            let now = System.now();

            tracing::trace!(
                token.status = ?decoded.token_status_at(portal_tokens::DEFAULT_REFRESH_MARGIN, now),
                token.lifetime = decoded.lifetime().0,
                token.issued = decoded.issued().0,
                token.expiry = decoded.expiry().0,
                token.until_expired = decoded.until_expired_at(now).0,
                "attaching access token"
            );
        }
    }
}

#[async_trait::async_trait]
impl<S, C, P> Middleware for RequestPipeline<S, C, P>
where
    S: RefreshSource,
    C: Clock + Send + Sync + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        self.screen(&req)?;

        let caller_authorized = req.headers().contains_key(header::AUTHORIZATION);
        let sent_token = self.decorate(&mut req, caller_authorized);
        let replay = if caller_authorized {
            None
        } else {
            req.try_clone()
        };

        let url = req.url().clone();
        let response = next.clone().run(req, extensions).await?;

        if response.status() == StatusCode::UNAUTHORIZED && !caller_authorized {
            self.recover_unauthorized(&url, response, replay, sent_token, extensions, next)
                .await
        } else {
            self.finish(&url, response)
        }
    }
}
