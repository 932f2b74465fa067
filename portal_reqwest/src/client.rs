use std::{fmt, sync::Arc};

use portal_session::{events::SecurityReporter, EnvironmentProbe, SessionGuard};
use portal_tokens::{
    sources::HttpRefreshSource, AccessToken, DecodeError, TokenLifecycleManager, TokenStore,
};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use serde::de::DeserializeOwned;

use crate::{ApiError, Mode, PortalConfig, RequestPipeline};

/// A backend service the portal talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Service {
    /// The authentication service
    Auth,
    /// The authorization service
    Authz,
    /// The portal service
    Portal,
}

/// Base URLs for each [`Service`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    auth: Url,
    authz: Url,
    portal: Url,
}

impl Endpoints {
    /// Constructs the endpoint set
    pub fn new(auth: Url, authz: Url, portal: Url) -> Self {
        Self {
            auth: as_base(auth),
            authz: as_base(authz),
            portal: as_base(portal),
        }
    }

    /// The base URL of `service`
    pub fn base(&self, service: Service) -> &Url {
        match service {
            Service::Auth => &self.auth,
            Service::Authz => &self.authz,
            Service::Portal => &self.portal,
        }
    }

    /// Resolves `path` relative to the base URL of `service`
    pub fn url(&self, service: Service, path: &str) -> Result<Url, url::ParseError> {
        self.base(service).join(path.trim_start_matches('/'))
    }
}

fn as_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// An authenticated client for the portal backends
///
/// Every request is routed through a [`RequestPipeline`], so callers only
/// deal with successful responses or a classified [`ApiError`].
pub struct PortalClient {
    http: ClientWithMiddleware,
    tokens: TokenLifecycleManager<HttpRefreshSource>,
    session: Arc<SessionGuard>,
    endpoints: Endpoints,
    mode: Mode,
}

impl fmt::Debug for PortalClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PortalClient")
            .field("tokens", &self.tokens)
            .field("session", &self.session)
            .field("endpoints", &self.endpoints)
            .field("mode", &self.mode)
            .finish()
    }
}

impl PortalClient {
    /// Builds a client from configuration
    ///
    /// The underlying HTTP client keeps a cookie store so the refresh
    /// endpoint can read its credential cookie.
    pub fn from_config<P>(config: &PortalConfig, environment: P) -> Result<Self, reqwest::Error>
    where
        P: EnvironmentProbe + 'static,
    {
        let client = reqwest::Client::builder().cookie_store(true).build()?;

        let tokens = TokenLifecycleManager::new(
            HttpRefreshSource::new(client.clone(), config.refresh_url.clone()),
            TokenStore::new(),
            config.refresh_config(),
        );
        let session = Arc::new(SessionGuard::in_memory(environment));
        let reporter = SecurityReporter::new(config.security_sink(&client), Arc::clone(&session));

        let pipeline = RequestPipeline::new(tokens.clone(), reporter)
            .with_predicate(config.allowed_origins())
            .with_rate_limiter(config.rate_limiter());

        Ok(Self {
            http: ClientBuilder::new(client).with(pipeline).build(),
            tokens,
            session,
            endpoints: Endpoints::new(
                config.auth_server_url.clone(),
                config.authz_server_url.clone(),
                config.portal_server_url.clone(),
            ),
            mode: config.mode,
        })
    }

    /// Starts a session with a token obtained at login
    pub fn sign_in(&self, token: AccessToken) -> Result<(), DecodeError> {
        self.tokens.set_token(token)?;
        self.session.generate();
        Ok(())
    }

    /// Ends the session and forgets the access token
    pub fn sign_out(&self) {
        self.tokens.clear();
        self.session.clear();
    }

    /// The token manager
    pub fn tokens(&self) -> &TokenLifecycleManager<HttpRefreshSource> {
        &self.tokens
    }

    /// The session guard
    pub fn session(&self) -> &Arc<SessionGuard> {
        &self.session
    }

    /// The service endpoints
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// How errors should be presented
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Starts a request to `path` on `service`
    pub fn request(
        &self,
        method: Method,
        service: Service,
        path: &str,
    ) -> Result<RequestBuilder, url::ParseError> {
        let url = self.endpoints.url(service, path)?;
        Ok(self.http.request(method, url))
    }

    /// Sends a request and decodes a successful JSON response
    pub async fn send_json<T>(&self, request: RequestBuilder) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response = request.send().await?;
        let response = ApiError::check(response).await?;
        Ok(response.json().await?)
    }

    /// Fetches `path` from `service` as JSON
    pub async fn get_json<T>(&self, service: Service, path: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let request = self
            .request(Method::GET, service, path)
            .map_err(ApiError::InvalidUrl)?;
        self.send_json(request).await
    }
}
