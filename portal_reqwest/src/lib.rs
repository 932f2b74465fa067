//! Middleware to screen, authorize, and recover outgoing portal requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`RequestPipeline`] in the middleware stack to use the access
//! token kept by a [`TokenLifecycleManager`](portal_tokens::TokenLifecycleManager)
//! for each outbound request, along with the session's anti-forgery token
//! and a request identifier.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use std::sync::Arc;
//! use portal_reqwest::RequestPipeline;
//! use portal_session::{events::{SecurityReporter, TracingSink}, ClientEnvironment, SessionGuard};
//! use portal_tokens::{sources::HttpRefreshSource, RefreshConfig, TokenLifecycleManager, TokenStore};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let refresh_url = "https://auth.example.com/auth/refresh".parse().unwrap();
//! let tokens = TokenLifecycleManager::new(
//!     HttpRefreshSource::new(Client::new(), refresh_url),
//!     TokenStore::new(),
//!     RefreshConfig::default(),
//! );
//! let session = Arc::new(SessionGuard::in_memory(ClientEnvironment::default()));
//! let reporter = SecurityReporter::new(TracingSink, session);
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(RequestPipeline::new(tokens, reporter))
//!     .build();
//!
//! let req = client
//!     .get("http://localhost:8080/api/users");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! # }
//! ```
//!
//! Only requests to allow-listed hosts are sent. By default that is just
//! `localhost`; any predicate over the request can take its place.
//!
//! ```
//! use portal_reqwest::AllowedOrigins;
//! use predicates::prelude::*;
//! # use std::sync::Arc;
//! # use portal_reqwest::RequestPipeline;
//! # use portal_session::{events::{SecurityReporter, TracingSink}, ClientEnvironment, SessionGuard};
//! # use portal_tokens::{sources::HttpRefreshSource, RefreshConfig, TokenLifecycleManager, TokenStore};
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! # let tokens = TokenLifecycleManager::new(
//! #     HttpRefreshSource::new(reqwest::Client::new(), "https://auth.example.com/auth/refresh".parse().unwrap()),
//! #     TokenStore::new(),
//! #     RefreshConfig::default(),
//! # );
//! # let reporter = SecurityReporter::new(TracingSink, Arc::new(SessionGuard::in_memory(ClientEnvironment::default())));
//!
//! RequestPipeline::new(tokens, reporter)
//!     .with_predicate(AllowedOrigins::new(["example.com", "partner.example.org"]));
//! # }
//! ```
//!
//! Failures surface as [`reqwest_middleware::Error`]. Convert them into an
//! [`ApiError`] to tell a session that must be re-authenticated apart from a
//! rate limit or a validation failure.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod client;
mod config;
mod error;
mod inspect;
mod origins;
mod pipeline;
mod rate_limit;

pub use client::{Endpoints, PortalClient, Service};
pub use config::PortalConfig;
pub use error::{ApiError, Mode, PipelineError};
pub use origins::AllowedOrigins;
pub use pipeline::{RequestPipeline, CSRF_HEADER, REQUEST_ID_HEADER};
pub use rate_limit::RateLimiter;
