//! In-memory access token management for portal clients
//!
//! This crate keeps a usable access token available to the rest of a portal
//! client with as few round trips to the authentication service as possible.
//!
//! The token itself lives in a [`TokenStore`], which only ever holds it in
//! memory. A [`TokenLifecycleManager`] watches over the store: it decodes the
//! token's expiry, arms a timer to refresh shortly before that expiry, and
//! offers a single-flight [`refresh()`][TokenLifecycleManager::refresh] for
//! callers that saw a request rejected. However many callers ask for a
//! refresh at the same moment, only one request reaches the refresh endpoint
//! and all of them observe the same outcome.
//!
//! Interested parties, such as UI state that needs to redirect to a login
//! page, subscribe to [`TokenEvent`]s rather than polling the store.
//!
//! ```
//! use portal_tokens::{
//!     sources::HttpRefreshSource, RefreshConfig, TokenEvent, TokenLifecycleManager, TokenStore,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let client = reqwest::Client::new();
//! let refresh_url = reqwest::Url::parse("https://auth.example.com/auth/refresh").unwrap();
//!
//! let manager = TokenLifecycleManager::new(
//!     HttpRefreshSource::new(client, refresh_url),
//!     TokenStore::new(),
//!     RefreshConfig::default(),
//! );
//!
//! let mut events = manager.store().subscribe();
//! # async move {
//! while let Ok(event) = events.recv().await {
//!     if event == TokenEvent::Expired {
//!         tracing::info!("session expired, sending user to login");
//!     }
//! }
//! # };
//! # }
//! ```
//!
//! # Features
//!
//! * `http` (default): Provides [`HttpRefreshSource`][sources::HttpRefreshSource], which
//!   refreshes against the authentication service using [reqwest].

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
mod manager;
pub mod sources;
mod store;
mod tokens;

pub use braids::*;
pub use manager::{PendingRefresh, RefreshConfig, RefreshError, TokenLifecycleManager};
pub use store::{TokenEvent, TokenStore};
pub use tokens::{
    decode_claims, is_expired, is_expired_at, is_expired_with_clock, is_expiring_soon,
    is_expiring_soon_at, is_expiring_soon_with_clock, is_valid, is_valid_at,
    is_valid_with_clock, DecodeError, DecodedToken, TokenClaims, TokenStatus,
    DEFAULT_REFRESH_MARGIN,
};
