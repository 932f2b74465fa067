//! Token sources

use crate::AccessToken;
use async_trait::async_trait;
use std::{error, sync::Arc};

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpRefreshSource;

/// An asynchronous source of refreshed access tokens
///
/// The lifecycle manager guarantees that at most one call to
/// [`refresh_token`][Self::refresh_token] is in flight at a time.
#[async_trait]
pub trait RefreshSource: Send + Sync + 'static {
    /// The error type returned in the event that refreshing fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a fresh access token
    async fn refresh_token(&self) -> Result<AccessToken, Self::Error>;
}

#[async_trait]
impl<T: RefreshSource + ?Sized> RefreshSource for Arc<T> {
    type Error = T::Error;

    async fn refresh_token(&self) -> Result<AccessToken, Self::Error> {
        (**self).refresh_token().await
    }
}
