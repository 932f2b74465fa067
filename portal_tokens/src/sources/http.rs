//! A refresh source that calls the authentication service's refresh endpoint

use async_trait::async_trait;
use thiserror::Error;

use super::RefreshSource;
use crate::AccessToken;

mod dto;

/// Refreshes access tokens by posting to the refresh endpoint
///
/// The refresh credential itself is an HTTP-only cookie, so `client` must be
/// built with a cookie store that already holds the session cookie set at
/// login. No request body is sent.
#[derive(Clone, Debug)]
pub struct HttpRefreshSource {
    client: reqwest::Client,
    refresh_url: reqwest::Url,
}

impl HttpRefreshSource {
    /// Constructs a new refresh source
    pub fn new(client: reqwest::Client, refresh_url: reqwest::Url) -> Self {
        Self {
            client,
            refresh_url,
        }
    }

    /// The endpoint this source refreshes against
    pub fn refresh_url(&self) -> &reqwest::Url {
        &self.refresh_url
    }
}

#[async_trait]
impl RefreshSource for HttpRefreshSource {
    type Error = RefreshRequestError;

    async fn refresh_token(&self) -> Result<AccessToken, Self::Error> {
        request_refresh(&self.client, self.refresh_url.clone()).await
    }
}

/// An error while attempting to refresh an access token
#[derive(Debug, Error)]
pub enum RefreshRequestError {
    /// The endpoint answered with a non-success status
    #[error("refresh endpoint responded {status}: {body}")]
    ErrorWithBody {
        /// The response status
        status: reqwest::StatusCode,
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the refresh body
    #[error("error deserializing refresh response body")]
    ResponseBody(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send a refresh request to the endpoint
    #[error("error sending request to refresh endpoint")]
    RequestSend(#[source] reqwest::Error),
}

#[tracing::instrument(err, skip(client, refresh_url), fields(refresh_url = %refresh_url))]
async fn request_refresh(
    client: &reqwest::Client,
    refresh_url: reqwest::Url,
) -> Result<AccessToken, RefreshRequestError> {
    tracing::trace!("requesting refreshed token");

    let resp = client
        .post(refresh_url)
        .send()
        .await
        .map_err(RefreshRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received refresh response"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(RefreshRequestError::BodyReadError)?;
        return Err(RefreshRequestError::ErrorWithBody {
            status,
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(RefreshRequestError::BodyReadError)?;
    let resp: dto::RefreshResponse = serde_json::from_slice(&body)?;

    tracing::info!("received refreshed access token");

    Ok(resp.data.access_token)
}
