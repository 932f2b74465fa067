use std::{fmt, time::Duration};

use reqwest::{header, Response, StatusCode, Url};
use thiserror::Error;

/// A request refused by the [`RequestPipeline`][crate::RequestPipeline]
///
/// These errors are returned through
/// [`reqwest_middleware::Error::Middleware`] and can be recovered with
/// [`ApiError::from`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The request targets a host outside the allow-list
    #[error("requests to {url} are not allowed")]
    DisallowedOrigin {
        /// The rejected URL
        url: Url,
    },
    /// A query parameter carries markup, script URLs, or control characters
    #[error("query parameter `{parameter}` contains disallowed content")]
    SuspiciousInput {
        /// The offending parameter name
        parameter: String,
    },
    /// The client-side limit was reached or the server answered 429
    #[error("too many requests")]
    RateLimited {
        /// How long to wait before retrying, if known
        retry_after: Option<Duration>,
    },
    /// The session or its credentials can no longer be recovered
    #[error("the session must be re-authenticated")]
    ReauthenticationRequired,
}

impl From<PipelineError> for reqwest_middleware::Error {
    fn from(error: PipelineError) -> Self {
        reqwest_middleware::Error::middleware(error)
    }
}

/// Whether errors are explained to developers or end users
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Detailed messages and console security logging
    #[default]
    Development,
    /// Generic messages and remote security logging
    Production,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Production => "production",
        })
    }
}

/// The outcome of a failed API call, as seen by application code
#[derive(Debug, Error)]
pub enum ApiError {
    /// The user must sign in again
    #[error("the session must be re-authenticated")]
    ReauthenticationRequired,
    /// The request targets a host outside the allow-list
    #[error("requests to {url} are not allowed")]
    DisallowedOrigin {
        /// The rejected URL
        url: Url,
    },
    /// A query parameter carries disallowed content
    #[error("query parameter `{parameter}` contains disallowed content")]
    SuspiciousInput {
        /// The offending parameter name
        parameter: String,
    },
    /// Too many requests were made
    #[error("too many requests")]
    RateLimited {
        /// How long to wait before retrying, if known
        retry_after: Option<Duration>,
    },
    /// The server rejected the credentials
    #[error("request was not authorized")]
    Unauthorized,
    /// The server rejected the request content (400 or 422)
    #[error("request was rejected as invalid ({status})")]
    Validation {
        /// The response status
        status: StatusCode,
        /// The response body, for field-level error rendering
        body: String,
    },
    /// Any other unsuccessful status
    #[error("request failed with status {status}")]
    Http {
        /// The response status
        status: StatusCode,
        /// The response body
        body: String,
    },
    /// The request could not be sent or its response could not be read
    #[error("request could not be completed")]
    Transport(#[source] reqwest_middleware::Error),
    /// The request path could not be resolved against the service URL
    #[error("request URL is invalid")]
    InvalidUrl(#[source] url::ParseError),
}

impl ApiError {
    /// Classifies an unsuccessful response, consuming its body
    ///
    /// Successful responses are returned unchanged.
    pub async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = retry_after(&response);
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.into()))?;

        Err(match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited { retry_after },
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ApiError::Validation { status, body }
            }
            _ => ApiError::Http { status, body },
        })
    }

    /// Whether a generic failure notification should be shown
    ///
    /// Validation failures are rendered next to the offending fields
    /// instead.
    pub fn should_notify(&self) -> bool {
        !matches!(self, Self::Validation { .. })
    }

    /// A message suitable for display in the given mode
    pub fn user_message(&self, mode: Mode) -> String {
        match mode {
            Mode::Development => {
                let mut message = self.to_string();
                let mut source = std::error::Error::source(self);
                while let Some(cause) = source {
                    message.push_str(": ");
                    message.push_str(&cause.to_string());
                    source = cause.source();
                }
                message
            }
            Mode::Production => match self {
                Self::ReauthenticationRequired | Self::Unauthorized => {
                    "Your session has ended. Please sign in again."
                }
                Self::RateLimited { .. } => "Too many requests. Please wait a moment and try again.",
                Self::Validation { .. } => "Some of the information entered is invalid.",
                Self::DisallowedOrigin { .. } | Self::SuspiciousInput { .. } => {
                    "This request was blocked for your security."
                }
                Self::Http { .. } | Self::Transport(_) | Self::InvalidUrl(_) => {
                    "Something went wrong. Please try again later."
                }
            }
            .to_owned(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::DisallowedOrigin { url } => Self::DisallowedOrigin { url },
            PipelineError::SuspiciousInput { parameter } => Self::SuspiciousInput { parameter },
            PipelineError::RateLimited { retry_after } => Self::RateLimited { retry_after },
            PipelineError::ReauthenticationRequired => Self::ReauthenticationRequired,
        }
    }
}

impl From<reqwest_middleware::Error> for ApiError {
    fn from(error: reqwest_middleware::Error) -> Self {
        match error {
            reqwest_middleware::Error::Middleware(inner) => match inner.downcast::<PipelineError>() {
                Ok(pipeline) => pipeline.into(),
                Err(other) => Self::Transport(reqwest_middleware::Error::Middleware(other)),
            },
            other => Self::Transport(other),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.into())
    }
}

/// Parses a `Retry-After` header given in seconds
pub(crate) fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
