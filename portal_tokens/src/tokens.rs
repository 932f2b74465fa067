use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use portal_clock::{Clock, DurationSecs, System, UnixTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{AccessToken, AccessTokenRef};

/// How long before expiry a token is considered to be expiring soon
pub const DEFAULT_REFRESH_MARGIN: DurationSecs = DurationSecs(5 * 60);

/// The claims carried in an access token's payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// The subject the token was issued to
    pub sub: String,

    /// When the token was issued
    #[serde(default)]
    pub iat: UnixTime,

    /// When the token stops being accepted
    pub exp: UnixTime,

    /// The portal user identifier
    #[serde(
        rename = "userId",
        alias = "user_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,

    /// The user's email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// The user's display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An error decoding the payload of an access token
///
/// Only the structure of the token is inspected. Signatures are verified by
/// the services that accept the token, never by this client.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The token does not have a `header.payload.signature` shape
    #[error("access token has no payload segment")]
    MissingPayload,
    /// The payload segment is not valid base64url
    #[error("access token payload is not valid base64url")]
    Base64(#[from] base64::DecodeError),
    /// The payload is not a JSON object with the expected claims
    #[error("access token payload does not contain the expected claims")]
    Claims(#[from] serde_json::Error),
}

/// Decodes the claims from an access token without verifying it
pub fn decode_claims(token: &AccessTokenRef) -> Result<TokenClaims, DecodeError> {
    let payload = token
        .as_str()
        .split('.')
        .nth(1)
        .filter(|segment| !segment.is_empty())
        .ok_or(DecodeError::MissingPayload)?;

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and outside of the refresh margin
    Fresh,
    /// The token is valid, but within the refresh margin of its expiry
    ExpiringSoon,
    /// The token is no longer valid
    Expired,
}

/// An access token together with its decoded claims
#[derive(Clone, Debug)]
pub struct DecodedToken {
    access_token: AccessToken,
    claims: TokenClaims,
}

impl DecodedToken {
    /// Decodes the claims of `access_token`
    pub fn decode(access_token: AccessToken) -> Result<Self, DecodeError> {
        let claims = decode_claims(&access_token)?;
        Ok(Self {
            access_token,
            claims,
        })
    }

    /// Gets the current access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the decoded claims
    #[inline]
    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    /// Consumes the decoded token, returning the raw access token
    #[inline]
    pub fn into_access_token(self) -> AccessToken {
        self.access_token
    }

    /// Gets the time that the token was issued
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.claims.iat
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.claims.exp
    }

    /// Gets the token's total lifetime
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.claims.exp - self.claims.iat
    }

    /// Gets the interval during which the token is valid
    #[inline]
    pub fn valid_interval(&self) -> std::ops::Range<UnixTime> {
        self.claims.iat..self.claims.exp
    }

    /// Gets the token's current lifetime status
    #[inline]
    pub fn token_status(&self, margin: DurationSecs) -> TokenStatus {
        self.token_status_with_clock(margin, &System)
    }

    /// Gets the token's lifetime status based on the current time
    /// as reported by the provided clock
    #[inline]
    pub fn token_status_with_clock<C: Clock>(&self, margin: DurationSecs, clock: &C) -> TokenStatus {
        self.token_status_at(margin, clock.now())
    }

    /// Gets the token's lifetime status as of the provided time
    #[inline]
    pub fn token_status_at(&self, margin: DurationSecs, time: UnixTime) -> TokenStatus {
        if time >= self.claims.exp {
            TokenStatus::Expired
        } else if self.claims.exp - time <= margin {
            TokenStatus::ExpiringSoon
        } else {
            TokenStatus::Fresh
        }
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.claims.exp - time
    }
}

/// Whether the token has expired according to the system clock
///
/// A token that cannot be decoded is treated as expired.
pub fn is_expired(token: &AccessTokenRef) -> bool {
    is_expired_at(token, System.now())
}

/// Whether the token has expired according to `clock`
pub fn is_expired_with_clock<C: Clock>(token: &AccessTokenRef, clock: &C) -> bool {
    is_expired_at(token, clock.now())
}

/// Whether the token has expired as of `now`
pub fn is_expired_at(token: &AccessTokenRef, now: UnixTime) -> bool {
    match decode_claims(token) {
        Ok(claims) => claims.exp <= now,
        Err(error) => {
            tracing::debug!(error = (&error as &dyn std::error::Error), "undecodable token treated as expired");
            true
        }
    }
}

/// Whether the token expires within `margin` of the system clock
pub fn is_expiring_soon(token: &AccessTokenRef, margin: DurationSecs) -> bool {
    is_expiring_soon_at(token, margin, System.now())
}

/// Whether the token expires within `margin` of `clock`
pub fn is_expiring_soon_with_clock<C: Clock>(
    token: &AccessTokenRef,
    margin: DurationSecs,
    clock: &C,
) -> bool {
    is_expiring_soon_at(token, margin, clock.now())
}

/// Whether the token expires within `margin` of `now`
///
/// Expired and undecodable tokens are always expiring soon.
pub fn is_expiring_soon_at(token: &AccessTokenRef, margin: DurationSecs, now: UnixTime) -> bool {
    match decode_claims(token) {
        Ok(claims) => claims.exp <= now + margin,
        Err(_) => true,
    }
}

/// Whether the token decodes and is unexpired according to the system clock
pub fn is_valid(token: &AccessTokenRef) -> bool {
    is_valid_at(token, System.now())
}

/// Whether the token decodes and is unexpired according to `clock`
pub fn is_valid_with_clock<C: Clock>(token: &AccessTokenRef, clock: &C) -> bool {
    is_valid_at(token, clock.now())
}

/// Whether the token decodes and is unexpired as of `now`
pub fn is_valid_at(token: &AccessTokenRef, now: UnixTime) -> bool {
    decode_claims(token).map_or(false, |claims| claims.exp > now)
}

#[cfg(test)]
pub(crate) fn unsigned_token(sub: &str, iat: UnixTime, exp: UnixTime) -> AccessToken {
    let claims = serde_json::json!({
        "sub": sub,
        "iat": iat.0,
        "exp": exp.0,
        "userId": format!("user-{sub}"),
        "email": format!("{sub}@example.com"),
        "name": sub,
    });
    AccessToken::new(format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
    ))
}
