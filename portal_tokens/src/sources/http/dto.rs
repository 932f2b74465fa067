//! DTOs for interacting with the authentication service's refresh endpoint

use serde::{Deserialize, Serialize};

use crate::AccessToken;

/// The envelope the authentication service wraps all payloads in
#[derive(Debug, Deserialize, Serialize)]
pub(super) struct RefreshResponse {
    pub data: RefreshData,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RefreshData {
    pub access_token: AccessToken,
}
