//! Application credentials and corporate access tokens
//!
//! `AppCredential` identifies one corporate integration and is immutable once
//! loaded from configuration. `AccessToken` is one live grant returned by the
//! gateway; at most one is cached per app id.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};

use crate::gateway::TokenGrant;

/// Credentials exchanged for a corporate access token.
#[derive(Debug, Clone)]
pub struct AppCredential {
    pub app_id: String,
    pub app_secret: Secret<String>,
    pub permanent_code: Secret<String>,
}

impl AppCredential {
    pub fn new(
        app_id: impl Into<String>,
        app_secret: impl Into<Secret<String>>,
        permanent_code: impl Into<Secret<String>>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            permanent_code: permanent_code.into(),
        }
    }
}

/// A corporate access token granted to one app.
///
/// `issued_at_ms` is stamped locally when the grant arrives (unix millis);
/// the gateway only reports the relative lifetime in `expires_in_secs`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub app_id: String,
    pub corp_id: String,
    #[serde(rename = "corpAccessToken")]
    pub token: String,
    #[serde(rename = "expiresIn")]
    pub expires_in_secs: u64,
    #[serde(skip)]
    pub issued_at_ms: u64,
}

impl AccessToken {
    /// Build a token from a successful issuance response.
    ///
    /// The app id comes from the credential that was exchanged, not from the
    /// response body, so a misbehaving gateway cannot file a token under a
    /// different app.
    pub fn from_grant(app_id: &str, grant: TokenGrant, issued_at_ms: u64) -> Self {
        Self {
            app_id: app_id.to_owned(),
            corp_id: grant.corp_id,
            token: grant.corp_access_token,
            expires_in_secs: grant.expires_in,
            issued_at_ms,
        }
    }

    /// Advertised lifetime, used as the store TTL.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.expires_in_secs)
    }

    /// Absolute expiry as unix millis.
    pub fn expires_at_ms(&self) -> u64 {
        self.issued_at_ms
            .saturating_add(self.expires_in_secs.saturating_mul(1000))
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("app_id", &self.app_id)
            .field("corp_id", &self.corp_id)
            .field("token", &"[REDACTED]")
            .field("expires_in_secs", &self.expires_in_secs)
            .field("issued_at_ms", &self.issued_at_ms)
            .finish()
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
