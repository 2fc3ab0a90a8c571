use chrono::{DateTime, Duration, Utc};
use jose_jwk::Jwk;

/// Pending requests are honored for this long after login starts.
pub const PENDING_REQUEST_TTL_MINUTES: i64 = 10;

/// Sessions live as long as the session cookie.
pub const SESSION_TTL_HOURS: i64 = 24;

/// Tokens this close to expiry are refreshed before use.
pub const REFRESH_WINDOW_MINUTES: i64 = 5;

/// An authorization that has been pushed to the auth server and is waiting
/// for the user to come back through the callback.
#[derive(Debug, Clone)]
pub struct PendingAuthRequest {
    /// OAuth state, unique per login attempt
    pub state: String,
    /// Authorization server issuer the request was pushed to
    pub issuer: String,
    /// PKCE code verifier
    pub pkce_verifier: String,
    /// DPoP key bound to this request and the session it spawns
    pub dpop_key: Jwk,
    /// Local path to return to after login
    pub destination: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthRequest {
    pub fn new(
        state: String,
        issuer: String,
        pkce_verifier: String,
        dpop_key: Jwk,
        destination: String,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            state,
            issuer,
            pkce_verifier,
            dpop_key,
            destination,
            created_at,
            expires_at: created_at + Duration::minutes(PENDING_REQUEST_TTL_MINUTES),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// An authenticated user session
#[derive(Debug, Clone)]
pub struct UserSession {
    /// Opaque id carried in the session cookie
    pub id: String,
    /// Account DID, equal to the token response `sub`
    pub did: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// DPoP key the tokens are bound to
    pub dpop_key: Jwk,
    /// Resolved PDS base URL, without trailing slash
    pub pds_url: String,
    /// Access token expiry, when the auth server reported one
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UserSession {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn token_state(&self) -> TokenState {
        TokenState::at(self.token_expires_at, Utc::now())
    }
}

/// Where an access token stands relative to its expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Fresh,
    NearExpiry,
    Expired,
}

impl TokenState {
    pub fn at(token_expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match token_expires_at {
            None => TokenState::Fresh,
            Some(expires_at) if now >= expires_at => TokenState::Expired,
            Some(expires_at) if expires_at - now <= Duration::minutes(REFRESH_WINDOW_MINUTES) => {
                TokenState::NearExpiry
            }
            Some(_) => TokenState::Fresh,
        }
    }

    pub fn needs_refresh(&self) -> bool {
        !matches!(self, TokenState::Fresh)
    }
}

/// Token endpoint response
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
}

impl TokenSet {
    /// Absolute token expiry. Negative lifetimes count as already expired;
    /// lifetimes past chrono's range are treated as unknown.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = self.expires_in?.max(0);
        now.checked_add_signed(Duration::try_seconds(secs)?)
    }
}
