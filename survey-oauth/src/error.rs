use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    // Identity resolution errors
    #[error("could not resolve handle {0}")]
    HandleUnresolvable(String),
    #[error("unsupported DID method: {0}")]
    UnsupportedDid(String),
    #[error("PDS discovery failed: {0}")]
    PdsDiscoveryFailed(String),
    #[error("authorization server discovery failed: {0}")]
    AuthServerDiscoveryFailed(String),

    // OAuth flow errors
    #[error("pushed authorization request rejected: {0}")]
    ParRejected(String),
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("unknown or expired OAuth state")]
    StateUnknown,
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch { expected: String, actual: String },
    #[error("use_dpop_nonce")]
    DpopNonceRequired(String), // Contains the nonce to send back

    // Repository errors
    #[error("access token expired")]
    TokenExpired,
    #[error("PDS rejected request with status {status}: {body}")]
    PdsRejected { status: u16, body: String },

    // Key errors
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("http error: {0}")]
    Http(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl Error {
    /// Whether the error means the user has to sign in again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            Error::RefreshFailed(_) | Error::TokenExpired | Error::Store(StoreError::NotFound)
        )
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Error::HandleUnresolvable(_)
            | Error::UnsupportedDid(_)
            | Error::PdsDiscoveryFailed(_)
            | Error::AuthServerDiscoveryFailed(_)
            | Error::StateUnknown
            | Error::IssuerMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::ParRejected(_)
            | Error::TokenExchangeFailed(_)
            | Error::PdsRejected { .. }
            | Error::DpopNonceRequired(_)
            | Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::RefreshFailed(_) | Error::TokenExpired => StatusCode::UNAUTHORIZED,
            Error::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, body).into_response()
    }
}
