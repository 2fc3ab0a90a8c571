use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, header::COOKIE, request::Parts},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use std::sync::Arc;
use survey_oauth::{OAuthStore, StoreError, UserSession};
use tracing::{debug, warn};

pub const SESSION_COOKIE: &str = "session";

/// The signed-in user for this request, if any.
///
/// Populated by [`load_user`]; extracts as anonymous when the layer is absent.
#[derive(Debug, Clone, Default)]
pub struct CurrentUser(pub Option<UserSession>);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .unwrap_or_default())
    }
}

/// Value of the `session` cookie
pub fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| {
            cookie
                .trim()
                .strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
        })
        .filter(|id| !id.is_empty())
}

/// Resolve the session cookie to a user.
///
/// A missing row, an expired session and a store failure all leave the request
/// anonymous. Expired sessions are deleted on sight.
pub async fn load_user<S: OAuthStore + 'static>(
    State(store): State<Arc<S>>,
    mut request: Request,
    next: Next,
) -> Response {
    let user = match session_id(request.headers()) {
        Some(id) => lookup(store.as_ref(), id).await,
        None => None,
    };
    request.extensions_mut().insert(CurrentUser(user));
    next.run(request).await
}

async fn lookup<S: OAuthStore + ?Sized>(store: &S, id: &str) -> Option<UserSession> {
    match store.get_session(id).await {
        Ok(session) if session.is_expired() => {
            debug!(did = %session.did, "dropping expired session");
            if let Err(e) = store.delete_session(id).await {
                warn!(error = %e, "failed to delete expired session");
            }
            None
        }
        Ok(session) => Some(session),
        Err(StoreError::NotFound) => None,
        Err(e) => {
            warn!(error = %e, "session lookup failed, treating request as anonymous");
            None
        }
    }
}
