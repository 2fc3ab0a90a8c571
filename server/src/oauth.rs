use crate::middleware::{SESSION_COOKIE, session_id};
use axum::{
    Form, Json, Router,
    extract::{Query, State},
    http::{
        HeaderMap, StatusCode,
        header::{LOCATION, SET_COOKIE},
    },
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use survey_oauth::session::SESSION_TTL_HOURS;
use survey_oauth::{CallbackParams, ClientMetadata, CompletedLogin, OAuthClient, OAuthStore};
use tracing::{info, warn};

type Client<S> = Arc<OAuthClient<S>>;

#[derive(Debug, Default, Deserialize)]
pub struct LoginQuery {
    pub destination: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub handle: String,
    #[serde(default)]
    pub destination: Option<String>,
}

/// OAuth routes, bound to `client`
pub fn router<S, T>(client: Client<S>) -> Router<T>
where
    S: OAuthStore + 'static,
    T: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/oauth/login", get(login_page).post(start_login::<S>))
        .route("/oauth/callback", get(handle_callback::<S>))
        .route("/oauth/client-metadata.json", get(client_metadata::<S>))
        .route("/oauth/jwks.json", get(jwks::<S>))
        .route("/oauth/logout", get(logout::<S>).post(logout::<S>))
        .with_state(client)
}

/// Only local paths are allowed as post-login destinations.
pub fn local_destination(destination: Option<&str>) -> String {
    match destination {
        Some(d) if d.starts_with('/') && !d.starts_with("//") && !d.contains('\\') => {
            d.to_string()
        }
        _ => "/".to_string(),
    }
}

pub fn session_cookie(id: &str) -> String {
    format!(
        "{SESSION_COOKIE}={id}; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age={}",
        SESSION_TTL_HOURS * 60 * 60
    )
}

pub fn cleared_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age=-1")
}

fn found(location: String) -> Response {
    (StatusCode::FOUND, [(LOCATION, location)]).into_response()
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn login_form(destination: &str, error: Option<&str>) -> String {
    let error = error
        .map(|e| format!(r#"<p class="error">{}</p>"#, escape_html(e)))
        .unwrap_or_default();
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Sign in</title></head>
<body>
<h1>Sign in with your Atmosphere account</h1>
{error}
<form method="post" action="/oauth/login">
<input type="hidden" name="destination" value="{destination}">
<label>Handle <input type="text" name="handle" placeholder="alice.bsky.social" autocomplete="username" required></label>
<button type="submit">Sign in</button>
</form>
</body>
</html>
"#,
        destination = escape_html(destination),
    )
}

pub async fn login_page(Query(query): Query<LoginQuery>) -> Html<String> {
    Html(login_form(
        &local_destination(query.destination.as_deref()),
        None,
    ))
}

pub async fn start_login<S: OAuthStore + 'static>(
    State(client): State<Client<S>>,
    Query(query): Query<LoginQuery>,
    Form(form): Form<LoginForm>,
) -> Response {
    let destination = local_destination(
        query
            .destination
            .as_deref()
            .or(form.destination.as_deref()),
    );
    let handle = form.handle.trim().trim_start_matches('@');
    if handle.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Html(login_form(&destination, Some("Enter your handle to sign in."))),
        )
            .into_response();
    }

    match client.start_login(handle, &destination).await {
        Ok(url) => found(url),
        Err(e) => {
            warn!(handle, error = %e, "failed to start oauth login");
            e.into_response()
        }
    }
}

pub async fn handle_callback<S: OAuthStore + 'static>(
    State(client): State<Client<S>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    match client.complete_login(params).await {
        Ok(CompletedLogin {
            session,
            destination,
        }) => {
            info!(did = %session.did, "user signed in");
            (
                StatusCode::FOUND,
                [
                    (LOCATION, local_destination(Some(&destination))),
                    (SET_COOKIE, session_cookie(&session.id)),
                ],
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "oauth callback failed");
            e.into_response()
        }
    }
}

pub async fn client_metadata<S: OAuthStore + 'static>(
    State(client): State<Client<S>>,
) -> Json<ClientMetadata> {
    Json(client.config().client_metadata())
}

pub async fn jwks<S: OAuthStore + 'static>(
    State(client): State<Client<S>>,
) -> Result<Json<Value>, survey_oauth::Error> {
    client.config().jwks().map(Json)
}

pub async fn logout<S: OAuthStore + 'static>(
    State(client): State<Client<S>>,
    headers: HeaderMap,
) -> Response {
    if let Some(id) = session_id(&headers) {
        if let Err(e) = client.logout(id).await {
            warn!(error = %e, "logout failed");
        }
    }
    (
        StatusCode::FOUND,
        [
            (LOCATION, "/".to_string()),
            (SET_COOKIE, cleared_session_cookie()),
        ],
    )
        .into_response()
}
