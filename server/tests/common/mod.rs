//! In-process PLC directory, PDS, authorization server and app view.

#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use server::{AppState, SqliteStore, app};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use survey_oauth::jwk::generate_secret_jwk;
use survey_oauth::{HandleStep, OAuthClient, OAuthConfig, ProfileCache, ResolverOptions};

pub const DID: &str = "did:plc:alice";
pub const HANDLE: &str = "alice.test";
pub const HOST: &str = "surveys.test";
pub const REQUEST_URI: &str = "urn:ietf:params:oauth:request_uri:req-1";

#[derive(Default)]
pub struct Upstream {
    pub base: OnceLock<String>,
    pub par_calls: AtomicUsize,
    pub token_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
}

impl Upstream {
    fn base(&self) -> String {
        self.base.get().cloned().unwrap_or_default()
    }
}

async fn auth_server_metadata(State(up): State<Arc<Upstream>>) -> Json<Value> {
    let base = up.base();
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/oauth/authorize"),
        "token_endpoint": format!("{base}/oauth/token"),
        "pushed_authorization_request_endpoint": format!("{base}/oauth/par"),
        "revocation_endpoint": format!("{base}/oauth/revoke"),
    }))
}

async fn protected_resource(State(up): State<Arc<Upstream>>) -> Json<Value> {
    Json(json!({ "authorization_servers": [up.base()] }))
}

async fn did_document(State(up): State<Arc<Upstream>>, Path(did): Path<String>) -> Response {
    if did != DID {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({
        "id": DID,
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": up.base(),
        }]
    }))
    .into_response()
}

async fn resolve_handle(Query(q): Query<HashMap<String, String>>) -> Response {
    match q.get("handle").map(String::as_str) {
        Some(HANDLE) => Json(json!({ "did": DID })).into_response(),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "InvalidRequest", "message": "Unable to resolve handle"})),
        )
            .into_response(),
    }
}

async fn par(State(up): State<Arc<Upstream>>) -> Response {
    up.par_calls.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::CREATED,
        Json(json!({ "request_uri": REQUEST_URI, "expires_in": 90 })),
    )
        .into_response()
}

async fn token(State(up): State<Arc<Upstream>>) -> Json<Value> {
    let n = up.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "access_token": format!("access-{n}"),
        "token_type": "DPoP",
        "expires_in": 3600,
        "refresh_token": format!("refresh-{n}"),
        "sub": DID,
    }))
}

async fn revoke(State(up): State<Arc<Upstream>>) -> StatusCode {
    up.revoke_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn get_profile(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    Json(json!({ "did": q["actor"], "handle": HANDLE, "displayName": "Alice" }))
}

pub async fn start_upstream() -> Arc<Upstream> {
    let up = Arc::new(Upstream::default());
    let app = Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(auth_server_metadata),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource),
        )
        .route("/{did}", get(did_document))
        .route(
            "/xrpc/com.atproto.identity.resolveHandle",
            get(resolve_handle),
        )
        .route("/xrpc/app.bsky.actor.getProfile", get(get_profile))
        .route("/oauth/par", post(par))
        .route("/oauth/token", post(token))
        .route("/oauth/revoke", post(revoke))
        .with_state(up.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    up.base
        .set(format!("http://{}", listener.local_addr().unwrap()))
        .unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    up
}

/// App state wired to `upstream`, backed by an in-memory database
pub async fn app_state(upstream: &Upstream, oauth_enabled: bool) -> AppState {
    let pool = app::connect_memory().await.unwrap();
    app::run_migrations(&pool).await.unwrap();
    let base = upstream.base();

    let oauth = oauth_enabled.then(|| {
        let client = OAuthClient::builder()
            .config(OAuthConfig::new(HOST, generate_secret_jwk()).unwrap())
            .store(Arc::new(SqliteStore::new(pool.clone())))
            .resolver_options(ResolverOptions {
                plc_directory: base.parse().unwrap(),
                bootstrap_server: base.parse().unwrap(),
                handle_order: vec![HandleStep::BootstrapResolveHandle],
            })
            .build()
            .unwrap();
        Arc::new(client)
    });

    AppState {
        db: pool,
        oauth,
        profiles: Arc::new(ProfileCache::new(reqwest::Client::new()).with_appview(base)),
    }
}

pub fn issuer(upstream: &Upstream) -> String {
    upstream.base()
}
