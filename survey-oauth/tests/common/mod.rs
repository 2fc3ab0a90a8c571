//! In-process stand-ins for the PLC directory, PDS and authorization server.

#![allow(dead_code)]

use axum::{
    Form, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use survey_oauth::{
    HandleStep, MemoryStore, OAuthClient, OAuthConfig, ResolverOptions, jwk::generate_secret_jwk,
};

pub const DID: &str = "did:plc:alice";
pub const HANDLE: &str = "alice.test";
pub const NONCE: &str = "server-nonce-1";
pub const REQUEST_URI: &str = "urn:ietf:params:oauth:request_uri:req-1";

#[derive(Default)]
pub struct MockState {
    pub base: OnceLock<String>,
    pub require_par_nonce: AtomicBool,
    pub require_token_nonce: AtomicBool,
    /// Challenge every request, even ones that already carry the nonce.
    pub reject_every_nonce: AtomicBool,
    pub require_repo_nonce: AtomicBool,
    pub par_proofs: Mutex<Vec<Value>>,
    pub par_forms: Mutex<Vec<HashMap<String, String>>>,
    pub token_forms: Mutex<Vec<HashMap<String, String>>>,
    pub token_proofs: Mutex<Vec<Value>>,
    pub token_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
    pub issued: AtomicUsize,
    pub repo_calls: AtomicUsize,
    pub repo_proofs: Mutex<Vec<Value>>,
    pub repo_auth: Mutex<Vec<String>>,
    pub repo_bodies: Mutex<Vec<Value>>,
}

impl MockState {
    pub fn base(&self) -> String {
        self.base.get().cloned().unwrap_or_default()
    }
}

pub struct MockAtproto {
    pub base: String,
    pub state: Arc<MockState>,
}

/// Decode the payload of a compact JWT without verifying it.
pub fn jwt_payload(token: &str) -> Value {
    let payload = token.split('.').nth(1).expect("jwt has a payload");
    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).expect("base64url payload"))
        .expect("json payload")
}

fn dpop_payload(headers: &HeaderMap) -> Value {
    headers
        .get("dpop")
        .and_then(|v| v.to_str().ok())
        .map(jwt_payload)
        .unwrap_or(Value::Null)
}

fn wants_nonce(state: &MockState, required: &AtomicBool, proof: &Value) -> bool {
    required.load(Ordering::SeqCst)
        && (proof.get("nonce").is_none() || state.reject_every_nonce.load(Ordering::SeqCst))
}

fn nonce_challenge(status: StatusCode, body: Value) -> Response {
    (status, [("DPoP-Nonce", NONCE)], Json(body)).into_response()
}

async fn auth_server_metadata(State(state): State<Arc<MockState>>) -> Json<Value> {
    let base = state.base();
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/oauth/authorize"),
        "token_endpoint": format!("{base}/oauth/token"),
        "pushed_authorization_request_endpoint": format!("{base}/oauth/par"),
        "revocation_endpoint": format!("{base}/oauth/revoke"),
        "dpop_signing_alg_values_supported": ["ES256"],
    }))
}

async fn protected_resource(State(state): State<Arc<MockState>>) -> Json<Value> {
    let base = state.base();
    Json(json!({ "resource": base, "authorization_servers": [base] }))
}

async fn did_document(State(state): State<Arc<MockState>>, Path(did): Path<String>) -> Response {
    if did != DID {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({
        "id": DID,
        "alsoKnownAs": [format!("at://{HANDLE}")],
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": state.base(),
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

async fn par(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let proof = dpop_payload(&headers);
    state.par_proofs.lock().unwrap().push(proof.clone());
    state.par_forms.lock().unwrap().push(form);

    if wants_nonce(&state, &state.require_par_nonce, &proof) {
        return nonce_challenge(StatusCode::BAD_REQUEST, json!({"error": "use_dpop_nonce"}));
    }
    (
        StatusCode::CREATED,
        Json(json!({ "request_uri": REQUEST_URI, "expires_in": 90 })),
    )
        .into_response()
}

async fn token(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let proof = dpop_payload(&headers);
    state.token_calls.fetch_add(1, Ordering::SeqCst);
    state.token_proofs.lock().unwrap().push(proof.clone());
    state.token_forms.lock().unwrap().push(form.clone());

    if wants_nonce(&state, &state.require_token_nonce, &proof) {
        return nonce_challenge(StatusCode::BAD_REQUEST, json!({"error": "use_dpop_nonce"}));
    }

    match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => {}
        Some("refresh_token") => {
            state.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if form.get("refresh_token").map(String::as_str) == Some("revoked") {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "invalid_grant", "error_description": "refresh token revoked"})),
                )
                    .into_response();
            }
            // Widen the window in which concurrent callers pile up.
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "unsupported_grant_type"})),
            )
                .into_response();
        }
    }

    let n = state.issued.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "access_token": format!("access-{n}"),
        "token_type": "DPoP",
        "expires_in": 3600,
        "refresh_token": format!("refresh-{n}"),
        "scope": "atproto transition:generic",
        "sub": DID,
    }))
    .into_response()
}

async fn revoke(State(state): State<Arc<MockState>>) -> StatusCode {
    state.revoke_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

fn record_repo_call(state: &MockState, headers: &HeaderMap) -> Option<Response> {
    state.repo_calls.fetch_add(1, Ordering::SeqCst);
    let proof = dpop_payload(headers);
    state.repo_proofs.lock().unwrap().push(proof.clone());
    state.repo_auth.lock().unwrap().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    );
    if state.require_repo_nonce.load(Ordering::SeqCst) && proof.get("nonce").is_none() {
        return Some(nonce_challenge(
            StatusCode::UNAUTHORIZED,
            json!({"error": "use_dpop_nonce", "message": "DPoP nonce mismatch"}),
        ));
    }
    None
}

async fn write_record(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(challenge) = record_repo_call(&state, &headers) {
        return challenge;
    }
    state.repo_bodies.lock().unwrap().push(body.clone());
    if body["collection"] == "com.example.forbidden" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "InvalidRequest", "message": "forbidden collection"})),
        )
            .into_response();
    }
    Json(json!({
        "uri": format!("at://{}/{}/{}", body["repo"].as_str().unwrap_or_default(), body["collection"].as_str().unwrap_or_default(), body["rkey"].as_str().unwrap_or_default()),
        "cid": "bafyreiexample",
    }))
    .into_response()
}

async fn delete_record(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(challenge) = record_repo_call(&state, &headers) {
        return challenge;
    }
    state.repo_bodies.lock().unwrap().push(body);
    Json(json!({})).into_response()
}

async fn get_record(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Some(challenge) = record_repo_call(&state, &headers) {
        return challenge;
    }
    Json(json!({
        "uri": format!("at://{}/{}/{}", q["repo"], q["collection"], q["rkey"]),
        "cid": "bafyreiexample",
        "value": { "title": "Favourite colour?", "rkey": q["rkey"] },
    }))
    .into_response()
}

async fn list_records(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if let Some(challenge) = record_repo_call(&state, &headers) {
        return challenge;
    }
    let collection = &q["collection"];
    Json(json!({
        "records": [
            {"uri": format!("at://{DID}/{collection}/3kaaa"), "cid": "bafy1", "value": {"title": "one", "rkey": "x"}},
            {"uri": format!("at://{DID}/{collection}/3kbbb"), "cid": "bafy2", "value": {"title": "two", "rkey": "y"}},
        ],
        "cursor": "3kbbb",
        "limit": q.get("limit"),
    }))
    .into_response()
}

impl MockAtproto {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
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
            .route("/oauth/par", post(par))
            .route("/oauth/token", post(token))
            .route("/oauth/revoke", post(revoke))
            .route("/xrpc/com.atproto.repo.createRecord", post(write_record))
            .route("/xrpc/com.atproto.repo.putRecord", post(write_record))
            .route("/xrpc/com.atproto.repo.deleteRecord", post(delete_record))
            .route("/xrpc/com.atproto.repo.getRecord", get(get_record))
            .route("/xrpc/com.atproto.repo.listRecords", get(list_records))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        state.base.set(base.clone()).unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self { base, state }
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            plc_directory: self.base.parse().unwrap(),
            bootstrap_server: self.base.parse().unwrap(),
            handle_order: vec![HandleStep::BootstrapResolveHandle],
        }
    }

    pub fn client(&self, store: Arc<MemoryStore>) -> OAuthClient<MemoryStore> {
        OAuthClient::builder()
            .config(OAuthConfig::new("surveys.test", generate_secret_jwk()).unwrap())
            .store(store)
            .resolver_options(self.resolver_options())
            .build()
            .unwrap()
    }
}

pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
