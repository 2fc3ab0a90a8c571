//! OAuth flow engine: PAR, code exchange, refresh and session upkeep.

use crate::config::OAuthConfig;
use crate::error::{Error, Result};
use crate::jwk::generate_secret_jwk;
use crate::jwt::{CLIENT_ASSERTION_TYPE_JWT_BEARER, create_client_assertion, create_dpop_proof};
use crate::random::{code_challenge, generate_code_verifier, generate_session_id, generate_state};
use crate::repo::RepoClient;
use crate::resolver::{
    AuthServerMetadata, IdentityResolver, ResolverOptions, is_did, same_issuer,
};
use crate::session::{PendingAuthRequest, SESSION_TTL_HOURS, TokenSet, TokenState, UserSession};
use crate::store::{OAuthStore, StoreError};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use http::StatusCode;
use jose_jwk::Jwk;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const DISCOVERY_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Query parameters the auth server sends back to the redirect URI
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub iss: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// A finished login: the new session and where to send the user
#[derive(Debug, Clone)]
pub struct CompletedLogin {
    pub session: UserSession,
    pub destination: String,
}

#[derive(Deserialize)]
struct ParResponse {
    request_uri: String,
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Status and body of a token-family endpoint response
struct EndpointResponse {
    status: StatusCode,
    body: String,
}

impl EndpointResponse {
    fn is_success(&self) -> bool {
        self.status.is_success()
    }

    fn parse<T: serde::de::DeserializeOwned>(&self) -> std::result::Result<T, String> {
        serde_json::from_str(&self.body).map_err(|e| format!("invalid response body: {e}"))
    }

    /// Server message for a failed call
    fn message(&self) -> String {
        match serde_json::from_str::<OAuthErrorBody>(&self.body) {
            Ok(OAuthErrorBody {
                error,
                error_description: Some(description),
            }) => format!("{error}: {description}"),
            Ok(OAuthErrorBody { error, .. }) => error,
            Err(_) => format!("HTTP {}", self.status.as_u16()),
        }
    }
}

struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

impl<T: Clone> Cached<T> {
    fn fresh(&self) -> Option<T> {
        (self.fetched_at.elapsed() < DISCOVERY_CACHE_TTL).then(|| self.value.clone())
    }
}

/// ATProto OAuth client bound to a store
pub struct OAuthClient<S: OAuthStore> {
    config: Arc<OAuthConfig>,
    store: Arc<S>,
    http: reqwest::Client,
    resolver: IdentityResolver,
    metadata_cache: DashMap<String, Cached<AuthServerMetadata>>,
    issuer_cache: DashMap<String, Cached<String>>,
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

pub struct OAuthClientBuilder<S: OAuthStore> {
    config: Option<OAuthConfig>,
    store: Option<Arc<S>>,
    http: Option<reqwest::Client>,
    resolver_options: ResolverOptions,
}

impl<S: OAuthStore> OAuthClient<S> {
    pub fn builder() -> OAuthClientBuilder<S> {
        OAuthClientBuilder {
            config: None,
            store: None,
            http: None,
            resolver_options: ResolverOptions::default(),
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Begin a login for `handle`, returning the URL to redirect the user to.
    pub async fn start_login(&self, handle: &str, destination: &str) -> Result<String> {
        let identity = self.resolver.resolve_identity(handle).await?;
        let metadata = self.auth_server_metadata(&identity.issuer).await?;

        let state = generate_state();
        let verifier = generate_code_verifier();
        let dpop_key = generate_secret_jwk();

        let request_uri = self
            .pushed_authorization_request(&metadata, &state, &verifier, &dpop_key, Some(handle))
            .await?;

        let request = PendingAuthRequest::new(
            state.clone(),
            metadata.issuer.clone(),
            verifier,
            dpop_key,
            destination.to_string(),
        );
        self.store.save_request(&request).await?;

        let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|e| {
            Error::AuthServerDiscoveryFailed(format!("bad authorization_endpoint: {e}"))
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id())
            .append_pair("request_uri", &request_uri)
            .append_pair("state", &state);

        info!(did = %identity.did, issuer = %metadata.issuer, "started oauth login");
        Ok(url.into())
    }

    /// Push the authorization parameters and return the `request_uri`.
    pub async fn pushed_authorization_request(
        &self,
        metadata: &AuthServerMetadata,
        state: &str,
        verifier: &str,
        dpop_key: &Jwk,
        login_hint: Option<&str>,
    ) -> Result<String> {
        let mut params = vec![
            ("response_type", "code".to_string()),
            ("code_challenge", code_challenge(verifier)),
            ("code_challenge_method", "S256".to_string()),
            ("redirect_uri", self.config.redirect_uri()),
            ("scope", self.config.scope.clone()),
            ("state", state.to_string()),
        ];
        if let Some(hint) = login_hint {
            params.push(("login_hint", hint.to_string()));
        }

        let response = self
            .token_request(
                &metadata.pushed_authorization_request_endpoint,
                &metadata.issuer,
                params,
                dpop_key,
            )
            .await
            .map_err(|e| match e {
                Error::DpopNonceRequired(_) => Error::ParRejected("use_dpop_nonce".to_string()),
                e => e,
            })?;

        if !response.is_success() {
            return Err(Error::ParRejected(response.message()));
        }
        let par: ParResponse = response.parse().map_err(Error::ParRejected)?;
        Ok(par.request_uri)
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        metadata: &AuthServerMetadata,
        code: &str,
        verifier: &str,
        dpop_key: &Jwk,
    ) -> Result<TokenSet> {
        let params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("code_verifier", verifier.to_string()),
            ("redirect_uri", self.config.redirect_uri()),
        ];

        let response = self
            .token_request(&metadata.token_endpoint, &metadata.issuer, params, dpop_key)
            .await
            .map_err(|e| match e {
                Error::DpopNonceRequired(_) => {
                    Error::TokenExchangeFailed("use_dpop_nonce".to_string())
                }
                e => e,
            })?;

        if !response.is_success() {
            return Err(Error::TokenExchangeFailed(response.message()));
        }
        response.parse().map_err(Error::TokenExchangeFailed)
    }

    /// Refresh a session's tokens. The caller persists the result.
    pub async fn refresh(&self, session: &UserSession) -> Result<TokenSet> {
        let refresh_token = session
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::RefreshFailed("session has no refresh token".to_string()))?;
        let issuer = self.issuer_for_pds(&session.pds_url).await?;
        let metadata = self.auth_server_metadata(&issuer).await?;

        let params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        let response = self
            .token_request(
                &metadata.token_endpoint,
                &metadata.issuer,
                params,
                &session.dpop_key,
            )
            .await
            .map_err(|e| match e {
                Error::DpopNonceRequired(_) => Error::RefreshFailed("use_dpop_nonce".to_string()),
                e => e,
            })?;

        if !response.is_success() {
            return Err(Error::RefreshFailed(response.message()));
        }
        let tokens: TokenSet = response.parse().map_err(Error::RefreshFailed)?;
        if let Some(sub) = &tokens.sub {
            if sub != &session.did {
                return Err(Error::RefreshFailed(format!(
                    "refreshed token belongs to {sub}, not {}",
                    session.did
                )));
            }
        }
        Ok(tokens)
    }

    /// Handle the redirect back from the auth server.
    ///
    /// The pending request is consumed whatever the outcome.
    pub async fn complete_login(&self, params: CallbackParams) -> Result<CompletedLogin> {
        let state = params.state.clone().ok_or(Error::StateUnknown)?;
        let request = match self.store.get_request(&state).await {
            Ok(request) => request,
            Err(StoreError::NotFound) => return Err(Error::StateUnknown),
            Err(e) => return Err(e.into()),
        };

        let result = self.finish_login(&request, params).await;

        if let Err(e) = self.store.delete_request(&state).await {
            warn!(error = %e, "failed to delete pending oauth request");
        }
        result
    }

    async fn finish_login(
        &self,
        request: &PendingAuthRequest,
        params: CallbackParams,
    ) -> Result<CompletedLogin> {
        if request.is_expired() {
            return Err(Error::StateUnknown);
        }

        let iss = params.iss.unwrap_or_default();
        if !same_issuer(&iss, &request.issuer) {
            return Err(Error::IssuerMismatch {
                expected: request.issuer.clone(),
                actual: iss,
            });
        }

        if let Some(error) = params.error {
            let message = match params.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            };
            return Err(Error::TokenExchangeFailed(message));
        }
        let code = params
            .code
            .ok_or_else(|| Error::TokenExchangeFailed("callback has no code".to_string()))?;

        let metadata = self.auth_server_metadata(&request.issuer).await?;
        let tokens = self
            .exchange_code(&metadata, &code, &request.pkce_verifier, &request.dpop_key)
            .await?;

        let did = tokens
            .sub
            .clone()
            .filter(|sub| is_did(sub))
            .ok_or_else(|| Error::TokenExchangeFailed("token response has no sub".to_string()))?;

        // The issuer must be authoritative for the account it vouched for.
        let pds_url = self
            .resolver
            .resolve_pds(&did)
            .await
            .map_err(|e| Error::TokenExchangeFailed(format!("resolving {did}: {e}")))?;
        let pds_issuer = self
            .issuer_for_pds(&pds_url)
            .await
            .map_err(|e| Error::TokenExchangeFailed(format!("resolving {pds_url}: {e}")))?;
        if !same_issuer(&pds_issuer, &request.issuer) {
            return Err(Error::TokenExchangeFailed(format!(
                "{} is not the authorization server for {did}",
                request.issuer
            )));
        }

        let now = Utc::now();
        let session = UserSession {
            id: generate_session_id(),
            did,
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            dpop_key: request.dpop_key.clone(),
            pds_url,
            token_expires_at: tokens.expires_at(now),
            created_at: now,
            expires_at: now + Duration::hours(SESSION_TTL_HOURS),
        };
        self.store.create_session(&session).await?;

        info!(did = %session.did, "oauth login completed");
        Ok(CompletedLogin {
            session,
            destination: request.destination.clone(),
        })
    }

    /// Load a session, refreshing its tokens first when they are expiring.
    /// A session past its own lifetime is deleted and reported as not found.
    ///
    /// Refreshes are serialized per session: a caller that waited on another
    /// caller's refresh sees the new tokens without calling the auth server.
    pub async fn fresh_session(&self, session_id: &str) -> Result<UserSession> {
        let seen = self.store.get_session(session_id).await?;
        if seen.is_expired() {
            debug!(did = %seen.did, "session past its lifetime");
            if let Err(e) = self.store.delete_session(session_id).await {
                warn!(error = %e, "failed to delete expired session");
            }
            return Err(Error::Store(StoreError::NotFound));
        }
        if !seen.token_state().needs_refresh() {
            return Ok(seen);
        }

        let lock = self
            .refresh_locks
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(session_id, &seen.access_token).await
        };
        drop(lock);
        self.refresh_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn refresh_locked(&self, session_id: &str, seen_token: &str) -> Result<UserSession> {
        let current = self.store.get_session(session_id).await?;
        let state = current.token_state();
        if current.access_token != seen_token || !state.needs_refresh() {
            debug!(session = %session_id, "tokens already refreshed");
            return Ok(current);
        }

        match self.refresh(&current).await {
            Ok(tokens) => {
                let refresh_token = tokens.refresh_token.clone().or(current.refresh_token.clone());
                let token_expires_at = tokens.expires_at(Utc::now());
                self.store
                    .update_session_tokens(
                        session_id,
                        &tokens.access_token,
                        refresh_token.as_deref(),
                        token_expires_at,
                    )
                    .await?;
                info!(did = %current.did, "refreshed oauth tokens");
                Ok(UserSession {
                    access_token: tokens.access_token,
                    refresh_token,
                    token_expires_at,
                    ..current
                })
            }
            Err(e) if state == TokenState::NearExpiry => {
                warn!(error = %e, did = %current.did, "early token refresh failed");
                Ok(current)
            }
            Err(e) => {
                warn!(error = %e, did = %current.did, "token refresh failed, ending session");
                if let Err(e) = self.store.delete_session(session_id).await {
                    warn!(error = %e, "failed to delete session after refresh failure");
                }
                Err(match e {
                    e @ Error::RefreshFailed(_) => e,
                    e => Error::RefreshFailed(e.to_string()),
                })
            }
        }
    }

    /// Repository client for a session, with tokens refreshed as needed.
    pub async fn repo_client(&self, session_id: &str) -> Result<RepoClient> {
        let session = self.fresh_session(session_id).await?;
        Ok(RepoClient::new(self.http.clone(), &session))
    }

    /// End a session and revoke its tokens at the auth server when possible.
    pub async fn logout(&self, session_id: &str) -> Result<()> {
        let session = match self.store.get_session(session_id).await {
            Ok(session) => session,
            Err(StoreError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.store.delete_session(session_id).await?;
        info!(did = %session.did, "logged out");

        if let Err(e) = self.revoke(&session).await {
            warn!(error = %e, did = %session.did, "token revocation failed");
        }
        Ok(())
    }

    async fn revoke(&self, session: &UserSession) -> Result<()> {
        let issuer = self.issuer_for_pds(&session.pds_url).await?;
        let metadata = self.auth_server_metadata(&issuer).await?;
        let Some(endpoint) = metadata.revocation_endpoint.as_deref() else {
            return Ok(());
        };

        let tokens = [Some(&session.access_token), session.refresh_token.as_ref()];
        for token in tokens.into_iter().flatten() {
            let response = self
                .token_request(
                    endpoint,
                    &metadata.issuer,
                    vec![("token", token.clone())],
                    &session.dpop_key,
                )
                .await?;
            if !response.is_success() {
                debug!(status = %response.status, "revocation endpoint refused token");
            }
        }
        Ok(())
    }

    /// Authorization server metadata for `issuer`, cached.
    pub async fn auth_server_metadata(&self, issuer: &str) -> Result<AuthServerMetadata> {
        let key = issuer.trim_end_matches('/').to_string();
        if let Some(metadata) = self.metadata_cache.get(&key).and_then(|c| c.fresh()) {
            return Ok(metadata);
        }
        let metadata = self.resolver.fetch_auth_server_metadata(&key).await?;
        self.metadata_cache.insert(
            key,
            Cached {
                value: metadata.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(metadata)
    }

    /// Issuer protecting a PDS, cached.
    pub async fn issuer_for_pds(&self, pds_url: &str) -> Result<String> {
        let key = pds_url.trim_end_matches('/').to_string();
        if let Some(issuer) = self.issuer_cache.get(&key).and_then(|c| c.fresh()) {
            return Ok(issuer);
        }
        let issuer = self.resolver.resolve_auth_server(&key).await?;
        self.issuer_cache.insert(
            key,
            Cached {
                value: issuer.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(issuer)
    }

    /// POST a client-authenticated, DPoP-bound form, retrying once on a nonce challenge.
    async fn token_request(
        &self,
        endpoint: &str,
        issuer: &str,
        params: Vec<(&'static str, String)>,
        dpop_key: &Jwk,
    ) -> Result<EndpointResponse> {
        match self
            .send_token_request(endpoint, issuer, &params, dpop_key, None)
            .await
        {
            Err(Error::DpopNonceRequired(nonce)) => {
                debug!(endpoint, "retrying with server dpop nonce");
                self.send_token_request(endpoint, issuer, &params, dpop_key, Some(&nonce))
                    .await
            }
            other => other,
        }
    }

    async fn send_token_request(
        &self,
        endpoint: &str,
        issuer: &str,
        params: &[(&'static str, String)],
        dpop_key: &Jwk,
        nonce: Option<&str>,
    ) -> Result<EndpointResponse> {
        let client_id = self.config.client_id();
        let assertion = create_client_assertion(&self.config.client_key, &client_id, issuer)?;
        let proof = create_dpop_proof(dpop_key, "POST", endpoint, nonce, None)?;

        let mut form: Vec<(&str, &str)> = vec![("client_id", client_id.as_str())];
        form.extend(params.iter().map(|(k, v)| (*k, v.as_str())));
        form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE_JWT_BEARER));
        form.push(("client_assertion", assertion.as_str()));
        let body = serde_urlencoded::to_string(&form)
            .map_err(|e| Error::Internal(format!("failed to encode form: {e}")))?;

        let response = self
            .http
            .post(endpoint)
            .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header("DPoP", proof)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let server_nonce = response
            .headers()
            .get("dpop-nonce")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await?;

        if status == StatusCode::BAD_REQUEST {
            if let Some(server_nonce) = server_nonce {
                let is_nonce_error = serde_json::from_str::<OAuthErrorBody>(&body)
                    .map(|b| b.error == "use_dpop_nonce")
                    .unwrap_or(false);
                if is_nonce_error {
                    return Err(Error::DpopNonceRequired(server_nonce));
                }
            }
        }

        Ok(EndpointResponse { status, body })
    }
}

impl<S: OAuthStore> OAuthClientBuilder<S> {
    pub fn config(mut self, config: OAuthConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a preconfigured HTTP client. It should carry a request timeout.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn resolver_options(mut self, options: ResolverOptions) -> Self {
        self.resolver_options = options;
        self
    }

    pub fn build(self) -> Result<OAuthClient<S>> {
        let config = self
            .config
            .ok_or_else(|| Error::Config("oauth config is required".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| Error::Config("oauth store is required".to_string()))?;
        let http = match self.http {
            Some(http) => http,
            None => default_http_client()?,
        };
        let resolver = IdentityResolver::new(http.clone(), self.resolver_options);

        Ok(OAuthClient {
            config: Arc::new(config),
            store,
            http,
            resolver,
            metadata_cache: DashMap::new(),
            issuer_cache: DashMap::new(),
            refresh_locks: DashMap::new(),
        })
    }
}

/// HTTP client with the deadline every outbound call needs.
pub fn default_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("survey-oauth/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config(format!("failed to build http client: {e}")))
}
