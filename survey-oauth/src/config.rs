use crate::error::{Error, Result};
use crate::jwk::{normalize_signing_jwk, parse_jwk, to_public_jwk};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jose_jwk::Jwk;
use serde::Serialize;

pub const SECRET_JWK_ENV: &str = "OAUTH_SECRET_JWK_B64";
pub const SERVER_HOST_ENV: &str = "SERVER_HOST";

pub const DEFAULT_SCOPE: &str = "atproto transition:generic";
pub const DEFAULT_CLIENT_NAME: &str = "Survey Service";

/// Configuration for the OAuth client
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// External hostname of this service, without scheme
    pub host: String,

    /// Service client private key used for `private_key_jwt`
    pub client_key: Jwk,

    /// Human readable client name shown by auth servers
    pub client_name: String,

    /// OAuth scopes to request
    pub scope: String,
}

/// Public OAuth client metadata document
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientMetadata {
    pub client_id: String,
    pub client_name: String,
    pub application_type: &'static str,
    pub grant_types: Vec<&'static str>,
    pub scope: String,
    pub response_types: Vec<&'static str>,
    pub redirect_uris: Vec<String>,
    pub dpop_bound_access_tokens: bool,
    pub token_endpoint_auth_method: &'static str,
    pub token_endpoint_auth_signing_alg: &'static str,
    pub jwks_uri: String,
}

impl OAuthConfig {
    /// Create a configuration for `host` signing with `client_key`
    pub fn new(host: impl AsRef<str>, client_key: Jwk) -> Result<Self> {
        let host = host
            .as_ref()
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        if host.is_empty() {
            return Err(Error::Config("server host is empty".to_string()));
        }
        let client_key = normalize_signing_jwk(client_key)
            .map_err(|e| Error::Config(format!("service client key: {e}")))?;

        Ok(Self {
            host,
            client_key,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
        })
    }

    /// Build from a base64 encoded private JWK.
    pub fn from_encoded_key(host: impl AsRef<str>, encoded_jwk: &str) -> Result<Self> {
        let encoded = encoded_jwk.trim();
        let raw = STANDARD
            .decode(encoded)
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')))
            .map_err(|e| Error::Config(format!("{SECRET_JWK_ENV} is not base64: {e}")))?;
        let raw = String::from_utf8(raw)
            .map_err(|e| Error::Config(format!("{SECRET_JWK_ENV} is not UTF-8: {e}")))?;
        let jwk = parse_jwk(&raw).map_err(|e| Error::Config(format!("{SECRET_JWK_ENV}: {e}")))?;
        Self::new(host, jwk)
    }

    /// Load from the environment. `Ok(None)` when OAuth is not configured.
    pub fn from_env() -> Result<Option<Self>> {
        let key = std::env::var(SECRET_JWK_ENV).ok().filter(|v| !v.trim().is_empty());
        let host = std::env::var(SERVER_HOST_ENV).ok().filter(|v| !v.trim().is_empty());
        match (key, host) {
            (Some(key), Some(host)) => Self::from_encoded_key(host, &key).map(Some),
            _ => Ok(None),
        }
    }

    /// Set client name
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Set custom scope
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn base_url(&self) -> String {
        format!("https://{}", self.host)
    }

    pub fn client_id(&self) -> String {
        format!("{}/oauth/client-metadata.json", self.base_url())
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}/oauth/callback", self.base_url())
    }

    pub fn jwks_uri(&self) -> String {
        format!("{}/oauth/jwks.json", self.base_url())
    }

    pub fn client_metadata(&self) -> ClientMetadata {
        ClientMetadata {
            client_id: self.client_id(),
            client_name: self.client_name.clone(),
            application_type: "web",
            grant_types: vec!["authorization_code", "refresh_token"],
            scope: self.scope.clone(),
            response_types: vec!["code"],
            redirect_uris: vec![self.redirect_uri()],
            dpop_bound_access_tokens: true,
            token_endpoint_auth_method: "private_key_jwt",
            token_endpoint_auth_signing_alg: "ES256",
            jwks_uri: self.jwks_uri(),
        }
    }

    /// JWKS document holding the public half of the client key
    pub fn jwks(&self) -> Result<serde_json::Value> {
        let public = to_public_jwk(&self.client_key)?;
        Ok(serde_json::json!({ "keys": [public] }))
    }
}
