//! ES256 JWTs: client assertions for `private_key_jwt` and DPoP proofs.

use crate::error::{Error, Result};
use crate::jwk::{signing_key, to_public_jwk};
use crate::random::generate_jti;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jose_jwk::Jwk;
use p256::ecdsa::signature::Signer;
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

const CLIENT_ASSERTION_LIFETIME_SECS: i64 = 300;
const DPOP_PROOF_LIFETIME_SECS: i64 = 30;

#[derive(Debug, Serialize)]
struct Header<'a> {
    alg: &'static str,
    typ: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
}

#[derive(Debug, Serialize)]
struct ClientAssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
}

#[derive(Debug, Serialize)]
struct DpopClaims<'a> {
    htm: &'a str,
    htu: String,
    iat: i64,
    exp: i64,
    jti: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ath: Option<String>,
}

fn sign<C: Serialize>(key: &Jwk, header: &Header<'_>, claims: &C) -> Result<String> {
    let signing_key = signing_key(key)?;

    let header_json = serde_json::to_string(header)
        .map_err(|e| Error::Internal(format!("failed to serialize header: {}", e)))?;
    let claims_json = serde_json::to_string(claims)
        .map_err(|e| Error::Internal(format!("failed to serialize claims: {}", e)))?;

    let header_b64 = URL_SAFE_NO_PAD.encode(&header_json);
    let payload_b64 = URL_SAFE_NO_PAD.encode(&claims_json);
    let signature_input = format!("{}.{}", header_b64, payload_b64);

    let signature: p256::ecdsa::Signature = signing_key.sign(signature_input.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

    Ok(format!("{}.{}.{}", header_b64, payload_b64, signature_b64))
}

/// Client assertion for `private_key_jwt` authentication at `audience`.
pub fn create_client_assertion(key: &Jwk, client_id: &str, audience: &str) -> Result<String> {
    let kid = key
        .prm
        .kid
        .as_deref()
        .ok_or_else(|| Error::InvalidKey("client key has no kid".to_string()))?;
    let now = Utc::now().timestamp();

    let header = Header {
        alg: "ES256",
        typ: "JWT",
        kid: Some(kid),
        jwk: None,
    };
    let claims = ClientAssertionClaims {
        iss: client_id,
        sub: client_id,
        aud: audience,
        iat: now,
        exp: now + CLIENT_ASSERTION_LIFETIME_SECS,
        jti: generate_jti(),
    };

    sign(key, &header, &claims)
}

/// DPoP proof for one request.
///
/// `ath` is present exactly when an access token is presented.
pub fn create_dpop_proof(
    key: &Jwk,
    method: &str,
    url: &str,
    nonce: Option<&str>,
    access_token: Option<&str>,
) -> Result<String> {
    let now = Utc::now().timestamp();

    let header = Header {
        alg: "ES256",
        typ: "dpop+jwt",
        kid: None,
        jwk: Some(to_public_jwk(key)?),
    };
    let claims = DpopClaims {
        htm: method,
        htu: target_uri(url)?,
        iat: now,
        exp: now + DPOP_PROOF_LIFETIME_SECS,
        jti: generate_jti(),
        nonce,
        ath: access_token.map(access_token_hash),
    };

    sign(key, &header, &claims)
}

/// `ath` value: base64url(SHA-256(token)) without padding.
pub fn access_token_hash(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

// htu excludes query and fragment.
fn target_uri(url: &str) -> Result<String> {
    let mut url = Url::parse(url).map_err(|e| Error::Internal(format!("bad url {url}: {e}")))?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}
