//! Identity resolution: handle → DID → PDS → authorization server → endpoints.
//!
//! **Handle → DID** runs the configured [`HandleStep`]s in order and returns
//! the first DID found:
//! 1. DNS TXT at `_atproto.{handle}` (`did=...`)
//! 2. HTTPS well-known at `https://{handle}/.well-known/atproto-did`
//! 3. `com.atproto.identity.resolveHandle` on a bootstrap server
//!
//! **DID → PDS** reads the DID document from the PLC directory (`did:plc`) or
//! the domain's well-known location (`did:web`) and takes the first
//! `AtprotoPersonalDataServer` service.

use crate::error::{Error, Result};
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";
pub const DEFAULT_BOOTSTRAP_SERVER: &str = "https://bsky.social";

/// A handle resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStep {
    /// DNS TXT record at `_atproto.<handle>`
    DnsTxt,
    /// HTTPS GET `https://<handle>/.well-known/atproto-did`
    HttpsWellKnown,
    /// XRPC `com.atproto.identity.resolveHandle` on the bootstrap server
    BootstrapResolveHandle,
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub plc_directory: Url,
    pub bootstrap_server: Url,
    pub handle_order: Vec<HandleStep>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            plc_directory: Url::parse(DEFAULT_PLC_DIRECTORY).expect("valid url"),
            bootstrap_server: Url::parse(DEFAULT_BOOTSTRAP_SERVER).expect("valid url"),
            handle_order: vec![
                HandleStep::DnsTxt,
                HandleStep::HttpsWellKnown,
                HandleStep::BootstrapResolveHandle,
            ],
        }
    }
}

/// Authorization server metadata (RFC 8414), restricted to what the client uses
#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub pushed_authorization_request_endpoint: String,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
}

/// Everything login needs to know about an account
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub did: String,
    pub pds_url: String,
    pub issuer: String,
}

#[derive(Deserialize)]
struct DidDocument {
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidService {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    kind: String,
    service_endpoint: serde_json::Value,
}

#[derive(Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

#[derive(Deserialize)]
struct ResolveHandleOutput {
    did: String,
}

/// Resolver from the host's DNS configuration, or public defaults when it can't be read.
fn system_dns() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        warn!(error = %e, "could not read system DNS config, using defaults");
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    })
}

#[derive(Clone)]
pub struct IdentityResolver {
    http: reqwest::Client,
    dns: Option<TokioAsyncResolver>,
    opts: ResolverOptions,
}

impl IdentityResolver {
    pub fn new(http: reqwest::Client, opts: ResolverOptions) -> Self {
        let dns = opts
            .handle_order
            .contains(&HandleStep::DnsTxt)
            .then(system_dns);
        Self { http, dns, opts }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.opts
    }

    /// Resolve a handle (or a DID given in its place) through to the issuer.
    pub async fn resolve_identity(&self, input: &str) -> Result<ResolvedIdentity> {
        let input = normalize_handle(input);
        let did = if is_did(&input) {
            input
        } else {
            self.resolve_handle(&input).await?
        };
        let pds_url = self.resolve_pds(&did).await?;
        let issuer = self.resolve_auth_server(&pds_url).await?;
        Ok(ResolvedIdentity {
            did,
            pds_url,
            issuer,
        })
    }

    pub async fn resolve_handle(&self, handle: &str) -> Result<String> {
        let handle = normalize_handle(handle);
        if handle.is_empty() || !handle.contains('.') {
            return Err(Error::HandleUnresolvable(handle));
        }

        for step in &self.opts.handle_order {
            let found = match step {
                HandleStep::DnsTxt => self.did_from_dns(&handle).await,
                HandleStep::HttpsWellKnown => self.did_from_well_known(&handle).await,
                HandleStep::BootstrapResolveHandle => self.did_from_bootstrap(&handle).await,
            };
            match found {
                Some(did) => {
                    debug!(handle = %handle, did = %did, ?step, "resolved handle");
                    return Ok(did);
                }
                None => debug!(handle = %handle, ?step, "handle resolution step found nothing"),
            }
        }

        Err(Error::HandleUnresolvable(handle))
    }

    async fn did_from_dns(&self, handle: &str) -> Option<String> {
        let dns = self.dns.as_ref()?;
        let response = dns.txt_lookup(format!("_atproto.{handle}.")).await.ok()?;
        for txt in response.iter() {
            for data in txt.txt_data().iter() {
                let record = String::from_utf8_lossy(data);
                if let Some(did) = record.strip_prefix("did=") {
                    if is_did(did) {
                        return Some(did.to_string());
                    }
                }
            }
        }
        None
    }

    async fn did_from_well_known(&self, handle: &str) -> Option<String> {
        let url = Url::parse(&format!("https://{handle}/.well-known/atproto-did")).ok()?;
        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        parse_atproto_did_body(&body)
    }

    async fn did_from_bootstrap(&self, handle: &str) -> Option<String> {
        let mut url = self
            .opts
            .bootstrap_server
            .join("/xrpc/com.atproto.identity.resolveHandle")
            .ok()?;
        url.query_pairs_mut().append_pair("handle", handle);
        let response = self.http.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let output: ResolveHandleOutput = response.json().await.ok()?;
        is_did(&output.did).then_some(output.did)
    }

    /// Resolve a DID to its PDS base URL (no trailing slash).
    pub async fn resolve_pds(&self, did: &str) -> Result<String> {
        let url = if did.starts_with("did:plc:") {
            self.opts
                .plc_directory
                .join(&format!("/{did}"))
                .map_err(|e| Error::PdsDiscoveryFailed(e.to_string()))?
        } else if did.starts_with("did:web:") {
            did_web_url(did)?
        } else {
            return Err(Error::UnsupportedDid(did.to_string()));
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::PdsDiscoveryFailed(format!("fetching DID document: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::PdsDiscoveryFailed(format!(
                "DID document request returned {}",
                response.status()
            )));
        }
        let doc: DidDocument = response
            .json()
            .await
            .map_err(|e| Error::PdsDiscoveryFailed(format!("invalid DID document: {e}")))?;

        pds_from_document(&doc)
            .ok_or_else(|| Error::PdsDiscoveryFailed(format!("no PDS service in {did}")))
    }

    /// Resolve the authorization server that protects a PDS.
    pub async fn resolve_auth_server(&self, pds_url: &str) -> Result<String> {
        let url = format!(
            "{}/.well-known/oauth-protected-resource",
            pds_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::AuthServerDiscoveryFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::AuthServerDiscoveryFailed(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        let metadata: ProtectedResourceMetadata = response
            .json()
            .await
            .map_err(|e| Error::AuthServerDiscoveryFailed(e.to_string()))?;

        metadata
            .authorization_servers
            .into_iter()
            .next()
            .map(|issuer| issuer.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                Error::AuthServerDiscoveryFailed(format!("{pds_url} lists no authorization servers"))
            })
    }

    /// Fetch and validate authorization server metadata.
    pub async fn fetch_auth_server_metadata(&self, issuer: &str) -> Result<AuthServerMetadata> {
        let url = format!(
            "{}/.well-known/oauth-authorization-server",
            issuer.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::AuthServerDiscoveryFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::AuthServerDiscoveryFailed(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        let metadata: AuthServerMetadata = response
            .json()
            .await
            .map_err(|e| Error::AuthServerDiscoveryFailed(format!("invalid metadata: {e}")))?;

        if !same_issuer(&metadata.issuer, issuer) {
            return Err(Error::AuthServerDiscoveryFailed(format!(
                "metadata issuer {} does not match {issuer}",
                metadata.issuer
            )));
        }
        for (name, value) in [
            ("authorization_endpoint", &metadata.authorization_endpoint),
            ("token_endpoint", &metadata.token_endpoint),
            (
                "pushed_authorization_request_endpoint",
                &metadata.pushed_authorization_request_endpoint,
            ),
        ] {
            if value.is_empty() {
                return Err(Error::AuthServerDiscoveryFailed(format!("missing {name}")));
            }
        }

        Ok(metadata)
    }
}

/// Issuers compare equal modulo a trailing slash.
pub fn same_issuer(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

pub fn normalize_handle(input: &str) -> String {
    let trimmed = input.trim().trim_start_matches('@');
    if is_did(trimmed) {
        trimmed.to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

pub fn is_did(s: &str) -> bool {
    let Some(rest) = s.strip_prefix("did:") else {
        return false;
    };
    match rest.split_once(':') {
        Some((method, id)) => {
            !method.is_empty()
                && method.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
                && !id.is_empty()
                && !id.ends_with(':')
        }
        None => false,
    }
}

fn parse_atproto_did_body(body: &str) -> Option<String> {
    let line = body.lines().find(|l| !l.trim().is_empty())?.trim();
    is_did(line).then(|| line.to_string())
}

/// `did:web:example.com` → `https://example.com/.well-known/did.json`
fn did_web_url(did: &str) -> Result<Url> {
    let rest = did
        .strip_prefix("did:web:")
        .ok_or_else(|| Error::UnsupportedDid(did.to_string()))?;
    let mut parts = rest.split(':');
    let host = parts
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::UnsupportedDid(did.to_string()))?
        .replace("%3A", ":");
    let path: Vec<&str> = parts.collect();
    let url = if path.is_empty() {
        format!("https://{host}/.well-known/did.json")
    } else {
        format!("https://{host}/{}/did.json", path.join("/"))
    };
    Url::parse(&url).map_err(|e| Error::PdsDiscoveryFailed(e.to_string()))
}

fn pds_from_document(doc: &DidDocument) -> Option<String> {
    doc.service
        .iter()
        .filter(|s| s.kind == "AtprotoPersonalDataServer")
        .find_map(|s| {
            debug!(id = %s.id, "found PDS service");
            s.service_endpoint
                .as_str()
                .map(|endpoint| endpoint.trim_end_matches('/').to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_web_urls() {
        assert_eq!(
            did_web_url("did:web:example.com").unwrap().as_str(),
            "https://example.com/.well-known/did.json"
        );
        assert_eq!(
            did_web_url("did:web:example.com:user:alice").unwrap().as_str(),
            "https://example.com/user/alice/did.json"
        );
        assert!(did_web_url("did:plc:abc").is_err());
    }

    #[test]
    fn did_shapes() {
        assert!(is_did("did:plc:ewvi7nxzyoun6zhxrhs64oiz"));
        assert!(is_did("did:web:example.com"));
        assert!(!is_did("alice.example.com"));
        assert!(!is_did("did:plc:"));
        assert!(!is_did("did:PLC:abc"));
    }

    #[test]
    fn handles_are_normalized() {
        assert_eq!(normalize_handle("  @Alice.Example.COM "), "alice.example.com");
        assert_eq!(normalize_handle("did:plc:AbC"), "did:plc:AbC");
    }

    #[test]
    fn well_known_body_takes_first_line() {
        assert_eq!(
            parse_atproto_did_body("\n did:plc:abc123 \nignored").as_deref(),
            Some("did:plc:abc123")
        );
        assert!(parse_atproto_did_body("<html>").is_none());
    }

    #[test]
    fn first_pds_service_wins() {
        let doc: DidDocument = serde_json::from_value(serde_json::json!({
            "id": "did:plc:abc",
            "service": [
                {"id": "#labeler", "type": "AtprotoLabeler", "serviceEndpoint": "https://labeler.example"},
                {"id": "#atproto_pds", "type": "AtprotoPersonalDataServer", "serviceEndpoint": "https://pds.example/"},
                {"id": "#other", "type": "AtprotoPersonalDataServer", "serviceEndpoint": "https://second.example"}
            ]
        }))
        .unwrap();
        assert_eq!(pds_from_document(&doc).as_deref(), Some("https://pds.example"));

        let empty: DidDocument = serde_json::from_value(serde_json::json!({"id": "did:plc:abc"})).unwrap();
        assert!(pds_from_document(&empty).is_none());
    }

    #[tokio::test]
    async fn unsupported_did_methods_fail() {
        let resolver = IdentityResolver::new(
            reqwest::Client::new(),
            ResolverOptions {
                handle_order: vec![],
                ..Default::default()
            },
        );
        assert!(matches!(
            resolver.resolve_pds("did:key:z6Mk").await,
            Err(Error::UnsupportedDid(_))
        ));
        assert!(matches!(
            resolver.resolve_handle("alice.test").await,
            Err(Error::HandleUnresolvable(_))
        ));
    }

    #[tokio::test]
    async fn dns_resolver_only_built_for_txt_lookups() {
        let with_dns = IdentityResolver::new(reqwest::Client::new(), ResolverOptions::default());
        assert!(with_dns.dns.is_some());

        let without = IdentityResolver::new(
            reqwest::Client::new(),
            ResolverOptions {
                handle_order: vec![HandleStep::HttpsWellKnown],
                ..Default::default()
            },
        );
        assert!(without.dns.is_none());
    }
}
