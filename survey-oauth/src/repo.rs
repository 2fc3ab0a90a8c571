//! Record CRUD against a user's PDS with DPoP-bound tokens

use crate::error::{Error, Result};
use crate::jwt::create_dpop_proof;
use crate::random::Tid;
use crate::session::UserSession;
use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use jose_jwk::Jwk;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Strong reference to a written record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

/// A record returned by `listRecords`
#[derive(Debug, Clone)]
pub struct ListedRecord<T> {
    pub uri: String,
    pub cid: String,
    /// Trailing path segment of `uri`
    pub rkey: String,
    pub value: T,
}

#[derive(Debug, Clone)]
pub struct RecordPage<T> {
    pub records: Vec<ListedRecord<T>>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
struct GetRecordOutput<T> {
    value: T,
}

#[derive(Deserialize)]
struct ListRecordsOutput<T> {
    records: Vec<RawListedRecord<T>>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct RawListedRecord<T> {
    uri: String,
    #[serde(default)]
    cid: String,
    value: T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteRecordInput<'a, R> {
    repo: &'a str,
    collection: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rkey: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<R>,
    validate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    swap_record: Option<&'a str>,
}

/// Authenticated client for one session's repository.
///
/// Holds a snapshot of the session's tokens and never refreshes them; callers
/// obtain a new client after a refresh.
#[derive(Clone)]
pub struct RepoClient {
    http: reqwest::Client,
    did: String,
    pds_url: String,
    access_token: String,
    token_expires_at: Option<DateTime<Utc>>,
    dpop_key: Jwk,
}

impl RepoClient {
    pub fn new(http: reqwest::Client, session: &UserSession) -> Self {
        Self {
            http,
            did: session.did.clone(),
            pds_url: session.pds_url.trim_end_matches('/').to_string(),
            access_token: session.access_token.clone(),
            token_expires_at: session.token_expires_at,
            dpop_key: session.dpop_key.clone(),
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// Create a record. A TID is generated when no `rkey` is given.
    pub async fn create_record<R: Serialize>(
        &self,
        collection: &str,
        rkey: Option<&str>,
        record: &R,
    ) -> Result<StrongRef> {
        let generated;
        let rkey = match rkey {
            Some(rkey) => rkey,
            None => {
                generated = Tid::now().to_string();
                generated.as_str()
            }
        };
        let input = WriteRecordInput {
            repo: &self.did,
            collection,
            rkey: Some(rkey),
            record: Some(record),
            validate: false,
            swap_record: None,
        };
        let body = self.procedure("com.atproto.repo.createRecord", &input).await?;
        parse_body(&body)
    }

    pub async fn get_record<T: DeserializeOwned>(&self, collection: &str, rkey: &str) -> Result<T> {
        let body = self
            .query(
                "com.atproto.repo.getRecord",
                &[
                    ("repo", self.did.as_str()),
                    ("collection", collection),
                    ("rkey", rkey),
                ],
            )
            .await?;
        let output: GetRecordOutput<T> = parse_body(&body)?;
        Ok(output.value)
    }

    pub async fn list_records<T: DeserializeOwned>(
        &self,
        collection: &str,
        limit: Option<u32>,
        cursor: Option<&str>,
    ) -> Result<RecordPage<T>> {
        let limit = limit.map(|l| l.to_string());
        let mut params = vec![("repo", self.did.as_str()), ("collection", collection)];
        if let Some(limit) = limit.as_deref() {
            params.push(("limit", limit));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor));
        }

        let body = self.query("com.atproto.repo.listRecords", &params).await?;
        let output: ListRecordsOutput<T> = parse_body(&body)?;
        Ok(RecordPage {
            records: output
                .records
                .into_iter()
                .map(|r| ListedRecord {
                    rkey: rkey_from_uri(&r.uri).to_string(),
                    uri: r.uri,
                    cid: r.cid,
                    value: r.value,
                })
                .collect(),
            cursor: output.cursor,
        })
    }

    pub async fn put_record<R: Serialize>(
        &self,
        collection: &str,
        rkey: &str,
        record: &R,
        swap_record: Option<&str>,
    ) -> Result<StrongRef> {
        let input = WriteRecordInput {
            repo: &self.did,
            collection,
            rkey: Some(rkey),
            record: Some(record),
            validate: false,
            swap_record,
        };
        let body = self.procedure("com.atproto.repo.putRecord", &input).await?;
        parse_body(&body)
    }

    pub async fn delete_record(
        &self,
        collection: &str,
        rkey: &str,
        swap_record: Option<&str>,
    ) -> Result<()> {
        let input: WriteRecordInput<'_, Value> = WriteRecordInput {
            repo: &self.did,
            collection,
            rkey: Some(rkey),
            record: None,
            validate: false,
            swap_record,
        };
        self.procedure("com.atproto.repo.deleteRecord", &input).await?;
        Ok(())
    }

    async fn procedure<B: Serialize>(&self, nsid: &str, input: &B) -> Result<String> {
        let body = serde_json::to_vec(input)
            .map_err(|e| Error::Internal(format!("failed to encode {nsid} input: {e}")))?;
        let url = format!("{}/xrpc/{}", self.pds_url, nsid);
        self.send(Method::POST, &url, Some(body)).await
    }

    async fn query(&self, nsid: &str, params: &[(&str, &str)]) -> Result<String> {
        let mut url = url::Url::parse(&format!("{}/xrpc/{}", self.pds_url, nsid))
            .map_err(|e| Error::Internal(format!("bad PDS url {}: {e}", self.pds_url)))?;
        url.query_pairs_mut().extend_pairs(params);
        self.send(Method::GET, url.as_str(), None).await
    }

    async fn send(&self, method: Method, url: &str, body: Option<Vec<u8>>) -> Result<String> {
        if let Some(expires_at) = self.token_expires_at {
            if Utc::now() >= expires_at {
                return Err(Error::TokenExpired);
            }
        }

        match self.send_once(&method, url, body.clone(), None).await {
            Err(Error::DpopNonceRequired(nonce)) => {
                debug!(url, "retrying with PDS dpop nonce");
                self.send_once(&method, url, body, Some(&nonce))
                    .await
                    .map_err(|e| match e {
                        Error::DpopNonceRequired(_) => Error::PdsRejected {
                            status: StatusCode::UNAUTHORIZED.as_u16(),
                            body: "use_dpop_nonce".to_string(),
                        },
                        e => e,
                    })
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<Vec<u8>>,
        nonce: Option<&str>,
    ) -> Result<String> {
        let proof = create_dpop_proof(
            &self.dpop_key,
            method.as_str(),
            url,
            nonce,
            Some(&self.access_token),
        )?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .header(http::header::AUTHORIZATION, format!("DPoP {}", self.access_token))
            .header("DPoP", proof);
        if let Some(body) = body {
            request = request
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            if let Some(nonce) = response
                .headers()
                .get("dpop-nonce")
                .and_then(|v| v.to_str().ok())
            {
                return Err(Error::DpopNonceRequired(nonce.to_string()));
            }
        }

        let text = response.text().await?;
        if !status.is_success() {
            return Err(Error::PdsRejected {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body)
        .map_err(|e| Error::Internal(format!("unexpected PDS response: {e}")))
}

/// `at://did/collection/rkey` → `rkey`
pub fn rkey_from_uri(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}
