use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_APPVIEW: &str = "https://public.api.bsky.app";
pub const PROFILE_TTL: Duration = Duration::from_secs(5 * 60);

/// Public profile fields the service displays
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub did: String,
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "avatar")]
    pub avatar_url: Option<String>,
}

struct CachedProfile {
    profile: Profile,
    fetched_at: Instant,
}

/// Best-effort did → profile cache backed by the public app view
pub struct ProfileCache {
    http: reqwest::Client,
    appview: String,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedProfile>>,
}

impl ProfileCache {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            appview: DEFAULT_APPVIEW.to_string(),
            ttl: PROFILE_TTL,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_appview(mut self, appview: impl Into<String>) -> Self {
        self.appview = appview.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn get(&self, did: &str) -> Result<Profile> {
        if let Some(entry) = self.entries.read().await.get(did) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.profile.clone());
            }
        }

        let profile = self.fetch(did).await?;
        self.entries.write().await.insert(
            did.to_string(),
            CachedProfile {
                profile: profile.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(profile)
    }

    async fn fetch(&self, did: &str) -> Result<Profile> {
        debug!(did, "fetching profile");
        let response = self
            .http
            .get(format!("{}/xrpc/app.bsky.actor.getProfile", self.appview))
            .query(&[("actor", did)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http(format!("getProfile for {did} returned {status}")));
        }
        Ok(response.json().await?)
    }

    /// Drop entries past their TTL
    pub async fn evict_stale(&self) {
        let ttl = self.ttl;
        self.entries
            .write()
            .await
            .retain(|_, entry| entry.fetched_at.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::Query, routing::get};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve_profiles(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/xrpc/app.bsky.actor.getProfile",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({
                        "did": q["actor"],
                        "handle": "alice.example.com",
                        "displayName": "Alice",
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn repeated_lookups_hit_the_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let cache = ProfileCache::new(reqwest::Client::new())
            .with_appview(serve_profiles(hits.clone()).await);

        let first = cache.get("did:plc:alice").await.unwrap();
        let second = cache.get("did:plc:alice").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.handle, "alice.example.com");
        assert_eq!(first.display_name.as_deref(), Some("Alice"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_entries_are_refetched() {
        let hits = Arc::new(AtomicUsize::new(0));
        let cache = ProfileCache::new(reqwest::Client::new())
            .with_appview(serve_profiles(hits.clone()).await)
            .with_ttl(Duration::ZERO);

        cache.get("did:plc:alice").await.unwrap();
        cache.get("did:plc:alice").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        cache.evict_stale().await;
        assert!(cache.entries.read().await.is_empty());
    }
}
