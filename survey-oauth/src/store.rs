use crate::session::{PendingAuthRequest, UserSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Conflict,
    #[error("storage error: {0}")]
    Backend(String),
}

/// Persistence for pending OAuth requests and user sessions
#[async_trait]
pub trait OAuthStore: Send + Sync {
    /// Persist a pending request. Fails with `Conflict` if the state is taken.
    async fn save_request(&self, request: &PendingAuthRequest) -> Result<(), StoreError>;

    /// Get a pending request by its state
    async fn get_request(&self, state: &str) -> Result<PendingAuthRequest, StoreError>;

    /// Delete a pending request. Deleting a missing request is not an error.
    async fn delete_request(&self, state: &str) -> Result<(), StoreError>;

    /// Persist a new session
    async fn create_session(&self, session: &UserSession) -> Result<(), StoreError>;

    /// Get a session by id
    async fn get_session(&self, id: &str) -> Result<UserSession, StoreError>;

    /// Replace a session's tokens after a refresh
    async fn update_session_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Delete a session. Deleting a missing session is not an error.
    async fn delete_session(&self, id: &str) -> Result<(), StoreError>;

    /// Remove pending requests past their expiry, returning how many went
    async fn sweep_expired_requests(&self) -> Result<u64, StoreError>;

    /// Remove sessions past their expiry, returning how many went
    async fn sweep_expired_sessions(&self) -> Result<u64, StoreError>;
}

/// In-process store, for tests and single-node development.
#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<String, PendingAuthRequest>>,
    sessions: RwLock<HashMap<String, UserSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OAuthStore for MemoryStore {
    async fn save_request(&self, request: &PendingAuthRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.state) {
            return Err(StoreError::Conflict);
        }
        requests.insert(request.state.clone(), request.clone());
        Ok(())
    }

    async fn get_request(&self, state: &str) -> Result<PendingAuthRequest, StoreError> {
        self.requests
            .read()
            .await
            .get(state)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn delete_request(&self, state: &str) -> Result<(), StoreError> {
        self.requests.write().await.remove(state);
        Ok(())
    }

    async fn create_session(&self, session: &UserSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict);
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<UserSession, StoreError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_session_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or(StoreError::NotFound)?;
        session.access_token = access_token.to_string();
        session.refresh_token = refresh_token.map(str::to_owned);
        session.token_expires_at = token_expires_at;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn sweep_expired_requests(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut requests = self.requests.write().await;
        let before = requests.len();
        requests.retain(|_, r| r.expires_at >= now);
        Ok((before - requests.len()) as u64)
    }

    async fn sweep_expired_sessions(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at >= now);
        Ok((before - sessions.len()) as u64)
    }
}
