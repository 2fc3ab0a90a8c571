//! # survey-oauth
//!
//! ATProto OAuth client for the survey service.
//!
//! The crate resolves a user's identity to their PDS and authorization server,
//! runs the pushed-authorization / PKCE / DPoP login flow with
//! `private_key_jwt` client authentication, keeps sessions and their tokens in
//! an [`OAuthStore`], and writes records to the user's repository.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use survey_oauth::{MemoryStore, OAuthClient, OAuthConfig};
//!
//! # async fn example() -> survey_oauth::Result<()> {
//! let config = OAuthConfig::from_env()?.expect("oauth configured");
//! let client = OAuthClient::builder()
//!     .config(config)
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()?;
//!
//! let redirect = client.start_login("alice.bsky.social", "/").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod jwk;
pub mod jwt;
pub mod profile;
pub mod random;
pub mod repo;
pub mod resolver;
pub mod session;
pub mod store;
pub mod sweeper;

pub use client::{CallbackParams, CompletedLogin, OAuthClient, OAuthClientBuilder};
pub use config::{ClientMetadata, OAuthConfig};
pub use error::{Error, Result};
pub use profile::{Profile, ProfileCache};
pub use random::Tid;
pub use repo::{ListedRecord, RecordPage, RepoClient, StrongRef};
pub use resolver::{HandleStep, IdentityResolver, ResolverOptions};
pub use session::{PendingAuthRequest, TokenSet, TokenState, UserSession};
pub use store::{MemoryStore, OAuthStore, StoreError};
pub use sweeper::Sweeper;
