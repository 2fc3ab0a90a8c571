//! Survey service HTTP server: OAuth sign-in routes, session middleware and
//! SQLite persistence for the `survey-oauth` client.

pub mod app;
pub mod middleware;
pub mod oauth;
pub mod store;

pub use app::{AppState, router};
pub use store::SqliteStore;
