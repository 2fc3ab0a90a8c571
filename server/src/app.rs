use crate::middleware::{CurrentUser, load_user};
use crate::oauth;
use crate::store::SqliteStore;
use axum::{Router, extract::State, routing::get};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use survey_oauth::{OAuthClient, ProfileCache};
use tower_http::trace::TraceLayer;
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    /// `None` when OAuth is not configured; the sign-in routes are then absent.
    pub oauth: Option<Arc<OAuthClient<SqliteStore>>>,
    pub profiles: Arc<ProfileCache>,
}

async fn handle_root(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> String {
    let Some(session) = user else {
        return "hello world!".to_string();
    };
    let name = match state.profiles.get(&session.did).await {
        Ok(profile) => profile.handle,
        Err(e) => {
            debug!(error = %e, did = %session.did, "profile lookup failed");
            session.did
        }
    };
    format!("hello, {name}!")
}

pub fn router(state: AppState) -> Router {
    let mut app = Router::new().route("/", get(handle_root));

    if let Some(client) = &state.oauth {
        app = app
            .merge(oauth::router::<_, AppState>(client.clone()))
            .layer(axum::middleware::from_fn_with_state(
                client.store().clone(),
                load_user::<SqliteStore>,
            ));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Open (creating if needed) the database and apply the schema.
pub async fn init_db(db_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let migration_sql = include_str!("../migrations/001_oauth_schema.sql");
    sqlx::raw_sql(migration_sql).execute(pool).await?;
    Ok(())
}

/// Single-connection in-memory database; every connection would otherwise get
/// its own empty database.
pub async fn connect_memory() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
}
