use miette::{IntoDiagnostic, Result, WrapErr};
use server::{AppState, SqliteStore, app::init_db, router};
use std::sync::Arc;
use survey_oauth::client::default_http_client;
use survey_oauth::{OAuthClient, OAuthConfig, ProfileCache, ResolverOptions, Sweeper};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn resolver_options() -> Result<ResolverOptions> {
    let mut options = ResolverOptions::default();
    if let Some(url) = env("PLC_DIRECTORY_URL") {
        options.plc_directory = url
            .parse()
            .into_diagnostic()
            .wrap_err("invalid PLC_DIRECTORY_URL")?;
    }
    if let Some(url) = env("HANDLE_RESOLVER_URL") {
        options.bootstrap_server = url
            .parse()
            .into_diagnostic()
            .wrap_err("invalid HANDLE_RESOLVER_URL")?;
    }
    Ok(options)
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutting down");
    let _ = shutdown.send(true);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let db_url = env("DATABASE_URL").unwrap_or_else(|| "sqlite:survey.db".to_string());
    let bind_addr = env("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string());

    let pool = init_db(&db_url).await.into_diagnostic()?;
    let http = default_http_client().into_diagnostic()?;
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let oauth = match OAuthConfig::from_env().into_diagnostic()? {
        Some(config) => {
            info!(client_id = %config.client_id(), "oauth enabled");
            let client = OAuthClient::builder()
                .config(config)
                .store(store.clone())
                .http_client(http.clone())
                .resolver_options(resolver_options()?)
                .build()
                .into_diagnostic()?;
            Some(Arc::new(client))
        }
        None => {
            warn!("OAUTH_SECRET_JWK_B64 or SERVER_HOST not set, sign-in is disabled");
            None
        }
    };

    tokio::spawn(Sweeper::new(store).run(shutdown_rx));

    let mut profiles = ProfileCache::new(http);
    if let Some(appview) = env("APPVIEW_URL") {
        profiles = profiles.with_appview(appview);
    }

    let state = AppState {
        db: pool,
        oauth,
        profiles: Arc::new(profiles),
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .into_diagnostic()?;
    info!(addr = %bind_addr, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .into_diagnostic()?;
    Ok(())
}
