use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use survey_oauth::jwk::{jwk_to_string, parse_jwk};
use survey_oauth::{OAuthStore, PendingAuthRequest, StoreError, UserSession};

/// Runs a sqlx call, and runs it a second time if the first attempt hit a
/// transient error (busy/locked database, pool exhaustion, I/O).
macro_rules! retry_transient {
    ($op:literal, $call:expr) => {
        match $call.await {
            Err(e) if is_transient(&e) => {
                tracing::warn!(error = %e, op = $op, "transient database error, retrying");
                $call.await
            }
            other => other,
        }
    };
}

/// [`OAuthStore`] over the service's SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    async fn insert_request(&self, request: &PendingAuthRequest) -> Result<(), sqlx::Error> {
        let dpop_key = jwk_to_string(&request.dpop_key)
            .map_err(|e| sqlx::Error::Encode(e.to_string().into()))?;
        sqlx::query(
            r#"
            INSERT INTO oauth_requests
            (state, issuer, pkce_verifier, dpop_private_key, destination, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.state)
        .bind(&request.issuer)
        .bind(&request.pkce_verifier)
        .bind(dpop_key)
        .bind(&request.destination)
        .bind(timestamp(request.created_at))
        .bind(timestamp(request.expires_at))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn select_request(&self, state: &str) -> Result<Option<SqliteRow>, sqlx::Error> {
        sqlx::query(
            r#"
            SELECT state, issuer, pkce_verifier, dpop_private_key, destination, created_at, expires_at
            FROM oauth_requests
            WHERE state = ?
            "#,
        )
        .bind(state)
        .fetch_optional(&self.db)
        .await
    }

    async fn insert_session(&self, session: &UserSession) -> Result<(), sqlx::Error> {
        let dpop_key = jwk_to_string(&session.dpop_key)
            .map_err(|e| sqlx::Error::Encode(e.to_string().into()))?;
        sqlx::query(
            r#"
            INSERT INTO oauth_sessions
            (id, did, access_token, refresh_token, dpop_key, pds_url, token_expires_at, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.did)
        .bind(&session.access_token)
        .bind(session.refresh_token.as_deref())
        .bind(dpop_key)
        .bind(&session.pds_url)
        .bind(session.token_expires_at.map(timestamp))
        .bind(timestamp(session.created_at))
        .bind(timestamp(session.expires_at))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn select_session(&self, id: &str) -> Result<Option<SqliteRow>, sqlx::Error> {
        sqlx::query(
            r#"
            SELECT id, did, access_token, refresh_token, dpop_key, pds_url, token_expires_at, created_at, expires_at
            FROM oauth_sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
    }

    async fn write_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE oauth_sessions
            SET access_token = ?, refresh_token = ?, token_expires_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(token_expires_at.map(timestamp))
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_where(&self, sql: &'static str, key: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(sql).bind(key).execute(&self.db).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OAuthStore for SqliteStore {
    async fn save_request(&self, request: &PendingAuthRequest) -> Result<(), StoreError> {
        retry_transient!("save_request", self.insert_request(request)).map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            e => backend(e),
        })
    }

    async fn get_request(&self, state: &str) -> Result<PendingAuthRequest, StoreError> {
        let row = retry_transient!("get_request", self.select_request(state))
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        request_from_row(&row)
    }

    async fn delete_request(&self, state: &str) -> Result<(), StoreError> {
        retry_transient!(
            "delete_request",
            self.delete_where("DELETE FROM oauth_requests WHERE state = ?", state)
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn create_session(&self, session: &UserSession) -> Result<(), StoreError> {
        retry_transient!("create_session", self.insert_session(session)).map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            e => backend(e),
        })
    }

    async fn get_session(&self, id: &str) -> Result<UserSession, StoreError> {
        let row = retry_transient!("get_session", self.select_session(id))
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        session_from_row(&row)
    }

    async fn update_session_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let updated = retry_transient!(
            "update_session_tokens",
            self.write_tokens(id, access_token, refresh_token, token_expires_at)
        )
        .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        retry_transient!(
            "delete_session",
            self.delete_where("DELETE FROM oauth_sessions WHERE id = ?", id)
        )
        .map_err(backend)?;
        Ok(())
    }

    async fn sweep_expired_requests(&self) -> Result<u64, StoreError> {
        let now = timestamp(Utc::now());
        retry_transient!(
            "sweep_expired_requests",
            self.delete_where("DELETE FROM oauth_requests WHERE expires_at < ?", &now)
        )
        .map_err(backend)
    }

    async fn sweep_expired_sessions(&self) -> Result<u64, StoreError> {
        let now = timestamp(Utc::now());
        retry_transient!(
            "sweep_expired_sessions",
            self.delete_where("DELETE FROM oauth_sessions WHERE expires_at < ?", &now)
        )
        .map_err(backend)
    }
}

/// Fixed-width UTC timestamps so that text comparison orders them correctly.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {raw:?}: {e}")))
}

fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("database is locked") || message.contains("database is busy")
        }
        _ => false,
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn column<T>(row: &SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(backend)
}

fn required(row: &SqliteRow, name: &str) -> Result<String, StoreError> {
    column::<Option<String>>(row, name)?
        .ok_or_else(|| StoreError::Backend(format!("session column {name} is empty")))
}

fn request_from_row(row: &SqliteRow) -> Result<PendingAuthRequest, StoreError> {
    let dpop_key: String = column(row, "dpop_private_key")?;
    Ok(PendingAuthRequest {
        state: column(row, "state")?,
        issuer: column(row, "issuer")?,
        pkce_verifier: column(row, "pkce_verifier")?,
        dpop_key: parse_jwk(&dpop_key).map_err(|e| StoreError::Backend(e.to_string()))?,
        destination: column(row, "destination")?,
        created_at: parse_timestamp(&column::<String>(row, "created_at")?)?,
        expires_at: parse_timestamp(&column::<String>(row, "expires_at")?)?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<UserSession, StoreError> {
    let dpop_key = required(row, "dpop_key")?;
    let token_expires_at = column::<Option<String>>(row, "token_expires_at")?
        .map(|raw| parse_timestamp(&raw))
        .transpose()?;
    Ok(UserSession {
        id: column(row, "id")?,
        did: column(row, "did")?,
        access_token: required(row, "access_token")?,
        refresh_token: column(row, "refresh_token")?,
        dpop_key: parse_jwk(&dpop_key).map_err(|e| StoreError::Backend(e.to_string()))?,
        pds_url: required(row, "pds_url")?,
        token_expires_at,
        created_at: parse_timestamp(&column::<String>(row, "created_at")?)?,
        expires_at: parse_timestamp(&column::<String>(row, "expires_at")?)?,
    })
}
