use std::future::Future;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{PgPool, Row, postgres::PgExecutor};
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::refresh_token::{ConsumeOutcome, NewRefreshToken, RefreshTokenRepo},
    domain::entities::refresh_token::{Clock, ConsumeDecision, ConsumeKind, RefreshToken, TokenPolicy},
};

/// Name of the unique constraint on `token_hash` (see migrations/).
const TOKEN_HASH_CONSTRAINT: &str = "auth_refresh_token_token_hash_key";

/// Postgres SQLSTATEs for transactions aborted by lock conflicts.
const DEADLOCK_DETECTED: &str = "40P01";
const SERIALIZATION_FAILURE: &str = "40001";

/// Attempts for a statement that Postgres aborted as a lock conflict.
const MAX_LOCK_ATTEMPTS: usize = 5;

const SELECT_COLS: &str = r#"
    id, subject, family_id, token_hash, created_at, expires_at,
    consumed_at, grace_expires_at, replaced_by, revoked_at
"#;

fn row_to_token(row: sqlx::postgres::PgRow) -> RefreshToken {
    RefreshToken {
        id: row.get("id"),
        subject: row.get("subject"),
        family_id: row.get("family_id"),
        token_hash: row.get("token_hash"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        consumed_at: row.get("consumed_at"),
        grace_expires_at: row.get("grace_expires_at"),
        replaced_by: row.get("replaced_by"),
        revoked_at: row.get("revoked_at"),
    }
}

fn map_insert_error(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
        && db_err.constraint() == Some(TOKEN_HASH_CONSTRAINT)
    {
        return AppError::TokenHashCollision;
    }
    AppError::from(err)
}

fn is_lock_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some(DEADLOCK_DETECTED | SERIALIZATION_FAILURE)
        ),
        _ => false,
    }
}

/// Run `attempt` again while Postgres aborts it as a deadlock or serialization
/// failure. Each attempt must be a complete transaction.
async fn retry_on_lock_conflict<T, F, Fut>(operation: &'static str, mut attempt: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut tries = 1;
    loop {
        match attempt().await {
            Err(err) if is_lock_conflict(&err) && tries < MAX_LOCK_ATTEMPTS => {
                tracing::warn!(operation, attempt = tries, error = %err, "Lock conflict, retrying");
                tries += 1;
            }
            result => return result.map_err(AppError::from),
        }
    }
}

/// Shared by the explicit revoker and the reuse path inside `consume`.
async fn revoke_family_rows<'e, E>(
    executor: E,
    family_id: Uuid,
    now: NaiveDateTime,
) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE auth_refresh_token SET revoked_at = $2 WHERE family_id = $1 AND revoked_at IS NULL",
    )
    .bind(family_id)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// One consume transaction. Dropping it before commit rolls everything back.
async fn consume_locked(
    pool: &PgPool,
    token_hash: &str,
    clock: Clock,
    policy: &TokenPolicy,
) -> Result<ConsumeOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    // Concurrent consumers of the same hash queue here and re-read the
    // committed row once the holder finishes.
    let row = sqlx::query(&format!(
        "SELECT {} FROM auth_refresh_token WHERE token_hash = $1 FOR UPDATE",
        SELECT_COLS
    ))
    .bind(token_hash)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(ConsumeOutcome::Unknown);
    };
    let mut token = row_to_token(row);
    let now = clock.now();

    let outcome = match token.decide(now, policy) {
        Err(reason) => ConsumeOutcome::Rejected(reason),
        Ok(ConsumeDecision::FirstUse {
            consumed_at,
            grace_expires_at,
        }) => {
            sqlx::query(
                r#"
                UPDATE auth_refresh_token
                SET consumed_at = $2, grace_expires_at = $3
                WHERE id = $1 AND consumed_at IS NULL
                "#,
            )
            .bind(token.id)
            .bind(consumed_at)
            .bind(grace_expires_at)
            .execute(&mut *tx)
            .await?;

            token.mark_consumed(consumed_at, grace_expires_at);
            ConsumeOutcome::Accepted {
                token,
                kind: ConsumeKind::First,
            }
        }
        Ok(ConsumeDecision::WithinGrace) => ConsumeOutcome::Accepted {
            token,
            kind: ConsumeKind::Grace,
        },
        // Sibling rows may be held by another stale replay of this family;
        // Postgres aborts one side of that cycle and the caller retries.
        Ok(ConsumeDecision::Reuse) => {
            let revoked_rows = revoke_family_rows(&mut *tx, token.family_id, now).await?;
            ConsumeOutcome::Reused {
                token,
                revoked_rows,
            }
        }
    };

    tx.commit().await?;
    Ok(outcome)
}

#[async_trait]
impl RefreshTokenRepo for PostgresPersistence {
    async fn insert(&self, token: &NewRefreshToken) -> AppResult<RefreshToken> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO auth_refresh_token (id, subject, family_id, token_hash, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            SELECT_COLS
        ))
        .bind(token.id)
        .bind(&token.subject)
        .bind(token.family_id)
        .bind(&token.token_hash)
        .bind(token.created_at)
        .bind(token.expires_at)
        .fetch_one(self.pool())
        .await
        .map_err(map_insert_error)?;

        Ok(row_to_token(row))
    }

    async fn consume(
        &self,
        token_hash: &str,
        clock: Clock,
        policy: &TokenPolicy,
    ) -> AppResult<ConsumeOutcome> {
        let pool = self.pool();
        let policy = *policy;
        retry_on_lock_conflict("consume", move || async move {
            consume_locked(pool, token_hash, clock, &policy).await
        })
        .await
    }

    async fn revoke_family(&self, family_id: Uuid, now: NaiveDateTime) -> AppResult<u64> {
        let pool = self.pool();
        retry_on_lock_conflict("revoke_family", move || async move {
            revoke_family_rows(pool, family_id, now).await
        })
        .await
    }

    async fn revoke_subject(&self, subject: &str, now: NaiveDateTime) -> AppResult<u64> {
        let pool = self.pool();
        retry_on_lock_conflict("revoke_subject", move || async move {
            let result = sqlx::query(
                "UPDATE auth_refresh_token SET revoked_at = $2 WHERE subject = $1 AND revoked_at IS NULL",
            )
            .bind(subject)
            .bind(now)
            .execute(pool)
            .await?;

            Ok::<_, sqlx::Error>(result.rows_affected())
        })
        .await
    }

    async fn link_replacement(&self, id: Uuid, replaced_by: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE auth_refresh_token SET replaced_by = $2 WHERE id = $1 AND replaced_by IS NULL",
        )
        .bind(id)
        .bind(replaced_by)
        .execute(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_by_hash(&self, token_hash: &str) -> AppResult<Option<RefreshToken>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM auth_refresh_token WHERE token_hash = $1",
            SELECT_COLS
        ))
        .bind(token_hash)
        .fetch_optional(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(row.map(row_to_token))
    }

    async fn list_by_family(&self, family_id: Uuid) -> AppResult<Vec<RefreshToken>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM auth_refresh_token WHERE family_id = $1 ORDER BY created_at, id",
            SELECT_COLS
        ))
        .bind(family_id)
        .fetch_all(self.pool())
        .await
        .map_err(AppError::from)?;

        Ok(rows.into_iter().map(row_to_token).collect())
    }
}
