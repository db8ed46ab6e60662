use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::NaiveDateTime;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::instrument;
use uuid::Uuid;

use crate::app_error::{AppError, AppResult};
use crate::domain::entities::refresh_token::{
    Clock, ConsumeKind, RefreshToken, RefreshTokenError, RefreshTokenStatus, TokenPolicy,
};

/// Attempts the issuer makes before giving up on hash collisions.
const MAX_ISSUE_ATTEMPTS: usize = 3;

/// Random bytes behind every refresh token secret (256 bits).
const TOKEN_BYTES: usize = 32;

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait RefreshTokenRepo: Send + Sync {
    /// Insert a new row. A duplicate `token_hash` must surface as
    /// `AppError::TokenHashCollision`.
    async fn insert(&self, token: &NewRefreshToken) -> AppResult<RefreshToken>;

    /// Lock the row matching `token_hash`, evaluate it with
    /// [`RefreshToken::decide`] and apply the decision, all in one unit of work.
    /// On reuse the whole family is revoked inside that same unit of work.
    ///
    /// `clock` must be read only once the lock is held.
    async fn consume(
        &self,
        token_hash: &str,
        clock: Clock,
        policy: &TokenPolicy,
    ) -> AppResult<ConsumeOutcome>;

    /// Set `revoked_at = now` on every unrevoked row of the family.
    /// Returns the number of rows changed.
    async fn revoke_family(&self, family_id: Uuid, now: NaiveDateTime) -> AppResult<u64>;

    /// Set `revoked_at = now` on every unrevoked row of the subject.
    async fn revoke_subject(&self, subject: &str, now: NaiveDateTime) -> AppResult<u64>;

    /// Point `id` at its successor. Returns false when a successor was
    /// already linked (or `id` does not exist).
    async fn link_replacement(&self, id: Uuid, replaced_by: Uuid) -> AppResult<bool>;

    /// Plain read, no lock.
    async fn get_by_hash(&self, token_hash: &str) -> AppResult<Option<RefreshToken>>;

    async fn list_by_family(&self, family_id: Uuid) -> AppResult<Vec<RefreshToken>>;
}

// ============================================================================
// Profile Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub subject: String,
    pub family_id: Uuid,
    pub token_hash: String,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

/// Result of a locked consume as seen by the store.
#[derive(Debug, Clone)]
pub enum ConsumeOutcome {
    /// No row has this hash.
    Unknown,
    /// Row exists but is revoked or expired. Nothing changed.
    Rejected(RefreshTokenError),
    /// First consumption or grace re-validation. `token` reflects the row after the update.
    Accepted { token: RefreshToken, kind: ConsumeKind },
    /// Presented after the grace window. The family is revoked.
    Reused { token: RefreshToken, revoked_rows: u64 },
}

/// A newly minted token. `token` is the only copy of the plaintext.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub id: Uuid,
    pub family_id: Uuid,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedToken {
    pub token_id: Uuid,
    pub subject: String,
    pub family_id: Uuid,
    pub kind: ConsumeKind,
}

#[derive(Debug, Clone)]
pub struct RotatedToken {
    pub issued: IssuedToken,
    pub subject: String,
    pub previous_id: Uuid,
}

// ============================================================================
// Use Cases
// ============================================================================

#[derive(Clone)]
pub struct RefreshTokenUseCases {
    repo: Arc<dyn RefreshTokenRepo>,
    policy: TokenPolicy,
}

impl RefreshTokenUseCases {
    pub fn new(repo: Arc<dyn RefreshTokenRepo>, policy: TokenPolicy) -> Self {
        Self { repo, policy }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    // ========================================================================
    // Issuer
    // ========================================================================

    /// Mint a token for `subject`. Without `family_id` this starts a new family
    /// (a fresh login); with it, the token continues that rotation chain.
    pub async fn issue_token(
        &self,
        subject: &str,
        family_id: Option<Uuid>,
    ) -> AppResult<IssuedToken> {
        self.issue_token_at(subject, family_id, now()).await
    }

    #[instrument(skip(self, subject))]
    pub async fn issue_token_at(
        &self,
        subject: &str,
        family_id: Option<Uuid>,
        now: NaiveDateTime,
    ) -> AppResult<IssuedToken> {
        if subject.trim().is_empty() {
            return Err(AppError::InvalidInput("Subject must not be empty".into()));
        }

        let family_id = family_id.unwrap_or_else(Uuid::new_v4);

        for attempt in 1..=MAX_ISSUE_ATTEMPTS {
            let plaintext = generate_refresh_token();
            let new_token = NewRefreshToken {
                id: Uuid::new_v4(),
                subject: subject.to_string(),
                family_id,
                token_hash: hash_refresh_token(&plaintext),
                created_at: now,
                expires_at: self.policy.expires_at(now),
            };

            match self.repo.insert(&new_token).await {
                Ok(row) => {
                    tracing::info!(
                        family_id = %row.family_id,
                        token_id = %row.id,
                        "Issued refresh token"
                    );
                    return Ok(IssuedToken {
                        token: plaintext,
                        id: row.id,
                        family_id: row.family_id,
                        expires_at: row.expires_at,
                    });
                }
                Err(AppError::TokenHashCollision) => {
                    tracing::warn!(attempt, "Refresh token hash collision, regenerating");
                }
                Err(err) => return Err(err),
            }
        }

        Err(AppError::TokenHashCollision)
    }

    // ========================================================================
    // Consumer
    // ========================================================================

    /// Validate a presented token and mark it consumed.
    ///
    /// A stale replay outside the grace window revokes the token's family
    /// before `ReuseDetected` is returned.
    pub async fn consume_token(&self, plaintext: &str) -> AppResult<ConsumedToken> {
        self.consume_with(plaintext, Clock::System).await
    }

    /// Same as [`Self::consume_token`] with `now` pinned to a fixed instant.
    pub async fn consume_token_at(
        &self,
        plaintext: &str,
        now: NaiveDateTime,
    ) -> AppResult<ConsumedToken> {
        self.consume_with(plaintext, Clock::Fixed(now)).await
    }

    #[instrument(skip(self, plaintext))]
    async fn consume_with(&self, plaintext: &str, clock: Clock) -> AppResult<ConsumedToken> {
        let token_hash = hash_refresh_token(plaintext);

        match self.repo.consume(&token_hash, clock, &self.policy).await? {
            ConsumeOutcome::Unknown => {
                tracing::debug!("Unknown refresh token presented");
                Err(RefreshTokenError::InvalidToken.into())
            }
            ConsumeOutcome::Rejected(reason) => {
                tracing::info!(reason = reason.as_str(), "Refresh token refused");
                Err(reason.into())
            }
            ConsumeOutcome::Accepted { token, kind } => {
                tracing::debug!(
                    family_id = %token.family_id,
                    token_id = %token.id,
                    kind = kind.as_str(),
                    "Refresh token consumed"
                );
                Ok(ConsumedToken {
                    token_id: token.id,
                    subject: token.subject,
                    family_id: token.family_id,
                    kind,
                })
            }
            ConsumeOutcome::Reused {
                token,
                revoked_rows,
            } => {
                tracing::warn!(
                    event_type = "REFRESH_TOKEN_REUSE",
                    family_id = %token.family_id,
                    token_id = %token.id,
                    revoked_rows,
                    "Refresh token reuse detected - revoked token family"
                );
                Err(RefreshTokenError::ReuseDetected.into())
            }
        }
    }

    // ========================================================================
    // Family Revoker
    // ========================================================================

    /// Revoke every token of the family. Safe to call repeatedly.
    pub async fn revoke_family(&self, family_id: Uuid) -> AppResult<u64> {
        self.revoke_family_at(family_id, now()).await
    }

    #[instrument(skip(self))]
    pub async fn revoke_family_at(&self, family_id: Uuid, now: NaiveDateTime) -> AppResult<u64> {
        let revoked_rows = self.repo.revoke_family(family_id, now).await?;
        tracing::info!(%family_id, revoked_rows, "Revoked token family");
        Ok(revoked_rows)
    }

    /// Revoke every token the subject holds, across all families.
    #[instrument(skip(self, subject))]
    pub async fn revoke_subject(&self, subject: &str) -> AppResult<u64> {
        let revoked_rows = self.repo.revoke_subject(subject, now()).await?;
        tracing::info!(revoked_rows, "Revoked all refresh tokens of subject");
        Ok(revoked_rows)
    }

    // ========================================================================
    // Rotation (refresh endpoint)
    // ========================================================================

    /// Consume `plaintext`, mint its successor in the same family and link them.
    pub async fn rotate(&self, plaintext: &str) -> AppResult<RotatedToken> {
        self.rotate_with(plaintext, Clock::System).await
    }

    pub async fn rotate_at(&self, plaintext: &str, now: NaiveDateTime) -> AppResult<RotatedToken> {
        self.rotate_with(plaintext, Clock::Fixed(now)).await
    }

    async fn rotate_with(&self, plaintext: &str, clock: Clock) -> AppResult<RotatedToken> {
        let consumed = self.consume_with(plaintext, clock).await?;
        let issued = self
            .issue_token_at(&consumed.subject, Some(consumed.family_id), clock.now())
            .await?;

        if !self.link_replacement(consumed.token_id, issued.id).await? {
            tracing::debug!(
                token_id = %consumed.token_id,
                successor_id = %issued.id,
                "Predecessor already linked to an earlier successor"
            );
        }

        Ok(RotatedToken {
            issued,
            subject: consumed.subject,
            previous_id: consumed.token_id,
        })
    }

    /// Record `replaced_by` on the predecessor. The first successor wins.
    pub async fn link_replacement(&self, id: Uuid, replaced_by: Uuid) -> AppResult<bool> {
        self.repo.link_replacement(id, replaced_by).await
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Read-only lookup of a presented token. Does not consume it.
    pub async fn find_by_token(&self, plaintext: &str) -> AppResult<Option<RefreshToken>> {
        self.repo.get_by_hash(&hash_refresh_token(plaintext)).await
    }

    /// Every row of a family, oldest first.
    pub async fn family_lineage(&self, family_id: Uuid) -> AppResult<Vec<RefreshToken>> {
        self.repo.list_by_family(family_id).await
    }

    // ========================================================================
    // Logout
    // ========================================================================

    /// Revoke the family of a presented token ("log out this session").
    pub async fn logout(&self, plaintext: &str) -> AppResult<u64> {
        let token = self.authenticate_presented(plaintext, now()).await?;
        self.revoke_family(token.family_id).await
    }

    /// Revoke every token of the presented token's subject ("log out everywhere").
    pub async fn logout_everywhere(&self, plaintext: &str) -> AppResult<u64> {
        let token = self.authenticate_presented(plaintext, now()).await?;
        self.revoke_subject(&token.subject).await
    }

    // ========================================================================
    // Private Helpers
    // ========================================================================

    async fn authenticate_presented(
        &self,
        plaintext: &str,
        now: NaiveDateTime,
    ) -> AppResult<RefreshToken> {
        let token = self
            .find_by_token(plaintext)
            .await?
            .ok_or(RefreshTokenError::InvalidToken)?;

        match token.status(now) {
            RefreshTokenStatus::Revoked => Err(RefreshTokenError::Revoked.into()),
            RefreshTokenStatus::Expired => Err(RefreshTokenError::Expired.into()),
            status => {
                tracing::debug!(
                    family_id = %token.family_id,
                    token_id = %token.id,
                    status = status.as_str(),
                    "Logout token accepted"
                );
                Ok(token)
            }
        }
    }
}

fn now() -> NaiveDateTime {
    Clock::System.now()
}

// ============================================================================
// Token Generation
// ============================================================================

/// Generate a refresh token secret: 32 OS-random bytes, base64url without padding.
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash a refresh token using SHA-256, returning hex-encoded hash.
pub fn hash_refresh_token(plaintext: &str) -> String {
    let hash = Sha256::digest(plaintext.as_bytes());
    hex::encode(hash)
}
