use chrono::{Duration, NaiveDateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Why a presented refresh token was refused.
///
/// All four variants are terminal. Callers must not retry; they force a new login.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTokenError {
    #[error("Refresh token not recognized")]
    InvalidToken,

    #[error("Refresh token expired")]
    Expired,

    #[error("Refresh token revoked")]
    Revoked,

    /// Presented again after its grace window closed. The whole family has
    /// already been revoked by the time the caller sees this.
    #[error("Refresh token reused after rotation")]
    ReuseDetected,
}

impl RefreshTokenError {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTokenError::InvalidToken => "invalid_token",
            RefreshTokenError::Expired => "expired",
            RefreshTokenError::Revoked => "revoked",
            RefreshTokenError::ReuseDetected => "reuse_detected",
        }
    }
}

/// Lifetime and grace window applied to every refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    pub lifetime: Duration,
    pub grace_window: Duration,
}

impl TokenPolicy {
    pub fn new(lifetime: Duration, grace_window: Duration) -> Self {
        Self {
            lifetime,
            grace_window,
        }
    }

    pub fn expires_at(&self, issued_at: NaiveDateTime) -> NaiveDateTime {
        issued_at + self.lifetime
    }

    pub fn grace_expires_at(&self, consumed_at: NaiveDateTime) -> NaiveDateTime {
        consumed_at + self.grace_window
    }
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            lifetime: Duration::days(7),
            grace_window: Duration::seconds(10),
        }
    }
}

/// Source of "now" for a consume.
///
/// Stores read it only after the row lock is held, so time spent queued
/// behind a concurrent consumer counts against the grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    System,
    Fixed(NaiveDateTime),
}

impl Clock {
    pub fn now(&self) -> NaiveDateTime {
        match self {
            Clock::System => Utc::now().naive_utc(),
            Clock::Fixed(now) => *now,
        }
    }
}

/// One persisted refresh token row. The plaintext secret is never part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshToken {
    pub id: Uuid,
    pub subject: String,
    pub family_id: Uuid,
    pub token_hash: String,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub consumed_at: Option<NaiveDateTime>,
    pub grace_expires_at: Option<NaiveDateTime>,
    pub replaced_by: Option<Uuid>,
    pub revoked_at: Option<NaiveDateTime>,
}

/// What a locked consume must do with the row it just read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeDecision {
    /// Never consumed: stamp `consumed_at` and `grace_expires_at`.
    FirstUse {
        consumed_at: NaiveDateTime,
        grace_expires_at: NaiveDateTime,
    },
    /// Already consumed, still inside the grace window. No mutation.
    WithinGrace,
    /// Already consumed and the grace window has closed. Revoke the family.
    Reuse,
}

/// Which success path a consume took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeKind {
    First,
    Grace,
}

impl ConsumeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumeKind::First => "first",
            ConsumeKind::Grace => "grace",
        }
    }
}

impl RefreshToken {
    /// Evaluate this row for a consume attempt at `now`.
    ///
    /// Must only be called on a row read under an exclusive lock; the caller
    /// applies the returned decision inside the same unit of work.
    pub fn decide(
        &self,
        now: NaiveDateTime,
        policy: &TokenPolicy,
    ) -> Result<ConsumeDecision, RefreshTokenError> {
        if self.revoked_at.is_some() {
            return Err(RefreshTokenError::Revoked);
        }
        if now > self.expires_at {
            return Err(RefreshTokenError::Expired);
        }

        match (self.consumed_at, self.grace_expires_at) {
            (None, _) => Ok(ConsumeDecision::FirstUse {
                consumed_at: now,
                grace_expires_at: policy.grace_expires_at(now),
            }),
            // Exactly at the boundary is still inside the window.
            (Some(_), Some(grace_expires_at)) if now <= grace_expires_at => {
                Ok(ConsumeDecision::WithinGrace)
            }
            // A consumed row without a grace deadline never had a window.
            (Some(_), _) => Ok(ConsumeDecision::Reuse),
        }
    }

    /// Apply a `FirstUse` decision to the in-memory copy of the row.
    pub fn mark_consumed(&mut self, consumed_at: NaiveDateTime, grace_expires_at: NaiveDateTime) {
        if self.consumed_at.is_none() {
            self.consumed_at = Some(consumed_at);
            self.grace_expires_at = Some(grace_expires_at);
        }
    }

    pub fn status(&self, now: NaiveDateTime) -> RefreshTokenStatus {
        if self.revoked_at.is_some() {
            RefreshTokenStatus::Revoked
        } else if now > self.expires_at {
            RefreshTokenStatus::Expired
        } else if self.replaced_by.is_some() {
            RefreshTokenStatus::Replaced
        } else if self.consumed_at.is_some() {
            RefreshTokenStatus::Consumed
        } else {
            RefreshTokenStatus::Active
        }
    }
}

/// Lifecycle position of a row at a given instant. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTokenStatus {
    Active,
    /// Consumed, successor not linked yet.
    Consumed,
    Replaced,
    Expired,
    Revoked,
}

impl RefreshTokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTokenStatus::Active => "active",
            RefreshTokenStatus::Consumed => "consumed",
            RefreshTokenStatus::Replaced => "replaced",
            RefreshTokenStatus::Expired => "expired",
            RefreshTokenStatus::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for RefreshTokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
