//! In-memory `RefreshTokenRepo` for use case and HTTP tests.
//!
//! A single mutex over the whole table stands in for the row lock: every
//! consume reads, decides and writes while holding it.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::use_cases::refresh_token::{ConsumeOutcome, NewRefreshToken, RefreshTokenRepo},
    domain::entities::refresh_token::{Clock, ConsumeDecision, ConsumeKind, RefreshToken, TokenPolicy},
};

#[derive(Default)]
pub struct InMemoryRefreshTokenRepo {
    rows: Mutex<Vec<RefreshToken>>,
    forced_collisions: AtomicUsize,
}

impl InMemoryRefreshTokenRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: Vec<RefreshToken>) -> Self {
        Self {
            rows: Mutex::new(tokens),
            forced_collisions: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` inserts fail as if the hash already existed.
    pub fn fail_next_inserts_with_collision(&self, count: usize) {
        self.forced_collisions.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, id: Uuid) -> Option<RefreshToken> {
        self.rows.lock().unwrap().iter().find(|t| t.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_forced_collision(&self) -> bool {
        self.forced_collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn revoke_where(
    rows: &mut [RefreshToken],
    now: NaiveDateTime,
    matches: impl Fn(&RefreshToken) -> bool,
) -> u64 {
    let mut revoked = 0;
    for row in rows.iter_mut().filter(|t| matches(t) && t.revoked_at.is_none()) {
        row.revoked_at = Some(now);
        revoked += 1;
    }
    revoked
}

#[async_trait]
impl RefreshTokenRepo for InMemoryRefreshTokenRepo {
    async fn insert(&self, token: &NewRefreshToken) -> AppResult<RefreshToken> {
        if self.take_forced_collision() {
            return Err(AppError::TokenHashCollision);
        }

        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|t| t.token_hash == token.token_hash) {
            return Err(AppError::TokenHashCollision);
        }

        let row = RefreshToken {
            id: token.id,
            subject: token.subject.clone(),
            family_id: token.family_id,
            token_hash: token.token_hash.clone(),
            created_at: token.created_at,
            expires_at: token.expires_at,
            consumed_at: None,
            grace_expires_at: None,
            replaced_by: None,
            revoked_at: None,
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn consume(
        &self,
        token_hash: &str,
        clock: Clock,
        policy: &TokenPolicy,
    ) -> AppResult<ConsumeOutcome> {
        let mut rows = self.rows.lock().unwrap();
        let now = clock.now();

        let Some(row) = rows.iter_mut().find(|t| t.token_hash == token_hash) else {
            return Ok(ConsumeOutcome::Unknown);
        };

        match row.decide(now, policy) {
            Err(reason) => Ok(ConsumeOutcome::Rejected(reason)),
            Ok(ConsumeDecision::FirstUse {
                consumed_at,
                grace_expires_at,
            }) => {
                row.mark_consumed(consumed_at, grace_expires_at);
                Ok(ConsumeOutcome::Accepted {
                    token: row.clone(),
                    kind: ConsumeKind::First,
                })
            }
            Ok(ConsumeDecision::WithinGrace) => Ok(ConsumeOutcome::Accepted {
                token: row.clone(),
                kind: ConsumeKind::Grace,
            }),
            Ok(ConsumeDecision::Reuse) => {
                let token = row.clone();
                let revoked_rows = revoke_where(&mut rows, now, |t| t.family_id == token.family_id);
                Ok(ConsumeOutcome::Reused {
                    token,
                    revoked_rows,
                })
            }
        }
    }

    async fn revoke_family(&self, family_id: Uuid, now: NaiveDateTime) -> AppResult<u64> {
        let mut rows = self.rows.lock().unwrap();
        Ok(revoke_where(&mut rows, now, |t| t.family_id == family_id))
    }

    async fn revoke_subject(&self, subject: &str, now: NaiveDateTime) -> AppResult<u64> {
        let mut rows = self.rows.lock().unwrap();
        Ok(revoke_where(&mut rows, now, |t| t.subject == subject))
    }

    async fn link_replacement(&self, id: Uuid, replaced_by: Uuid) -> AppResult<bool> {
        let mut rows = self.rows.lock().unwrap();
        match rows
            .iter_mut()
            .find(|t| t.id == id && t.replaced_by.is_none())
        {
            Some(row) => {
                row.replaced_by = Some(replaced_by);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_by_hash(&self, token_hash: &str) -> AppResult<Option<RefreshToken>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn list_by_family(&self, family_id: Uuid) -> AppResult<Vec<RefreshToken>> {
        let mut family: Vec<RefreshToken> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.family_id == family_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        family.sort_by_key(|t| t.created_at);
        Ok(family)
    }
}
