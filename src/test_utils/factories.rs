//! Test data factories for creating valid test fixtures.
//!
//! Each factory function creates a complete, valid object with sensible defaults.
//! Use the closure parameter to override specific fields as needed.

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use crate::domain::entities::refresh_token::{RefreshToken, TokenPolicy};
use crate::use_cases::refresh_token::hash_refresh_token;

/// Fixed timestamp so time-dependent tests are reproducible.
pub fn test_datetime() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, 1)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

/// Create an unconsumed refresh token row whose plaintext is `plaintext`.
pub fn create_test_refresh_token(
    plaintext: &str,
    overrides: impl FnOnce(&mut RefreshToken),
) -> RefreshToken {
    let created_at = test_datetime();
    let mut token = RefreshToken {
        id: Uuid::new_v4(),
        subject: "user@example.com".to_string(),
        family_id: Uuid::new_v4(),
        token_hash: hash_refresh_token(plaintext),
        created_at,
        expires_at: TokenPolicy::default().expires_at(created_at),
        consumed_at: None,
        grace_expires_at: None,
        replaced_by: None,
        revoked_at: None,
    };
    overrides(&mut token);
    token
}
