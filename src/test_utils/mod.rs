//! Test utilities.
//!
//! This module provides:
//! - Test data factories for creating valid test fixtures
//! - An in-memory refresh token repository for mocking persistence
//! - A builder for `AppState` backed by that repository

mod app_state_builder;
mod factories;
mod refresh_token_mocks;

pub use app_state_builder::*;
pub use factories::*;
pub use refresh_token_mocks::*;
