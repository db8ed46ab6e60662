use std::sync::Arc;

use crate::{infra::config::AppConfig, use_cases::refresh_token::RefreshTokenUseCases};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub refresh_token_use_cases: Arc<RefreshTokenUseCases>,
}
