use thiserror::Error;

use crate::domain::entities::refresh_token::RefreshTokenError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found")]
    NotFound,

    /// Freshly generated token hashed to a value already stored. Retryable.
    #[error("Refresh token hash collision")]
    TokenHashCollision,

    #[error(transparent)]
    RefreshToken(#[from] RefreshTokenError),
}

#[derive(Clone, Copy, Debug)]
pub enum ErrorCode {
    DatabaseError,
    InvalidCredentials,
    InvalidInput,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl AppError {
    /// The refresh-token failure behind this error, if any.
    pub fn refresh_token_error(&self) -> Option<RefreshTokenError> {
        match self {
            AppError::RefreshToken(reason) => Some(*reason),
            _ => None,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
