use std::net::SocketAddr;

use axum::http::HeaderValue;
use chrono::Duration;
use env_helpers::{get_env, get_env_default};
use secrecy::SecretString;

use crate::domain::entities::refresh_token::TokenPolicy;

pub struct AppConfig {
    /// Postgres connection string. Contains credentials, never log it.
    pub database_url: SecretString,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub cors_origin: HeaderValue,
    /// Absolute lifetime of every refresh token.
    pub refresh_token_ttl: Duration,
    /// How long a consumed token may still be presented by a racing duplicate request.
    pub refresh_token_grace: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url = SecretString::new(get_env::<String>("DATABASE_URL").into());
        let database_max_connections: u32 = get_env_default("DATABASE_MAX_CONNECTIONS", 5);

        let bind_addr: SocketAddr = get_env_default(
            "BIND_ADDR",
            SocketAddr::from(([127, 0, 0, 1], 3001)),
        );
        let cors_origin: HeaderValue =
            get_env_default("CORS_ORIGIN", String::from("http://localhost:3000"))
                .parse()
                .expect("CORS_ORIGIN must be a valid header value");

        let refresh_token_ttl_days: i64 = get_env_default("REFRESH_TOKEN_TTL_DAYS", 7);
        let refresh_token_grace_secs: i64 = get_env_default("REFRESH_TOKEN_GRACE_SECS", 10);
        assert!(refresh_token_ttl_days > 0, "REFRESH_TOKEN_TTL_DAYS must be positive");
        assert!(
            refresh_token_grace_secs >= 0,
            "REFRESH_TOKEN_GRACE_SECS must not be negative"
        );

        Self {
            database_url,
            database_max_connections,
            bind_addr,
            cors_origin,
            refresh_token_ttl: Duration::days(refresh_token_ttl_days),
            refresh_token_grace: Duration::seconds(refresh_token_grace_secs),
        }
    }

    pub fn token_policy(&self) -> TokenPolicy {
        TokenPolicy::new(self.refresh_token_ttl, self.refresh_token_grace)
    }
}
