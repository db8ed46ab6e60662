use crate::{
    adapters::http::app_state::AppState,
    infra::{config::AppConfig, postgres_persistence},
    use_cases::refresh_token::{RefreshTokenRepo, RefreshTokenUseCases},
};
use secrecy::ExposeSecret;
use std::fs::File;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub async fn init_app_state() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env();

    let postgres_arc = Arc::new(
        postgres_persistence(
            config.database_url.expose_secret(),
            config.database_max_connections,
        )
        .await?,
    );

    let refresh_token_use_cases = RefreshTokenUseCases::new(
        postgres_arc.clone() as Arc<dyn RefreshTokenRepo>,
        config.token_policy(),
    );

    Ok(AppState {
        config: Arc::new(config),
        refresh_token_use_cases: Arc::new(refresh_token_use_cases),
    })
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "refresh_guard=debug,tower_http=debug".into());

    // Console (pretty logs)
    let console_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .pretty();

    // File (structured JSON logs)
    let file = File::create("app.log").expect("cannot create log file");
    let json_layer = fmt::layer()
        .json()
        .with_writer(file)
        .with_current_span(true)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .try_init()
        .ok();
}
