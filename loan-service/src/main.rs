use anyhow::Context;
use loan_service::{AppState, ServiceConfig, create_app};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured JSON tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "loan_service=debug,loan_flow=debug,tower_http=debug".into());

    match log_format.as_str() {
        "pretty" => {
            // Human-readable logging for development
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

fn spawn_idle_purge(state: &AppState, every: Duration) {
    let engine = Arc::clone(&state.engine);
    let max_idle = engine.config().session_idle_timeout();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(err) = engine.store().purge_idle(max_idle).await {
                error!(error = %err, "Idle session purge failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServiceConfig::load()?;
    let state = AppState::from_config(&config).context("building workflow engine")?;
    spawn_idle_purge(&state, Duration::from_secs(config.purge_interval_secs));

    let app = create_app(state);
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    info!(
        addr = %listener.local_addr()?,
        run_mode = ?config.engine.run_mode,
        "Loan service listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
