use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::body::Body;
use axum::{routing::get, Router};
use http::StatusCode;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod i18n;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use config::Config;
use services::discord::{DiscordService, Messenger};
use services::gateway::CommandGateway;
use services::google::{CalendarProvider, GoogleCalendarService};
use services::init;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub calendar: Arc<dyn CalendarProvider>,
    pub messenger: Arc<dyn Messenger>,
}

/// Push notifications over the limit are acknowledged with an empty 200 and
/// dropped; the webhook never answers anything but 200 to the provider.
fn rate_limited_response(error: GovernorError) -> http::Response<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, .. } => {
            tracing::warn!(
                "Calendar push over the rate limit, dropped (retry after {}s)",
                wait_time
            );
            let mut resp = http::Response::new(Body::empty());
            *resp.status_mut() = StatusCode::OK;
            resp
        }
        GovernorError::UnableToExtractKey => {
            let mut resp = http::Response::new(Body::from(
                "Unable to determine client IP for rate limiting",
            ));
            *resp.status_mut() = StatusCode::BAD_REQUEST;
            resp
        }
        GovernorError::Other { code, msg, headers } => {
            let body = msg.unwrap_or_else(|| "Rate limiting error".to_string());
            let mut resp = http::Response::new(Body::from(body));
            *resp.status_mut() =
                StatusCode::from_u16(code.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            resp
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to bind SIGTERM, only Ctrl+C stops the service: {}", e);
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calendar_notifications=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Calendar Notifications Service");

    let pool = init::init_db(&config).await?;
    if let Some(path) = &config.store.legacy_import_path {
        init::import_legacy_store(&pool, path).await?;
    }

    let calendar = GoogleCalendarService::from_config(&config.google)?;
    tracing::info!(
        "Calendar access through service account {}",
        calendar.service_account_email()
    );
    let messenger = DiscordService::new(
        config.discord.bot_token.clone(),
        config.discord.api_base.clone(),
    )?;

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        calendar: Arc::new(calendar),
        messenger: Arc::new(messenger),
    });

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let thread_shutdown = Arc::new(AtomicBool::new(false));

    let bg_handles = init::spawn_background_workers(app_state.clone(), shutdown_tx.clone());
    let (gateway_handle, shard_manager) = CommandGateway::start(app_state.clone()).await?;

    // Calendar push webhook limiter
    let mut webhooks_builder = GovernorConfigBuilder::default();
    webhooks_builder.per_second(config.rate_limit.webhook_per_second.into());
    webhooks_builder.burst_size(config.rate_limit.webhook_burst);
    webhooks_builder.key_extractor(SmartIpKeyExtractor);
    webhooks_builder.error_handler(rate_limited_response);
    let webhooks_gov_conf = Arc::new(
        webhooks_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build webhooks governor config"))?,
    );

    let webhooks_cleaner = {
        let limiter = webhooks_gov_conf.limiter().clone();
        let flag = thread_shutdown.clone();
        std::thread::spawn(move || {
            let tick = Duration::from_secs(1);
            loop {
                for _ in 0..60 {
                    if flag.load(Ordering::SeqCst) {
                        tracing::info!("Webhooks rate limiter cleanup thread exiting");
                        return;
                    }
                    std::thread::sleep(tick);
                }
                tracing::debug!("webhooks rate limiter size: {}", limiter.len());
                limiter.retain_recent();
            }
        })
    };

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest(
            "/webhooks",
            routes::webhooks::router().layer(GovernorLayer {
                config: webhooks_gov_conf.clone(),
            }),
        )
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);
    tracing::info!(
        "Calendar push notifications are expected at {}",
        config.server.calendar_callback_url()
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, notifying background workers");
        }
    }

    let _ = shutdown_tx.send(());
    thread_shutdown.store(true, Ordering::SeqCst);
    shard_manager.shutdown_all().await;

    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );
    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
        let _ = gateway_handle.await;
    };
    if tokio::time::timeout(shutdown_wait, bg_wait).await.is_err() {
        tracing::warn!("Background workers did not exit in time");
    }

    if webhooks_cleaner.join().is_err() {
        tracing::warn!("Webhooks rate limiter cleanup thread panicked");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
