//! Startup helpers:
//! - database connection + migrations
//! - one-time import of a legacy JSON store
//! - background worker spawn helpers

use std::{path::Path, sync::Arc};

use anyhow::Result;

use crate::config::Config;
use crate::db::repository::ChannelRepository;
use crate::services::scheduler::RenewalScheduler;

/// Strip credentials from a database URL before logging it.
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        format!("{}://{}{}{}", url.scheme(), host, port_part, url.path())
    } else if let Some(at_pos) = db_url.find('@') {
        format!("(redacted){}", &db_url[at_pos + 1..])
    } else {
        "(redacted)".to_string()
    }
}

/// Open the SQLite channel store and run migrations. The parent directory of
/// the database file is created when missing.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Import channels from a legacy JSON store (one object keyed by channel id).
/// Channels already present in the database are left alone, so running the
/// import on every start is harmless.
pub async fn import_legacy_store(pool: &sqlx::SqlitePool, path: &str) -> Result<usize> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::warn!("Legacy store {} does not exist, skipping import", path.display());
        return Ok(0);
    }

    let raw = tokio::fs::read_to_string(path).await?;
    let imported = ChannelRepository::import_document(pool, &raw).await?;
    tracing::info!(
        "Imported {} channel(s) from legacy store {}",
        imported,
        path.display()
    );
    Ok(imported)
}

/// Spawn background workers. Currently this is the renewal scheduler, which
/// also posts the weekly auto-display grids.
///
/// Each worker listens for a shutdown notification on `shutdown`; the returned
/// handles let the caller wait for them to exit.
pub fn spawn_background_workers(
    state: Arc<crate::AppState>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![tokio::spawn(RenewalScheduler::run(
        state,
        shutdown.subscribe(),
    ))]
}
