use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use lazy_static::lazy_static;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::models::{
    CalendarRegistration, ChannelDocument, OrderedMap, WatchSubscription,
};
use crate::error::{AppError, AppResult};

lazy_static! {
    /// One async lock per channel id. Held for the whole read-modify-write of
    /// that channel's document; other channels are never blocked. Entries are
    /// removed once nobody holds or waits for them.
    static ref CHANNEL_LOCKS: StdMutex<HashMap<String, Arc<Mutex<()>>>> =
        StdMutex::new(HashMap::new());
}

fn channel_locks() -> MutexGuard<'static, HashMap<String, Arc<Mutex<()>>>> {
    CHANNEL_LOCKS.lock().unwrap_or_else(|e| e.into_inner())
}

/// Exclusive access to one channel's document; prunes its map entry on drop.
struct ChannelLock {
    channel_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ChannelLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = channel_locks();
        if locks
            .get(&self.channel_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.channel_id);
        }
    }
}

async fn lock_channel(channel_id: &str) -> ChannelLock {
    let lock = channel_locks()
        .entry(channel_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    ChannelLock {
        channel_id: channel_id.to_string(),
        guard: Some(lock.lock_owned().await),
    }
}

/// Repository for per-channel configuration documents (`channels` table).
pub struct ChannelRepository;

impl ChannelRepository {
    /// Load the document of one channel, `None` if the channel never wrote anything.
    pub async fn find_by_id(
        pool: &SqlitePool,
        channel_id: &str,
    ) -> AppResult<Option<ChannelDocument>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT document FROM channels WHERE channel_id = ?")
                .bind(channel_id)
                .fetch_optional(pool)
                .await
                .map_err(AppError::Database)?;

        raw.map(|doc| serde_json::from_str(&doc).map_err(AppError::from))
            .transpose()
    }

    /// All channels with their documents. Rows that fail to parse are logged
    /// and skipped so one broken document does not stop the sweep.
    pub async fn list_all(pool: &SqlitePool) -> AppResult<Vec<(String, ChannelDocument)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT channel_id, document FROM channels ORDER BY channel_id")
                .fetch_all(pool)
                .await
                .map_err(AppError::Database)?;

        let mut out = Vec::with_capacity(rows.len());
        for (channel_id, raw) in rows {
            match serde_json::from_str::<ChannelDocument>(&raw) {
                Ok(doc) => out.push((channel_id, doc)),
                Err(e) => {
                    tracing::error!("Skipping unreadable document for channel {}: {}", channel_id, e);
                }
            }
        }
        Ok(out)
    }

    /// Register a calendar for display, or update its name/color in place.
    /// Returns the channel's registrations afterwards.
    pub async fn upsert_calendar(
        pool: &SqlitePool,
        channel_id: &str,
        calendar_id: &str,
        name: &str,
        color: &str,
    ) -> AppResult<OrderedMap<CalendarRegistration>> {
        Self::modify(pool, channel_id, |doc| {
            doc.display.insert(
                calendar_id,
                CalendarRegistration {
                    name: name.to_string(),
                    color: color.to_string(),
                },
            );
            Ok(doc.display.clone())
        })
        .await
    }

    /// Change the color of an already registered calendar.
    pub async fn upsert_color(
        pool: &SqlitePool,
        channel_id: &str,
        calendar_id: &str,
        color: &str,
    ) -> AppResult<CalendarRegistration> {
        Self::modify(pool, channel_id, |doc| {
            let registration = doc.display.get_mut(calendar_id).ok_or_else(|| {
                AppError::NotFound(format!("calendar {} in this channel", calendar_id))
            })?;
            registration.color = color.to_string();
            Ok(registration.clone())
        })
        .await
    }

    /// Store a watch subscription, replacing any previous one for the same calendar.
    pub async fn upsert_watch(
        pool: &SqlitePool,
        channel_id: &str,
        calendar_id: &str,
        subscription: WatchSubscription,
    ) -> AppResult<()> {
        Self::modify(pool, channel_id, |doc| {
            doc.watch.insert(calendar_id, subscription);
            Ok(())
        })
        .await
    }

    /// Set the auto-display weekday (0 disables it).
    pub async fn upsert_auto_display(
        pool: &SqlitePool,
        channel_id: &str,
        weekday: u8,
    ) -> AppResult<()> {
        Self::modify(pool, channel_id, |doc| {
            doc.auto_display = Some(weekday);
            Ok(())
        })
        .await
    }

    pub async fn mark_auto_display_fired(
        pool: &SqlitePool,
        channel_id: &str,
        date: NaiveDate,
    ) -> AppResult<()> {
        Self::modify(pool, channel_id, |doc| {
            doc.auto_display_last_fired = Some(date);
            Ok(())
        })
        .await
    }

    /// Load a whole-system document `{ channelId: <channel document> }` as
    /// written by the file-based store.
    ///
    /// Channels that already have a row are left untouched, so importing the
    /// same file on every start is harmless. Returns the number of channels
    /// inserted.
    pub async fn import_document(pool: &SqlitePool, json: &str) -> AppResult<usize> {
        let documents: OrderedMap<ChannelDocument> = serde_json::from_str(json)?;
        let mut imported = 0;

        for (channel_id, doc) in documents.iter() {
            let _guard = lock_channel(channel_id).await;
            let mut tx = pool.begin().await.map_err(AppError::Database)?;

            if Self::load_in_tx(&mut tx, channel_id).await?.is_some() {
                tracing::debug!("Channel {} already stored, skipping import", channel_id);
                continue;
            }

            Self::store_in_tx(&mut tx, channel_id, doc).await?;
            tx.commit().await.map_err(AppError::Database)?;
            imported += 1;
        }

        Ok(imported)
    }

    /// Read, mutate and write one channel document under its lock and inside
    /// a single transaction. Nothing is written when `mutate` fails.
    async fn modify<T, F>(pool: &SqlitePool, channel_id: &str, mutate: F) -> AppResult<T>
    where
        F: FnOnce(&mut ChannelDocument) -> AppResult<T>,
    {
        let _guard = lock_channel(channel_id).await;
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        let mut doc = Self::load_in_tx(&mut tx, channel_id)
            .await?
            .unwrap_or_default();
        let result = mutate(&mut doc)?;

        Self::store_in_tx(&mut tx, channel_id, &doc).await?;
        tx.commit().await.map_err(AppError::Database)?;

        Ok(result)
    }

    async fn load_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        channel_id: &str,
    ) -> AppResult<Option<ChannelDocument>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT document FROM channels WHERE channel_id = ?")
                .bind(channel_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(AppError::Database)?;

        raw.map(|doc| serde_json::from_str(&doc).map_err(AppError::from))
            .transpose()
    }

    async fn store_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        channel_id: &str,
        doc: &ChannelDocument,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        let document = serde_json::to_string(doc)?;

        sqlx::query(
            r#"
            INSERT INTO channels (channel_id, document, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(channel_id) DO UPDATE SET
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(channel_id)
        .bind(document)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}
