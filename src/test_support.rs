//! In-memory doubles shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::models::{CalendarRegistration, OrderedMap, DEFAULT_CALENDAR_COLOR};
use crate::error::{AppError, AppResult};
use crate::services::discord::Messenger;
use crate::services::google::{
    CalendarProvider, EventList, EventTime, ProviderEvent, WatchRequest, WatchResponse,
};
use crate::AppState;

pub const SERVICE_ACCOUNT: &str = "bot@project.iam.gserviceaccount.com";

/// A single-connection in-memory database with the schema applied. One
/// connection that never expires keeps the database alive for the whole test.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub async fn test_state(
    calendar: Arc<dyn CalendarProvider>,
    messenger: Arc<dyn Messenger>,
) -> Arc<AppState> {
    Arc::new(AppState {
        db: memory_pool().await,
        config: Config::default(),
        calendar,
        messenger,
    })
}

pub fn timed(title: &str, start: &str, end: &str) -> ProviderEvent {
    ProviderEvent {
        id: Some(format!("evt-{}", title.to_lowercase())),
        status: Some("confirmed".to_string()),
        summary: Some(title.to_string()),
        start: Some(EventTime {
            date: None,
            date_time: Some(start.to_string()),
        }),
        end: Some(EventTime {
            date: None,
            date_time: Some(end.to_string()),
        }),
        ..Default::default()
    }
}

pub fn all_day(title: &str, date: &str) -> ProviderEvent {
    ProviderEvent {
        id: Some(format!("evt-{}", title.to_lowercase())),
        status: Some("confirmed".to_string()),
        summary: Some(title.to_string()),
        start: Some(EventTime {
            date: Some(date.to_string()),
            date_time: None,
        }),
        ..Default::default()
    }
}

pub fn registrations(entries: &[(&str, &str)]) -> OrderedMap<CalendarRegistration> {
    entries
        .iter()
        .map(|(id, name)| {
            (
                id.to_string(),
                CalendarRegistration {
                    name: name.to_string(),
                    color: DEFAULT_CALENDAR_COLOR.to_string(),
                },
            )
        })
        .collect()
}

/// Calendar provider that serves canned events and records watch requests.
/// Every listing returns the whole calendar; the requested bounds are only
/// recorded so tests can assert them.
#[derive(Default)]
pub struct FakeProvider {
    calendars: HashMap<String, (String, Vec<ProviderEvent>)>,
    denied: HashSet<String>,
    watch_error: Option<String>,
    watch_calls: Mutex<Vec<(String, WatchRequest)>>,
    window_calls: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    updated_since_calls: Mutex<Vec<(String, DateTime<Utc>)>>,
    list_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_calendar(mut self, id: &str, summary: &str, events: Vec<ProviderEvent>) -> Self {
        self.calendars
            .insert(id.to_string(), (summary.to_string(), events));
        self
    }

    pub fn deny(mut self, id: &str) -> Self {
        self.denied.insert(id.to_string());
        self
    }

    pub fn fail_watch(mut self, message: &str) -> Self {
        self.watch_error = Some(message.to_string());
        self
    }

    pub fn watch_calls(&self) -> Vec<(String, WatchRequest)> {
        self.watch_calls.lock().unwrap().clone()
    }

    /// (calendar id, time_min, time_max) of every window listing.
    pub fn window_calls(&self) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
        self.window_calls.lock().unwrap().clone()
    }

    /// (calendar id, updated_min) of every updated-since listing.
    pub fn updated_since_calls(&self) -> Vec<(String, DateTime<Utc>)> {
        self.updated_since_calls.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn calendar(&self, id: &str) -> AppResult<&(String, Vec<ProviderEvent>)> {
        if self.denied.contains(id) {
            return Err(AppError::AccessDenied(id.to_string()));
        }
        self.calendars
            .get(id)
            .ok_or_else(|| AppError::AccessDenied(id.to_string()))
    }

    fn list(&self, id: &str) -> AppResult<EventList> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let (summary, events) = self.calendar(id)?;
        Ok(EventList {
            summary: summary.clone(),
            items: events.clone(),
            next_page_token: None,
        })
    }
}

#[async_trait]
impl CalendarProvider for FakeProvider {
    fn service_account_email(&self) -> &str {
        SERVICE_ACCOUNT
    }

    async fn list_events_in_window(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> AppResult<EventList> {
        self.window_calls
            .lock()
            .unwrap()
            .push((calendar_id.to_string(), time_min, time_max));
        self.list(calendar_id)
    }

    async fn list_events_updated_since(
        &self,
        calendar_id: &str,
        updated_min: DateTime<Utc>,
    ) -> AppResult<EventList> {
        self.updated_since_calls
            .lock()
            .unwrap()
            .push((calendar_id.to_string(), updated_min));
        self.list(calendar_id)
    }

    async fn calendar_summary(&self, calendar_id: &str) -> AppResult<String> {
        self.calendar(calendar_id).map(|(summary, _)| summary.clone())
    }

    async fn watch(&self, calendar_id: &str, request: &WatchRequest) -> AppResult<WatchResponse> {
        self.calendar(calendar_id)?;
        if let Some(message) = &self.watch_error {
            return Err(AppError::Provider(message.clone()));
        }

        let mut calls = self.watch_calls.lock().unwrap();
        calls.push((calendar_id.to_string(), request.clone()));
        Ok(WatchResponse {
            resource_id: format!("resource-{}", calls.len()),
            expiration: Some((Utc::now() + chrono::Duration::days(7)).timestamp_millis()),
        })
    }
}

/// Messenger that keeps every posted message in memory.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(String, String)>>,
    missing: HashSet<String>,
    failing_lookups: bool,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `channel_id` as deleted.
    pub fn without_channel(mut self, channel_id: &str) -> Self {
        self.missing.insert(channel_id.to_string());
        self
    }

    /// Every channel lookup fails as if Discord rate limited it.
    pub fn failing_lookups(mut self) -> Self {
        self.failing_lookups = true;
        self
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, channel_id: &str, content: &str) -> AppResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn channel_exists(&self, channel_id: &str) -> AppResult<bool> {
        if self.failing_lookups {
            return Err(AppError::Discord("429 Too Many Requests".to_string()));
        }
        Ok(!self.missing.contains(channel_id))
    }
}
