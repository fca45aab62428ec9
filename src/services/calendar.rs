use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::db::models::{CalendarRegistration, OrderedMap, DEFAULT_CALENDAR_COLOR};
use crate::error::AppResult;
use crate::i18n;
use crate::services::google::{CalendarProvider, EventTime, ProviderEvent};

/// One provider event, flattened and tagged with the calendar it came from.
///
/// Times are naive wall-clock values: a `dateTime` keeps the clock reading
/// it was published with and its UTC offset is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub start: NaiveDateTime,
    pub all_day: bool,
    /// `dd.mm.yyyy` for whole-day events, `dd.mm.yyyy   HH:MM` otherwise.
    pub date_label: String,
    pub title: Option<String>,
    pub calendar_name: String,
    pub calendar_color: String,
    pub end: Option<NaiveDateTime>,
    pub description: Option<String>,
    pub duration: Option<Duration>,
    pub status: Option<String>,
}

impl NormalizedEvent {
    pub fn title_or_default(&self) -> &str {
        self.title.as_deref().unwrap_or("(no title)")
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

/// Fetches events of a channel's calendars and merges them into one
/// time-ordered list.
pub struct EventAggregator;

impl EventAggregator {
    /// Events of every registered calendar starting in `[window_start, window_end)`.
    ///
    /// Calendars are queried in registration order; when `name_filter` is set
    /// only registrations whose display name is in it are queried. The first
    /// failing calendar aborts the whole aggregation.
    pub async fn aggregate(
        provider: &dyn CalendarProvider,
        registrations: &OrderedMap<CalendarRegistration>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        name_filter: Option<&[String]>,
    ) -> AppResult<Vec<NormalizedEvent>> {
        let mut events = Vec::new();

        for (calendar_id, registration) in registrations.iter() {
            if let Some(filter) = name_filter {
                if !filter.iter().any(|name| name == &registration.name) {
                    debug!("Skipping calendar {} (filtered out)", calendar_id);
                    continue;
                }
            }

            let list = provider
                .list_events_in_window(calendar_id, window_start, window_end)
                .await?;

            events.extend(list.items.iter().filter_map(|event| {
                normalize(event, &registration.name, &registration.color)
            }));
        }

        // Stable: equal starts keep calendar enumeration order.
        events.sort_by_key(|event| event.start);
        Ok(events)
    }

    /// Events of one calendar changed since `since`, cancelled ones included.
    /// Returns the calendar's provider-side name alongside.
    pub async fn aggregate_updated_since(
        provider: &dyn CalendarProvider,
        calendar_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<(String, Vec<NormalizedEvent>)> {
        let list = provider
            .list_events_updated_since(calendar_id, since)
            .await?;

        let events = list
            .items
            .iter()
            .filter_map(|event| normalize(event, &list.summary, DEFAULT_CALENDAR_COLOR))
            .collect();

        Ok((list.summary, events))
    }
}

/// Display window for `days` days starting today: local midnight today up to
/// local midnight `days + 1` days later.
pub fn display_window(today: NaiveDate, days: u32) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = today.and_hms_opt(0, 0, 0).unwrap_or_default();
    let end = start + Duration::days(i64::from(days) + 1);
    (local_to_utc(start), local_to_utc(end))
}

fn local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Parse a provider time into a naive wall-clock value. The bool is true for
/// date-only values.
fn parse_event_time(time: &EventTime) -> Option<(NaiveDateTime, bool)> {
    if let Some(ref date) = time.date {
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        return Some((day.and_hms_opt(0, 0, 0)?, true));
    }

    let raw = time.date_time.as_deref()?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.naive_local())
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|dt| (dt, false))
}

pub fn normalize(event: &ProviderEvent, calendar_name: &str, color: &str) -> Option<NormalizedEvent> {
    let Some((start, all_day)) = event.start.as_ref().and_then(parse_event_time) else {
        warn!(
            "Dropping event {:?} ({:?}) from {}: missing or unreadable start",
            event.id, event.summary, calendar_name
        );
        return None;
    };

    let end = event
        .end
        .as_ref()
        .and_then(parse_event_time)
        .map(|(end, _)| end);

    let date_label = if all_day {
        start.format("%d.%m.%Y").to_string()
    } else {
        start.format("%d.%m.%Y   %H:%M").to_string()
    };

    let duration = match (all_day, end) {
        (false, Some(end)) => Some(end - start),
        _ => None,
    };

    Some(NormalizedEvent {
        start,
        all_day,
        date_label,
        title: event.summary.clone(),
        calendar_name: calendar_name.to_string(),
        calendar_color: color.to_string(),
        end,
        description: event.description.clone(),
        duration,
        status: event.status.clone(),
    })
}

/// `"{Weekday} {date}   **{title}**   ({calendar})\n"` per event.
pub fn format_event_lines(events: &[NormalizedEvent]) -> String {
    events
        .iter()
        .map(|event| {
            format!(
                "{} {}   **{}**   ({})\n",
                event.start.format("%A"),
                event.date_label,
                event.title_or_default(),
                event.calendar_name
            )
        })
        .collect()
}

/// Message body for the `display` command.
pub fn render_text(events: &[NormalizedEvent]) -> String {
    if events.is_empty() {
        return i18n::t("display.no_events");
    }
    format!(">>> {}", format_event_lines(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::test_support::{all_day, registrations, timed, FakeProvider};

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        display_window(NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(), 7)
    }

    #[test]
    fn date_time_offset_is_stripped() {
        let event = timed("Standup", "2024-05-06T09:30:00+02:00", "2024-05-06T09:45:00+02:00");
        let normalized = normalize(&event, "Team", "#7986cb").unwrap();

        assert_eq!(
            normalized.start,
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(9, 30, 0).unwrap()
        );
        assert!(!normalized.all_day);
        assert_eq!(normalized.date_label, "06.05.2024   09:30");
        assert_eq!(normalized.duration, Some(Duration::minutes(15)));
    }

    #[test]
    fn date_only_is_whole_day_at_midnight() {
        let normalized = normalize(&all_day("Holiday", "2024-05-09"), "Team", "#000000").unwrap();
        assert!(normalized.all_day);
        assert_eq!(normalized.start.format("%H:%M").to_string(), "00:00");
        assert_eq!(normalized.date_label, "09.05.2024");
        assert_eq!(normalized.duration, None);
    }

    #[test]
    fn events_without_start_are_dropped() {
        let event = ProviderEvent {
            summary: Some("Ghost".into()),
            ..Default::default()
        };
        assert!(normalize(&event, "Team", "#000000").is_none());
    }

    #[tokio::test]
    async fn merged_events_are_sorted_by_start() {
        let provider = FakeProvider::new()
            .with_calendar(
                "late@x",
                "Late",
                vec![
                    timed("C", "2024-05-08T10:00:00Z", "2024-05-08T11:00:00Z"),
                    timed("E", "2024-05-10T10:00:00Z", "2024-05-10T11:00:00Z"),
                ],
            )
            .with_calendar(
                "early@x",
                "Early",
                vec![
                    all_day("A", "2024-05-06"),
                    timed("D", "2024-05-09T08:00:00Z", "2024-05-09T09:00:00Z"),
                    timed("B", "2024-05-07T10:00:00Z", "2024-05-07T11:00:00Z"),
                ],
            );
        let regs = registrations(&[("late@x", "Late"), ("early@x", "Early")]);
        let (start, end) = window();

        let events = EventAggregator::aggregate(&provider, &regs, start, end, None)
            .await
            .unwrap();
        let titles: Vec<_> = events.iter().map(|e| e.title_or_default()).collect();
        assert_eq!(titles, vec!["A", "B", "C", "D", "E"]);
        assert!(events.windows(2).all(|w| w[0].start < w[1].start));

        let calls = provider.window_calls();
        let ids: Vec<_> = calls.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["late@x", "early@x"]);
        assert!(calls.iter().all(|(_, min, max)| (*min, *max) == (start, end)));
    }

    #[test]
    fn display_window_spans_local_midnights() {
        let (start, end) = window();
        assert_eq!(
            start.with_timezone(&Local).naive_local(),
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
        assert_eq!(
            end.with_timezone(&Local).naive_local(),
            NaiveDate::from_ymd_opt(2024, 5, 14).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn equal_starts_keep_registration_order() {
        let provider = FakeProvider::new()
            .with_calendar("second@x", "Second", vec![all_day("from second", "2024-05-07")])
            .with_calendar("first@x", "First", vec![all_day("from first", "2024-05-07")]);
        let regs = registrations(&[("first@x", "First"), ("second@x", "Second")]);
        let (start, end) = window();

        let events = EventAggregator::aggregate(&provider, &regs, start, end, None)
            .await
            .unwrap();
        let names: Vec<_> = events.iter().map(|e| e.calendar_name.as_str()).collect();
        assert_eq!(names, vec!["First", "Second"]);
    }

    #[tokio::test]
    async fn name_filter_is_exact() {
        let provider = FakeProvider::new()
            .with_calendar("a@x", "Team", vec![all_day("team", "2024-05-07")])
            .with_calendar("b@x", "team", vec![all_day("other", "2024-05-07")]);
        let regs = registrations(&[("a@x", "Team"), ("b@x", "team")]);
        let (start, end) = window();
        let filter = vec!["Team".to_string()];

        let events = EventAggregator::aggregate(&provider, &regs, start, end, Some(&filter))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title_or_default(), "team");
    }

    #[tokio::test]
    async fn first_denied_calendar_aborts() {
        let provider = FakeProvider::new()
            .with_calendar("ok@x", "Ok", vec![all_day("fine", "2024-05-07")])
            .deny("locked@x");
        let regs = registrations(&[("ok@x", "Ok"), ("locked@x", "Locked")]);
        let (start, end) = window();

        let err = EventAggregator::aggregate(&provider, &regs, start, end, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AccessDenied(id) if id == "locked@x"));
    }

    #[tokio::test]
    async fn register_then_display_end_to_end() {
        use crate::db::repository::ChannelRepository;
        use crate::test_support::memory_pool;

        let pool = memory_pool().await;
        let provider = FakeProvider::new().with_calendar(
            "abc@provider",
            "Team",
            vec![
                timed("Review", "2024-05-08T14:00:00+02:00", "2024-05-08T15:00:00+02:00"),
                all_day("Holiday", "2024-05-07"),
            ],
        );
        ChannelRepository::upsert_calendar(&pool, "1", "abc@provider", "Team", DEFAULT_CALENDAR_COLOR)
            .await
            .unwrap();

        let doc = ChannelRepository::find_by_id(&pool, "1").await.unwrap().unwrap();
        let (start, end) = window();
        let events = EventAggregator::aggregate(&provider, &doc.display, start, end, None)
            .await
            .unwrap();

        assert_eq!(
            render_text(&events),
            ">>> Tuesday 07.05.2024   **Holiday**   (Team)\n\
             Wednesday 08.05.2024   14:00   **Review**   (Team)\n"
        );
    }

    #[test]
    fn empty_display_has_fixed_message() {
        assert_eq!(render_text(&[]), "No events in calendar");
    }

    #[tokio::test]
    async fn updated_since_keeps_cancelled_events() {
        let mut cancelled = timed("Gone", "2024-05-08T10:00:00Z", "2024-05-08T11:00:00Z");
        cancelled.status = Some("cancelled".into());
        let provider = FakeProvider::new().with_calendar("c@x", "Cal", vec![cancelled]);

        let (name, events) = EventAggregator::aggregate_updated_since(&provider, "c@x", Utc::now())
            .await
            .unwrap();
        assert_eq!(name, "Cal");
        assert!(events[0].is_cancelled());
    }
}
