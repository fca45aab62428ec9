use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, Utc};

use crate::db::repository::ChannelRepository;
use crate::error::AppResult;
use crate::i18n;
use crate::services::calendar::{display_window, render_text, EventAggregator, NormalizedEvent};
use crate::services::grid::GridRenderer;
use crate::AppState;

/// Builds the `display` listing and the weekly grid for a channel.
pub struct DisplayService;

impl DisplayService {
    /// Events of the channel's calendars in `[start, end)`, `None` when the
    /// channel has no calendars registered.
    async fn events_in(
        state: &Arc<AppState>,
        channel_id: &str,
        (start, end): (DateTime<Utc>, DateTime<Utc>),
        name_filter: Option<&[String]>,
    ) -> AppResult<Option<Vec<NormalizedEvent>>> {
        let registrations = ChannelRepository::find_by_id(&state.db, channel_id)
            .await?
            .map(|doc| doc.display)
            .unwrap_or_default();
        if registrations.is_empty() {
            return Ok(None);
        }

        let events = EventAggregator::aggregate(
            state.calendar.as_ref(),
            &registrations,
            start,
            end,
            name_filter,
        )
        .await?;
        Ok(Some(events))
    }

    /// Block-quoted event lines for the next `days` days.
    pub async fn text_listing(
        state: &Arc<AppState>,
        channel_id: &str,
        days: u32,
        name_filter: Option<&[String]>,
    ) -> AppResult<String> {
        let today = Local::now().date_naive();
        Ok(
            match Self::events_in(state, channel_id, display_window(today, days), name_filter)
                .await?
            {
                Some(events) => render_text(&events),
                None => i18n::t("display.no_calendars"),
            },
        )
    }

    /// Weekly grid for the next `days` days, drawn inside a code block.
    pub async fn grid(state: &Arc<AppState>, channel_id: &str, days: u32) -> AppResult<String> {
        let today = Local::now().date_naive();
        Self::grid_for(state, channel_id, days, today).await
    }

    pub async fn grid_for(
        state: &Arc<AppState>,
        channel_id: &str,
        days: u32,
        today: NaiveDate,
    ) -> AppResult<String> {
        // The grid shows whole weeks, so fetch everything it draws.
        let (first_date, total_days) = GridRenderer::span(days, today);
        let window = display_window(first_date, total_days - 1);
        Ok(match Self::events_in(state, channel_id, window, None).await? {
            Some(events) => {
                let grid = GridRenderer::render(&events, days, today);
                format!("```\n{}```", grid.to_text_table())
            }
            None => i18n::t("display.no_calendars"),
        })
    }
}
