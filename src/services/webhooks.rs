use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::i18n;
use crate::services::calendar::{EventAggregator, NormalizedEvent};
use crate::AppState;

// Push notification headers sent by Google Calendar
pub const GOOG_CHANNEL_ID_HEADER: &str = "x-goog-channel-id";
pub const GOOG_CHANNEL_TOKEN_HEADER: &str = "x-goog-channel-token";
pub const GOOG_CHANNEL_EXPIRATION_HEADER: &str = "x-goog-channel-expiration";
pub const GOOG_RESOURCE_ID_HEADER: &str = "x-goog-resource-id";
pub const GOOG_RESOURCE_URI_HEADER: &str = "x-goog-resource-uri";
pub const GOOG_RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";
pub const GOOG_MESSAGE_NUMBER_HEADER: &str = "x-goog-message-number";

/// Sent once when a channel is created; carries no change.
const RESOURCE_STATE_SYNC: &str = "sync";

/// The headers of one push notification. The body is always empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushNotification {
    pub channel_id: Option<String>,
    pub token: Option<String>,
    pub expiration: Option<String>,
    pub resource_id: Option<String>,
    pub resource_uri: Option<String>,
    pub resource_state: Option<String>,
    pub message_number: Option<String>,
}

pub struct WebhookService;

impl WebhookService {
    /// Extract push-notification headers from request. Missing headers stay `None`.
    pub fn extract_headers(headers: &HeaderMap) -> PushNotification {
        PushNotification {
            channel_id: Self::get_header(headers, GOOG_CHANNEL_ID_HEADER),
            token: Self::get_header(headers, GOOG_CHANNEL_TOKEN_HEADER),
            expiration: Self::get_header(headers, GOOG_CHANNEL_EXPIRATION_HEADER),
            resource_id: Self::get_header(headers, GOOG_RESOURCE_ID_HEADER),
            resource_uri: Self::get_header(headers, GOOG_RESOURCE_URI_HEADER),
            resource_state: Self::get_header(headers, GOOG_RESOURCE_STATE_HEADER),
            message_number: Self::get_header(headers, GOOG_MESSAGE_NUMBER_HEADER),
        }
    }

    fn get_header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Calendar id from a resource URI such as
    /// `https://www.googleapis.com/calendar/v3/calendars/abc%40group.calendar.google.com/events?alt=json`:
    /// the path segment after `calendars`, percent-decoded.
    pub fn calendar_id_from_resource_uri(resource_uri: &str) -> Option<String> {
        let url = url::Url::parse(resource_uri).ok()?;
        let mut segments = url.path_segments()?;
        segments.find(|segment| *segment == "calendars")?;
        let raw = segments.next().filter(|s| !s.is_empty())?;
        urlencoding::decode(raw).ok().map(|id| id.into_owned())
    }

    /// Post newly created events of the notified calendar to the channel named
    /// by the notification token.
    pub async fn handle_notification(
        state: &Arc<AppState>,
        notification: &PushNotification,
    ) -> AppResult<()> {
        if notification.resource_state.as_deref() == Some(RESOURCE_STATE_SYNC) {
            debug!(
                "Sync handshake for push channel {:?}; nothing to do",
                notification.channel_id
            );
            return Ok(());
        }

        let channel_id = notification
            .token
            .as_deref()
            .ok_or_else(|| AppError::ChannelUnresolvable("<missing token>".to_string()))?;

        if !state.messenger.channel_exists(channel_id).await? {
            return Err(AppError::ChannelUnresolvable(channel_id.to_string()));
        }

        let calendar_id = notification
            .resource_uri
            .as_deref()
            .and_then(Self::calendar_id_from_resource_uri)
            .ok_or_else(|| {
                AppError::BadRequest(format!(
                    "No calendar id in resource URI {:?}",
                    notification.resource_uri
                ))
            })?;

        let since = Utc::now() - Duration::seconds(state.config.scheduler.webhook_lookback_seconds);
        let (calendar_name, events) = match EventAggregator::aggregate_updated_since(
            state.calendar.as_ref(),
            &calendar_id,
            since,
        )
        .await
        {
            Ok(result) => result,
            Err(AppError::AccessDenied(calendar_id)) => {
                let message = i18n::t_with(
                    "webhook.access_denied",
                    &[
                        ("email", state.calendar.service_account_email()),
                        ("calendar_id", &calendar_id),
                    ],
                );
                state.messenger.send_text(channel_id, &message).await?;
                return Err(AppError::AccessDenied(calendar_id));
            }
            Err(e) => return Err(e),
        };

        let blocks: String = events.iter().filter_map(format_new_event).collect();
        if blocks.is_empty() {
            debug!(
                "Change notification for calendar {} had no new events",
                calendar_id
            );
            return Ok(());
        }

        info!(
            "Posting new events of calendar {} to channel {}",
            calendar_id, channel_id
        );
        state
            .messenger
            .send_text(
                channel_id,
                &i18n::t_with("webhook.new_event", &[("name", &calendar_name)]),
            )
            .await?;
        state
            .messenger
            .send_text(channel_id, &format!(">>> {}", blocks))
            .await?;

        Ok(())
    }

    /// Run `handle_notification` and log the outcome instead of returning it.
    pub async fn process(state: Arc<AppState>, notification: PushNotification) {
        match Self::handle_notification(&state, &notification).await {
            Ok(()) => {}
            Err(AppError::ChannelUnresolvable(channel)) => {
                warn!(
                    "Dropping push notification for unresolvable channel {} (push channel {:?})",
                    channel, notification.channel_id
                );
            }
            Err(e) => {
                warn!(
                    "Failed to process push notification {:?} for {:?}: {}",
                    notification.message_number, notification.resource_uri, e
                );
            }
        }
    }
}

/// Message block for one updated event, `None` for cancelled or untitled events.
pub fn format_new_event(event: &NormalizedEvent) -> Option<String> {
    if event.is_cancelled() {
        return None;
    }
    let title = event.title.as_deref()?;

    let date = if event.all_day {
        event.date_label.clone()
    } else {
        let mut date = format!(
            "{}   {}",
            event.start.format("%A"),
            event.start.format("%d.%m.%Y   %H:%M")
        );
        if let Some(duration) = event.duration {
            date.push_str(&format!("\nDuration: {}", format_duration(duration)));
        }
        date
    };

    let mut block = format!("**{}**\n\n{}\n", title, date);
    if let Some(ref description) = event.description {
        block.push_str(&format!("\n{}\n", description));
    }
    Some(block)
}

/// `"N days"` from one day up, `"MM minutes"` under an hour, `"H:MM hours"` otherwise.
pub fn format_duration(duration: Duration) -> String {
    let days = duration.num_days();
    if days > 0 {
        return format!("{} days", days);
    }

    let secs = duration.num_seconds().max(0);
    if secs < 3600 {
        format!("{:02} minutes", secs / 60)
    } else {
        format!("{}:{:02} hours", secs / 3600, (secs % 3600) / 60)
    }
}
