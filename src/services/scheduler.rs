use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, Timelike};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::db::models::ChannelDocument;
use crate::db::repository::ChannelRepository;
use crate::error::{AppError, AppResult};
use crate::services::display::DisplayService;
use crate::services::subscriptions::SubscriptionManager;
use crate::AppState;

/// Work found by one sweep over the store.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepPlan {
    /// (channel id, calendar id) pairs whose watch must be renewed.
    pub renewals: Vec<(String, String)>,
    /// Channels due for their weekly grid.
    pub auto_displays: Vec<String>,
}

/// Periodic sweep that keeps watches alive and posts weekly grids.
pub struct RenewalScheduler;

impl RenewalScheduler {
    /// Decide what the sweep at `now` has to do. Pure, so the renewal and
    /// auto-display rules can be checked without a clock or a provider.
    pub fn plan(
        channels: &[(String, ChannelDocument)],
        now: DateTime<Local>,
        config: &SchedulerConfig,
    ) -> SweepPlan {
        let now_ms = now.timestamp_millis();
        let threshold_ms = config.renewal_threshold_seconds * 1000;
        let today = now.date_naive();
        let weekday = now.weekday().number_from_monday();

        let mut plan = SweepPlan::default();
        for (channel_id, doc) in channels {
            for (calendar_id, watch) in doc.watch.iter() {
                if watch.needs_renewal(now_ms, threshold_ms) {
                    plan.renewals
                        .push((channel_id.clone(), calendar_id.to_string()));
                }
            }

            let due = doc.auto_display.map(u32::from) == Some(weekday)
                && now.hour() < config.auto_display_cutoff_hour
                && doc.auto_display_last_fired != Some(today);
            if due {
                plan.auto_displays.push(channel_id.clone());
            }
        }
        plan
    }

    /// Load all channels, plan, and hand every piece of work to its own task.
    /// The spawned tasks are not awaited.
    pub async fn sweep(state: &Arc<AppState>) -> AppResult<SweepPlan> {
        let channels = ChannelRepository::list_all(&state.db).await?;
        let plan = Self::plan(&channels, Local::now(), &state.config.scheduler);

        info!(
            "Sweep over {} channel(s): {} renewal(s), {} auto-display(s)",
            channels.len(),
            plan.renewals.len(),
            plan.auto_displays.len()
        );

        for (channel_id, calendar_id) in plan.renewals.iter().cloned() {
            let state = state.clone();
            tokio::spawn(async move {
                match SubscriptionManager::renew(&state, &channel_id, &calendar_id).await {
                    Ok(_) => {}
                    Err(AppError::ChannelUnresolvable(_)) => {
                        info!(
                            "Channel {} is gone; letting watch for {} lapse",
                            channel_id, calendar_id
                        );
                    }
                    Err(e) => warn!(
                        "Failed to renew watch for calendar {} in channel {}: {}",
                        calendar_id, channel_id, e
                    ),
                }
            });
        }

        for channel_id in plan.auto_displays.iter().cloned() {
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::auto_display(&state, &channel_id).await {
                    warn!("Auto-display for channel {} failed: {}", channel_id, e);
                }
            });
        }

        Ok(plan)
    }

    /// Post the weekly grid and remember the day it went out.
    async fn auto_display(state: &Arc<AppState>, channel_id: &str) -> AppResult<()> {
        if !state.messenger.channel_exists(channel_id).await? {
            return Err(AppError::ChannelUnresolvable(channel_id.to_string()));
        }

        let today = Local::now().date_naive();
        let content = match DisplayService::grid_for(
            state,
            channel_id,
            state.config.scheduler.auto_display_days,
            today,
        )
        .await
        {
            Ok(content) => content,
            Err(e @ AppError::AccessDenied(_)) => {
                e.user_message(state.calendar.service_account_email())
            }
            Err(e) => return Err(e),
        };

        state.messenger.send_text(channel_id, &content).await?;
        ChannelRepository::mark_auto_display_fired(&state.db, channel_id, today).await?;
        debug!("Auto-display posted to channel {}", channel_id);
        Ok(())
    }

    /// Sweep immediately, then every `interval_seconds`, until shutdown.
    pub async fn run(state: Arc<AppState>, mut shutdown_rx: broadcast::Receiver<()>) {
        let interval = std::time::Duration::from_secs(state.config.scheduler.interval_seconds);

        loop {
            if let Err(e) = Self::sweep(&state).await {
                warn!("Renewal sweep failed: {:?}", e);
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Renewal scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
