use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::WatchSubscription;
use crate::db::repository::ChannelRepository;
use crate::error::{AppError, AppResult};
use crate::services::google::WatchRequest;
use crate::AppState;

/// Creates and renews provider push subscriptions ("watches").
///
/// A watch is a lease: the provider stops delivering after its expiration.
/// Renewing opens a new channel and overwrites the stored record; the old
/// provider-side channel is left to lapse on its own.
pub struct SubscriptionManager;

impl SubscriptionManager {
    /// Start watching `calendar_id` for `channel_id`.
    ///
    /// Fails with `AlreadyWatching` while a stored watch is still live. A
    /// watch whose expiration has passed does not block a new one.
    pub async fn subscribe(
        state: &Arc<AppState>,
        channel_id: &str,
        calendar_id: &str,
    ) -> AppResult<WatchSubscription> {
        let now_ms = Utc::now().timestamp_millis();
        if let Some(doc) = ChannelRepository::find_by_id(&state.db, channel_id).await? {
            if let Some(existing) = doc.watch.get(calendar_id) {
                if existing.is_active_at(now_ms) {
                    return Err(AppError::AlreadyWatching(calendar_id.to_string()));
                }
                info!(
                    "Stored watch for calendar {} in channel {} has expired; replacing it",
                    calendar_id, channel_id
                );
            }
        }

        Self::create_watch(state, channel_id, calendar_id).await
    }

    /// Replace the watch for `calendar_id` with a fresh one.
    ///
    /// Skipped with `ChannelUnresolvable` only when the messenger reports the
    /// channel as gone, so subscriptions of deleted channels run out. A failed
    /// lookup renews anyway: one missed renewal outlives the lease.
    pub async fn renew(
        state: &Arc<AppState>,
        channel_id: &str,
        calendar_id: &str,
    ) -> AppResult<WatchSubscription> {
        match state.messenger.channel_exists(channel_id).await {
            Ok(true) => {}
            Ok(false) => return Err(AppError::ChannelUnresolvable(channel_id.to_string())),
            Err(e) => warn!(
                "Could not check channel {} before renewing {}, renewing anyway: {}",
                channel_id, calendar_id, e
            ),
        }

        let subscription = Self::create_watch(state, channel_id, calendar_id).await?;
        info!(
            "Renewed watch for calendar {} in channel {} (expires {:?})",
            calendar_id, channel_id, subscription.expiration
        );
        Ok(subscription)
    }

    /// Open a push channel at the provider and persist it. Nothing is
    /// written when the provider refuses.
    async fn create_watch(
        state: &Arc<AppState>,
        channel_id: &str,
        calendar_id: &str,
    ) -> AppResult<WatchSubscription> {
        let request = WatchRequest::web_hook(
            Uuid::new_v4().to_string(),
            state.config.server.calendar_callback_url(),
            channel_id.to_string(),
        );

        let response = state
            .calendar
            .watch(calendar_id, &request)
            .await
            .map_err(|e| {
                warn!(
                    "Provider rejected watch for calendar {} (channel {}): {}",
                    calendar_id, channel_id, e
                );
                e
            })?;

        let subscription = WatchSubscription {
            caluuid: request.id,
            token: request.token,
            resource_id: response.resource_id,
            expiration: response.expiration,
        };

        ChannelRepository::upsert_watch(&state.db, channel_id, calendar_id, subscription.clone())
            .await?;

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_state, FakeProvider, RecordingMessenger};

    #[tokio::test]
    async fn subscribe_stores_record_with_channel_token() {
        let provider = Arc::new(FakeProvider::new().with_calendar("abc@provider", "Team", vec![]));
        let state = test_state(provider.clone(), Arc::new(RecordingMessenger::new())).await;

        let sub = SubscriptionManager::subscribe(&state, "555", "abc@provider")
            .await
            .unwrap();
        assert_eq!(sub.token, "555");

        let doc = ChannelRepository::find_by_id(&state.db, "555")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.watch.get("abc@provider"), Some(&sub));

        let calls = provider.watch_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.channel_type, "web_hook");
        assert_eq!(calls[0].1.address, "http://localhost:8080/webhooks/calendar");
        assert!(Uuid::parse_str(&calls[0].1.id).is_ok());
    }

    #[tokio::test]
    async fn live_watch_blocks_second_subscribe() {
        let provider = Arc::new(FakeProvider::new().with_calendar("abc@provider", "Team", vec![]));
        let state = test_state(provider.clone(), Arc::new(RecordingMessenger::new())).await;

        SubscriptionManager::subscribe(&state, "555", "abc@provider")
            .await
            .unwrap();
        let err = SubscriptionManager::subscribe(&state, "555", "abc@provider")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyWatching(_)));
        assert_eq!(provider.watch_calls().len(), 1);
    }

    #[tokio::test]
    async fn expired_watch_is_replaced() {
        let provider = Arc::new(FakeProvider::new().with_calendar("abc@provider", "Team", vec![]));
        let state = test_state(provider.clone(), Arc::new(RecordingMessenger::new())).await;

        ChannelRepository::upsert_watch(
            &state.db,
            "555",
            "abc@provider",
            WatchSubscription {
                caluuid: "old".into(),
                token: "555".into(),
                resource_id: "old-resource".into(),
                expiration: Some(1),
            },
        )
        .await
        .unwrap();

        let sub = SubscriptionManager::subscribe(&state, "555", "abc@provider")
            .await
            .unwrap();
        assert_ne!(sub.caluuid, "old");

        let doc = ChannelRepository::find_by_id(&state.db, "555")
            .await
            .unwrap()
            .unwrap();
        let stored = doc.watch.get("abc@provider").unwrap();
        assert_ne!(stored.caluuid, "old");
        assert_ne!(stored.resource_id, "old-resource");
    }

    #[tokio::test]
    async fn renew_overwrites_without_duplicate_check() {
        let provider = Arc::new(FakeProvider::new().with_calendar("abc@provider", "Team", vec![]));
        let state = test_state(provider.clone(), Arc::new(RecordingMessenger::new())).await;

        let first = SubscriptionManager::subscribe(&state, "555", "abc@provider")
            .await
            .unwrap();
        let second = SubscriptionManager::renew(&state, "555", "abc@provider")
            .await
            .unwrap();
        assert_ne!(first.caluuid, second.caluuid);

        let doc = ChannelRepository::find_by_id(&state.db, "555")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.watch.len(), 1);
        assert_eq!(doc.watch.get("abc@provider"), Some(&second));
    }

    #[tokio::test]
    async fn renew_skips_deleted_channels() {
        let provider = Arc::new(FakeProvider::new().with_calendar("abc@provider", "Team", vec![]));
        let messenger = Arc::new(RecordingMessenger::new().without_channel("555"));
        let state = test_state(provider.clone(), messenger).await;

        let err = SubscriptionManager::renew(&state, "555", "abc@provider")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ChannelUnresolvable(_)));
        assert!(provider.watch_calls().is_empty());
    }

    #[tokio::test]
    async fn renew_survives_failed_channel_lookup() {
        let provider = Arc::new(FakeProvider::new().with_calendar("abc@provider", "Team", vec![]));
        let messenger = Arc::new(RecordingMessenger::new().failing_lookups());
        let state = test_state(provider.clone(), messenger).await;

        let renewed = SubscriptionManager::renew(&state, "555", "abc@provider")
            .await
            .unwrap();
        assert_eq!(provider.watch_calls().len(), 1);

        let doc = ChannelRepository::find_by_id(&state.db, "555")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.watch.get("abc@provider"), Some(&renewed));
    }

    #[tokio::test]
    async fn provider_failure_persists_nothing() {
        let provider = Arc::new(
            FakeProvider::new()
                .with_calendar("abc@provider", "Team", vec![])
                .fail_watch("push notifications are not supported"),
        );
        let state = test_state(provider, Arc::new(RecordingMessenger::new())).await;

        let err = SubscriptionManager::subscribe(&state, "555", "abc@provider")
            .await
            .unwrap_err();
        assert!(
            matches!(err, AppError::Provider(msg) if msg == "push notifications are not supported")
        );
        assert!(ChannelRepository::find_by_id(&state.db, "555")
            .await
            .unwrap()
            .is_none());
    }
}
