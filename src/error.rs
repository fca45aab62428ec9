use crate::i18n;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The provider refused access to a calendar (401/403/404).
    #[error("Access denied for calendar: {0}")]
    AccessDenied(String),

    #[error("Calendar provider error: {0}")]
    Provider(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Already watching calendar: {0}")]
    AlreadyWatching(String),

    #[error("Channel cannot be resolved: {0}")]
    ChannelUnresolvable(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Discord error: {0}")]
    Discord(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Text posted back to the chat channel when a command fails.
    ///
    /// `service_account` is the address users have to share their calendar
    /// with; it is quoted in access-related messages.
    pub fn user_message(&self, service_account: &str) -> String {
        match self {
            AppError::AccessDenied(calendar_id) => i18n::t_with(
                "errors.access_denied",
                &[("email", service_account), ("calendar_id", calendar_id)],
            ),
            AppError::Provider(msg) => i18n::t_with("errors.provider", &[("err", msg)]),
            AppError::NotFound(msg) => i18n::t_with("errors.not_found", &[("what", msg)]),
            AppError::AlreadyWatching(_) => i18n::t("watch.already_watching"),
            AppError::ChannelUnresolvable(_) => i18n::t("errors.channel_unresolvable"),
            AppError::BadRequest(msg) => i18n::t_with("errors.invalid_input", &[("err", msg)]),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                i18n::t("errors.internal")
            }
            AppError::Discord(msg) => {
                tracing::error!("Discord error: {}", msg);
                i18n::t("errors.internal")
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                i18n::t("errors.internal")
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                i18n::t("errors.internal")
            }
            AppError::Serialization(e) => {
                tracing::error!("Serialization error: {:?}", e);
                i18n::t("errors.internal")
            }
            AppError::Jwt(e) => {
                tracing::error!("JWT error: {:?}", e);
                i18n::t("errors.internal")
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_mentions_account_and_calendar() {
        let msg = AppError::AccessDenied("abc@provider".to_string())
            .user_message("bot@project.iam.gserviceaccount.com");
        assert!(msg.contains("bot@project.iam.gserviceaccount.com"));
        assert!(msg.contains("abc@provider"));
    }

    #[test]
    fn provider_message_is_passed_through() {
        let msg = AppError::Provider("quota exceeded".to_string()).user_message("x");
        assert!(msg.contains("quota exceeded"));
    }

    #[test]
    fn internal_errors_are_not_leaked() {
        let msg = AppError::Discord("401 Unauthorized: token=secret".to_string()).user_message("x");
        assert!(!msg.contains("secret"));
    }
}
