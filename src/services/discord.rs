use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// Discord rejects message content above this many characters.
pub const MESSAGE_LIMIT: usize = 2000;

/// Outbound side of the chat platform, owned by `AppState` and shared by
/// command handling, the scheduler and the webhook intake.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Post text to a channel, splitting it when it exceeds the message limit.
    async fn send_text(&self, channel_id: &str, content: &str) -> AppResult<()>;

    /// Whether the bot can still see the channel. Deleted channels and
    /// channels the bot was removed from report `false`.
    async fn channel_exists(&self, channel_id: &str) -> AppResult<bool>;
}

#[derive(Clone)]
pub struct DiscordService {
    client: reqwest::Client,
    bot_token: String,
    api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordMessage {
    pub content: Option<String>,
    pub tts: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_mentions: Option<AllowedMentions>,
}

/// Calendar titles are user controlled; never let them ping anyone.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AllowedMentions {
    pub parse: Vec<String>,
}

impl DiscordMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tts: None,
            allowed_mentions: Some(AllowedMentions::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordChannel {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub channel_type: u8,
    pub guild_id: Option<String>,
}

impl DiscordService {
    pub fn new(bot_token: String, api_base: String) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Discord(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            bot_token,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}{}", self.api_base, endpoint)
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    /// Parse retry_after from a Discord rate limit error response
    fn parse_retry_after(error_text: &str) -> Option<f64> {
        if let Ok(json) = serde_json::from_str::<Value>(error_text) {
            if let Some(retry_after) = json.get("retry_after") {
                return retry_after.as_f64();
            }
        }
        None
    }

    /// Handle rate limiting by waiting for the retry_after duration
    async fn handle_rate_limit(error_text: &str) -> AppResult<()> {
        if let Some(retry_after) = Self::parse_retry_after(error_text) {
            let wait_seconds = (retry_after.ceil() as u64) + 1;
            tracing::warn!(
                "Discord rate limit hit, waiting {} seconds before retry",
                wait_seconds
            );
            tokio::time::sleep(tokio::time::Duration::from_secs(wait_seconds)).await;
            Ok(())
        } else {
            Err(AppError::Discord(format!(
                "Rate limited but could not parse retry_after: {}",
                error_text
            )))
        }
    }

    /// Send a message to a channel. A rate-limited request is retried once
    /// after the advertised delay.
    pub async fn send_message(&self, channel_id: &str, message: &DiscordMessage) -> AppResult<()> {
        let url = self.api_url(&format!("/channels/{}/messages", channel_id));
        let mut rate_limited_once = false;

        loop {
            let response = self
                .client
                .post(&url)
                .header("Authorization", self.auth_header())
                .header("Content-Type", "application/json")
                .json(message)
                .send()
                .await
                .map_err(|e| AppError::Discord(format!("Failed to send message: {}", e)))?;

            let status = response.status();
            if status.is_success() {
                return Ok(());
            }

            let error_text = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS && !rate_limited_once {
                rate_limited_once = true;
                Self::handle_rate_limit(&error_text).await?;
                continue;
            }

            return Err(AppError::Discord(format!(
                "Discord API error ({}): {}",
                status, error_text
            )));
        }
    }

    /// Get a single Discord channel by ID. `None` when Discord answers 403/404.
    pub async fn get_channel(&self, channel_id: &str) -> AppResult<Option<DiscordChannel>> {
        let url = self.api_url(&format!("/channels/{}", channel_id));

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| AppError::Discord(format!("Failed to get channel: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(None);
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Discord(format!(
                "Discord API error ({}): {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| AppError::Discord(format!("Failed to parse channel response: {}", e)))
    }
}

#[async_trait]
impl Messenger for DiscordService {
    async fn send_text(&self, channel_id: &str, content: &str) -> AppResult<()> {
        for chunk in split_message(content, MESSAGE_LIMIT) {
            self.send_message(channel_id, &DiscordMessage::text(chunk))
                .await?;
        }
        Ok(())
    }

    async fn channel_exists(&self, channel_id: &str) -> AppResult<bool> {
        Ok(self.get_channel(channel_id).await?.is_some())
    }
}

/// Split `content` into pieces of at most `limit` characters, breaking on
/// line ends where possible. A leading `>>> ` block quote or a fenced code
/// block is repeated around every piece so formatting survives the split.
pub fn split_message(content: &str, limit: usize) -> Vec<String> {
    if content.chars().count() <= limit {
        return vec![content.to_string()];
    }

    let (open, body, close) = if let Some(body) = content.strip_prefix(">>> ") {
        (">>> ", body, "")
    } else if let Some(inner) = content
        .strip_prefix("```\n")
        .and_then(|rest| rest.strip_suffix("\n```"))
    {
        ("```\n", inner, "\n```")
    } else {
        ("", content, "")
    };

    let budget = limit
        .saturating_sub(open.chars().count() + close.chars().count())
        .max(1);

    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in body.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > budget && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > budget {
            for ch in line.chars() {
                if current_len == budget {
                    pieces.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.push(ch);
                current_len += 1;
            }
        } else {
            current.push_str(line);
            current_len += line_len;
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
        .into_iter()
        .map(|piece| {
            let piece = if close.is_empty() {
                piece.as_str()
            } else {
                piece.trim_end_matches('\n')
            };
            format!("{}{}{}", open, piece, close)
        })
        .collect()
}
