use std::sync::Arc;

use async_trait::async_trait;
use serenity::all::{Client, Context, EventHandler, GatewayIntents, Message, Ready, ShardManager};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::services::commands::{parse_invocation, CommandRouter};
use crate::AppState;

/// Receives chat messages from the Discord gateway and hands prefixed ones to
/// the command router.
pub struct CommandGateway {
    state: Arc<AppState>,
}

impl CommandGateway {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Arguments of a message addressed to the bot. Other bots are ignored.
    fn invocation(&self, from_bot: bool, content: &str) -> Option<Vec<String>> {
        if from_bot {
            return None;
        }
        parse_invocation(&self.state.config.discord.command_prefix, content)
    }

    /// Connect to the gateway in the background. The shard manager is
    /// returned so shutdown can close the connection.
    pub async fn start(state: Arc<AppState>) -> AppResult<(JoinHandle<()>, Arc<ShardManager>)> {
        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = Client::builder(&state.config.discord.bot_token, intents)
            .event_handler(Self::new(state.clone()))
            .await
            .map_err(|e| AppError::Discord(format!("Failed to build gateway client: {}", e)))?;

        let shard_manager = client.shard_manager.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = client.start().await {
                error!("Discord gateway stopped: {}", e);
            }
        });

        Ok((handle, shard_manager))
    }
}

#[async_trait]
impl EventHandler for CommandGateway {
    async fn message(&self, _ctx: Context, msg: Message) {
        let Some(args) = self.invocation(msg.author.bot, &msg.content) else {
            return;
        };

        let channel_id = msg.channel_id.get().to_string();
        debug!("Command from {} in channel {}: {:?}", msg.author.id, channel_id, args);

        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(e) = CommandRouter::handle(&state, &channel_id, &args).await {
                warn!("Failed to answer command in channel {}: {}", channel_id, e);
            }
        });
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(
            "Discord gateway connected as {} ({} guild(s))",
            ready.user.name,
            ready.guilds.len()
        );
    }
}
