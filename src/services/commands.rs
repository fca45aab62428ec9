use std::sync::Arc;

use tracing::{debug, info};

use crate::db::models::DEFAULT_CALENDAR_COLOR;
use crate::db::repository::ChannelRepository;
use crate::error::{AppError, AppResult};
use crate::i18n;
use crate::services::display::DisplayService;
use crate::services::subscriptions::SubscriptionManager;
use crate::AppState;

const DEFAULT_DISPLAY_DAYS: u32 = 7;
const MAX_DISPLAY_DAYS: u32 = 366;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Register,
    SetColor,
    SetAutoDisplay,
    Display,
    Grid,
    Watch,
    ChannelInfo,
    Help,
    ExtendedHelp,
}

/// Every accepted command word, synonyms included.
const COMMAND_NAMES: &[(&str, Command)] = &[
    ("register", Command::Register),
    ("set-color", Command::SetColor),
    ("color", Command::SetColor),
    ("set-auto-display", Command::SetAutoDisplay),
    ("autodisplay", Command::SetAutoDisplay),
    ("display", Command::Display),
    ("show", Command::Display),
    ("grid", Command::Grid),
    ("table", Command::Grid),
    ("week", Command::Grid),
    ("watch", Command::Watch),
    ("push", Command::Watch),
    ("notifyeventcreation", Command::Watch),
    ("info", Command::ChannelInfo),
    ("channelinfo", Command::ChannelInfo),
    ("channel-info", Command::ChannelInfo),
    ("channel info", Command::ChannelInfo),
    ("help", Command::Help),
    ("extendedhelp", Command::ExtendedHelp),
];

impl Command {
    pub fn lookup(name: &str) -> Option<Command> {
        let name = name.trim().to_lowercase();
        COMMAND_NAMES
            .iter()
            .find(|(word, _)| *word == name)
            .map(|(_, command)| *command)
    }
}

/// Split arguments on whitespace; double quotes group words into one argument.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// Arguments after `prefix` if `content` is addressed to the bot.
pub fn parse_invocation(prefix: &str, content: &str) -> Option<Vec<String>> {
    let rest = content.trim_start().strip_prefix(prefix)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(tokenize(rest))
}

fn is_hex_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Day count argument; anything that is not a plain number keeps the default.
fn parse_days(arg: Option<&String>) -> u32 {
    arg.and_then(|raw| raw.parse::<u32>().ok())
        .map(|days| days.min(MAX_DISPLAY_DAYS))
        .unwrap_or(DEFAULT_DISPLAY_DAYS)
}

/// Runs chat commands against the core services and replies via the messenger.
pub struct CommandRouter;

impl CommandRouter {
    /// Handle one invocation and post the replies to `channel_id`.
    pub async fn handle(state: &Arc<AppState>, channel_id: &str, args: &[String]) -> AppResult<()> {
        for reply in Self::execute(state, channel_id, args).await {
            state.messenger.send_text(channel_id, &reply).await?;
        }
        Ok(())
    }

    /// Replies for one invocation. Failures become user-facing messages.
    pub async fn execute(state: &Arc<AppState>, channel_id: &str, args: &[String]) -> Vec<String> {
        let (command, rest) = match Self::resolve(args) {
            Some(found) => found,
            None => {
                debug!("Unknown command {:?} in channel {}", args.first(), channel_id);
                (Command::Help, &args[args.len().min(1)..])
            }
        };

        info!("Command {:?} in channel {}", command, channel_id);
        let result = match command {
            Command::Register => Self::register(state, channel_id, rest).await,
            Command::SetColor => Self::set_color(state, channel_id, rest).await,
            Command::SetAutoDisplay => Self::set_auto_display(state, channel_id, rest).await,
            Command::Display => {
                let filter = rest.get(1).map(|name| vec![name.clone()]);
                DisplayService::text_listing(
                    state,
                    channel_id,
                    parse_days(rest.first()),
                    filter.as_deref(),
                )
                .await
                .map(|text| vec![text])
            }
            Command::Grid => DisplayService::grid(state, channel_id, parse_days(rest.first()))
                .await
                .map(|text| vec![text]),
            Command::Watch => Self::watch(state, channel_id, rest).await,
            Command::ChannelInfo => Self::channel_info(state, channel_id).await,
            Command::Help => Ok(vec![Self::text_with_prefix(state, "help.text")]),
            Command::ExtendedHelp => Ok(vec![Self::text_with_prefix(state, "help.extended")]),
        };

        result.unwrap_or_else(|e| vec![e.user_message(state.calendar.service_account_email())])
    }

    /// Command and its remaining arguments. `channel info` given as two words
    /// is accepted as well.
    fn resolve(args: &[String]) -> Option<(Command, &[String])> {
        let first = args.first()?;
        if let Some(command) = Command::lookup(first) {
            return Some((command, &args[1..]));
        }
        let second = args.get(1)?;
        Command::lookup(&format!("{} {}", first, second)).map(|command| (command, &args[2..]))
    }

    fn text_with_prefix(state: &Arc<AppState>, key: &str) -> String {
        i18n::t_with(key, &[("prefix", &state.config.discord.command_prefix)])
    }

    fn usage(state: &Arc<AppState>, key: &str) -> String {
        i18n::t_with(
            key,
            &[
                ("prefix", &state.config.discord.command_prefix),
                ("email", state.calendar.service_account_email()),
            ],
        )
    }

    async fn register(
        state: &Arc<AppState>,
        channel_id: &str,
        args: &[String],
    ) -> AppResult<Vec<String>> {
        let Some(calendar_id) = args.first() else {
            return Ok(vec![Self::usage(state, "register.usage")]);
        };

        let name = state.calendar.calendar_summary(calendar_id).await?;

        let color = ChannelRepository::find_by_id(&state.db, channel_id)
            .await?
            .and_then(|doc| doc.display.get(calendar_id).map(|r| r.color.clone()))
            .unwrap_or_else(|| DEFAULT_CALENDAR_COLOR.to_string());

        let registrations =
            ChannelRepository::upsert_calendar(&state.db, channel_id, calendar_id, &name, &color)
                .await?;

        Ok(vec![i18n::t_with(
            "register.success",
            &[("count", &registrations.len().to_string())],
        )])
    }

    async fn set_color(
        state: &Arc<AppState>,
        channel_id: &str,
        args: &[String],
    ) -> AppResult<Vec<String>> {
        let (Some(calendar_id), Some(color)) = (args.first(), args.get(1)) else {
            return Ok(vec![Self::usage(state, "set_color.usage")]);
        };
        if !is_hex_color(color) {
            return Ok(vec![i18n::t_with("set_color.invalid", &[("color", color)])]);
        }

        let registration =
            ChannelRepository::upsert_color(&state.db, channel_id, calendar_id, color).await?;
        Ok(vec![i18n::t_with(
            "set_color.success",
            &[("name", &registration.name), ("color", color)],
        )])
    }

    async fn set_auto_display(
        state: &Arc<AppState>,
        channel_id: &str,
        args: &[String],
    ) -> AppResult<Vec<String>> {
        let Some(weekday) = args
            .first()
            .and_then(|raw| raw.parse::<u8>().ok())
            .filter(|day| *day <= 7)
        else {
            return Ok(vec![Self::usage(state, "auto_display.usage")]);
        };

        ChannelRepository::upsert_auto_display(&state.db, channel_id, weekday).await?;

        Ok(vec![if weekday == 0 {
            i18n::t("auto_display.disabled")
        } else {
            i18n::t_with(
                "auto_display.enabled",
                &[("weekday", &i18n::weekday_name(u32::from(weekday)))],
            )
        }])
    }

    async fn watch(
        state: &Arc<AppState>,
        channel_id: &str,
        args: &[String],
    ) -> AppResult<Vec<String>> {
        let Some(calendar_id) = args.first() else {
            return Ok(vec![Self::usage(state, "watch.usage")]);
        };

        match SubscriptionManager::subscribe(state, channel_id, calendar_id).await {
            Ok(_) => Ok(vec![i18n::t("watch.started")]),
            Err(AppError::AlreadyWatching(_)) => Ok(vec![i18n::t("watch.already_watching")]),
            Err(e) => Err(e),
        }
    }

    async fn channel_info(state: &Arc<AppState>, channel_id: &str) -> AppResult<Vec<String>> {
        let doc = ChannelRepository::find_by_id(&state.db, channel_id).await?;
        match doc {
            Some(doc) if doc != Default::default() => Ok(vec![
                i18n::t("info.header"),
                format!(">>> {}", serde_json::to_string_pretty(&doc)?),
            ]),
            _ => Ok(vec![i18n::t("info.empty")]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{all_day, test_state, FakeProvider, RecordingMessenger};

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn synonyms_resolve_to_one_command() {
        for word in ["display", "show", "DISPLAY"] {
            assert_eq!(Command::lookup(word), Some(Command::Display));
        }
        for word in ["watch", "push", "notifyeventcreation"] {
            assert_eq!(Command::lookup(word), Some(Command::Watch));
        }
        for word in ["info", "channelinfo", "channel-info", "channel info"] {
            assert_eq!(Command::lookup(word), Some(Command::ChannelInfo));
        }
        assert_eq!(Command::lookup("table"), Some(Command::Grid));
        assert_eq!(Command::lookup("delete"), None);
    }

    #[test]
    fn quotes_group_words() {
        assert_eq!(
            tokenize(r#"display 7 "Team Calendar""#),
            vec!["display", "7", "Team Calendar"]
        );
        assert_eq!(tokenize(r#""channel info""#), vec!["channel info"]);
        assert_eq!(tokenize("  register   abc@x  "), vec!["register", "abc@x"]);
        assert_eq!(tokenize(r#"show 7 """#), vec!["show", "7", ""]);
    }

    #[test]
    fn prefix_must_be_a_whole_word() {
        assert_eq!(
            parse_invocation("!calendar", "!calendar show 14"),
            Some(args(&["show", "14"]))
        );
        assert_eq!(parse_invocation("!calendar", "!calendar"), Some(vec![]));
        assert_eq!(parse_invocation("!calendar", "!calendars show"), None);
        assert_eq!(parse_invocation("!calendar", "hello"), None);
    }

    #[test]
    fn day_argument_falls_back_to_a_week() {
        assert_eq!(parse_days(Some(&"14".to_string())), 14);
        assert_eq!(parse_days(Some(&"two".to_string())), 7);
        assert_eq!(parse_days(None), 7);
    }

    #[tokio::test]
    async fn unknown_or_missing_command_shows_help() {
        let state = test_state(
            Arc::new(FakeProvider::new()),
            Arc::new(RecordingMessenger::new()),
        )
        .await;
        let help = i18n::t_with("help.text", &[("prefix", "!calendar")]);

        assert_eq!(CommandRouter::execute(&state, "1", &[]).await, vec![help.clone()]);
        assert_eq!(
            CommandRouter::execute(&state, "1", &args(&["delete", "x"])).await,
            vec![help]
        );
    }

    #[tokio::test]
    async fn register_then_show() {
        let provider = Arc::new(FakeProvider::new().with_calendar(
            "abc@provider",
            "Team",
            vec![all_day("Holiday", "2024-05-07")],
        ));
        let state = test_state(provider, Arc::new(RecordingMessenger::new())).await;

        let replies = CommandRouter::execute(&state, "1", &args(&["register", "abc@provider"])).await;
        assert_eq!(
            replies,
            vec!["Calendar Bot now knows that 1 calendar(s) belong to this channel"]
        );

        let replies = CommandRouter::execute(&state, "1", &args(&["show"])).await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with(">>> "));
        assert!(replies[0].contains("**Holiday**   (Team)"));
    }

    #[tokio::test]
    async fn register_denied_calendar_explains_sharing() {
        let provider = Arc::new(FakeProvider::new().deny("secret@x"));
        let state = test_state(provider, Arc::new(RecordingMessenger::new())).await;

        let replies = CommandRouter::execute(&state, "1", &args(&["register", "secret@x"])).await;
        assert!(replies[0].contains("secret@x"));
        assert!(replies[0].contains("bot@project.iam.gserviceaccount.com"));
        assert!(ChannelRepository::find_by_id(&state.db, "1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn set_color_validates_and_updates() {
        let provider = Arc::new(FakeProvider::new().with_calendar("abc@provider", "Team", vec![]));
        let state = test_state(provider, Arc::new(RecordingMessenger::new())).await;

        let replies =
            CommandRouter::execute(&state, "1", &args(&["color", "abc@provider", "red"])).await;
        assert!(replies[0].contains("`red` is not a color"));

        let replies =
            CommandRouter::execute(&state, "1", &args(&["set-color", "abc@provider", "#ff0000"]))
                .await;
        assert!(replies[0].contains("Calendar Bot could not find"));

        CommandRouter::execute(&state, "1", &args(&["register", "abc@provider"])).await;
        let replies =
            CommandRouter::execute(&state, "1", &args(&["set-color", "abc@provider", "#ff0000"]))
                .await;
        assert_eq!(replies, vec!["Calendar Team is now drawn in #ff0000"]);
    }

    #[tokio::test]
    async fn auto_display_accepts_zero_to_seven() {
        let state = test_state(
            Arc::new(FakeProvider::new()),
            Arc::new(RecordingMessenger::new()),
        )
        .await;

        let replies = CommandRouter::execute(&state, "1", &args(&["autodisplay", "8"])).await;
        assert!(replies[0].contains("set-auto-display <1-7>"));

        let replies = CommandRouter::execute(&state, "1", &args(&["set-auto-display", "1"])).await;
        assert!(replies[0].contains("Monday"));

        CommandRouter::execute(&state, "1", &args(&["set-auto-display", "0"])).await;
        let doc = ChannelRepository::find_by_id(&state.db, "1").await.unwrap().unwrap();
        assert_eq!(doc.auto_display, Some(0));
    }

    #[tokio::test]
    async fn watch_twice_reports_already_watching() {
        let provider = Arc::new(FakeProvider::new().with_calendar("abc@provider", "Team", vec![]));
        let messenger = Arc::new(RecordingMessenger::new());
        let state = test_state(provider, messenger.clone()).await;

        CommandRouter::handle(&state, "1", &args(&["push", "abc@provider"]))
            .await
            .unwrap();
        CommandRouter::handle(&state, "1", &args(&["watch", "abc@provider"]))
            .await
            .unwrap();

        let sent: Vec<String> = messenger.sent().into_iter().map(|(_, text)| text).collect();
        assert_eq!(
            sent,
            vec![i18n::t("watch.started"), i18n::t("watch.already_watching")]
        );
    }

    #[tokio::test]
    async fn channel_info_two_words() {
        let state = test_state(
            Arc::new(FakeProvider::new().with_calendar("abc@provider", "Team", vec![])),
            Arc::new(RecordingMessenger::new()),
        )
        .await;

        let replies = CommandRouter::execute(&state, "1", &args(&["channel", "info"])).await;
        assert_eq!(replies, vec![i18n::t("info.empty")]);

        CommandRouter::execute(&state, "1", &args(&["register", "abc@provider"])).await;
        let replies = CommandRouter::execute(&state, "1", &args(&["info"])).await;
        assert_eq!(replies[0], i18n::t("info.header"));
        assert!(replies[1].contains("abc@provider"));
    }
}
