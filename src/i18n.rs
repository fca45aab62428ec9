/*
Message catalog for everything the bot posts into a channel.

This module provides:
- An embedded English catalog (compile-time embedded JSON).
- `t` / `t_with` to look up a message by key, with optional params.

Usage:
    use crate::i18n;
    let msg = i18n::t("display.no_events");
    let msg_with = i18n::t_with("register.success", &[("count", "2")]);

Notes:
- Placeholders in messages use single-brace format: `{name}`.
- A missing key is returned as-is.
*/

use std::collections::HashMap;
use std::sync::OnceLock;

static MESSAGES: OnceLock<HashMap<String, String>> = OnceLock::new();

const EN_JSON: &str = r#"
{
  "help.text": "Calendar Bot can display a Google Calendar or notify you of newly created events.\n\nCommands:\n`{prefix} register <Google Calendar ID>` Calendar Bot will remember your Google Calendar and can later display it. You can register multiple Calendars in a single Channel.\n`{prefix} display` show Events in the registered Calendars for the next 7 days.\n`{prefix} display 14` You can adjust the timespan for the displayed Events. Here the timespan is set to 14 days.\n`{prefix} display 7 \"<calendar name>\"` Calendar Bot can display a specific calendar indicated by their name.\n`{prefix} grid` draws the registered Calendars as a weekly table for the next 7 days. `{prefix} grid 14` works as well.\n`{prefix} set-color <Google Calendar ID> <#rrggbb>` changes the color of a registered Calendar in the weekly table.\n`{prefix} set-auto-display <1-7>` posts the weekly table every week on that weekday (1 = Monday). `0` turns it off.\n`{prefix} watch <Google Calendar ID>` Calendar Bot will notify you of newly created Events for the given Calendar.\n`{prefix} info` Calendar Bot shows you which calendars are registered or watched in this channel.\n`{prefix} help` displays this help message again.\n`{prefix} extendedhelp` displays even more help text.\n\nYou can find a Calendar's ID by visiting the webpage of google calendar. Open your Calendar's settings and scroll to the section 'Integrate Calendar'. The ID should look like this: <random numbers and letters>@group.calendar.google.com",
  "help.extended": "There are a few alternative command names:\n`{prefix} display` = `{prefix} show`\n`{prefix} grid` = `table` = `week`\n`{prefix} watch` = `push` = `notifyeventcreation`\n`{prefix} info` = `channelinfo` = `channel-info` = `\"channel info\"`\n`{prefix} set-color` = `color`\n`{prefix} set-auto-display` = `autodisplay`",
  "register.usage": "To register a Google Calendar:\n1. Invite the Email address {email} to have access to your Google Calendar. To do this, visit the webpage of google calendar, open your calendar's settings and scroll to the section 'Share with specific people or groups'.\n2. Then find and copy the Calendar ID in the section 'Integrate Calendar', a little further down.\n3. In this discord channel send the command: `{prefix} register the_calendar_id_you_just_copied`",
  "register.success": "Calendar Bot now knows that {count} calendar(s) belong to this channel",
  "set_color.usage": "To change a calendar's color send: `{prefix} set-color <Google Calendar ID> <#rrggbb>`",
  "set_color.invalid": "`{color}` is not a color. Use the `#rrggbb` form, for example `#7986cb`.",
  "set_color.success": "Calendar {name} is now drawn in {color}",
  "auto_display.usage": "To post the weekly table automatically send: `{prefix} set-auto-display <1-7>` (1 = Monday, 7 = Sunday, 0 = off)",
  "auto_display.enabled": "Calendar Bot will post the weekly table every {weekday} morning",
  "auto_display.disabled": "Calendar Bot will no longer post the weekly table automatically",
  "display.no_calendars": "Calendar Bot does not know any Calendars associated with this channel.",
  "display.no_events": "No events in calendar",
  "watch.usage": "Sign up for event creation notifications for a Google Calendar:\n1. Invite the Email address {email} to have access to your Google Calendar. To do this, visit the webpage of google calendar, open your calendar's settings and scroll to the section 'Share with specific people or groups'.\n2. Then find and copy the Calendar ID in the section 'Integrate Calendar', a little further down.\n3. In this discord channel send the command: `{prefix} watch the_calendar_id_you_just_copied`",
  "watch.already_watching": "Calendar Bot is already listening to push notifications for this Calendar-ID.",
  "watch.started": "Calendar Bot is now listening for push notifications for this Calendar-ID",
  "info.header": "Here is the saved Data for this channel:",
  "info.empty": "There are no calendars registered or watched for this channel. Calendar Bot does not have any saved data to show yet.",
  "webhook.new_event": "New Event created for Calendar {name}",
  "webhook.access_denied": "A registered Calendar has been changed. However, Calendar Bot was not granted access to the Calendar, and cannot tell you anything about the change. Please make sure to invite the Email address: {email} to have access to your Google Calendar. The Calendar ID: {calendar_id}",
  "errors.access_denied": "Calendar Bot was not granted access to a Calendar. Please make sure to invite the Email address: {email} to have access to your Google Calendar. The Calendar ID: {calendar_id}",
  "errors.provider": "Calendar Bot encountered an error when talking to the google calendar api. {err}",
  "errors.not_found": "Calendar Bot could not find {what}",
  "errors.channel_unresolvable": "Calendar Bot cannot see this channel.",
  "errors.invalid_input": "Calendar Bot did not understand that. {err}",
  "errors.internal": "Calendar Bot got an Error. Please try again later.",
  "weekday.1": "Monday",
  "weekday.2": "Tuesday",
  "weekday.3": "Wednesday",
  "weekday.4": "Thursday",
  "weekday.5": "Friday",
  "weekday.6": "Saturday",
  "weekday.7": "Sunday",
  "app.name": "Calendar Bot"
}
"#;

fn messages() -> &'static HashMap<String, String> {
    MESSAGES.get_or_init(|| {
        serde_json::from_str(EN_JSON).unwrap_or_else(|e| {
            panic!("failed to parse EN_JSON in i18n module: {}", e);
        })
    })
}

/// Look up a message. If the key is missing the key itself is returned,
/// which keeps gaps visible in chat and logs.
pub fn t(key: &str) -> String {
    messages()
        .get(key)
        .cloned()
        .unwrap_or_else(|| key.to_string())
}

/// Look up a message and replace its `{name}` placeholders from `params`.
pub fn t_with(key: &str, params: &[(&str, &str)]) -> String {
    params.iter().fold(t(key), |s, (k, v)| s.replace(&format!("{{{}}}", k), v))
}

/// English weekday name for an ISO weekday number (1 = Monday).
pub fn weekday_name(iso_weekday: u32) -> String {
    t(&format!("weekday.{}", iso_weekday))
}
