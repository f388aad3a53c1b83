//! Inline keyboards and the bot command menu

use sova_ipc::{InlineButton, InlineKeyboard};

pub const SET_MODEL_PREFIX: &str = "set_model:";
pub const DONATE_SENT: &str = "donate_sent";

/// Telegram caps `callback_data` at 64 bytes.
const MAX_CALLBACK_DATA_BYTES: usize = 64;

/// Commands published through `setMyCommands`.
pub const BOT_COMMANDS: &[(&str, &str)] = &[
    ("start", "Restart the bot"),
    ("help", "How to use the bot"),
    ("mode", "Choose a model"),
    ("search", "Search the web"),
    ("clear", "Clear the conversation"),
    ("system", "Show or set the assistant role"),
    ("tts", "Toggle voice replies"),
    ("profile", "Your profile and referral link"),
    ("donate", "Support the project"),
    ("feedback", "Send feedback to the developer"),
];

/// Model picker: two buttons per row, in menu order.
pub fn model_keyboard<'a, I>(models: I) -> InlineKeyboard
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let buttons: Vec<InlineButton> = models
        .into_iter()
        .filter_map(|(label, id)| {
            let data = format!("{}{}", SET_MODEL_PREFIX, id);
            if data.len() > MAX_CALLBACK_DATA_BYTES {
                tracing::warn!("Model id '{}' is too long for callback data; skipped", id);
                return None;
            }
            Some(InlineButton::new(label, data))
        })
        .collect();

    buttons.chunks(2).map(|row| row.to_vec()).collect()
}

pub fn donate_keyboard() -> InlineKeyboard {
    vec![vec![InlineButton::new("✅ I sent a donation", DONATE_SENT)]]
}

/// Model id carried by a `set_model:` callback.
pub fn parse_set_model(data: &str) -> Option<&str> {
    data.strip_prefix(SET_MODEL_PREFIX)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

pub fn commands_payload() -> serde_json::Value {
    serde_json::Value::Array(
        BOT_COMMANDS
            .iter()
            .map(|(command, description)| {
                serde_json::json!({ "command": command, "description": description })
            })
            .collect(),
    )
}
