//! Command and callback-query parsing (spec §4.7), plus the static inline
//! keyboards offered from `/settings`, `/model`, and `/thinking`.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

pub const MODEL_CHOICES: &[(&str, &str)] = &[
    ("anthropic", "claude-opus"),
    ("anthropic", "claude-sonnet"),
    ("openai", "gpt-5"),
];

pub const THINKING_LEVELS: &[&str] = &["low", "medium", "high"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Settings,
    Cancel,
    New,
    Delete,
    Share,
    Model,
    Thinking,
    Auth,
    Steer(String),
}

impl Command {
    /// Parses a leading-slash command, stripping any `@botname` suffix
    /// Telegram appends in group chats.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((h, r)) => (h, r.trim()),
            None => (text, ""),
        };
        let head = head.split('@').next().unwrap_or(head);
        match head {
            "/start" => Some(Command::Start),
            "/help" => Some(Command::Help),
            "/settings" => Some(Command::Settings),
            "/cancel" => Some(Command::Cancel),
            "/new" => Some(Command::New),
            "/delete" => Some(Command::Delete),
            "/share" => Some(Command::Share),
            "/model" => Some(Command::Model),
            "/thinking" => Some(Command::Thinking),
            "/auth" => Some(Command::Auth),
            "/steer" => Some(Command::Steer(rest.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Settings(String),
    Auth(String),
    Model { provider: String, model_id: String },
    Thinking(String),
    Unknown,
}

impl CallbackAction {
    /// Parses the compact `s: a: m: t:` callback-data prefixes (spec §4.7).
    /// Anything else, including a malformed `m:` payload, is `Unknown` —
    /// callers fall back to re-rendering the settings panel.
    pub fn parse(data: &str) -> Self {
        let Some((prefix, rest)) = data.split_once(':') else {
            return CallbackAction::Unknown;
        };
        match prefix {
            "s" => CallbackAction::Settings(rest.to_string()),
            "a" => CallbackAction::Auth(rest.to_string()),
            "m" => match rest.split_once(':') {
                Some((provider, model_id)) => CallbackAction::Model {
                    provider: provider.to_string(),
                    model_id: model_id.to_string(),
                },
                None => CallbackAction::Unknown,
            },
            "t" => CallbackAction::Thinking(rest.to_string()),
            _ => CallbackAction::Unknown,
        }
    }
}

pub fn settings_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new([
        [
            InlineKeyboardButton::callback("Model", "s:model"),
            InlineKeyboardButton::callback("Thinking", "s:thinking"),
        ],
        [
            InlineKeyboardButton::callback("Auth", "s:auth"),
            InlineKeyboardButton::callback("Delete session", "s:del:confirm"),
        ],
    ])
}

pub fn delete_confirm_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new([[
        InlineKeyboardButton::callback("Yes, delete", "s:del:yes"),
        InlineKeyboardButton::callback("Cancel", "s:del:no"),
    ]])
}

pub fn model_keyboard() -> InlineKeyboardMarkup {
    let rows = MODEL_CHOICES
        .iter()
        .map(|(provider, model_id)| {
            [InlineKeyboardButton::callback(
                format!("{provider}/{model_id}"),
                format!("m:{provider}:{model_id}"),
            )]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

pub fn thinking_keyboard() -> InlineKeyboardMarkup {
    let rows = THINKING_LEVELS
        .iter()
        .map(|level| [InlineKeyboardButton::callback(*level, format!("t:{level}"))])
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_steer_with_argument() {
        assert_eq!(Command::parse("/steer stop and summarize"), Some(Command::Steer("stop and summarize".to_string())));
    }

    #[test]
    fn parses_command_with_botname_suffix() {
        assert_eq!(Command::parse("/help@my_bot"), Some(Command::Help));
    }

    #[test]
    fn non_command_text_is_none() {
        assert_eq!(Command::parse("hello there"), None);
    }

    #[test]
    fn callback_action_parses_model_pair() {
        assert_eq!(
            CallbackAction::parse("m:anthropic:claude-opus"),
            CallbackAction::Model {
                provider: "anthropic".to_string(),
                model_id: "claude-opus".to_string()
            }
        );
    }

    #[test]
    fn callback_action_malformed_model_is_unknown() {
        assert_eq!(CallbackAction::parse("m:anthropic"), CallbackAction::Unknown);
    }

    #[test]
    fn callback_action_unprefixed_is_unknown() {
        assert_eq!(CallbackAction::parse("nocolon"), CallbackAction::Unknown);
    }
}
