use crate::chat::SessionSummary;
use async_trait::async_trait;
use std::time::Duration;
use teloxide::{
    prelude::*,
    types::{MessageId, ParseMode},
    utils::{command::BotCommands, markdown},
};
use tracing::info;

/// Longest visitor text quoted in a bot notification, in characters.
pub const PREVIEW_CHARS: usize = 1000;

/// Telegram rejects messages longer than this.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Longest session id, name or email quoted in a notification.
const MAX_FIELD_CHARS: usize = 128;

/// Dashboard links longer than this are left out of notifications.
const MAX_LINK_CHARS: usize = 1024;

/// Where Telegram put a message the bot sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("telegram bot token or chat id is not configured")]
    NotConfigured,

    #[error("telegram did not answer within {0:?}")]
    Timeout(Duration),

    #[error("telegram api error: {0}")]
    Api(String),
}

impl From<teloxide::RequestError> for DeliveryError {
    fn from(err: teloxide::RequestError) -> Self {
        DeliveryError::Api(err.to_string())
    }
}

/// The slice of the Telegram Bot API the relay needs.
#[async_trait]
pub trait BotApi: Send + Sync {
    /// Send MarkdownV2 `text` to `chat_id`, optionally threaded onto
    /// `reply_to`. Returns the chat and message id Telegram assigned.
    async fn send_markdown(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<SentMessage, DeliveryError>;
}

#[derive(Clone)]
pub struct TelegramBot {
    bot: Bot,
}

impl TelegramBot {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            bot: Bot::with_client(token, client),
        })
    }

    /// Point Telegram's update delivery at `url`.
    pub async fn register_webhook(&self, url: &str, secret: Option<&str>) -> anyhow::Result<()> {
        let url = reqwest::Url::parse(url)?;

        let mut request = self.bot.set_webhook(url.clone());
        if let Some(secret) = secret {
            request = request.secret_token(secret.to_string());
        }
        request.await?;

        info!(%url, "Telegram webhook registered");
        Ok(())
    }
}

#[async_trait]
impl BotApi for TelegramBot {
    async fn send_markdown(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<SentMessage, DeliveryError> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::MarkdownV2);

        if let Some(reply_to) = reply_to {
            let reply_to = i32::try_from(reply_to)
                .map_err(|_| DeliveryError::Api(format!("message id {reply_to} out of range")))?;
            request = request.reply_to_message_id(MessageId(reply_to));
        }

        let sent = request.await?;
        Ok(SentMessage {
            chat_id: sent.chat.id.0,
            message_id: i64::from(sent.id.0),
        })
    }
}

/// Commands the operator can send to the bot outside of a reply.
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "Operator commands:")]
pub enum Command {
    #[command(description = "display this text.")]
    Help,
    #[command(description = "list recent website chat sessions.")]
    Sessions,
}

/// MarkdownV2-escaped `content`, cut to at most `max_chars` characters of text
/// and `budget` characters once escaped. A cut never splits an escape and is
/// marked with an ellipsis that counts toward `budget`.
pub fn escaped_preview(content: &str, max_chars: usize, budget: usize) -> String {
    let content = content.trim();
    let escaped = markdown::escape(content);
    if content.chars().count() <= max_chars && escaped.chars().count() <= budget {
        return escaped;
    }

    let mut out = String::new();
    let mut used = 0;
    let mut buf = [0u8; 4];
    for ch in content.chars().take(max_chars) {
        let piece = markdown::escape(ch.encode_utf8(&mut buf));
        let len = piece.chars().count();
        if used + len + 1 > budget {
            break;
        }
        used += len;
        out.push_str(&piece);
    }
    out.push('…');
    out
}

/// Cut `value` to `max_chars` characters without escaping it.
fn clip(value: &str, max_chars: usize) -> String {
    let value = value.trim();
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut cut: String = value.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

fn dashboard_button(link: Option<&str>, label: &str) -> Option<String> {
    link.filter(|link| link.chars().count() <= MAX_LINK_CHARS)
        .map(|link| markdown::link(link, &markdown::escape(label)))
}

/// Notification sent to the operator for a new visitor message.
pub fn render_visitor_message(
    content: &str,
    session_id: &str,
    dashboard_link: Option<&str>,
) -> String {
    let head = format!("{} 💬\n\n", markdown::bold("New Live Chat Message"));

    let mut tail = format!(
        "\n\n{} {}",
        markdown::escape("Session:"),
        markdown::code_inline(&clip(session_id, MAX_FIELD_CHARS)),
    );
    if let Some(button) = dashboard_button(dashboard_link, "Open conversation") {
        tail.push('\n');
        tail.push_str(&button);
    }
    tail.push_str("\n\n");
    tail.push_str(&markdown::italic(&markdown::escape(
        "Reply to this message to answer the visitor.",
    )));

    let budget = MAX_MESSAGE_CHARS.saturating_sub(head.chars().count() + tail.chars().count());
    format!("{head}{}{tail}", escaped_preview(content, PREVIEW_CHARS, budget))
}

pub fn render_contact_form(name: &str, email: &str, message: &str) -> String {
    let head = format!(
        "{}\n\n{} {}\n{} {}\n\n{}\n",
        markdown::bold("New Contact Form Submission"),
        markdown::bold("Name:"),
        escaped_preview(name, MAX_FIELD_CHARS, MAX_FIELD_CHARS * 2),
        markdown::bold("Email:"),
        escaped_preview(email, MAX_FIELD_CHARS, MAX_FIELD_CHARS * 2),
        markdown::bold("Message:"),
    );

    let budget = MAX_MESSAGE_CHARS.saturating_sub(head.chars().count());
    format!("{head}{}", escaped_preview(message, PREVIEW_CHARS * 3, budget))
}

/// Notice threaded onto an operator reply that could not be matched to a session.
pub fn render_unmatched_reply() -> String {
    format!(
        "⚠️ {}\n\n{}\n\n{}",
        markdown::bold("Reply Failed"),
        markdown::escape(
            "I couldn't find the website chat session for the message you replied to. \
             The visitor will not see your reply."
        ),
        markdown::escape(
            "Reply directly to a \"New Live Chat Message\" notification, \
             or answer from the dashboard."
        ),
    )
}

pub fn render_session_list(
    sessions: &[SessionSummary],
    link_for: impl Fn(&str) -> Option<String>,
) -> String {
    if sessions.is_empty() {
        return markdown::escape("No website chat sessions yet.");
    }

    let mut text = markdown::bold("Recent sessions");
    for session in sessions {
        let last = match session.last_message_content.as_deref() {
            Some(content) => escaped_preview(content, 80, 160),
            None => markdown::escape("No messages yet..."),
        };

        let mut entry = format!(
            "\n\n{}",
            markdown::code_inline(&clip(&session.id, MAX_FIELD_CHARS))
        );
        if let Some(button) = dashboard_button(link_for(&session.id).as_deref(), "open") {
            entry.push(' ');
            entry.push_str(&button);
        }
        entry.push('\n');
        entry.push_str(&last);

        if text.chars().count() + entry.chars().count() > MAX_MESSAGE_CHARS {
            break;
        }
        text.push_str(&entry);
    }
    text
}

pub fn render_help() -> String {
    markdown::escape(&Command::descriptions().to_string())
}
