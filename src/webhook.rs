//! Operator → visitor path: Telegram updates pushed to our webhook.
//!
//! Replies are correlated by the chat and Telegram id of the notification
//! being replied to, which the relay stored as `external_chat_id` and
//! `external_message_id`. Nothing in
//! here fails outward; Telegram retries anything that is not a 200.

use crate::{
    bus::{Event, EventBus},
    chat::{ChatMessage, NewMessage},
    config::Config,
    interface::telegram::{
        render_help, render_session_list, render_unmatched_reply, BotApi, Command,
    },
    store::Store,
};
use serde::Deserialize;
use std::sync::Arc;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};

const SESSION_LIST_LIMIT: i64 = 10;

/// The parts of a Telegram `Update` the relay reads. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: Option<i64>,
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub message_id: i64,
    pub chat: IncomingChat,
    pub text: Option<String>,
    pub reply_to_message: Option<Box<RepliedMessage>>,
}

#[derive(Debug, Deserialize)]
pub struct IncomingChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RepliedMessage {
    pub message_id: i64,
}

#[derive(Debug)]
pub enum WebhookOutcome {
    /// Operator reply appended to the visitor's session.
    Appended(ChatMessage),
    /// A reply whose target is not a relayed message we know about.
    Unmatched { reply_to: i64 },
    /// An operator bot command was answered.
    Command(Command),
    /// Not something the relay acts on.
    Ignored(&'static str),
    /// Something broke while handling a relevant update.
    Failed(String),
}

#[derive(Clone)]
pub struct WebhookHandler {
    store: Store,
    bus: Arc<EventBus>,
    bot: Option<Arc<dyn BotApi>>,
    config: Arc<Config>,
}

impl WebhookHandler {
    pub fn new(
        store: Store,
        bus: Arc<EventBus>,
        bot: Option<Arc<dyn BotApi>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            bus,
            bot,
            config,
        }
    }

    /// Handle a raw webhook request body.
    pub async fn handle(&self, secret_token: Option<&str>, body: &[u8]) -> WebhookOutcome {
        if let Some(expected) = self.config.webhook_secret.as_deref() {
            if secret_token != Some(expected) {
                warn!("Webhook call with missing or wrong secret token ignored");
                return WebhookOutcome::Ignored("secret token mismatch");
            }
        }

        let update: Update = match serde_json::from_slice(body) {
            Ok(update) => update,
            Err(e) => {
                warn!("Unparseable webhook payload: {}", e);
                return WebhookOutcome::Ignored("malformed payload");
            }
        };

        self.handle_update(update).await
    }

    pub async fn handle_update(&self, update: Update) -> WebhookOutcome {
        let Some(message) = update.message else {
            debug!(update_id = ?update.update_id, "Update without message ignored");
            return WebhookOutcome::Ignored("not a message");
        };

        if let Some(operator_chat) = self.config.operator_chat_id {
            if message.chat.id != operator_chat {
                warn!(chat_id = message.chat.id, "Message from a non-operator chat ignored");
                return WebhookOutcome::Ignored("not the operator chat");
            }
        }

        let Some(text) = message.text.as_deref() else {
            return WebhookOutcome::Ignored("no text");
        };

        let Some(replied) = message.reply_to_message.as_deref() else {
            return self.handle_command(&message, text).await;
        };

        let session_id = match self
            .store
            .find_session_by_external_id(message.chat.id, replied.message_id)
            .await
        {
            Ok(Some(session_id)) => session_id,
            Ok(None) => {
                info!(
                    chat_id = message.chat.id,
                    reply_to = replied.message_id,
                    "Operator reply does not match any relayed message"
                );
                if self.config.notify_unmatched_replies {
                    self.answer(&message, render_unmatched_reply(), true).await;
                }
                return WebhookOutcome::Unmatched {
                    reply_to: replied.message_id,
                };
            }
            Err(e) => {
                error!("Correlation lookup failed: {}", e);
                return WebhookOutcome::Failed(e.to_string());
            }
        };

        match self
            .store
            .append_message(&NewMessage::operator(&session_id, text))
            .await
        {
            Ok(reply) => {
                info!(session_id = %session_id, message_id = reply.id, "Operator reply relayed");
                self.bus.publish(Event::MessageInserted(reply.clone()));
                WebhookOutcome::Appended(reply)
            }
            Err(e) => {
                error!(session_id = %session_id, "Failed to store operator reply: {}", e);
                WebhookOutcome::Failed(e.to_string())
            }
        }
    }

    async fn handle_command(&self, message: &IncomingMessage, text: &str) -> WebhookOutcome {
        // Trailing words after a command are ignored; none of the commands take arguments.
        let Ok(command) = Command::parse(command_word(text), "") else {
            return WebhookOutcome::Ignored("not a reply");
        };

        let response = match command {
            Command::Help => render_help(),
            Command::Sessions => match self.store.list_sessions(SESSION_LIST_LIMIT).await {
                Ok(sessions) => {
                    render_session_list(&sessions, |id| self.config.dashboard_link(id))
                }
                Err(e) => {
                    error!("Failed to list sessions: {}", e);
                    return WebhookOutcome::Failed(e.to_string());
                }
            },
        };

        self.answer(message, response, false).await;
        WebhookOutcome::Command(command)
    }

    async fn answer(&self, message: &IncomingMessage, text: String, threaded: bool) {
        let Some(bot) = self.bot.as_ref() else {
            return;
        };
        let reply_to = threaded.then_some(message.message_id);
        if let Err(e) = bot.send_markdown(message.chat.id, &text, reply_to).await {
            error!("Failed to answer operator in Telegram: {}", e);
        }
    }
}

/// `/sessions@portfolio_bot extra` → `/sessions`
fn command_word(text: &str) -> &str {
    let text = text.trim();
    let head = text.split_whitespace().next().unwrap_or(text);
    head.split('@').next().unwrap_or(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Sender;
    use crate::interface::telegram::fake::FakeBot;
    use crate::relay::Relay;
    use crate::store::test_store;
    use serde_json::json;

    const OPERATOR_CHAT: i64 = 42;

    struct Harness {
        store: Store,
        bus: Arc<EventBus>,
        bot: Arc<FakeBot>,
        webhook: WebhookHandler,
        relay: Relay,
    }

    async fn harness(config: Config) -> Harness {
        let store = test_store().await;
        let bus = Arc::new(EventBus::new());
        let bot = Arc::new(FakeBot::delivering_from(999));
        let config = Arc::new(config);
        let dyn_bot: Arc<dyn BotApi> = bot.clone();

        Harness {
            webhook: WebhookHandler::new(
                store.clone(),
                bus.clone(),
                Some(dyn_bot.clone()),
                config.clone(),
            ),
            relay: Relay::new(store.clone(), bus.clone(), Some(dyn_bot), config),
            store,
            bus,
            bot,
        }
    }

    fn operator_config() -> Config {
        Config {
            operator_chat_id: Some(OPERATOR_CHAT),
            ..Config::default()
        }
    }

    fn reply_payload(reply_to: i64, text: &str) -> Vec<u8> {
        reply_payload_in(OPERATOR_CHAT, reply_to, text)
    }

    fn reply_payload_in(chat_id: i64, reply_to: i64, text: &str) -> Vec<u8> {
        json!({
            "update_id": 1,
            "message": {
                "message_id": 5000,
                "date": 1700000000,
                "chat": { "id": chat_id, "type": "private" },
                "from": { "id": 7, "is_bot": false, "first_name": "Owner" },
                "text": text,
                "reply_to_message": {
                    "message_id": reply_to,
                    "date": 1699999999,
                    "chat": { "id": chat_id, "type": "private" },
                    "text": "New Live Chat Message"
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    fn plain_payload(text: &str) -> Vec<u8> {
        json!({
            "update_id": 2,
            "message": {
                "message_id": 6000,
                "chat": { "id": OPERATOR_CHAT },
                "text": text
            }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn reply_to_relayed_message_lands_in_its_session() {
        let h = harness(operator_config()).await;
        let mut visitor = h.bus.subscribe_session("abc-123");

        let outcome = h.relay.relay("abc-123", "Hello, is anyone there?").await.unwrap();
        assert_eq!(outcome.message.external_message_id, Some(999));

        let outcome = h
            .webhook
            .handle(None, &reply_payload(999, "Yes, how can I help?"))
            .await;
        let reply = match outcome {
            WebhookOutcome::Appended(reply) => reply,
            other => panic!("expected appended reply, got {other:?}"),
        };
        assert_eq!(reply.session_id, "abc-123");
        assert_eq!(reply.sender, Sender::Operator);

        let history = h.store.get_chat_history("abc-123").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].sender, Sender::Operator);
        assert_eq!(history[1].content, "Yes, how can I help?");
        assert_eq!(history[1].external_message_id, None);

        assert_eq!(visitor.recv().await.unwrap().sender, Sender::Visitor);
        assert_eq!(visitor.recv().await.unwrap().content, "Yes, how can I help?");
    }

    #[tokio::test]
    async fn reply_to_unknown_message_appends_nothing_and_warns_operator() {
        let h = harness(operator_config()).await;
        h.relay.relay("abc-123", "hi").await.unwrap();

        let outcome = h.webhook.handle(None, &reply_payload(12345, "hello?")).await;
        assert!(matches!(outcome, WebhookOutcome::Unmatched { reply_to: 12345 }));

        assert_eq!(h.store.get_chat_history("abc-123").await.unwrap().len(), 1);

        let sent = h.bot.sent();
        let notice = sent.last().unwrap();
        assert_eq!(notice.chat_id, OPERATOR_CHAT);
        assert_eq!(notice.reply_to, Some(5000));
        assert!(notice.text.contains("Reply Failed"));
    }

    #[tokio::test]
    async fn unmatched_notice_can_be_disabled() {
        let h = harness(Config {
            notify_unmatched_replies: false,
            ..operator_config()
        })
        .await;

        let outcome = h.webhook.handle(None, &reply_payload(1, "hello?")).await;
        assert!(matches!(outcome, WebhookOutcome::Unmatched { .. }));
        assert!(h.bot.sent().is_empty());
    }

    #[tokio::test]
    async fn irrelevant_updates_are_ignored() {
        let h = harness(operator_config()).await;

        let edited = json!({ "update_id": 3, "edited_message": { "message_id": 1 } });
        assert!(matches!(
            h.webhook.handle(None, edited.to_string().as_bytes()).await,
            WebhookOutcome::Ignored(_)
        ));
        assert!(matches!(
            h.webhook.handle(None, &plain_payload("just chatting")).await,
            WebhookOutcome::Ignored(_)
        ));
        assert!(matches!(
            h.webhook.handle(None, b"not json").await,
            WebhookOutcome::Ignored("malformed payload")
        ));

        let photo_reply = json!({
            "update_id": 4,
            "message": {
                "message_id": 1,
                "chat": { "id": OPERATOR_CHAT },
                "reply_to_message": { "message_id": 999 }
            }
        });
        assert!(matches!(
            h.webhook.handle(None, photo_reply.to_string().as_bytes()).await,
            WebhookOutcome::Ignored("no text")
        ));

        assert!(h.store.list_sessions(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replies_from_other_chats_are_ignored() {
        let h = harness(operator_config()).await;
        h.relay.relay("abc-123", "hi").await.unwrap();

        let stranger = json!({
            "update_id": 5,
            "message": {
                "message_id": 10,
                "chat": { "id": 1 },
                "text": "spoofed",
                "reply_to_message": { "message_id": 999 }
            }
        });
        let outcome = h.webhook.handle(None, stranger.to_string().as_bytes()).await;
        assert!(matches!(outcome, WebhookOutcome::Ignored("not the operator chat")));
        assert_eq!(h.store.get_chat_history("abc-123").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn secret_token_is_enforced_when_configured() {
        let h = harness(Config {
            webhook_secret: Some("s3cret".to_string()),
            ..operator_config()
        })
        .await;
        h.relay.relay("abc-123", "hi").await.unwrap();

        let payload = reply_payload(999, "answer");
        assert!(matches!(
            h.webhook.handle(None, &payload).await,
            WebhookOutcome::Ignored("secret token mismatch")
        ));
        assert!(matches!(
            h.webhook.handle(Some("wrong"), &payload).await,
            WebhookOutcome::Ignored("secret token mismatch")
        ));
        assert!(matches!(
            h.webhook.handle(Some("s3cret"), &payload).await,
            WebhookOutcome::Appended(_)
        ));
    }

    #[tokio::test]
    async fn sessions_command_lists_recent_conversations() {
        let h = harness(Config {
            public_base_url: Some("https://example.dev".to_string()),
            ..operator_config()
        })
        .await;
        h.relay.relay("abc-123", "Need a quote").await.unwrap();

        let outcome = h.webhook.handle(None, &plain_payload("/sessions@portfolio_bot")).await;
        assert!(matches!(outcome, WebhookOutcome::Command(Command::Sessions)));

        let sent = h.bot.sent();
        let listing = sent.last().unwrap();
        assert_eq!(listing.reply_to, None);
        assert!(listing.text.contains("`abc-123`"));
        assert!(listing.text.contains("https://example.dev/telegram-chat#abc-123"));
    }

    #[tokio::test]
    async fn reply_correlates_within_the_chat_it_was_sent_in() {
        let store = test_store().await;
        let bus = Arc::new(EventBus::new());
        let wire = |chat_id: i64| {
            let bot: Arc<dyn BotApi> = Arc::new(FakeBot::delivering_from(999));
            let config = Arc::new(Config {
                operator_chat_id: Some(chat_id),
                ..Config::default()
            });
            (
                Relay::new(store.clone(), bus.clone(), Some(bot.clone()), config.clone()),
                WebhookHandler::new(store.clone(), bus.clone(), Some(bot), config),
            )
        };

        // The operator chat moves and the new chat hands out the same message id.
        let (old_relay, _) = wire(OPERATOR_CHAT);
        old_relay.relay("alice", "hi from alice").await.unwrap();
        let (relay, webhook) = wire(OPERATOR_CHAT + 1);
        let outcome = relay.relay("bob", "hi from bob").await.unwrap();
        assert_eq!(outcome.message.external_chat_id, Some(OPERATOR_CHAT + 1));
        assert_eq!(outcome.message.external_message_id, Some(999));

        let outcome = webhook
            .handle(None, &reply_payload_in(OPERATOR_CHAT + 1, 999, "Hi Bob"))
            .await;
        let reply = match outcome {
            WebhookOutcome::Appended(reply) => reply,
            other => panic!("expected appended reply, got {other:?}"),
        };
        assert_eq!(reply.session_id, "bob");
        assert_eq!(store.get_chat_history("alice").await.unwrap().len(), 1);
        assert_eq!(store.get_chat_history("bob").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn command_with_trailing_words_is_still_answered() {
        let h = harness(operator_config()).await;

        let outcome = h.webhook.handle(None, &plain_payload("/help now")).await;
        assert!(matches!(outcome, WebhookOutcome::Command(Command::Help)));

        let sent = h.bot.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("sessions"));

        assert!(matches!(
            h.webhook.handle(None, &plain_payload("/unknown thing")).await,
            WebhookOutcome::Ignored("not a reply")
        ));
    }

    #[test]
    fn command_word_drops_mentions_and_arguments() {
        assert_eq!(command_word("/sessions@my_bot"), "/sessions");
        assert_eq!(command_word(" /help "), "/help");
        assert_eq!(command_word("/help@b now"), "/help");
    }
}
